//! Per-session outbound queue. OBS frames are latest-wins and are the only
//! frames ever evicted; ACK, EVENT_BATCH and catalog frames wait briefly for
//! room instead.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

pub const DEFAULT_OUTBOUND_CAPACITY: usize = 8;
pub const MAX_OUTBOUND_CAPACITY: usize = 64;
/// Timed send budget for frames that must not be evicted.
pub const RELIABLE_SEND_TIMEOUT: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Obs,
    Reliable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub text: String,
}

#[derive(Debug, Default)]
struct Queue {
    frames: VecDeque<Frame>,
    closed: bool,
    dropped_obs: u64,
}

impl Queue {
    fn evict_oldest_obs(&mut self) -> bool {
        match self.frames.iter().position(|f| f.kind == FrameKind::Obs) {
            Some(idx) => {
                self.frames.remove(idx);
                self.dropped_obs += 1;
                true
            }
            None => false,
        }
    }
}

#[derive(Debug)]
struct Inner {
    capacity: usize,
    queue: Mutex<Queue>,
    readable: Notify,
    writable: Notify,
}

/// Cloneable handle; the world runtime pushes OBS, the session pushes the rest
/// and drains.
#[derive(Debug, Clone)]
pub struct Outbound {
    inner: Arc<Inner>,
}

impl Outbound {
    /// `requested` of 0 means the default; anything above the cap is clamped.
    pub fn new(requested: usize) -> Self {
        let capacity = match requested {
            0 => DEFAULT_OUTBOUND_CAPACITY,
            n => n.min(MAX_OUTBOUND_CAPACITY),
        };
        Self {
            inner: Arc::new(Inner {
                capacity,
                queue: Mutex::new(Queue::default()),
                readable: Notify::new(),
                writable: Notify::new(),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped_obs(&self) -> u64 {
        self.lock().dropped_obs
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Enqueues an OBS, evicting the oldest queued OBS when full. Returns false
    /// when the queue is closed or holds only reliable frames.
    pub fn push_obs(&self, text: String) -> bool {
        {
            let mut queue = self.lock();
            if queue.closed {
                return false;
            }
            if queue.frames.len() >= self.inner.capacity && !queue.evict_oldest_obs() {
                queue.dropped_obs += 1;
                return false;
            }
            queue.frames.push_back(Frame {
                kind: FrameKind::Obs,
                text,
            });
        }
        self.inner.readable.notify_one();
        true
    }

    /// Enqueues a frame that must not be evicted. A queued OBS makes room when
    /// full; otherwise waits up to `timeout` for the reader to drain.
    pub async fn push_reliable(&self, text: String, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut text = Some(text);
        loop {
            {
                let mut queue = self.lock();
                if queue.closed {
                    return false;
                }
                if queue.frames.len() < self.inner.capacity || queue.evict_oldest_obs() {
                    if let Some(text) = text.take() {
                        queue.frames.push_back(Frame {
                            kind: FrameKind::Reliable,
                            text,
                        });
                    }
                    drop(queue);
                    self.inner.readable.notify_one();
                    return true;
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero()
                || tokio::time::timeout(remaining, self.inner.writable.notified())
                    .await
                    .is_err()
            {
                return false;
            }
        }
    }

    /// Next frame in order, or `None` once closed and drained.
    pub async fn recv(&self) -> Option<Frame> {
        loop {
            {
                let mut queue = self.lock();
                if let Some(frame) = queue.frames.pop_front() {
                    drop(queue);
                    self.inner.writable.notify_one();
                    return Some(frame);
                }
                if queue.closed {
                    return None;
                }
            }
            self.inner.readable.notified().await;
        }
    }

    pub fn close(&self) {
        self.lock().closed = true;
        self.inner.readable.notify_waiters();
        self.inner.readable.notify_one();
        self.inner.writable.notify_waiters();
    }

    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.inner.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_defaults_and_clamps() {
        assert_eq!(Outbound::new(0).capacity(), DEFAULT_OUTBOUND_CAPACITY);
        assert_eq!(Outbound::new(3).capacity(), 3);
        assert_eq!(Outbound::new(1000).capacity(), MAX_OUTBOUND_CAPACITY);
    }

    #[tokio::test]
    async fn full_queue_drops_the_oldest_obs() {
        let out = Outbound::new(2);
        assert!(out.push_obs("obs1".to_string()));
        assert!(out.push_reliable("ack1".to_string(), RELIABLE_SEND_TIMEOUT).await);
        assert!(out.push_obs("obs2".to_string()));
        assert_eq!(out.dropped_obs(), 1);

        let first = out.recv().await.expect("frame");
        assert_eq!(first.text, "ack1");
        let second = out.recv().await.expect("frame");
        assert_eq!(second.text, "obs2");
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn reliable_frames_evict_obs_but_never_each_other() {
        let out = Outbound::new(2);
        out.push_obs("obs".to_string());
        assert!(out.push_reliable("a".to_string(), RELIABLE_SEND_TIMEOUT).await);
        assert!(out.push_reliable("b".to_string(), RELIABLE_SEND_TIMEOUT).await);
        assert_eq!(out.len(), 2);

        // Only reliable frames queued: OBS is refused and a third ACK times out.
        assert!(!out.push_obs("late".to_string()));
        assert!(!out.push_reliable("c".to_string(), Duration::from_millis(20)).await);
        assert_eq!(out.recv().await.map(|f| f.text), Some("a".to_string()));
        assert_eq!(out.recv().await.map(|f| f.text), Some("b".to_string()));
    }

    #[tokio::test]
    async fn reliable_push_waits_for_the_reader() {
        let out = Outbound::new(1);
        assert!(out.push_reliable("first".to_string(), RELIABLE_SEND_TIMEOUT).await);
        let reader = out.clone();
        let drain = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            reader.recv().await
        });
        assert!(out.push_reliable("second".to_string(), Duration::from_secs(2)).await);
        assert_eq!(drain.await.expect("join").map(|f| f.text), Some("first".to_string()));
        assert_eq!(out.recv().await.map(|f| f.text), Some("second".to_string()));
    }

    #[tokio::test]
    async fn close_ends_the_stream_after_draining() {
        let out = Outbound::new(4);
        out.push_obs("last".to_string());
        out.close();
        assert!(!out.push_obs("after".to_string()));
        assert_eq!(out.recv().await.map(|f| f.text), Some("last".to_string()));
        assert_eq!(out.recv().await, None);
    }
}
