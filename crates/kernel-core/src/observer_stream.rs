//! Stateless observer helpers: task progress and the per-chunk streaming state
//! machine. Callers own the previous state and pass it back in every tick.

use std::collections::{BTreeMap, BTreeSet};

use crate::chunks::ChunkKey;
use crate::spatial::{dist_xz, Vec3i};

// ---------------------------------------------------------------------------
// Task progress
// ---------------------------------------------------------------------------

/// Whole-cell tolerance: ceil, minimum 1.
pub fn tolerance_cells(tolerance: f64) -> i32 {
    if tolerance.is_finite() && tolerance > 1.0 {
        tolerance.ceil() as i32
    } else {
        1
    }
}

/// Progress of a MOVE_TO from `start` towards `target`, measured against the
/// tolerance ring, plus the remaining step count.
pub fn move_progress(start: Vec3i, current: Vec3i, target: Vec3i, tolerance: f64) -> (f64, u64) {
    let tol = tolerance_cells(tolerance);
    let remaining = (dist_xz(current, target) - tol).max(0);
    let total = (dist_xz(start, target) - tol).max(0);
    let progress = if total == 0 {
        1.0
    } else {
        (f64::from(total - remaining) / f64::from(total)).clamp(0.0, 1.0)
    };
    (progress, remaining as u64)
}

pub fn follow_progress(current: Vec3i, target: Vec3i, distance: f64) -> (f64, u64) {
    let keep = tolerance_cells(distance);
    let dist = dist_xz(current, target);
    if dist <= keep {
        return (1.0, 0);
    }
    (f64::from(keep) / f64::from(dist), (dist - keep) as u64)
}

// ---------------------------------------------------------------------------
// Chunk streams
// ---------------------------------------------------------------------------

/// Union of Manhattan disks of `radius` chunks around each centre, nearest first,
/// ties broken by key, truncated to `max_chunks`.
pub fn wanted_chunks(centers: &[ChunkKey], radius: i32, max_chunks: usize) -> Vec<ChunkKey> {
    let radius = radius.max(1);
    let max_chunks = if max_chunks == 0 { 1024 } else { max_chunks };
    let mut best: BTreeMap<ChunkKey, i32> = BTreeMap::new();
    for center in centers {
        for dz in -radius..=radius {
            for dx in -radius..=radius {
                let dist = dx.abs() + dz.abs();
                if dist > radius {
                    continue;
                }
                let key = ChunkKey {
                    cx: center.cx + dx,
                    cz: center.cz + dz,
                };
                best.entry(key)
                    .and_modify(|d| *d = (*d).min(dist))
                    .or_insert(dist);
            }
        }
    }
    let mut ordered = best.into_iter().collect::<Vec<_>>();
    ordered.sort_by(|(ka, da), (kb, db)| da.cmp(db).then(ka.cmp(kb)));
    ordered.truncate(max_chunks);
    ordered.into_iter().map(|(key, _)| key).collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkStreamState {
    pub last_wanted_tick: u64,
    pub sent_full: bool,
    pub needs_full: bool,
    pub blocks: Option<Vec<u16>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchCell {
    pub lx: i32,
    pub lz: i32,
    pub block: u16,
}

#[derive(Debug, Clone)]
pub struct ChunkStreamInput<'a> {
    pub now_tick: u64,
    pub centers: &'a [ChunkKey],
    pub radius: i32,
    pub max_chunks: usize,
    pub max_full_per_tick: usize,
    pub evict_after_ticks: u64,
    /// Cells changed this tick (from SET_BLOCK audits) with their new block.
    pub changed_cells: &'a [(Vec3i, u16)],
}

/// Transport for one observer client. A `false` return means back-pressure.
pub trait ChunkSink {
    fn send_full(&mut self, key: ChunkKey, blocks: &[u16]) -> bool;
    fn send_patch(&mut self, key: ChunkKey, cells: &[PatchCell]) -> bool;
    fn send_evict(&mut self, key: ChunkKey) -> bool;
}

/// Advances every chunk's stream state by one tick:
/// None -> NeedsFull -> SentFull -> patches, with eviction once a chunk has been
/// unwanted for `evict_after_ticks`. A failed patch send demotes to NeedsFull.
pub fn step_chunk_stream(
    states: &mut BTreeMap<ChunkKey, ChunkStreamState>,
    input: &ChunkStreamInput<'_>,
    compute_blocks: impl Fn(ChunkKey) -> Vec<u16>,
    sink: &mut impl ChunkSink,
) {
    let max_full = if input.max_full_per_tick == 0 { 32 } else { input.max_full_per_tick };
    let evict_after = if input.evict_after_ticks == 0 { 50 } else { input.evict_after_ticks };

    let wanted = wanted_chunks(input.centers, input.radius, input.max_chunks);
    let wanted_set = wanted.iter().copied().collect::<BTreeSet<_>>();

    let mut budget = max_full;
    let mut can_send = true;
    for key in &wanted {
        let state = states.entry(*key).or_insert_with(|| ChunkStreamState {
            last_wanted_tick: input.now_tick,
            needs_full: true,
            ..ChunkStreamState::default()
        });
        state.last_wanted_tick = input.now_tick;
        if can_send && state.needs_full && budget > 0 {
            let blocks = state.blocks.get_or_insert_with(|| compute_blocks(*key));
            if sink.send_full(*key, blocks) {
                state.sent_full = true;
                state.needs_full = false;
                budget -= 1;
            } else {
                can_send = false;
            }
        }
    }

    let mut patches: BTreeMap<ChunkKey, BTreeMap<(i32, i32), PatchCell>> = BTreeMap::new();
    for (pos, block) in input.changed_cells {
        let key = ChunkKey::containing(*pos);
        let Some(state) = states.get_mut(&key) else {
            continue;
        };
        let Some(blocks) = state.blocks.as_mut() else {
            continue;
        };
        let lx = pos.x.rem_euclid(16);
        let lz = pos.z.rem_euclid(16);
        let index = (lz * 16 + lx) as usize;
        match blocks.get_mut(index) {
            Some(cell) if *cell != *block => *cell = *block,
            _ => continue,
        }
        if state.needs_full {
            continue;
        }
        patches.entry(key).or_default().insert(
            (lz, lx),
            PatchCell {
                lx,
                lz,
                block: *block,
            },
        );
    }
    for (key, cells) in patches {
        let cells = cells.into_values().collect::<Vec<_>>();
        if !sink.send_patch(key, &cells) {
            if let Some(state) = states.get_mut(&key) {
                state.needs_full = true;
            }
        }
    }

    let stale = states
        .iter()
        .filter(|(key, state)| {
            !wanted_set.contains(key)
                && input.now_tick.saturating_sub(state.last_wanted_tick) >= evict_after
        })
        .map(|(key, state)| (*key, state.sent_full))
        .collect::<Vec<_>>();
    for (key, sent_full) in stale {
        if !sent_full || sink.send_evict(key) {
            states.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        full: Vec<ChunkKey>,
        patches: Vec<(ChunkKey, Vec<PatchCell>)>,
        evicted: Vec<ChunkKey>,
        accept_full: bool,
    }

    impl ChunkSink for RecordingSink {
        fn send_full(&mut self, key: ChunkKey, _blocks: &[u16]) -> bool {
            if self.accept_full {
                self.full.push(key);
            }
            self.accept_full
        }

        fn send_patch(&mut self, key: ChunkKey, cells: &[PatchCell]) -> bool {
            self.patches.push((key, cells.to_vec()));
            true
        }

        fn send_evict(&mut self, key: ChunkKey) -> bool {
            self.evicted.push(key);
            true
        }
    }

    fn origin() -> ChunkKey {
        ChunkKey { cx: 0, cz: 0 }
    }

    #[test]
    fn wanted_chunks_are_manhattan_disks_nearest_first() {
        let keys = wanted_chunks(&[origin()], 1, 0);
        assert_eq!(keys.len(), 5);
        assert_eq!(keys[0], origin());
        assert!(!keys.contains(&ChunkKey { cx: 1, cz: 1 }));
        let capped = wanted_chunks(&[origin()], 2, 3);
        assert_eq!(capped.len(), 3);
    }

    #[test]
    fn full_then_patch_then_evict() {
        let mut states = BTreeMap::new();
        let mut sink = RecordingSink {
            accept_full: true,
            ..RecordingSink::default()
        };
        let centers = [origin()];
        let input = ChunkStreamInput {
            now_tick: 1,
            centers: &centers,
            radius: 1,
            max_chunks: 0,
            max_full_per_tick: 2,
            evict_after_ticks: 5,
            changed_cells: &[],
        };
        step_chunk_stream(&mut states, &input, |_| vec![0; 256], &mut sink);
        assert_eq!(sink.full.len(), 2);
        assert!(states[&origin()].sent_full);

        let changes = [(Vec3i::new(3, 0, 4), 9u16)];
        let input = ChunkStreamInput {
            now_tick: 2,
            changed_cells: &changes,
            ..input
        };
        step_chunk_stream(&mut states, &input, |_| vec![0; 256], &mut sink);
        assert_eq!(sink.patches.len(), 1);
        assert_eq!(
            sink.patches[0].1,
            vec![PatchCell {
                lx: 3,
                lz: 4,
                block: 9
            }]
        );

        let far = [ChunkKey { cx: 50, cz: 50 }];
        let input = ChunkStreamInput {
            now_tick: 20,
            centers: &far,
            changed_cells: &[],
            ..input
        };
        step_chunk_stream(&mut states, &input, |_| vec![0; 256], &mut sink);
        assert!(sink.evicted.contains(&origin()));
        assert!(!states.contains_key(&origin()));
    }

    #[test]
    fn back_pressure_keeps_chunks_pending() {
        let mut states = BTreeMap::new();
        let mut sink = RecordingSink::default();
        let centers = [origin()];
        let input = ChunkStreamInput {
            now_tick: 1,
            centers: &centers,
            radius: 1,
            max_chunks: 0,
            max_full_per_tick: 8,
            evict_after_ticks: 5,
            changed_cells: &[],
        };
        step_chunk_stream(&mut states, &input, |_| vec![0; 256], &mut sink);
        assert!(states.values().all(|state| state.needs_full && !state.sent_full));
    }

    #[test]
    fn move_progress_respects_tolerance() {
        let start = Vec3i::new(0, 0, 0);
        let target = Vec3i::new(10, 0, 0);
        let (p0, eta0) = move_progress(start, start, target, 1.0);
        assert_eq!(p0, 0.0);
        assert_eq!(eta0, 9);
        let (p1, eta1) = move_progress(start, Vec3i::new(9, 0, 0), target, 1.0);
        assert_eq!(p1, 1.0);
        assert_eq!(eta1, 0);
        assert_eq!(follow_progress(start, Vec3i::new(1, 0, 0), 2.0), (1.0, 0));
    }
}
