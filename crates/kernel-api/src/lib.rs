//! Async host for the voxel kernel: per-world tick loops, multi-world routing,
//! websocket sessions and the durable log/index pipeline.

pub mod config;
pub mod index;
pub mod manager;
pub mod mirror;
pub mod outbound;
pub mod persistence;
pub mod runtime;
mod server;

pub use config::{EntryPoint, IndexBackend, MirrorConfig, MultiWorldConfig, SwitchRoute, WorldSpec};
pub use manager::{
    JoinParams, Joined, ManagerError, ManagerOptions, ManagerState, StateFile, SwitchMetric,
    WorldManager,
};
pub use outbound::Outbound;
pub use persistence::PersistenceError;
pub use runtime::{ResetReport, RuntimeError, RuntimeOptions, WorldHandle, WorldRuntime, WorldStatus};
pub use server::{serve, ServerError};
