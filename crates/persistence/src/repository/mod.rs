//! Repository implementations for database operations

pub mod benchmarks;
pub mod inputs;
pub mod jobs;
pub mod snapshots;

pub use benchmarks::*;
pub use inputs::*;
pub use jobs::*;
pub use snapshots::*;
