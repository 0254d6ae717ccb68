pub mod audit;
pub mod logging;

pub use tracing;

/// Lifecycle notifications broadcast to every long-running task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
    Finalised,
}
