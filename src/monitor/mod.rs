pub mod controller;
pub mod loop_worker;
pub mod state;

pub use controller::{MonitorController, StartError};
pub use loop_worker::{CycleGate, DetectionLoop, TickOutcome};
pub use state::{MonitorSnapshot, MonitorState, MonitorStatus};
