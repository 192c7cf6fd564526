pub mod notifier;
pub mod stabilizer;

pub use notifier::{AttendanceNotifier, HttpAttendanceNotifier};
pub use stabilizer::AttendanceStabilizer;
