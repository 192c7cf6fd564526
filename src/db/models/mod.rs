pub mod session;

pub use session::{MonitorSession, SessionStatus};
