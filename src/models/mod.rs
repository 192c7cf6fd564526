pub mod attendance;
pub mod frame;
pub mod identity;
pub mod match_result;

pub use attendance::AttendanceMark;
pub use frame::Frame;
pub use identity::{Identity, IdentityId, SessionId};
pub use match_result::{BoundingBox, MatchResult, MatchScore};
