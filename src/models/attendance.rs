use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Identity, SessionId};

/// Confirmation that `identity` was present during `session`.
///
/// At most one exists per (session, identity) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceMark {
    pub session_id: SessionId,
    pub identity: Identity,
    pub marked_at: DateTime<Utc>,
}
