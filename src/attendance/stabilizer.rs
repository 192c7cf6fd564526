use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use log::{debug, info};

use crate::models::{AttendanceMark, Identity, IdentityId, MatchResult, SessionId};

use super::notifier::AttendanceNotifier;

/// Per-session debounce between raw recognition results and attendance marks.
///
/// An identity is marked at most once per session. It becomes eligible once it
/// has been recognized in `confirmation_streak` consecutive batches; with a
/// streak of 1 any single recognition is enough. The marked set only grows
/// after the notifier confirms, so a failed notification is retried on the
/// next sighting.
#[derive(Debug)]
pub struct AttendanceStabilizer {
    session: SessionId,
    marked: HashSet<IdentityId>,
    streaks: HashMap<IdentityId, u32>,
    confirmation_streak: u32,
}

impl AttendanceStabilizer {
    pub fn new(session: SessionId, confirmation_streak: u32) -> Self {
        Self {
            session,
            marked: HashSet::new(),
            streaks: HashMap::new(),
            confirmation_streak: confirmation_streak.max(1),
        }
    }

    pub fn session(&self) -> &SessionId {
        &self.session
    }

    pub fn marked_count(&self) -> usize {
        self.marked.len()
    }

    pub fn is_marked(&self, id: &IdentityId) -> bool {
        self.marked.contains(id)
    }

    /// Advances streaks from one batch. Identities missing from the batch lose
    /// their streak. Returns the recognized identities in batch order, once each.
    pub fn observe(&mut self, batch: &[MatchResult]) -> Vec<Identity> {
        let mut seen = Vec::new();
        let mut seen_ids = HashSet::new();
        for identity in batch.iter().filter_map(|result| result.identity.as_ref()) {
            if seen_ids.insert(identity.id.clone()) {
                seen.push(identity.clone());
            }
        }

        self.streaks.retain(|id, _| seen_ids.contains(id));
        for id in seen_ids {
            let streak = self.streaks.entry(id).or_insert(0);
            *streak = streak.saturating_add(1);
        }

        seen
    }

    pub fn should_mark(&self, id: &IdentityId) -> bool {
        !self.marked.contains(id)
            && self.streaks.get(id).copied().unwrap_or(0) >= self.confirmation_streak
    }

    pub fn commit(&mut self, id: &IdentityId) {
        self.marked.insert(id.clone());
        self.streaks.remove(id);
    }

    /// Observes `batch`, notifies for every newly eligible identity and commits
    /// those the notifier accepted. Returns the marks made by this batch.
    pub async fn process_batch(
        &mut self,
        batch: &[MatchResult],
        notifier: &dyn AttendanceNotifier,
        now: DateTime<Utc>,
    ) -> Vec<AttendanceMark> {
        let mut marks = Vec::new();

        for identity in self.observe(batch) {
            if !self.should_mark(&identity.id) {
                continue;
            }

            if notifier.notify(&self.session, &identity, now).await {
                self.commit(&identity.id);
                info!("Marked {} ({}) present in {}", identity.display_name, identity.id, self.session);
                marks.push(AttendanceMark {
                    session_id: self.session.clone(),
                    identity,
                    marked_at: now,
                });
            } else {
                debug!("notification for {} failed; will retry on next sighting", identity.id);
            }
        }

        marks
    }

    /// Drops all state and rebinds to `session`.
    pub fn reset(&mut self, session: SessionId) {
        self.session = session;
        self.marked.clear();
        self.streaks.clear();
    }
}
