use chrono::Utc;
use log::{debug, info};

use crate::{Backend, BackendError, NewAttendance};

use super::SessionManager;

/// What happened to a join/leave request.
///
/// A missing acting identity is an observable outcome rather than a silent
/// no-op, so callers can tell a logged-out user from a recorded change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttendanceOutcome {
    /// The attendance row was written and the viewer counter adjusted
    Recorded,
    /// No authenticated user could be resolved, nothing was written
    SkippedAnonymous,
}

impl<Db> SessionManager<Db>
where
    Db: Backend,
{
    /// Records the acting user's presence in the session and bumps the
    /// viewer counter.
    ///
    /// Joining is an upsert on the (session, user) pair, so repeated calls
    /// refresh the same attendance row instead of duplicating it.
    pub async fn mark_joined(&self, session_id: &str) -> Result<AttendanceOutcome, BackendError> {
        let Some(user_id) = self.backend.current_user_id().await? else {
            debug!("Skipping join for session {}: no authenticated user", session_id);
            return Ok(AttendanceOutcome::SkippedAnonymous);
        };

        self.backend
            .upsert_attendance(NewAttendance {
                session_id: session_id.to_string(),
                user_id: user_id.clone(),
                joined_at: Utc::now(),
            })
            .await?;

        self.backend.bump_viewers(session_id, 1).await?;

        info!("User {} joined live session {}", user_id, session_id);

        Ok(AttendanceOutcome::Recorded)
    }

    /// Closes the acting user's attendance row and bumps the viewer counter
    /// back down.
    pub async fn mark_left(&self, session_id: &str) -> Result<AttendanceOutcome, BackendError> {
        let Some(user_id) = self.backend.current_user_id().await? else {
            debug!("Skipping leave for session {}: no authenticated user", session_id);
            return Ok(AttendanceOutcome::SkippedAnonymous);
        };

        self.backend
            .close_attendance(session_id, &user_id, Utc::now())
            .await?;

        self.backend.bump_viewers(session_id, -1).await?;

        info!("User {} left live session {}", user_id, session_id);

        Ok(AttendanceOutcome::Recorded)
    }

    /// Counts distinct attendees of a session, used when finalizing its
    /// stated participant count.
    pub async fn count_participants(&self, session_id: &str) -> Result<i64, BackendError> {
        self.backend.count_participants(session_id).await
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use crate::{MemoryBackend, SessionOptions};

    use super::*;

    #[tokio::test]
    async fn test_repeated_joins_keep_a_single_attendance_row() {
        let backend = Arc::new(MemoryBackend::new());
        backend.set_current_user(Some("u1".to_string()));

        let sessions = SessionManager::new(&backend);
        let session = sessions.create("A", SessionOptions::default()).await.unwrap();

        sessions.mark_joined(&session.id).await.unwrap();
        sessions.mark_joined(&session.id).await.unwrap();

        assert_eq!(sessions.count_participants(&session.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_anonymous_join_and_leave_are_skipped() {
        let backend = Arc::new(MemoryBackend::new());
        let sessions = SessionManager::new(&backend);
        let session = sessions.create("A", SessionOptions::default()).await.unwrap();

        let joined = sessions.mark_joined(&session.id).await.unwrap();
        let left = sessions.mark_left(&session.id).await.unwrap();

        assert_eq!(joined, AttendanceOutcome::SkippedAnonymous);
        assert_eq!(left, AttendanceOutcome::SkippedAnonymous);
        assert_eq!(sessions.count_participants(&session.id).await.unwrap(), 0);

        let session = sessions.get(&session.id).await.unwrap().unwrap();
        assert_eq!(session.viewers, 0);
    }
}
