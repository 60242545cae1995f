mod attendance;

use std::sync::Arc;

use lectern_core::{Table, Topic};
use log::{info, warn};
use tokio::task::JoinHandle;

pub use attendance::*;

use crate::{
    util::slugify, Backend, BackendError, LiveSessionData, NewLiveSession, SessionPatch,
    SessionStatus,
};

/// Creates, queries, and ends live session rows on the backend, with a thin
/// attendance-tracking layer on top.
pub struct SessionManager<Db> {
    backend: Arc<Db>,
}

/// Optional overrides for a new live session.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub status: Option<SessionStatus>,
    pub slug: Option<String>,
    pub session_link: Option<String>,
    pub token: Option<String>,
    pub participants: Option<i32>,
    pub duration: Option<i32>,
}

/// Final values attached when ending a session. Absent fields keep their
/// stored value.
#[derive(Debug, Clone, Default)]
pub struct EndUpdates {
    pub status: Option<SessionStatus>,
    pub session_link: Option<String>,
    pub duration: Option<i32>,
    pub participants: Option<i32>,
}

impl<Db> SessionManager<Db>
where
    Db: Backend,
{
    pub const DEFAULT_TITLE: &'static str = "Live Session";

    pub fn new(backend: &Arc<Db>) -> Self {
        Self {
            backend: backend.clone(),
        }
    }

    /// Creates a session row, defaulting the status to live, and returns it
    /// fully populated by the backend.
    pub async fn create(
        &self,
        title: &str,
        options: SessionOptions,
    ) -> Result<LiveSessionData, BackendError> {
        let host_id = self.backend.current_user_id().await?;

        let title = if title.trim().is_empty() {
            Self::DEFAULT_TITLE
        } else {
            title
        };

        let new_session = NewLiveSession {
            host_id,
            title: title.to_string(),
            status: options.status.unwrap_or(SessionStatus::Live),
            slug: options.slug.or_else(|| slugify(title)),
            session_link: options.session_link,
            token: options.token,
            participants: options.participants,
            duration: options.duration,
        };

        let session = self.backend.create_session(new_session).await?;

        info!("Live session {} ({}) created", session.id, session.title);

        Ok(session)
    }

    /// Ends a session, defaulting the status to ended and attaching any
    /// supplied final values.
    pub async fn end(&self, id: &str, updates: EndUpdates) -> Result<(), BackendError> {
        let patch = SessionPatch {
            status: Some(updates.status.unwrap_or(SessionStatus::Ended)),
            session_link: updates.session_link,
            duration: updates.duration,
            participants: updates.participants,
        };

        self.backend.update_session(id, patch).await?;

        info!("Live session {} ended", id);

        Ok(())
    }

    /// Adjusts the viewer counter. The adjustment happens atomically on the
    /// backend, never as a local read-modify-write.
    pub async fn bump_viewers(&self, id: &str, delta: i32) -> Result<(), BackendError> {
        self.backend.bump_viewers(id, delta).await
    }

    /// Returns up to `limit` currently live sessions, newest first.
    pub async fn list_live_now(&self, limit: u32) -> Result<Vec<LiveSessionData>, BackendError> {
        self.backend.list_live(limit).await
    }

    /// Returns the session, or [None] when no row matches.
    pub async fn get(&self, id: &str) -> Result<Option<LiveSessionData>, BackendError> {
        self.backend.session_by_id(id).await
    }

    /// Watches a single session row, invoking the callback with the row
    /// state (new, or old on deletes) for every change.
    pub fn watch_row<F>(&self, id: &str, on_change: F) -> RowWatch
    where
        F: Fn(LiveSessionData) + Send + 'static,
    {
        let topic = Topic::scoped(Table::LiveSessions, "id", id);
        let mut subscription = self.backend.changes().subscribe(topic);

        let task = tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                let Some(row) = event.row() else {
                    continue;
                };

                match serde_json::from_value::<LiveSessionData>(row.clone()) {
                    Ok(session) => on_change(session),
                    Err(e) => warn!("Ignoring malformed live session payload: {}", e),
                }
            }
        });

        RowWatch { task }
    }
}

/// A live watch on a single session row.
///
/// Releasing is idempotent: any number of [Self::unsubscribe] calls (or a
/// drop on top of one) is safe, even once the backend's bus is gone.
pub struct RowWatch {
    task: JoinHandle<()>,
}

impl RowWatch {
    pub fn unsubscribe(&self) {
        self.task.abort()
    }
}

impl Drop for RowWatch {
    fn drop(&mut self) {
        self.task.abort()
    }
}
