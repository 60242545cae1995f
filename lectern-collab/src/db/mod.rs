use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lectern_core::ChangeBus;
use thiserror::Error;

mod data;
pub use data::*;

mod memory;
pub use memory::*;

mod pg;
pub use pg::*;

pub type Result<T> = std::result::Result<T, BackendError>;

#[derive(Debug, Error)]
pub enum BackendError {
    /// An unknown or internal error happened with the backend
    #[error(transparent)]
    Internal(Box<dyn std::error::Error + Send + Sync>),
    /// A resource the operation requires doesn't exist
    #[error("{resource}:{identifier} doesn't exist")]
    NotFound {
        resource: &'static str,
        identifier: &'static str,
    },
    /// A value coming across the boundary failed validation
    #[error("{field} has invalid value {value}")]
    Invalid {
        field: &'static str,
        value: String,
    },
}

/// Helper trait to reduce boilerplate
pub trait IntoBackendError {
    fn not_found_or(self, resource: &'static str, identifier: &'static str) -> BackendError;
    fn any(self) -> BackendError;
}

/// Represents a type that can read and mutate lectern data on the hosted
/// backend.
///
/// Components take this as an explicitly constructed instance, never as a
/// process-wide singleton, so every consumer can be handed a test double.
#[async_trait]
pub trait Backend: Send + Sync {
    /// The acting user, if any. Anonymous callers resolve to [None].
    async fn current_user_id(&self) -> Result<Option<PrimaryKey>>;

    async fn create_session(&self, new_session: NewLiveSession) -> Result<LiveSessionData>;
    async fn update_session(&self, id: &str, patch: SessionPatch) -> Result<()>;
    async fn session_by_id(&self, id: &str) -> Result<Option<LiveSessionData>>;
    async fn list_live(&self, limit: u32) -> Result<Vec<LiveSessionData>>;
    /// Adjusts the viewer counter atomically on the backend, so concurrent
    /// joins never lose updates to a read-modify-write race.
    async fn bump_viewers(&self, id: &str, delta: i32) -> Result<()>;

    /// Upserts on the (session, user) pair, so a repeated join refreshes the
    /// existing row instead of duplicating it.
    async fn upsert_attendance(&self, new_attendance: NewAttendance) -> Result<()>;
    async fn close_attendance(
        &self,
        session_id: &str,
        user_id: &str,
        left_at: DateTime<Utc>,
    ) -> Result<()>;
    async fn count_participants(&self, session_id: &str) -> Result<i64>;

    async fn assignments_by_teacher(&self, teacher_id: &str) -> Result<Vec<AssignmentData>>;
    async fn profiles_by_ids(&self, ids: &[PrimaryKey]) -> Result<Vec<ProfileData>>;
    async fn progress_by_ids(&self, ids: &[PrimaryKey]) -> Result<Vec<ProgressData>>;

    async fn list_modules(
        &self,
        category: ModuleCategory,
        level: Option<ModuleLevel>,
    ) -> Result<Vec<ModuleData>>;

    /// The change-notification bus this backend publishes on.
    fn changes(&self) -> &ChangeBus;
}
