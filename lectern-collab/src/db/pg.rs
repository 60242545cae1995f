use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lectern_core::{ChangeBus, ChangeEvent};
use log::warn;
use sqlx::{
    postgres::{PgListener, PgPoolOptions, PgRow},
    Error as SqlxError, PgPool, Row,
};

use super::{
    AssignmentData, Backend, BackendError, IntoBackendError, LiveSessionData, ModuleCategory,
    ModuleData, ModuleLevel, NewAttendance, NewLiveSession, PrimaryKey, ProfileData, ProgressData,
    Result, SessionPatch,
};

/// A postgres backend implementation for lectern.
///
/// Change notifications arrive over LISTEN/NOTIFY: the database is expected
/// to have row triggers calling `pg_notify('lectern_changes', payload)` with
/// a JSON payload of the shape `{"table", "kind", "new", "old"}`, which is
/// republished verbatim on the change bus.
pub struct PgBackend {
    pool: PgPool,
    acting_user: Option<PrimaryKey>,
    bus: Arc<ChangeBus>,
}

impl PgBackend {
    pub const NOTIFY_CHANNEL: &'static str = "lectern_changes";

    /// The environment variable [Self::connect_from_env] reads the database
    /// url from.
    pub const DATABASE_URL_VAR: &'static str = "LECTERN_DATABASE_URL";

    pub async fn connect_from_env(acting_user: Option<PrimaryKey>) -> Result<Self> {
        let url = std::env::var(Self::DATABASE_URL_VAR)
            .map_err(|e| BackendError::Internal(Box::new(e)))?;

        Self::connect(&url, acting_user).await
    }

    pub async fn connect(url: &str, acting_user: Option<PrimaryKey>) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await
            .map_err(|e| BackendError::Internal(Box::new(e)))?;

        let bus = ChangeBus::new();

        let mut listener = PgListener::connect_with(&pool)
            .await
            .map_err(|e| e.any())?;

        listener
            .listen(Self::NOTIFY_CHANNEL)
            .await
            .map_err(|e| e.any())?;

        spawn_notification_task(listener, bus.clone());

        Ok(Self {
            pool,
            acting_user,
            bus,
        })
    }

    /// Ensure the session exists before touching it
    async fn require_session(&self, id: &str) -> Result<()> {
        sqlx::query("SELECT id FROM live_sessions WHERE id = $1")
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| e.not_found_or("live session", "id"))
            .map(|_| ())
    }
}

#[async_trait]
impl Backend for PgBackend {
    async fn current_user_id(&self) -> Result<Option<PrimaryKey>> {
        Ok(self.acting_user.clone())
    }

    async fn create_session(&self, new_session: NewLiveSession) -> Result<LiveSessionData> {
        let row = sqlx::query(
            "
            INSERT INTO live_sessions
                (host_id, title, status, slug, session_link, token, participants, duration)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING
                id, host_id, title, session_link, token, slug,
                status, viewers, duration, participants, created_at",
        )
        .bind(new_session.host_id)
        .bind(new_session.title)
        .bind(new_session.status.as_str())
        .bind(new_session.slug)
        .bind(new_session.session_link)
        .bind(new_session.token)
        .bind(new_session.participants)
        .bind(new_session.duration)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| e.any())?;

        session_from_row(&row)
    }

    async fn update_session(&self, id: &str, patch: SessionPatch) -> Result<()> {
        self.require_session(id).await?;

        sqlx::query(
            "
            UPDATE live_sessions SET
                status = COALESCE($2::text, status),
                session_link = COALESCE($3::text, session_link),
                duration = COALESCE($4::int4, duration),
                participants = COALESCE($5::int4, participants)
            WHERE id = $1",
        )
        .bind(id)
        .bind(patch.status.map(|s| s.as_str()))
        .bind(patch.session_link)
        .bind(patch.duration)
        .bind(patch.participants)
        .execute(&self.pool)
        .await
        .map_err(|e| e.any())
        .map(|_| ())
    }

    async fn session_by_id(&self, id: &str) -> Result<Option<LiveSessionData>> {
        let row = sqlx::query(
            "
            SELECT
                id, host_id, title, session_link, token, slug,
                status, viewers, duration, participants, created_at
            FROM live_sessions
            WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| e.any())?;

        row.as_ref().map(session_from_row).transpose()
    }

    async fn list_live(&self, limit: u32) -> Result<Vec<LiveSessionData>> {
        let rows = sqlx::query(
            "
            SELECT
                id, host_id, title, session_link, token, slug,
                status, viewers, duration, participants, created_at
            FROM live_sessions
            WHERE status = 'live'
            ORDER BY created_at DESC
            LIMIT $1",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| e.any())?;

        rows.iter().map(session_from_row).collect()
    }

    async fn bump_viewers(&self, id: &str, delta: i32) -> Result<()> {
        sqlx::query("UPDATE live_sessions SET viewers = viewers + $2 WHERE id = $1")
            .bind(id)
            .bind(delta)
            .execute(&self.pool)
            .await
            .map_err(|e| e.any())
            .map(|_| ())
    }

    async fn upsert_attendance(&self, new_attendance: NewAttendance) -> Result<()> {
        sqlx::query(
            "
            INSERT INTO live_attendances (session_id, user_id, joined_at, left_at)
            VALUES ($1, $2, $3, NULL)
            ON CONFLICT (session_id, user_id)
            DO UPDATE SET joined_at = EXCLUDED.joined_at, left_at = NULL",
        )
        .bind(new_attendance.session_id)
        .bind(new_attendance.user_id)
        .bind(new_attendance.joined_at)
        .execute(&self.pool)
        .await
        .map_err(|e| e.any())
        .map(|_| ())
    }

    async fn close_attendance(
        &self,
        session_id: &str,
        user_id: &str,
        left_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "
            UPDATE live_attendances SET left_at = $3
            WHERE session_id = $1 AND user_id = $2",
        )
        .bind(session_id)
        .bind(user_id)
        .bind(left_at)
        .execute(&self.pool)
        .await
        .map_err(|e| e.any())
        .map(|_| ())
    }

    async fn count_participants(&self, session_id: &str) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) FROM live_attendances WHERE session_id = $1")
            .bind(session_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| e.any())?;

        row.try_get(0).map_err(|e| e.any())
    }

    async fn assignments_by_teacher(&self, teacher_id: &str) -> Result<Vec<AssignmentData>> {
        let rows = sqlx::query(
            "
            SELECT student_id, grade_level, strand, status
            FROM teacher_students
            WHERE teacher_id = $1",
        )
        .bind(teacher_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| e.any())?;

        rows.iter().map(assignment_from_row).collect()
    }

    async fn profiles_by_ids(&self, ids: &[PrimaryKey]) -> Result<Vec<ProfileData>> {
        let rows = sqlx::query("SELECT id, name FROM profiles WHERE id = ANY($1)")
            .bind(ids)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| e.any())?;

        rows.iter()
            .map(|row| {
                Ok(ProfileData {
                    id: row.try_get("id").map_err(|e| e.any())?,
                    name: row.try_get("name").map_err(|e| e.any())?,
                })
            })
            .collect()
    }

    async fn progress_by_ids(&self, ids: &[PrimaryKey]) -> Result<Vec<ProgressData>> {
        let rows = sqlx::query(
            "SELECT student_id, progress FROM student_progress WHERE student_id = ANY($1)",
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| e.any())?;

        rows.iter()
            .map(|row| {
                Ok(ProgressData {
                    student_id: row.try_get("student_id").map_err(|e| e.any())?,
                    progress: row.try_get("progress").map_err(|e| e.any())?,
                })
            })
            .collect()
    }

    async fn list_modules(
        &self,
        category: ModuleCategory,
        level: Option<ModuleLevel>,
    ) -> Result<Vec<ModuleData>> {
        let rows = sqlx::query(
            "
            SELECT id, title, description, category, level, order_index
            FROM modules
            WHERE active = TRUE
                AND category = $1
                AND ($2::text IS NULL OR level = $2)
            ORDER BY order_index ASC, created_at ASC",
        )
        .bind(category.as_str())
        .bind(level.map(|l| l.as_str()))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| e.any())?;

        rows.iter().map(module_from_row).collect()
    }

    fn changes(&self) -> &ChangeBus {
        &self.bus
    }
}

fn spawn_notification_task(mut listener: PgListener, bus: Arc<ChangeBus>) {
    tokio::spawn(async move {
        loop {
            match listener.recv().await {
                Ok(notification) => {
                    match serde_json::from_str::<ChangeEvent>(notification.payload()) {
                        Ok(event) => bus.publish(event),
                        Err(e) => warn!("Ignoring malformed change payload: {}", e),
                    }
                }
                Err(e) => {
                    warn!("Change listener disconnected: {}", e);
                    break;
                }
            }
        }
    });
}

fn session_from_row(row: &PgRow) -> Result<LiveSessionData> {
    let status: String = row.try_get("status").map_err(|e| e.any())?;

    Ok(LiveSessionData {
        id: row.try_get("id").map_err(|e| e.any())?,
        host_id: row.try_get("host_id").map_err(|e| e.any())?,
        title: row.try_get("title").map_err(|e| e.any())?,
        session_link: row.try_get("session_link").map_err(|e| e.any())?,
        token: row.try_get("token").map_err(|e| e.any())?,
        slug: row.try_get("slug").map_err(|e| e.any())?,
        status: status.parse()?,
        viewers: row.try_get("viewers").map_err(|e| e.any())?,
        duration: row.try_get("duration").map_err(|e| e.any())?,
        participants: row.try_get("participants").map_err(|e| e.any())?,
        created_at: row.try_get("created_at").map_err(|e| e.any())?,
    })
}

fn assignment_from_row(row: &PgRow) -> Result<AssignmentData> {
    // A missing status means the assignment was never deactivated
    let status: Option<String> = row.try_get("status").map_err(|e| e.any())?;
    let status = match status {
        Some(value) => value.parse()?,
        None => super::AssignmentStatus::Active,
    };

    Ok(AssignmentData {
        student_id: row.try_get("student_id").map_err(|e| e.any())?,
        grade_level: row.try_get("grade_level").map_err(|e| e.any())?,
        strand: row.try_get("strand").map_err(|e| e.any())?,
        status,
    })
}

fn module_from_row(row: &PgRow) -> Result<ModuleData> {
    let category: String = row.try_get("category").map_err(|e| e.any())?;
    let level: String = row.try_get("level").map_err(|e| e.any())?;

    Ok(ModuleData {
        id: row.try_get("id").map_err(|e| e.any())?,
        title: row.try_get("title").map_err(|e| e.any())?,
        description: row.try_get("description").map_err(|e| e.any())?,
        category: category.parse()?,
        level: level.parse()?,
        order_index: row.try_get("order_index").map_err(|e| e.any())?,
    })
}

impl IntoBackendError for SqlxError {
    fn any(self) -> BackendError {
        BackendError::Internal(Box::new(self))
    }

    fn not_found_or(self, resource: &'static str, identifier: &'static str) -> BackendError {
        match self {
            SqlxError::RowNotFound => BackendError::NotFound {
                resource,
                identifier,
            },
            e => Self::any(e),
        }
    }
}
