use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use lectern_core::{ChangeBus, ChangeEvent, ChangeKind, Table};
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::util::random_string;

use super::{
    AssignmentData, AttendanceData, Backend, BackendError, LiveSessionData, ModuleCategory,
    ModuleData, ModuleLevel, NewAttendance, NewLiveSession, PrimaryKey, ProfileData, ProgressData,
    Result, SessionPatch,
};

use async_trait::async_trait;

/// An in-memory backend, used as a test double and for local development.
///
/// Behaves like the hosted one where it matters: keys are assigned on insert,
/// attendance upserts on the (session, user) pair, viewer bumps are atomic,
/// and every mutation is published on the change bus.
pub struct MemoryBackend {
    sessions: DashMap<PrimaryKey, LiveSessionData>,
    attendances: DashMap<(PrimaryKey, PrimaryKey), AttendanceData>,
    assignments: Mutex<Vec<(PrimaryKey, AssignmentData)>>,
    profiles: DashMap<PrimaryKey, ProfileData>,
    progress: DashMap<PrimaryKey, ProgressData>,
    modules: Mutex<Vec<StoredModule>>,
    current_user: Mutex<Option<PrimaryKey>>,
    bus: Arc<ChangeBus>,
}

struct StoredModule {
    data: ModuleData,
    active: bool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            sessions: Default::default(),
            attendances: Default::default(),
            assignments: Default::default(),
            profiles: Default::default(),
            progress: Default::default(),
            modules: Default::default(),
            current_user: Default::default(),
            bus: ChangeBus::new(),
        }
    }

    /// Sets the acting user resolved by [Backend::current_user_id].
    pub fn set_current_user(&self, user_id: Option<PrimaryKey>) {
        *self.current_user.lock() = user_id;
    }

    /// Seeds a teacher-to-student assignment row.
    pub fn add_assignment(&self, teacher_id: impl Into<PrimaryKey>, assignment: AssignmentData) {
        let teacher_id = teacher_id.into();
        let row = assignment_row(&teacher_id, &assignment);

        self.assignments.lock().push((teacher_id, assignment));
        self.publish(Table::TeacherStudents, ChangeKind::Insert, Some(row), None);
    }

    /// Seeds a profile row.
    pub fn add_profile(&self, profile: ProfileData) {
        let row = to_row(&profile);

        self.profiles.insert(profile.id.clone(), profile);
        self.publish(Table::Profiles, ChangeKind::Insert, Some(row), None);
    }

    /// Inserts or replaces a student's progress row.
    pub fn put_progress(&self, progress: ProgressData) {
        let row = to_row(&progress);
        let previous = self.progress.insert(progress.student_id.clone(), progress);

        let kind = match previous {
            Some(_) => ChangeKind::Update,
            None => ChangeKind::Insert,
        };

        self.publish(Table::StudentProgress, kind, Some(row), previous.as_ref().map(to_row));
    }

    /// Seeds a catalog module.
    pub fn add_module(&self, module: ModuleData, active: bool) {
        let row = to_row(&module);

        self.modules.lock().push(StoredModule {
            data: module,
            active,
        });
        self.publish(Table::Modules, ChangeKind::Insert, Some(row), None);
    }

    fn publish(&self, table: Table, kind: ChangeKind, new: Option<Value>, old: Option<Value>) {
        self.bus.publish(ChangeEvent {
            table,
            kind,
            new,
            old,
        })
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn current_user_id(&self) -> Result<Option<PrimaryKey>> {
        Ok(self.current_user.lock().clone())
    }

    async fn create_session(&self, new_session: NewLiveSession) -> Result<LiveSessionData> {
        let session = LiveSessionData {
            id: random_string(12),
            host_id: new_session.host_id,
            title: new_session.title,
            session_link: new_session.session_link,
            token: new_session.token,
            slug: new_session.slug,
            status: new_session.status,
            viewers: 0,
            duration: new_session.duration,
            participants: new_session.participants,
            created_at: Utc::now(),
        };

        self.sessions.insert(session.id.clone(), session.clone());
        self.publish(
            Table::LiveSessions,
            ChangeKind::Insert,
            Some(to_row(&session)),
            None,
        );

        Ok(session)
    }

    async fn update_session(&self, id: &str, patch: SessionPatch) -> Result<()> {
        let (old, new) = {
            let mut session = self.sessions.get_mut(id).ok_or(BackendError::NotFound {
                resource: "live session",
                identifier: "id",
            })?;

            let old = session.clone();

            if let Some(status) = patch.status {
                session.status = status;
            }
            if let Some(session_link) = patch.session_link {
                session.session_link = Some(session_link);
            }
            if let Some(duration) = patch.duration {
                session.duration = Some(duration);
            }
            if let Some(participants) = patch.participants {
                session.participants = Some(participants);
            }

            (old, session.clone())
        };

        self.publish(
            Table::LiveSessions,
            ChangeKind::Update,
            Some(to_row(&new)),
            Some(to_row(&old)),
        );

        Ok(())
    }

    async fn session_by_id(&self, id: &str) -> Result<Option<LiveSessionData>> {
        Ok(self.sessions.get(id).map(|s| s.clone()))
    }

    async fn list_live(&self, limit: u32) -> Result<Vec<LiveSessionData>> {
        let mut live: Vec<_> = self
            .sessions
            .iter()
            .filter(|s| s.status == super::SessionStatus::Live)
            .map(|s| s.clone())
            .collect();

        live.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        live.truncate(limit as usize);

        Ok(live)
    }

    async fn bump_viewers(&self, id: &str, delta: i32) -> Result<()> {
        let rows = {
            let mut session = match self.sessions.get_mut(id) {
                Some(session) => session,
                None => return Ok(()),
            };

            let old = session.clone();
            session.viewers += delta;

            Some((old, session.clone()))
        };

        if let Some((old, new)) = rows {
            self.publish(
                Table::LiveSessions,
                ChangeKind::Update,
                Some(to_row(&new)),
                Some(to_row(&old)),
            );
        }

        Ok(())
    }

    async fn upsert_attendance(&self, new_attendance: NewAttendance) -> Result<()> {
        let key = (
            new_attendance.session_id.clone(),
            new_attendance.user_id.clone(),
        );

        let attendance = AttendanceData {
            session_id: new_attendance.session_id,
            user_id: new_attendance.user_id,
            joined_at: new_attendance.joined_at,
            left_at: None,
        };

        let previous = self.attendances.insert(key, attendance.clone());

        let kind = match previous {
            Some(_) => ChangeKind::Update,
            None => ChangeKind::Insert,
        };

        self.publish(
            Table::LiveAttendances,
            kind,
            Some(to_row(&attendance)),
            previous.as_ref().map(to_row),
        );

        Ok(())
    }

    async fn close_attendance(
        &self,
        session_id: &str,
        user_id: &str,
        left_at: DateTime<Utc>,
    ) -> Result<()> {
        let key = (session_id.to_string(), user_id.to_string());

        let rows = {
            let mut attendance = match self.attendances.get_mut(&key) {
                Some(attendance) => attendance,
                None => return Ok(()),
            };

            let old = attendance.clone();
            attendance.left_at = Some(left_at);

            Some((old, attendance.clone()))
        };

        if let Some((old, new)) = rows {
            self.publish(
                Table::LiveAttendances,
                ChangeKind::Update,
                Some(to_row(&new)),
                Some(to_row(&old)),
            );
        }

        Ok(())
    }

    async fn count_participants(&self, session_id: &str) -> Result<i64> {
        let count = self
            .attendances
            .iter()
            .filter(|entry| entry.key().0 == session_id)
            .count();

        Ok(count as i64)
    }

    async fn assignments_by_teacher(&self, teacher_id: &str) -> Result<Vec<AssignmentData>> {
        let assignments = self
            .assignments
            .lock()
            .iter()
            .filter(|(teacher, _)| teacher.as_str() == teacher_id)
            .map(|(_, assignment)| assignment.clone())
            .collect();

        Ok(assignments)
    }

    async fn profiles_by_ids(&self, ids: &[PrimaryKey]) -> Result<Vec<ProfileData>> {
        Ok(ids
            .iter()
            .filter_map(|id| self.profiles.get(id).map(|p| p.clone()))
            .collect())
    }

    async fn progress_by_ids(&self, ids: &[PrimaryKey]) -> Result<Vec<ProgressData>> {
        Ok(ids
            .iter()
            .filter_map(|id| self.progress.get(id).map(|p| p.clone()))
            .collect())
    }

    async fn list_modules(
        &self,
        category: ModuleCategory,
        level: Option<ModuleLevel>,
    ) -> Result<Vec<ModuleData>> {
        let mut modules: Vec<_> = self
            .modules
            .lock()
            .iter()
            .filter(|m| m.active && m.data.category == category)
            .filter(|m| level.map_or(true, |level| m.data.level == level))
            .map(|m| m.data.clone())
            .collect();

        // Curated entries first in index order, uncurated ones keep their
        // insertion order at the end.
        modules.sort_by_key(|m| m.order_index.unwrap_or(i32::MAX));

        Ok(modules)
    }

    fn changes(&self) -> &ChangeBus {
        &self.bus
    }
}

fn to_row<T: serde::Serialize>(value: &T) -> Value {
    serde_json::to_value(value).expect("row data serializes")
}

fn assignment_row(teacher_id: &str, assignment: &AssignmentData) -> Value {
    let mut row = to_row(assignment);

    if let Value::Object(map) = &mut row {
        map.insert("teacher_id".to_string(), json!(teacher_id));
    }

    row
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use lectern_core::Topic;

    use crate::SessionStatus;

    use super::*;

    fn new_session(title: &str) -> NewLiveSession {
        NewLiveSession {
            host_id: None,
            title: title.to_string(),
            status: SessionStatus::Live,
            slug: None,
            session_link: None,
            token: None,
            participants: None,
            duration: None,
        }
    }

    #[tokio::test]
    async fn test_attendance_upsert_is_idempotent() {
        let backend = MemoryBackend::new();
        let session = backend.create_session(new_session("Test")).await.unwrap();

        for _ in 0..2 {
            backend
                .upsert_attendance(NewAttendance {
                    session_id: session.id.clone(),
                    user_id: "u1".to_string(),
                    joined_at: Utc::now(),
                })
                .await
                .unwrap();
        }

        assert_eq!(backend.count_participants(&session.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_viewer_bumps_converge_under_interleaving() {
        let backend = Arc::new(MemoryBackend::new());
        let session = backend.create_session(new_session("Test")).await.unwrap();

        let mut handles = vec![];

        for delta in [1, -1] {
            for _ in 0..50 {
                let backend = backend.clone();
                let id = session.id.clone();

                handles.push(tokio::spawn(async move {
                    backend.bump_viewers(&id, delta).await.unwrap();
                }));
            }
        }

        for handle in handles {
            handle.await.unwrap();
        }

        let session = backend.session_by_id(&session.id).await.unwrap().unwrap();
        assert_eq!(session.viewers, 0);
    }

    #[tokio::test]
    async fn test_mutations_are_published() {
        let backend = MemoryBackend::new();
        let mut subscription = backend.changes().subscribe(Topic::table(Table::LiveSessions));

        let session = backend.create_session(new_session("Test")).await.unwrap();

        let event = subscription.recv().await.unwrap();
        assert_eq!(event.kind, ChangeKind::Insert);
        assert_eq!(
            event.row().and_then(|row| row.get("id")),
            Some(&serde_json::json!(session.id))
        );
    }

    #[tokio::test]
    async fn test_update_session_requires_existing_row() {
        let backend = MemoryBackend::new();

        let result = backend
            .update_session("missing", SessionPatch::default())
            .await;

        assert!(matches!(result, Err(BackendError::NotFound { .. })));
    }
}
