use std::collections::HashMap;
use std::sync::{Arc, Weak};

use futures_util::future::try_join;
use lectern_core::{Sequence, Table, Topic};
use log::{debug, warn};
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::{AssignmentData, AssignmentStatus, Backend, BackendError, PrimaryKey, ProfileData, ProgressData};

const UNKNOWN_STUDENT: &str = "Unknown Student";

/// One student in a teacher's roster, joined client-side from the
/// assignment, profile, and progress tables.
#[derive(Debug, Clone, PartialEq)]
pub struct RosterEntry {
    pub student_id: PrimaryKey,
    pub name: String,
    pub initials: String,
    pub grade: String,
    pub strand: String,
    pub status: AssignmentStatus,
    pub progress: i32,
}

/// The published state of a roster.
///
/// Failure is explicit, so a fetch error is never mistaken for a teacher
/// with no students.
#[derive(Debug, Clone, PartialEq)]
pub enum RosterLoad {
    Loading,
    Loaded(Vec<RosterEntry>),
    Failed(String),
}

/// A teacher's roster, kept fresh by change notifications on the underlying
/// tables.
///
/// Every triggering change re-runs the full fetch-and-join; the joined list
/// replaces the previous snapshot wholesale. Overlapping refreshes are
/// guarded by a sequence ticket, so only the most recently issued one may
/// publish its result.
pub struct RosterView<Db> {
    me: Weak<Self>,
    backend: Arc<Db>,
    teacher_id: PrimaryKey,
    state: Mutex<RosterLoad>,
    refreshes: Sequence,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<Db> RosterView<Db>
where
    Db: Backend + 'static,
{
    pub fn new(backend: &Arc<Db>, teacher_id: impl Into<PrimaryKey>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            backend: backend.clone(),
            teacher_id: teacher_id.into(),
            state: Mutex::new(RosterLoad::Loading),
            refreshes: Sequence::new(),
            tasks: Default::default(),
        })
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> RosterLoad {
        self.state.lock().clone()
    }

    /// The loaded entries with active status. Purely local: switching
    /// between this and [Self::inactive] never fetches.
    pub fn active(&self) -> Vec<RosterEntry> {
        self.filtered(AssignmentStatus::Active)
    }

    /// The loaded entries with inactive status.
    pub fn inactive(&self) -> Vec<RosterEntry> {
        self.filtered(AssignmentStatus::Inactive)
    }

    fn filtered(&self, status: AssignmentStatus) -> Vec<RosterEntry> {
        match &*self.state.lock() {
            RosterLoad::Loaded(entries) => entries
                .iter()
                .filter(|entry| entry.status == status)
                .cloned()
                .collect(),
            _ => vec![],
        }
    }

    /// Re-runs the full fetch-and-join and publishes the result, unless a
    /// newer refresh was issued while this one was in flight.
    pub async fn refresh(&self) {
        let ticket = self.refreshes.issue();
        let result = self.build().await;

        if !self.refreshes.is_current(ticket) {
            debug!(
                "Discarding stale roster refresh for teacher {}",
                self.teacher_id
            );
            return;
        }

        *self.state.lock() = match result {
            Ok(entries) => RosterLoad::Loaded(entries),
            Err(e) => {
                warn!("Roster refresh for teacher {} failed: {}", self.teacher_id, e);
                RosterLoad::Failed(e.to_string())
            }
        };
    }

    async fn build(&self) -> Result<Vec<RosterEntry>, BackendError> {
        let assignments = self
            .backend
            .assignments_by_teacher(&self.teacher_id)
            .await?;

        if assignments.is_empty() {
            return Ok(vec![]);
        }

        let ids = distinct_student_ids(&assignments);

        let (profiles, progress) = try_join(
            self.backend.profiles_by_ids(&ids),
            self.backend.progress_by_ids(&ids),
        )
        .await?;

        Ok(join_rows(&assignments, profiles, progress))
    }

    /// Loads the roster and starts refreshing it whenever the assignment
    /// table (scoped to this teacher) or the progress table changes.
    pub async fn start(&self) {
        self.refresh().await;

        let mut tasks = self.tasks.lock();

        if !tasks.is_empty() {
            return;
        }

        let topics = [
            Topic::scoped(Table::TeacherStudents, "teacher_id", self.teacher_id.clone()),
            Topic::table(Table::StudentProgress),
        ];

        for topic in topics {
            let mut subscription = self.backend.changes().subscribe(topic);
            let view = self.me.clone();

            tasks.push(tokio::spawn(async move {
                while subscription.recv().await.is_some() {
                    let Some(view) = view.upgrade() else {
                        break;
                    };

                    view.refresh().await;
                }
            }));
        }
    }

    /// Releases the change subscriptions. Never errors, no matter how often
    /// it is called or whether the bus still exists.
    pub fn stop(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl<Db> Drop for RosterView<Db> {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

fn distinct_student_ids(assignments: &[AssignmentData]) -> Vec<PrimaryKey> {
    let mut ids: Vec<PrimaryKey> = Vec::new();

    for assignment in assignments {
        if !ids.contains(&assignment.student_id) {
            ids.push(assignment.student_id.clone());
        }
    }

    ids
}

/// Produces one joined record per assignment row. Duplicate assignment rows
/// for the same student are kept as-is.
fn join_rows(
    assignments: &[AssignmentData],
    profiles: Vec<ProfileData>,
    progress: Vec<ProgressData>,
) -> Vec<RosterEntry> {
    let by_profile: HashMap<PrimaryKey, ProfileData> =
        profiles.into_iter().map(|p| (p.id.clone(), p)).collect();
    let by_progress: HashMap<PrimaryKey, ProgressData> = progress
        .into_iter()
        .map(|p| (p.student_id.clone(), p))
        .collect();

    assignments
        .iter()
        .map(|assignment| {
            let name = by_profile
                .get(&assignment.student_id)
                .and_then(|profile| profile.name.as_deref())
                .map(str::trim)
                .filter(|name| !name.is_empty());

            let (name, initials) = match name {
                Some(name) => (name.to_string(), initials(name)),
                None => (UNKNOWN_STUDENT.to_string(), "?".to_string()),
            };

            let progress = by_progress
                .get(&assignment.student_id)
                .and_then(|p| p.progress)
                .unwrap_or(0);

            RosterEntry {
                student_id: assignment.student_id.clone(),
                name,
                initials,
                grade: assignment.grade_level.clone().unwrap_or_default(),
                strand: assignment.strand.clone().unwrap_or_default(),
                status: assignment.status,
                progress,
            }
        })
        .collect()
}

/// Uppercased first letters of the first two name tokens; "?" when the name
/// has none.
fn initials(name: &str) -> String {
    let letters: String = name
        .split_whitespace()
        .take(2)
        .filter_map(|token| token.chars().next())
        .flat_map(|letter| letter.to_uppercase())
        .collect();

    if letters.is_empty() {
        "?".to_string()
    } else {
        letters
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use lectern_core::ChangeBus;
    use tokio::time::{sleep, timeout, Duration};

    use crate::{
        LiveSessionData, MemoryBackend, ModuleCategory, ModuleData, ModuleLevel, NewAttendance,
        NewLiveSession, SessionPatch,
    };

    use super::*;

    fn assignment(student_id: &str, status: AssignmentStatus) -> AssignmentData {
        AssignmentData {
            student_id: student_id.to_string(),
            grade_level: Some("Grade 7".to_string()),
            strand: Some("STEM".to_string()),
            status,
        }
    }

    fn profile(id: &str, name: &str) -> ProfileData {
        ProfileData {
            id: id.to_string(),
            name: Some(name.to_string()),
        }
    }

    #[test]
    fn test_initials_derivation() {
        assert_eq!(initials("Maria Santos"), "MS");
        assert_eq!(initials("Cher"), "C");
        assert_eq!(initials("ana maria reyes"), "AM");
        assert_eq!(initials(""), "?");
        assert_eq!(initials("   "), "?");
    }

    #[test]
    fn test_join_defaults() {
        let assignments = vec![
            assignment("a", AssignmentStatus::Active),
            assignment("b", AssignmentStatus::Active),
            assignment("c", AssignmentStatus::Inactive),
        ];
        let profiles = vec![profile("a", "Maria Santos"), profile("b", "Cher")];
        let progress = vec![ProgressData {
            student_id: "a".to_string(),
            progress: Some(80),
        }];

        let entries = join_rows(&assignments, profiles, progress);

        assert_eq!(entries.len(), 3);

        assert_eq!(entries[0].name, "Maria Santos");
        assert_eq!(entries[0].initials, "MS");
        assert_eq!(entries[0].progress, 80);

        assert_eq!(entries[1].name, "Cher");
        assert_eq!(entries[1].initials, "C");
        assert_eq!(entries[1].progress, 0);

        assert_eq!(entries[2].name, UNKNOWN_STUDENT);
        assert_eq!(entries[2].initials, "?");
        assert_eq!(entries[2].progress, 0);
    }

    #[test]
    fn test_duplicate_assignments_are_kept() {
        let assignments = vec![
            assignment("a", AssignmentStatus::Active),
            assignment("a", AssignmentStatus::Active),
        ];

        let entries = join_rows(&assignments, vec![profile("a", "Maria Santos")], vec![]);

        assert_eq!(entries.len(), 2);
        assert_eq!(distinct_student_ids(&assignments).len(), 1);
    }

    /// Delegates to a [MemoryBackend] while counting roster fetch cycles and
    /// optionally refusing them.
    struct InstrumentedBackend {
        inner: MemoryBackend,
        assignment_fetches: AtomicUsize,
        refuse: AtomicBool,
    }

    impl InstrumentedBackend {
        fn new(inner: MemoryBackend) -> Self {
            Self {
                inner,
                assignment_fetches: AtomicUsize::new(0),
                refuse: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl Backend for InstrumentedBackend {
        async fn current_user_id(&self) -> crate::Result<Option<PrimaryKey>> {
            self.inner.current_user_id().await
        }

        async fn create_session(
            &self,
            new_session: NewLiveSession,
        ) -> crate::Result<LiveSessionData> {
            self.inner.create_session(new_session).await
        }

        async fn update_session(&self, id: &str, patch: SessionPatch) -> crate::Result<()> {
            self.inner.update_session(id, patch).await
        }

        async fn session_by_id(&self, id: &str) -> crate::Result<Option<LiveSessionData>> {
            self.inner.session_by_id(id).await
        }

        async fn list_live(&self, limit: u32) -> crate::Result<Vec<LiveSessionData>> {
            self.inner.list_live(limit).await
        }

        async fn bump_viewers(&self, id: &str, delta: i32) -> crate::Result<()> {
            self.inner.bump_viewers(id, delta).await
        }

        async fn upsert_attendance(&self, new_attendance: NewAttendance) -> crate::Result<()> {
            self.inner.upsert_attendance(new_attendance).await
        }

        async fn close_attendance(
            &self,
            session_id: &str,
            user_id: &str,
            left_at: DateTime<Utc>,
        ) -> crate::Result<()> {
            self.inner.close_attendance(session_id, user_id, left_at).await
        }

        async fn count_participants(&self, session_id: &str) -> crate::Result<i64> {
            self.inner.count_participants(session_id).await
        }

        async fn assignments_by_teacher(
            &self,
            teacher_id: &str,
        ) -> crate::Result<Vec<AssignmentData>> {
            self.assignment_fetches.fetch_add(1, Ordering::SeqCst);

            if self.refuse.load(Ordering::SeqCst) {
                return Err(BackendError::Internal(Box::new(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "connection refused",
                ))));
            }

            self.inner.assignments_by_teacher(teacher_id).await
        }

        async fn profiles_by_ids(&self, ids: &[PrimaryKey]) -> crate::Result<Vec<ProfileData>> {
            self.inner.profiles_by_ids(ids).await
        }

        async fn progress_by_ids(&self, ids: &[PrimaryKey]) -> crate::Result<Vec<ProgressData>> {
            self.inner.progress_by_ids(ids).await
        }

        async fn list_modules(
            &self,
            category: ModuleCategory,
            level: Option<ModuleLevel>,
        ) -> crate::Result<Vec<ModuleData>> {
            self.inner.list_modules(category, level).await
        }

        fn changes(&self) -> &ChangeBus {
            self.inner.changes()
        }
    }

    fn seeded_backend() -> MemoryBackend {
        let backend = MemoryBackend::new();

        backend.add_assignment("t1", assignment("a", AssignmentStatus::Active));
        backend.add_assignment("t1", assignment("b", AssignmentStatus::Inactive));
        backend.add_profile(profile("a", "Maria Santos"));
        backend.add_profile(profile("b", "Cher"));
        backend.put_progress(ProgressData {
            student_id: "a".to_string(),
            progress: Some(40),
        });

        backend
    }

    #[tokio::test]
    async fn test_tab_filtering_does_not_fetch() {
        let backend = Arc::new(InstrumentedBackend::new(seeded_backend()));
        let roster = RosterView::new(&backend, "t1");

        roster.refresh().await;
        assert_eq!(backend.assignment_fetches.load(Ordering::SeqCst), 1);

        for _ in 0..3 {
            assert_eq!(roster.active().len(), 1);
            assert_eq!(roster.inactive().len(), 1);
        }

        assert_eq!(backend.assignment_fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_fetch_is_not_an_empty_roster() {
        let backend = Arc::new(InstrumentedBackend::new(seeded_backend()));
        let roster = RosterView::new(&backend, "t1");

        backend.refuse.store(true, Ordering::SeqCst);
        roster.refresh().await;

        assert!(matches!(roster.snapshot(), RosterLoad::Failed(_)));

        backend.refuse.store(false, Ordering::SeqCst);
        roster.refresh().await;

        assert!(matches!(roster.snapshot(), RosterLoad::Loaded(_)));
    }

    #[tokio::test]
    async fn test_empty_roster_loads_empty() {
        let backend = Arc::new(MemoryBackend::new());
        let roster = RosterView::new(&backend, "t1");

        roster.refresh().await;

        assert_eq!(roster.snapshot(), RosterLoad::Loaded(vec![]));
    }

    #[tokio::test]
    async fn test_progress_changes_refresh_the_roster() {
        let backend = Arc::new(seeded_backend());
        let roster = RosterView::new(&backend, "t1");

        roster.start().await;

        backend.put_progress(ProgressData {
            student_id: "a".to_string(),
            progress: Some(90),
        });

        let updated = timeout(Duration::from_secs(2), async {
            loop {
                if let RosterLoad::Loaded(entries) = roster.snapshot() {
                    if entries.iter().any(|e| e.progress == 90) {
                        break entries;
                    }
                }

                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("refresh catches the progress change");

        assert_eq!(updated.len(), 2);

        // Releasing repeatedly stays quiet
        roster.stop();
        roster.stop();
    }
}
