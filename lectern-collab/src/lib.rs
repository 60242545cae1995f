mod catalog;
mod db;
mod roster;
mod sessions;
mod speech;
mod util;

use std::sync::Arc;

pub use catalog::*;
pub use db::*;
pub use roster::*;
pub use sessions::*;
pub use speech::*;

/// The lectern collab system, facilitating live sessions, rosters, and the
/// exercise catalog over an explicitly injected backend.
pub struct Lectern<Db> {
    backend: Arc<Db>,

    pub sessions: SessionManager<Db>,
    pub catalog: Catalog<Db>,
}

impl<Db> Lectern<Db>
where
    Db: Backend + 'static,
{
    pub fn new(backend: Db) -> Self {
        let backend = Arc::new(backend);

        Self {
            sessions: SessionManager::new(&backend),
            catalog: Catalog::new(&backend),
            backend,
        }
    }

    /// Builds a roster view for the given teacher.
    pub fn roster(&self, teacher_id: impl Into<PrimaryKey>) -> Arc<RosterView<Db>> {
        RosterView::new(&self.backend, teacher_id)
    }

    pub fn backend(&self) -> &Arc<Db> {
        &self.backend
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_components_share_one_backend() {
        let lectern = Lectern::new(MemoryBackend::new());
        lectern.backend().set_current_user(Some("t1".to_string()));

        let session = lectern
            .sessions
            .create("Morning Reading", SessionOptions::default())
            .await
            .unwrap();

        assert_eq!(session.host_id.as_deref(), Some("t1"));

        let roster = lectern.roster("t1");
        roster.refresh().await;

        assert_eq!(roster.snapshot(), RosterLoad::Loaded(vec![]));
    }
}
