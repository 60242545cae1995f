use std::sync::Arc;

use crate::{Backend, BackendError, ModuleCategory, ModuleLevel, PrimaryKey};

/// The read-only exercise catalog, filtered by category and level.
pub struct Catalog<Db> {
    backend: Arc<Db>,
}

/// A catalog module with its derived lesson label.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleEntry {
    pub id: PrimaryKey,
    pub title: String,
    pub description: Option<String>,
    pub category: ModuleCategory,
    pub level: ModuleLevel,
    pub order_index: Option<i32>,
    /// "Lesson N", 1-based
    pub subtitle: String,
}

impl<Db> Catalog<Db>
where
    Db: Backend,
{
    pub const UNTITLED: &'static str = "Untitled Module";

    pub fn new(backend: &Arc<Db>) -> Self {
        Self {
            backend: backend.clone(),
        }
    }

    /// Loads the active modules of a category, optionally narrowed to one
    /// level, in catalog order.
    ///
    /// The lesson number comes from the stored 0-based order index, or from
    /// the position in the result list when a module was never curated.
    pub async fn load(
        &self,
        category: ModuleCategory,
        level: Option<ModuleLevel>,
    ) -> Result<Vec<ModuleEntry>, BackendError> {
        let modules = self.backend.list_modules(category, level).await?;

        let entries = modules
            .into_iter()
            .enumerate()
            .map(|(position, module)| {
                let lesson = module
                    .order_index
                    .map(|index| index + 1)
                    .unwrap_or(position as i32 + 1);

                ModuleEntry {
                    id: module.id,
                    title: module.title.unwrap_or_else(|| Self::UNTITLED.to_string()),
                    description: module.description,
                    category: module.category,
                    level: module.level,
                    order_index: module.order_index,
                    subtitle: format!("Lesson {}", lesson),
                }
            })
            .collect();

        Ok(entries)
    }
}
