use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The remote tables a change notification can originate from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    LiveSessions,
    LiveAttendances,
    TeacherStudents,
    Profiles,
    StudentProgress,
    Modules,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::LiveSessions => "live_sessions",
            Table::LiveAttendances => "live_attendances",
            Table::TeacherStudents => "teacher_students",
            Table::Profiles => "profiles",
            Table::StudentProgress => "student_progress",
            Table::Modules => "modules",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A single insert/update/delete pushed by the backend.
///
/// Row payloads stay untyped JSON until a consumer decodes them, since every
/// table rides the same bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub table: Table,
    pub kind: ChangeKind,
    /// The row state after the change, absent on deletes.
    #[serde(default)]
    pub new: Option<Value>,
    /// The row state before the change, only delivered on updates/deletes.
    #[serde(default)]
    pub old: Option<Value>,
}

impl ChangeEvent {
    /// Returns the new row state, or the old one on deletes.
    pub fn row(&self) -> Option<&Value> {
        self.new.as_ref().or(self.old.as_ref())
    }
}

/// What a subscriber wants to hear about: a table, optionally narrowed to
/// rows where a column has a specific value.
#[derive(Debug, Clone)]
pub struct Topic {
    pub table: Table,
    pub scope: Option<Scope>,
}

/// A row predicate on a topic, equivalent to a `column=eq.value` filter.
#[derive(Debug, Clone)]
pub struct Scope {
    pub column: &'static str,
    pub value: String,
}

impl Topic {
    /// Every change on a table.
    pub fn table(table: Table) -> Self {
        Self { table, scope: None }
    }

    /// Changes on a table, narrowed to rows matching `column = value`.
    pub fn scoped(table: Table, column: &'static str, value: impl Into<String>) -> Self {
        Self {
            table,
            scope: Some(Scope {
                column,
                value: value.into(),
            }),
        }
    }

    /// Returns true if the event belongs to this topic.
    ///
    /// A scoped topic matches when either row state carries the scoped value,
    /// so an update moving a row out of scope is still observed once.
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        if event.table != self.table {
            return false;
        }

        let Some(scope) = &self.scope else {
            return true;
        };

        [&event.new, &event.old]
            .into_iter()
            .flatten()
            .any(|row| scope.matches_row(row))
    }
}

impl Scope {
    fn matches_row(&self, row: &Value) -> bool {
        match row.get(self.column) {
            Some(Value::String(value)) => value == &self.value,
            Some(Value::Number(value)) => value.to_string() == self.value,
            _ => false,
        }
    }
}
