use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::BackendError;

/// The type used for primary keys on the backend.
pub type PrimaryKey = String;

/// Where a live session is in its lifecycle.
///
/// This is a closed set: anything else arriving from the backend is rejected
/// at the boundary instead of being carried around as a loose string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Live,
    Scheduled,
    Ended,
    Hidden,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Live => "live",
            SessionStatus::Scheduled => "scheduled",
            SessionStatus::Ended => "ended",
            SessionStatus::Hidden => "hidden",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = BackendError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "live" => Ok(SessionStatus::Live),
            "scheduled" => Ok(SessionStatus::Scheduled),
            "ended" => Ok(SessionStatus::Ended),
            "hidden" => Ok(SessionStatus::Hidden),
            other => Err(BackendError::Invalid {
                field: "status",
                value: other.to_string(),
            }),
        }
    }
}

/// One live broadcast instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveSessionData {
    pub id: PrimaryKey,
    /// The user hosting the session, absent for anonymous hosts
    pub host_id: Option<PrimaryKey>,
    pub title: String,
    pub session_link: Option<String>,
    /// The join token handed to participants
    pub token: Option<String>,
    pub slug: Option<String>,
    pub status: SessionStatus,
    pub viewers: i32,
    /// Final duration in seconds, attached when the session ends
    pub duration: Option<i32>,
    pub participants: Option<i32>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewLiveSession {
    pub host_id: Option<PrimaryKey>,
    pub title: String,
    pub status: SessionStatus,
    pub slug: Option<String>,
    pub session_link: Option<String>,
    pub token: Option<String>,
    pub participants: Option<i32>,
    pub duration: Option<i32>,
}

/// A partial update to a live session. Absent fields keep their stored value.
#[derive(Debug, Clone, Default)]
pub struct SessionPatch {
    pub status: Option<SessionStatus>,
    pub session_link: Option<String>,
    pub duration: Option<i32>,
    pub participants: Option<i32>,
}

/// One user's presence in one session.
/// Note: `session_id` and `user_id` are unique together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceData {
    pub session_id: PrimaryKey,
    pub user_id: PrimaryKey,
    pub joined_at: DateTime<Utc>,
    /// Populated once the user leaves; an open attendance has none
    pub left_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewAttendance {
    pub session_id: PrimaryKey,
    pub user_id: PrimaryKey,
    pub joined_at: DateTime<Utc>,
}

/// Whether a student assignment is currently active for its teacher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssignmentStatus {
    Active,
    Inactive,
}

impl AssignmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssignmentStatus::Active => "active",
            AssignmentStatus::Inactive => "inactive",
        }
    }
}

impl FromStr for AssignmentStatus {
    type Err = BackendError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "active" => Ok(AssignmentStatus::Active),
            "inactive" => Ok(AssignmentStatus::Inactive),
            other => Err(BackendError::Invalid {
                field: "status",
                value: other.to_string(),
            }),
        }
    }
}

/// A teacher-to-student assignment row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignmentData {
    pub student_id: PrimaryKey,
    pub grade_level: Option<String>,
    pub strand: Option<String>,
    pub status: AssignmentStatus,
}

/// A user profile row, read for display names
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileData {
    pub id: PrimaryKey,
    pub name: Option<String>,
}

/// A student's overall completion percentage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressData {
    pub student_id: PrimaryKey,
    pub progress: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleCategory {
    Speaking,
    Reading,
}

impl ModuleCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleCategory::Speaking => "speaking",
            ModuleCategory::Reading => "reading",
        }
    }
}

impl FromStr for ModuleCategory {
    type Err = BackendError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "speaking" => Ok(ModuleCategory::Speaking),
            "reading" => Ok(ModuleCategory::Reading),
            other => Err(BackendError::Invalid {
                field: "category",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleLevel {
    Basic,
    Advanced,
}

impl ModuleLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleLevel::Basic => "basic",
            ModuleLevel::Advanced => "advanced",
        }
    }
}

impl FromStr for ModuleLevel {
    type Err = BackendError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "basic" => Ok(ModuleLevel::Basic),
            "advanced" => Ok(ModuleLevel::Advanced),
            other => Err(BackendError::Invalid {
                field: "level",
                value: other.to_string(),
            }),
        }
    }
}

/// A read-only exercise catalog entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleData {
    pub id: PrimaryKey,
    pub title: Option<String>,
    pub description: Option<String>,
    pub category: ModuleCategory,
    pub level: ModuleLevel,
    /// 0-based position within the catalog, when curated
    pub order_index: Option<i32>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_session_status_is_a_closed_set() {
        assert_eq!("live".parse::<SessionStatus>().unwrap(), SessionStatus::Live);
        assert_eq!("ended".parse::<SessionStatus>().unwrap(), SessionStatus::Ended);

        let rejected = "paused".parse::<SessionStatus>();
        assert!(matches!(
            rejected,
            Err(BackendError::Invalid { field: "status", .. })
        ));
    }

    #[test]
    fn test_status_round_trips_through_json() {
        let encoded = serde_json::to_string(&SessionStatus::Scheduled).unwrap();
        assert_eq!(encoded, "\"scheduled\"");

        let decoded: SessionStatus = serde_json::from_str("\"hidden\"").unwrap();
        assert_eq!(decoded, SessionStatus::Hidden);

        assert!(serde_json::from_str::<SessionStatus>("\"paused\"").is_err());
    }
}
