use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::SyncError;

/// Remote collections the sync core knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Collection {
    /// Jobs are still called "fields" on the backend.
    #[serde(rename = "fields")]
    Jobs,
    #[serde(rename = "tasks")]
    Tasks,
    #[serde(rename = "team_members")]
    TeamMembers,
    #[serde(rename = "weather_data")]
    Weather,
}

/// Sort applied to a remote read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderBy {
    pub column: &'static str,
    pub ascending: bool,
}

impl Collection {
    pub const ALL: [Collection; 4] = [
        Collection::Jobs,
        Collection::Tasks,
        Collection::TeamMembers,
        Collection::Weather,
    ];

    /// Collections with live change feeds, local writes and a read-through cache.
    pub const SYNCED: [Collection; 3] =
        [Collection::Jobs, Collection::Tasks, Collection::TeamMembers];

    pub fn table_name(self) -> &'static str {
        match self {
            Collection::Jobs => "fields",
            Collection::Tasks => "tasks",
            Collection::TeamMembers => "team_members",
            Collection::Weather => "weather_data",
        }
    }

    pub fn cache_key(self) -> Option<&'static str> {
        match self {
            Collection::Jobs => Some("cached_fields"),
            Collection::Tasks => Some("cached_tasks"),
            Collection::TeamMembers => Some("cached_team"),
            Collection::Weather => None,
        }
    }

    pub fn order_by(self) -> OrderBy {
        match self {
            Collection::Jobs => OrderBy { column: "created_at", ascending: false },
            Collection::Tasks => OrderBy { column: "due_date", ascending: true },
            Collection::TeamMembers => OrderBy { column: "name", ascending: true },
            Collection::Weather => OrderBy { column: "date", ascending: true },
        }
    }

    /// Newest-first collections place fresh inserts at the front.
    pub fn inserts_at_front(self) -> bool {
        !self.order_by().ascending
    }

    /// Human label used in notifications.
    pub fn display_name(self) -> &'static str {
        match self {
            Collection::Jobs => "Field",
            Collection::Tasks => "Task",
            Collection::TeamMembers => "Team Member",
            Collection::Weather => "Weather",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table_name())
    }
}

impl FromStr for Collection {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Collection::ALL
            .into_iter()
            .find(|c| c.table_name() == s)
            .ok_or_else(|| SyncError::InvalidOperation(format!("unknown collection `{s}`")))
    }
}

/// Logical operation type shared by the queue and the change feed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum OpType {
    Insert,
    Update,
    Delete,
}

impl OpType {
    pub fn as_str(self) -> &'static str {
        match self {
            OpType::Insert => "INSERT",
            OpType::Update => "UPDATE",
            OpType::Delete => "DELETE",
        }
    }
}

impl FromStr for OpType {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INSERT" => Ok(OpType::Insert),
            "UPDATE" => Ok(OpType::Update),
            "DELETE" => Ok(OpType::Delete),
            other => Err(SyncError::InvalidOperation(format!("unknown operation `{other}`"))),
        }
    }
}

/// Read the `id` of a record. Numeric ids (weather rows) are stringified.
pub fn record_id(record: &Value) -> Option<String> {
    match record.get("id")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// A typed row of one collection.
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const COLLECTION: Collection;

    fn id(&self) -> String;

    fn to_record(&self) -> Result<Value, SyncError> {
        Ok(serde_json::to_value(self)?)
    }

    fn from_record(record: &Value) -> Result<Self, SyncError> {
        Ok(Self::deserialize(record)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldStatus {
    Healthy,
    NeedsAttention,
    Critical,
    Harvesting,
}

/// A job site. The backend keeps the historical name `fields`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub id: String,
    pub name: String,
    pub location: String,
    pub size: f64,
    pub crop: String,
    pub status: FieldStatus,
    pub soil_moisture: f64,
    pub temperature: f64,
    pub last_irrigated: String,
    pub next_irrigation: String,
    pub image_url: String,
    pub growth_stage: String,
    pub expected_yield: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl Entity for Field {
    const COLLECTION: Collection = Collection::Jobs;

    fn id(&self) -> String {
        self.id.clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
    pub priority: Priority,
    #[serde(default)]
    pub status: TaskStatus,
    pub due_date: NaiveDate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl Entity for Task {
    const COLLECTION: Collection = Collection::Tasks;

    fn id(&self) -> String {
        self.id.clone()
    }
}

/// Input for creating a task. The id is generated on the client when absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    #[serde(default)]
    pub id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub field_id: Option<String>,
    #[serde(default)]
    pub assigned_to: Option<String>,
    pub priority: Priority,
    #[serde(default)]
    pub status: Option<TaskStatus>,
    pub due_date: NaiveDate,
}

impl NewTask {
    pub fn new(title: impl Into<String>, priority: Priority, due_date: NaiveDate) -> Self {
        Self {
            id: None,
            title: title.into(),
            description: None,
            field_id: None,
            assigned_to: None,
            priority,
            status: None,
            due_date,
        }
    }

    pub fn into_task(self) -> Task {
        Task {
            id: self.id.unwrap_or_else(new_id),
            title: self.title,
            description: Some(self.description.unwrap_or_default()),
            field_id: self.field_id,
            assigned_to: self.assigned_to,
            priority: self.priority,
            status: self.status.unwrap_or_default(),
            due_date: self.due_date,
            completed_at: None,
            user_id: None,
        }
    }
}

/// Partial task update. Only the populated fields are sent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_date: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskPatch {
    pub fn status(status: TaskStatus) -> Self {
        Self { status: Some(status), ..Self::default() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberStatus {
    Available,
    Busy,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamMember {
    pub id: String,
    pub name: String,
    pub role: String,
    pub email: String,
    pub phone: String,
    pub avatar_url: String,
    pub status: MemberStatus,
    #[serde(default)]
    pub assigned_fields: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl Entity for TeamMember {
    const COLLECTION: Collection = Collection::TeamMembers;

    fn id(&self) -> String {
        self.id.clone()
    }
}

/// Read-only forecast row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherData {
    pub id: i64,
    pub date: String,
    pub temperature: f64,
    pub condition: String,
    pub humidity: f64,
    pub wind_speed: f64,
    pub precipitation: f64,
    pub icon: String,
}

impl Entity for WeatherData {
    const COLLECTION: Collection = Collection::Weather;

    fn id(&self) -> String {
        self.id.to_string()
    }
}
