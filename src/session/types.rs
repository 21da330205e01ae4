//! Session record and mailbox entry types.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current session record schema version.
pub const SESSION_SCHEMA_VERSION: u32 = 1;

/// Default capacity of a record's execution timeline.
pub const DEFAULT_TIMELINE_CAP: usize = 200;

/// Kind of conversation a session holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    /// The agent's long-lived conversation with its user.
    #[default]
    Primary,
    /// Heartbeat bookkeeping for an agent.
    Heartbeat,
    /// Ephemeral session for one isolated task run.
    Job,
    /// Conversation bound to an external channel.
    Channel,
    /// Child session spawned from another session.
    Sub,
}

impl fmt::Display for SessionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Primary => "primary",
            Self::Heartbeat => "heartbeat",
            Self::Job => "job",
            Self::Channel => "channel",
            Self::Sub => "sub",
        };
        f.write_str(s)
    }
}

/// Whether a session is live or retired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Active,
    Archived,
}

/// Identity of a session: its id plus what is needed to create it.
///
/// Ids follow `{agent}.{type}[.{suffix}]`, e.g. `ada.primary` or
/// `ada.job.3f2c...`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub id: String,
    pub agent: String,
    pub session_type: SessionType,
}

impl SessionKey {
    /// The agent's primary session.
    pub fn primary(agent: &str) -> Self {
        Self {
            id: format!("{agent}.primary"),
            agent: agent.to_owned(),
            session_type: SessionType::Primary,
        }
    }

    /// The agent's heartbeat bookkeeping session.
    pub fn heartbeat(agent: &str) -> Self {
        Self {
            id: format!("{agent}.heartbeat"),
            agent: agent.to_owned(),
            session_type: SessionType::Heartbeat,
        }
    }

    /// A fresh ephemeral job session.
    pub fn job(agent: &str) -> Self {
        Self {
            id: format!("{agent}.job.{}", uuid::Uuid::new_v4().simple()),
            agent: agent.to_owned(),
            session_type: SessionType::Job,
        }
    }

    /// The session bound to `channel`.
    pub fn channel(agent: &str, channel: &str) -> Self {
        Self {
            id: format!("{agent}.channel.{channel}"),
            agent: agent.to_owned(),
            session_type: SessionType::Channel,
        }
    }

    /// A fresh child session.
    pub fn sub(agent: &str) -> Self {
        Self {
            id: format!("{agent}.sub.{}", uuid::Uuid::new_v4().simple()),
            agent: agent.to_owned(),
            session_type: SessionType::Sub,
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// Role of a conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

/// One message of persisted conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub role: MessageRole,
    pub content: String,
    pub at: DateTime<Utc>,
}

impl HistoryMessage {
    pub fn new(role: MessageRole, content: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            role,
            content: content.into(),
            at,
        }
    }
}

/// One entry of a session's execution timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub at: DateTime<Utc>,
    /// Short machine-friendly kind ("turn_complete", "task_failed", ...).
    pub kind: String,
    #[serde(default)]
    pub detail: String,
}

impl TimelineEntry {
    pub fn new(at: DateTime<Utc>, kind: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            at,
            kind: kind.into(),
            detail: detail.into(),
        }
    }
}

/// What went into the most recent turn's prompt.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ContextTrace {
    pub recorded_at: Option<DateTime<Utc>>,
    /// Why the turn ran ("heartbeat:structured_due", "task:inbox", ...).
    #[serde(default)]
    pub trigger: String,
    #[serde(default)]
    pub task_ids: Vec<String>,
    #[serde(default)]
    pub prompt_chars: usize,
    #[serde(default)]
    pub system_prompt_override: bool,
}

/// Mailbox entry priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EventPriority {
    Low,
    #[default]
    Normal,
    High,
}

/// A notification deposited into a session's mailbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemEvent {
    /// Idempotency key: a second deposit with the same id is a no-op.
    pub event_id: String,
    /// Category ("task_result", "heartbeat", "diagnostic", ...).
    pub event_type: String,
    pub source_session_id: String,
    pub timestamp: DateTime<Utc>,
    pub summary: String,
    #[serde(default)]
    pub detail: String,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub priority: EventPriority,
    /// Drop the event once it is older than the staleness window.
    #[serde(default)]
    pub suppress_if_stale: bool,
    /// Newer events with the same key replace older ones.
    #[serde(default)]
    pub dedupe_key: Option<String>,
}

impl SystemEvent {
    /// Event with a fresh random id and normal priority.
    pub fn new(
        event_type: impl Into<String>,
        source_session_id: impl Into<String>,
        summary: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            source_session_id: source_session_id.into(),
            timestamp,
            summary: summary.into(),
            detail: String::new(),
            artifacts: Vec::new(),
            priority: EventPriority::Normal,
            suppress_if_stale: false,
            dedupe_key: None,
        }
    }

    pub fn with_event_id(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = event_id.into();
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }

    pub fn with_priority(mut self, priority: EventPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }

    pub fn suppress_if_stale(mut self) -> Self {
        self.suppress_if_stale = true;
        self
    }

    /// Stale events are those flagged `suppress_if_stale` and older than `window`.
    #[must_use]
    pub fn is_stale(&self, now: DateTime<Utc>, window: chrono::Duration) -> bool {
        self.suppress_if_stale && now.signed_duration_since(self.timestamp) > window
    }
}

/// Persisted state of one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub session_id: String,
    pub agent_name: String,
    pub session_type: SessionType,
    #[serde(default)]
    pub history_messages: Vec<HistoryMessage>,
    #[serde(default)]
    pub mailbox: Vec<SystemEvent>,
    #[serde(default)]
    pub variables: BTreeMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub state: SessionState,
    #[serde(default)]
    pub archived_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub timeline: VecDeque<TimelineEntry>,
    #[serde(default)]
    pub context_trace: Option<ContextTrace>,
    /// Incremented on every persisted mutation.
    #[serde(default)]
    pub revision: u64,
    /// SHA-256 of the record serialized with this field empty.
    #[serde(default)]
    pub checksum: String,
}

fn default_schema_version() -> u32 {
    SESSION_SCHEMA_VERSION
}

impl SessionRecord {
    /// Empty record for `key`, revision 0.
    pub fn new(key: &SessionKey, now: DateTime<Utc>) -> Self {
        Self {
            schema_version: SESSION_SCHEMA_VERSION,
            session_id: key.id.clone(),
            agent_name: key.agent.clone(),
            session_type: key.session_type,
            history_messages: Vec::new(),
            mailbox: Vec::new(),
            variables: BTreeMap::new(),
            created_at: now,
            updated_at: now,
            state: SessionState::Active,
            archived_at: None,
            timeline: VecDeque::new(),
            context_trace: None,
            revision: 0,
            checksum: String::new(),
        }
    }

    /// Append to the timeline, dropping the oldest entries beyond `cap`.
    pub fn push_timeline(&mut self, entry: TimelineEntry, cap: usize) {
        self.timeline.push_back(entry);
        while self.timeline.len() > cap.max(1) {
            self.timeline.pop_front();
        }
    }

    /// Mark archived at `now`. Idempotent.
    pub fn archive(&mut self, now: DateTime<Utc>) {
        if self.state != SessionState::Archived {
            self.state = SessionState::Archived;
            self.archived_at = Some(now);
        }
    }
}
