use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of an external agent-CLI integration (codex, claude, ...).
/// Lowercase, `[a-z][a-z0-9._-]*`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderId(String);

impl ProviderId {
    pub fn new(value: impl Into<String>) -> anyhow::Result<Self> {
        let value = value.into();
        let mut chars = value.chars();
        let valid = match chars.next() {
            Some(first) => {
                first.is_ascii_lowercase()
                    && chars.all(|c| {
                        c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-')
                    })
            }
            None => false,
        };
        if !valid {
            anyhow::bail!("invalid provider id '{value}'; expected [a-z][a-z0-9._-]*");
        }
        Ok(Self(value))
    }

    pub fn codex() -> Self {
        Self("codex".to_string())
    }

    pub fn claude() -> Self {
        Self("claude".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ProviderId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ThreadActivity {
    #[default]
    Ready,
    Unread,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubAgent {
    pub id: String,
    pub name: String,
}

/// One chat thread reported by a provider for a project path.
/// Identity is `(provider, id)` within a path; `id` may be a pending
/// placeholder (`new-<uuid>`) until the provider assigns a real one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionThread {
    pub id: String,
    pub title: String,
    /// Logical timestamp in epoch milliseconds.
    pub updated_at: i64,
    pub archived: bool,
    pub activity: ThreadActivity,
    pub provider: ProviderId,
    pub sub_agents: Vec<SubAgent>,
}

impl SessionThread {
    /// `provider:id` identity string shared with open chat tabs.
    pub fn identity(&self) -> String {
        thread_identity(&self.provider, &self.id)
    }
}

/// Lightweight cached row used to seed placeholder threads while a real
/// load is still running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadPreview {
    pub id: String,
    pub title: String,
    pub updated_at: i64,
    pub provider: ProviderId,
}

impl From<&SessionThread> for ThreadPreview {
    fn from(thread: &SessionThread) -> Self {
        Self {
            id: thread.id.clone(),
            title: thread.title.clone(),
            updated_at: thread.updated_at,
            provider: thread.provider.clone(),
        }
    }
}

impl ThreadPreview {
    pub fn into_cached_thread(self) -> SessionThread {
        SessionThread {
            id: self.id,
            title: self.title,
            updated_at: self.updated_at,
            archived: false,
            activity: ThreadActivity::Ready,
            provider: self.provider,
            sub_agents: Vec::new(),
        }
    }
}

/// Non-fatal per-provider failure attached to a path (e.g. CLI missing).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderWarning {
    pub provider: ProviderId,
    pub message: String,
}

/// Worktree entry as reported by the project catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeEntry {
    pub path: String,
    pub name: String,
    pub branch: Option<String>,
    pub is_open: bool,
}

/// Project entry as reported by the project catalog (open + recent).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectEntry {
    pub path: String,
    pub name: String,
    pub branch: Option<String>,
    pub is_open: bool,
    pub worktrees: Vec<WorktreeEntry>,
}

/// Session state for a single worktree path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorktreeSessions {
    pub path: String,
    pub name: String,
    pub branch: Option<String>,
    pub is_open: bool,
    pub threads: Vec<SessionThread>,
    pub is_loading: bool,
    pub has_loaded: bool,
    pub has_unknown_thread_count: bool,
    pub error_message: Option<String>,
    pub provider_warnings: Vec<ProviderWarning>,
}

/// Session state for a single project path plus its worktrees.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectSessions {
    pub path: String,
    pub name: String,
    pub branch: Option<String>,
    pub is_open: bool,
    pub threads: Vec<SessionThread>,
    pub is_loading: bool,
    pub has_loaded: bool,
    pub has_unknown_thread_count: bool,
    pub error_message: Option<String>,
    pub provider_warnings: Vec<ProviderWarning>,
    pub worktrees: Vec<WorktreeSessions>,
}

/// The single aggregate snapshot broadcast to observers. Replaced as a
/// whole value on every change; never mutated in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SessionsState {
    pub projects: Vec<ProjectSessions>,
    pub last_updated_at: Option<i64>,
    pub error_message: Option<String>,
    /// How many threads the consuming UI currently shows per path.
    /// Owned by the UI; retained here so a catalog swap keeps the numbers.
    pub visible_thread_counts: HashMap<String, usize>,
}

/// Snapshot of an open not-yet-identified chat tab.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTabSnapshot {
    pub pending_identity: String,
    pub created_at_ms: Option<i64>,
    pub first_input_at_ms: Option<i64>,
}

impl PendingTabSnapshot {
    /// Anchor time for temporal matching: first-input time, else creation
    /// time.
    pub fn anchor_ms(&self) -> Option<i64> {
        self.first_input_at_ms.or(self.created_at_ms)
    }
}

/// Resolved binding target for a pending chat tab.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebindTarget {
    pub thread_identity: String,
    pub thread_id: String,
    /// Argv the host uses to resume the session in a terminal.
    pub shell_command: Vec<String>,
    pub thread_title: String,
    pub thread_activity: ThreadActivity,
    pub thread_updated_at: i64,
}

/// Transient tombstone hiding a just-archived thread until the provider
/// catches up.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArchiveSuppression {
    pub path: String,
    pub provider: ProviderId,
    pub thread_id: String,
}

const PENDING_ID_PREFIX: &str = "new-";

/// Generate a fresh pending placeholder session id.
pub fn new_pending_session_id() -> String {
    format!("{PENDING_ID_PREFIX}{}", uuid::Uuid::new_v4())
}

/// True when a session id is a pending placeholder rather than a
/// provider-assigned id.
pub fn is_pending_session_id(id: &str) -> bool {
    id.starts_with(PENDING_ID_PREFIX)
}

/// Build the `provider:id` identity string.
pub fn thread_identity(provider: &ProviderId, id: &str) -> String {
    format!("{provider}:{id}")
}

/// Split a `provider:id` identity string. Returns None when the provider
/// part is not a valid provider id or the separator is missing.
pub fn parse_thread_identity(identity: &str) -> Option<(ProviderId, &str)> {
    let (provider, id) = identity.split_once(':')?;
    let provider = ProviderId::new(provider).ok()?;
    if id.is_empty() {
        return None;
    }
    Some((provider, id))
}

/// Normalize a project/worktree path so it can serve as an identity key:
/// system-independent separators, no trailing slash (except a bare root).
pub fn normalize_path(path: &str) -> String {
    let mut normalized = path.replace('\\', "/");
    while normalized.len() > 1 && normalized.ends_with('/') {
        normalized.pop();
    }
    normalized
}

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
