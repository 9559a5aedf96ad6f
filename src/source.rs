use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::model::{
    PendingTabSnapshot, ProjectEntry, ProviderId, RebindTarget, SessionThread, ThreadActivity,
};

/// Per-provider capability to list session threads. Supplied by the host
/// application, one implementation per agent CLI.
///
/// Any listing call may fail; failures are mapped to per-path provider
/// warnings by the coordinator, never treated as fatal.
#[async_trait]
pub trait SessionSource: Send + Sync {
    fn provider(&self) -> ProviderId;

    /// List threads for a path that is currently open in the host.
    async fn list_threads_from_open_project(&self, path: &str) -> Result<Vec<SessionThread>>;

    /// List threads for a path with no open host project (plain CLI query).
    async fn list_threads_from_closed_project(&self, path: &str) -> Result<Vec<SessionThread>>;

    /// Optional bulk prefetch across many paths in one round trip. Paths
    /// missing from the returned map fall back to a per-path call. The
    /// default implementation prefetches nothing.
    async fn prefetch_threads(
        &self,
        _paths: &[String],
    ) -> Result<HashMap<String, Vec<SessionThread>>> {
        Ok(HashMap::new())
    }

    /// False when the source can only enumerate a bounded page of threads,
    /// so the true total is unknown.
    fn can_report_exact_thread_count(&self) -> bool {
        true
    }

    /// True when this source emits live change notifications.
    fn supports_updates(&self) -> bool {
        false
    }

    /// Change-notification stream: an item means "something changed for
    /// this provider", with no payload. Only meaningful when
    /// `supports_updates` is true.
    fn subscribe_updates(&self) -> Option<broadcast::Receiver<()>> {
        None
    }
}

/// Yields the current set of session sources. Queried on every refresh so
/// hosts can register or retire providers at runtime.
pub trait SessionSourceRegistry: Send + Sync {
    fn sources(&self) -> Vec<Arc<dyn SessionSource>>;
}

/// Fixed set of sources; enough for hosts without dynamic providers.
pub struct StaticSources(pub Vec<Arc<dyn SessionSource>>);

impl SessionSourceRegistry for StaticSources {
    fn sources(&self) -> Vec<Arc<dyn SessionSource>> {
        self.0.clone()
    }
}

/// Discovers project entries (open projects plus the recent-projects
/// list, each possibly with nested worktrees). Called once per refresh
/// cycle.
#[async_trait]
pub trait ProjectCatalog: Send + Sync {
    async fn project_entries(&self) -> Result<Vec<ProjectEntry>>;
}

/// Externally owned precondition polled before provider-scoped refreshes.
/// `true` means refreshing is currently allowed.
#[async_trait]
pub trait RefreshGate: Send + Sync {
    async fn is_active(&self) -> bool;
}

/// Always-open gate for hosts without a refresh precondition.
pub struct AlwaysActiveGate;

#[async_trait]
impl RefreshGate for AlwaysActiveGate {
    async fn is_active(&self) -> bool {
        true
    }
}

/// Window into the host's open chat tabs: which paths have tabs, which
/// tabs are still pending, and hooks to push presentation updates or
/// rebind a pending tab once its real thread id is known.
#[async_trait]
pub trait TabRegistry: Send + Sync {
    /// Project paths with any open chat tab.
    async fn open_project_paths(&self) -> Result<HashSet<String>>;

    /// Open pending (not-yet-identified) tabs grouped by project path.
    async fn open_pending_tabs_by_path(&self)
        -> Result<HashMap<String, Vec<PendingTabSnapshot>>>;

    /// Concrete (non-pending) thread identities displayed per path. These
    /// are excluded as rebind candidates: a thread another tab already
    /// shows must not be silently repossessed.
    async fn open_concrete_thread_identities_by_path(
        &self,
    ) -> Result<HashMap<String, HashSet<String>>>;

    /// Push refreshed titles/activities into open tabs, keyed by
    /// `(path, thread identity)`. Returns how many tabs changed.
    async fn update_tab_presentation(
        &self,
        titles: HashMap<(String, String), String>,
        activities: HashMap<(String, String), ThreadActivity>,
    ) -> usize;

    /// Rebind one specific pending tab to a resolved target. Returns true
    /// when the tab was found and rebound.
    async fn rebind_pending_tab(
        &self,
        path: &str,
        pending_identity: &str,
        target: RebindTarget,
    ) -> bool;
}

/// Tab registry for hosts without chat tabs: nothing open, nothing to
/// rebind.
pub struct NoTabs;

#[async_trait]
impl TabRegistry for NoTabs {
    async fn open_project_paths(&self) -> Result<HashSet<String>> {
        Ok(HashSet::new())
    }

    async fn open_pending_tabs_by_path(
        &self,
    ) -> Result<HashMap<String, Vec<PendingTabSnapshot>>> {
        Ok(HashMap::new())
    }

    async fn open_concrete_thread_identities_by_path(
        &self,
    ) -> Result<HashMap<String, HashSet<String>>> {
        Ok(HashMap::new())
    }

    async fn update_tab_presentation(
        &self,
        _titles: HashMap<(String, String), String>,
        _activities: HashMap<(String, String), ThreadActivity>,
    ) -> usize {
        0
    }

    async fn rebind_pending_tab(
        &self,
        _path: &str,
        _pending_identity: &str,
        _target: RebindTarget,
    ) -> bool {
        false
    }
}

/// Argv used to resume a session in a terminal. Hosts with richer
/// provider integrations can shell out differently; this is the portable
/// fallback form.
pub fn resume_command(provider: &ProviderId, thread_id: &str) -> Vec<String> {
    vec![
        provider.as_str().to_string(),
        "resume".to_string(),
        thread_id.to_string(),
    ]
}
