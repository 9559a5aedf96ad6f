use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::loader::{merge_provider_warning, provider_unavailable_message};
use crate::matcher::MatchWindow;
use crate::model::{
    now_ms, normalize_path, ArchiveSuppression, ProjectSessions, ProviderId, ProviderWarning,
    SessionsState, WorktreeSessions,
};
use crate::previews::PreviewCache;
use crate::queue::CoalescingQueue;
use crate::source::{ProjectCatalog, RefreshGate, SessionSourceRegistry, TabRegistry};
use crate::store::StateStore;

mod refresh;
mod source_refresh;

pub(crate) use source_refresh::RefreshScope;

/// Tunables for the coordinator's timers and matcher windows. Production
/// uses the defaults; tests shrink them.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Quiet period after a provider change notification before a refresh
    /// is enqueued.
    pub source_update_debounce: Duration,
    /// Delay between gate re-checks while the refresh gate is closed.
    pub gate_retry_interval: Duration,
    /// Cadence of the pending-tab reconciliation poll.
    pub pending_rebind_poll_interval: Duration,
    pub match_window: MatchWindow,
    /// A pending tab must stay ambiguous for this many polls before the
    /// first warning (tolerates transient races).
    pub ambiguity_notify_after_polls: u32,
    /// Minimum gap between repeated warnings for the same pending tab.
    pub ambiguity_notify_cooldown: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            source_update_debounce: Duration::from_millis(350),
            gate_retry_interval: Duration::from_millis(500),
            pending_rebind_poll_interval: Duration::from_millis(1_500),
            match_window: MatchWindow::default(),
            ambiguity_notify_after_polls: 2,
            ambiguity_notify_cooldown: Duration::from_secs(5 * 60),
        }
    }
}

/// The two full-refresh request kinds. Catalog sync only loads paths that
/// just transitioned closed→open; a full refresh reloads every open path,
/// so it dominates when both are queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RefreshKind {
    CatalogSync,
    FullRefresh,
}

impl RefreshKind {
    pub(crate) fn merge(current: Self, incoming: Self) -> Self {
        if current == Self::FullRefresh || incoming == Self::FullRefresh {
            Self::FullRefresh
        } else {
            Self::CatalogSync
        }
    }
}

#[derive(Default)]
struct OnDemandGuard {
    projects: HashSet<String>,
    worktrees: HashSet<String>,
}

struct DebounceSlot {
    generation: u64,
    handle: JoinHandle<()>,
}

pub(crate) struct AmbiguityState {
    pub poll_count: u32,
    pub last_warned_at: Option<tokio::time::Instant>,
}

/// Orchestrates session loading: coalesced full/catalog refreshes,
/// debounced provider-change refreshes behind the external gate, archive
/// suppression, pending-tab reconciliation, and on-demand loads for
/// closed paths. All state lands in the injected [`StateStore`].
pub struct Coordinator {
    pub(crate) registry: Arc<dyn SessionSourceRegistry>,
    pub(crate) catalog: Arc<dyn ProjectCatalog>,
    pub(crate) gate: Arc<dyn RefreshGate>,
    pub(crate) tabs: Arc<dyn TabRegistry>,
    pub(crate) store: Arc<StateStore>,
    pub(crate) previews: PreviewCache,
    pub(crate) config: CoordinatorConfig,

    // Two queues, one serialization domain: executions of either kind
    // take `refresh_mutex` so a catalog refresh and a provider-scoped
    // refresh never race on the same snapshot.
    refresh_queue: CoalescingQueue<(), RefreshKind>,
    pub(crate) source_queue: CoalescingQueue<ProviderId, RefreshScope>,
    pub(crate) refresh_mutex: Mutex<()>,

    on_demand: Mutex<OnDemandGuard>,
    suppressions: StdMutex<HashSet<ArchiveSuppression>>,

    debounce_timers: StdMutex<HashMap<ProviderId, DebounceSlot>>,
    debounce_generation: AtomicU64,
    observers: StdMutex<HashMap<ProviderId, JoinHandle<()>>>,
    pending_poll: StdMutex<Option<JoinHandle<()>>>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,

    pub(crate) ambiguity: StdMutex<HashMap<(String, String), AmbiguityState>>,
    pub(crate) refresh_ids: AtomicU64,
}

impl Coordinator {
    pub fn new(
        registry: Arc<dyn SessionSourceRegistry>,
        catalog: Arc<dyn ProjectCatalog>,
        gate: Arc<dyn RefreshGate>,
        tabs: Arc<dyn TabRegistry>,
        store: Arc<StateStore>,
    ) -> Arc<Self> {
        Self::with_config(registry, catalog, gate, tabs, store, CoordinatorConfig::default())
    }

    pub fn with_config(
        registry: Arc<dyn SessionSourceRegistry>,
        catalog: Arc<dyn ProjectCatalog>,
        gate: Arc<dyn RefreshGate>,
        tabs: Arc<dyn TabRegistry>,
        store: Arc<StateStore>,
        config: CoordinatorConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            catalog,
            gate,
            tabs,
            store,
            previews: PreviewCache::new(),
            config,
            refresh_queue: CoalescingQueue::new(),
            source_queue: CoalescingQueue::new(),
            refresh_mutex: Mutex::new(()),
            on_demand: Mutex::new(OnDemandGuard::default()),
            suppressions: StdMutex::new(HashSet::new()),
            debounce_timers: StdMutex::new(HashMap::new()),
            debounce_generation: AtomicU64::new(0),
            observers: StdMutex::new(HashMap::new()),
            pending_poll: StdMutex::new(None),
            tasks: StdMutex::new(Vec::new()),
            ambiguity: StdMutex::new(HashMap::new()),
            refresh_ids: AtomicU64::new(0),
        })
    }

    /// Reload every currently open path.
    pub fn refresh(self: &Arc<Self>) {
        self.enqueue_refresh(RefreshKind::FullRefresh);
    }

    /// Re-sync the project catalog and load only newly opened paths.
    pub fn refresh_catalog_and_load_newly_opened(self: &Arc<Self>) {
        self.enqueue_refresh(RefreshKind::CatalogSync);
    }

    /// Refresh a single provider for a specific set of paths.
    pub fn refresh_provider_scope(self: &Arc<Self>, provider: ProviderId, paths: HashSet<String>) {
        self.enqueue_source_refresh(provider, Some(paths));
    }

    /// Start observing provider change streams and the pending-tab
    /// reconciliation poll. Idempotent; call again after the source set
    /// changed to reconcile observers.
    pub fn observe_session_source_updates(self: &Arc<Self>) {
        self.ensure_source_update_observers();
        self.ensure_pending_rebind_polling();
    }

    /// Hide a just-archived thread until the provider stops returning it.
    pub fn suppress_archived_thread(&self, path: &str, provider: ProviderId, thread_id: &str) {
        let suppression = ArchiveSuppression {
            path: normalize_path(path),
            provider,
            thread_id: thread_id.to_string(),
        };
        self.suppressions
            .lock()
            .expect("suppressions lock poisoned")
            .insert(suppression);
    }

    /// Undo a prior archive suppression (the archive was reverted).
    pub fn unsuppress_archived_thread(&self, path: &str, provider: ProviderId, thread_id: &str) {
        let suppression = ArchiveSuppression {
            path: normalize_path(path),
            provider,
            thread_id: thread_id.to_string(),
        };
        self.suppressions
            .lock()
            .expect("suppressions lock poisoned")
            .remove(&suppression);
    }

    /// Attach a "provider unavailable" warning to one path, wherever that
    /// path appears in the tree.
    pub fn append_provider_unavailable_warning(&self, path: &str, provider: &ProviderId) {
        let path = normalize_path(path);
        let warning = ProviderWarning {
            provider: provider.clone(),
            message: provider_unavailable_message(provider),
        };
        self.store.update(|state| {
            let mut updated = false;
            let mut next = state.clone();
            for project in &mut next.projects {
                if project.path == path {
                    project.provider_warnings =
                        merge_provider_warning(&project.provider_warnings, warning.clone());
                    updated = true;
                    continue;
                }
                for worktree in &mut project.worktrees {
                    if worktree.path == path {
                        worktree.provider_warnings =
                            merge_provider_warning(&worktree.provider_warnings, warning.clone());
                        updated = true;
                    }
                }
            }
            if updated {
                next.last_updated_at = Some(now_ms());
                next
            } else {
                state.clone()
            }
        });
    }

    /// Load a closed project's threads once, on user request. No-op when
    /// the path is open, already loading, or already loaded.
    pub fn load_project_threads_on_demand(self: &Arc<Self>, path: &str) {
        let path = normalize_path(path);
        let this = Arc::clone(self);
        self.track(tokio::spawn(async move {
            if !this.mark_on_demand_project(&path).await {
                return;
            }
            this.store.update_project(&path, |project| ProjectSessions {
                is_loading: true,
                has_unknown_thread_count: false,
                error_message: None,
                provider_warnings: Vec::new(),
                ..project.clone()
            });
            let result = this.load_threads_from_closed_path(&path).await;
            this.store.update_project(&path, |project| ProjectSessions {
                is_loading: false,
                has_loaded: true,
                has_unknown_thread_count: result.has_unknown_thread_count,
                threads: result.threads.clone(),
                error_message: result.error_message.clone(),
                provider_warnings: result.provider_warnings.clone(),
                ..project.clone()
            });
            this.clear_on_demand_project(&path).await;
        }));
    }

    /// Worktree variant of [`Self::load_project_threads_on_demand`].
    pub fn load_worktree_threads_on_demand(self: &Arc<Self>, project_path: &str, worktree_path: &str) {
        let project_path = normalize_path(project_path);
        let worktree_path = normalize_path(worktree_path);
        let this = Arc::clone(self);
        self.track(tokio::spawn(async move {
            if !this
                .mark_on_demand_worktree(&project_path, &worktree_path)
                .await
            {
                return;
            }
            this.store
                .update_worktree(&project_path, &worktree_path, |worktree| WorktreeSessions {
                    is_loading: true,
                    has_unknown_thread_count: false,
                    error_message: None,
                    provider_warnings: Vec::new(),
                    ..worktree.clone()
                });
            let result = this.load_threads_from_closed_path(&worktree_path).await;
            this.store
                .update_worktree(&project_path, &worktree_path, |worktree| WorktreeSessions {
                    is_loading: false,
                    has_loaded: true,
                    has_unknown_thread_count: result.has_unknown_thread_count,
                    threads: result.threads.clone(),
                    error_message: result.error_message.clone(),
                    provider_warnings: result.provider_warnings.clone(),
                    ..worktree.clone()
                });
            this.clear_on_demand_worktree(&worktree_path).await;
        }));
    }

    /// Abort every background task this coordinator spawned. A cancelled
    /// task never writes to the store (all store writes are synchronous
    /// and atomic).
    pub fn shutdown(&self) {
        for (_, slot) in self
            .debounce_timers
            .lock()
            .expect("debounce lock poisoned")
            .drain()
        {
            slot.handle.abort();
        }
        for (_, handle) in self.observers.lock().expect("observers lock poisoned").drain() {
            handle.abort();
        }
        if let Some(handle) = self.pending_poll.lock().expect("poll lock poisoned").take() {
            handle.abort();
        }
        for handle in self.tasks.lock().expect("tasks lock poisoned").drain(..) {
            handle.abort();
        }
    }

    // ── Full-refresh queue ─────────────────────────────────────────

    fn enqueue_refresh(self: &Arc<Self>, kind: RefreshKind) {
        if !self.refresh_queue.enqueue((), kind, RefreshKind::merge) {
            return;
        }
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            loop {
                let Some(this) = weak.upgrade() else { break };
                let Some(((), kind)) = this.refresh_queue.take_next() else {
                    break;
                };
                if let Err(error) = this.execute_refresh(kind).await {
                    tracing::error!(error = %format!("{error:#}"), "failed to load agent sessions");
                    this.store.mark_load_failure("Failed to load agent sessions");
                }
            }
        });
        self.track(handle);
    }

    // ── Update-stream observers & pending-tab polling ──────────────

    pub(crate) fn ensure_source_update_observers(self: &Arc<Self>) {
        let mut available = HashMap::new();
        for source in self.registry.sources() {
            let provider = source.provider();
            if available.contains_key(&provider) {
                warn!(provider = %provider, "duplicate session source; ignoring");
                continue;
            }
            available.insert(provider, source);
        }

        let mut observers = self.observers.lock().expect("observers lock poisoned");
        observers.retain(|provider, handle| {
            let keep = available
                .get(provider)
                .is_some_and(|source| source.supports_updates());
            if !keep {
                debug!(provider = %provider, "stopping source updates observer");
                handle.abort();
            }
            keep
        });

        for (provider, source) in &available {
            if !source.supports_updates() {
                continue;
            }
            if observers.get(provider).is_some_and(|h| !h.is_finished()) {
                continue;
            }
            let Some(mut updates) = source.subscribe_updates() else {
                warn!(provider = %provider, "source reports update support but has no stream");
                continue;
            };

            debug!(provider = %provider, "starting source updates observer");
            let weak = Arc::downgrade(self);
            let observed = provider.clone();
            let handle = tokio::spawn(async move {
                loop {
                    match updates.recv().await {
                        Ok(()) => {
                            let Some(this) = weak.upgrade() else { break };
                            this.schedule_source_refresh(observed.clone());
                        }
                        // Missed notifications still mean "something
                        // changed"; one refresh covers them all.
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                            let Some(this) = weak.upgrade() else { break };
                            this.schedule_source_refresh(observed.clone());
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            });
            observers.insert(provider.clone(), handle);
        }
    }

    fn ensure_pending_rebind_polling(self: &Arc<Self>) {
        let mut slot = self.pending_poll.lock().expect("poll lock poisoned");
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        let interval = self
            .config
            .pending_rebind_poll_interval
            .max(Duration::from_millis(200));
        let weak = Arc::downgrade(self);
        *slot = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(this) = weak.upgrade() else { break };
                this.poll_pending_tabs_once().await;
            }
        }));
    }

    /// One pending-tab poll round: find paths with open pending tabs and
    /// enqueue a scoped refresh per provider that owns them.
    async fn poll_pending_tabs_once(self: &Arc<Self>) {
        let pending_by_path = match self.tabs.open_pending_tabs_by_path().await {
            Ok(pending) => pending,
            Err(error) => {
                warn!(error = %format!("{error:#}"), "failed to collect pending chat tabs for refresh polling");
                return;
            }
        };
        if pending_by_path.is_empty() {
            return;
        }

        let mut paths_by_provider: HashMap<ProviderId, HashSet<String>> = HashMap::new();
        for (path, tabs) in &pending_by_path {
            for tab in tabs {
                let Some((provider, id)) = crate::model::parse_thread_identity(&tab.pending_identity)
                else {
                    continue;
                };
                if !crate::model::is_pending_session_id(id) {
                    continue;
                }
                paths_by_provider
                    .entry(provider)
                    .or_default()
                    .insert(normalize_path(path));
            }
        }

        for (provider, paths) in paths_by_provider {
            debug!(
                provider = %provider,
                paths = paths.len(),
                "detected pending chat tabs; scheduling scoped provider refresh"
            );
            self.enqueue_source_refresh(provider, Some(paths));
        }
    }

    pub(crate) fn schedule_source_refresh(self: &Arc<Self>, provider: ProviderId) {
        let generation = self.debounce_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let mut timers = self.debounce_timers.lock().expect("debounce lock poisoned");
        if let Some(previous) = timers.remove(&provider) {
            previous.handle.abort();
        }
        debug!(provider = %provider, "scheduled debounced source refresh");

        let weak = Arc::downgrade(self);
        let debounce = self.config.source_update_debounce;
        let timed_provider = provider.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            let Some(this) = weak.upgrade() else { return };
            this.enqueue_source_refresh(timed_provider.clone(), None);
            // Remove our own slot unless a newer timer replaced it.
            let mut timers = this.debounce_timers.lock().expect("debounce lock poisoned");
            if timers
                .get(&timed_provider)
                .is_some_and(|slot| slot.generation == generation)
            {
                timers.remove(&timed_provider);
            }
        });
        timers.insert(provider, DebounceSlot { generation, handle });
    }

    // ── Archive suppression ledger ─────────────────────────────────

    pub(crate) fn apply_archive_suppressions(
        &self,
        path: &str,
        provider: &ProviderId,
        threads: Vec<crate::model::SessionThread>,
    ) -> Vec<crate::model::SessionThread> {
        let normalized = normalize_path(path);
        let suppressed: HashSet<String> = self
            .suppressions
            .lock()
            .expect("suppressions lock poisoned")
            .iter()
            .filter(|s| s.path == normalized && s.provider == *provider)
            .map(|s| s.thread_id.clone())
            .collect();
        if suppressed.is_empty() {
            return threads;
        }
        threads
            .into_iter()
            .filter(|thread| !suppressed.contains(&thread.id))
            .collect()
    }

    // ── On-demand load guards ──────────────────────────────────────

    async fn mark_on_demand_project(&self, path: &str) -> bool {
        let mut guard = self.on_demand.lock().await;
        let state = self.store.snapshot();
        let Some(project) = state.projects.iter().find(|p| p.path == path) else {
            return false;
        };
        if project.is_open || project.is_loading || project.has_loaded {
            return false;
        }
        guard.projects.insert(path.to_string())
    }

    async fn clear_on_demand_project(&self, path: &str) {
        self.on_demand.lock().await.projects.remove(path);
    }

    async fn mark_on_demand_worktree(&self, project_path: &str, worktree_path: &str) -> bool {
        let mut guard = self.on_demand.lock().await;
        let state = self.store.snapshot();
        let Some(project) = state.projects.iter().find(|p| p.path == project_path) else {
            return false;
        };
        let Some(worktree) = project.worktrees.iter().find(|w| w.path == worktree_path) else {
            return false;
        };
        if worktree.is_loading || worktree.has_loaded {
            return false;
        }
        guard.worktrees.insert(worktree_path.to_string())
    }

    async fn clear_on_demand_worktree(&self, worktree_path: &str) {
        self.on_demand.lock().await.worktrees.remove(worktree_path);
    }

    // ── Task bookkeeping ───────────────────────────────────────────

    pub(crate) fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().expect("tasks lock poisoned");
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }
}

/// Helpers shared by the full-refresh and provider-refresh halves.
pub(crate) fn collect_loaded_paths(state: &SessionsState) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut paths = Vec::new();
    for project in &state.projects {
        if project.has_loaded && seen.insert(project.path.clone()) {
            paths.push(project.path.clone());
        }
        for worktree in &project.worktrees {
            if worktree.has_loaded && seen.insert(worktree.path.clone()) {
                paths.push(worktree.path.clone());
            }
        }
    }
    paths
}

pub(crate) fn collect_loaded_provider_thread_ids_by_path(
    state: &SessionsState,
    provider: &ProviderId,
) -> HashMap<String, HashSet<String>> {
    let mut result = HashMap::new();
    for project in &state.projects {
        if project.has_loaded {
            result.insert(
                project.path.clone(),
                project
                    .threads
                    .iter()
                    .filter(|t| t.provider == *provider)
                    .map(|t| t.id.clone())
                    .collect(),
            );
        }
        for worktree in &project.worktrees {
            if !worktree.has_loaded {
                continue;
            }
            result.insert(
                worktree.path.clone(),
                worktree
                    .threads
                    .iter()
                    .filter(|t| t.provider == *provider)
                    .map(|t| t.id.clone())
                    .collect(),
            );
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_kind_merge_upgrades_to_full() {
        use RefreshKind::*;
        assert_eq!(RefreshKind::merge(CatalogSync, CatalogSync), CatalogSync);
        assert_eq!(RefreshKind::merge(CatalogSync, FullRefresh), FullRefresh);
        assert_eq!(RefreshKind::merge(FullRefresh, CatalogSync), FullRefresh);
        assert_eq!(RefreshKind::merge(FullRefresh, FullRefresh), FullRefresh);
    }
}
