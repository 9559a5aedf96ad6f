//! Provider-scoped refreshes: the gated queue processor, pending-tab
//! binding, presentation sync, and the pending-thread projection that
//! keeps not-yet-identified tabs visible in the session list.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::Result;
use futures::future::join_all;
use tracing::{debug, warn};

use crate::loader::{merge_threads_for_provider, provider_warning_message, replace_provider_warning};
use crate::matcher::{match_pending_tabs, MatchOutcome};
use crate::model::{
    is_pending_session_id, normalize_path, now_ms, parse_thread_identity, PendingTabSnapshot,
    ProviderId, ProviderWarning, RebindTarget, SessionThread, SessionsState, ThreadActivity,
};
use crate::source::resume_command;

use super::{
    collect_loaded_paths, collect_loaded_provider_thread_ids_by_path, AmbiguityState, Coordinator,
};

/// Path scope of one provider refresh request. `None` means every
/// relevant path (loaded paths plus paths with open tabs) and absorbs any
/// narrower scope it coalesces with.
pub(crate) type RefreshScope = Option<BTreeSet<String>>;

fn merge_scopes(current: RefreshScope, incoming: RefreshScope) -> RefreshScope {
    match (current, incoming) {
        (Some(mut a), Some(b)) => {
            a.extend(b);
            Some(a)
        }
        _ => None,
    }
}

/// Result of one provider's listing for one path during a scoped refresh.
struct ProviderRefreshOutcome {
    /// `None` when the listing failed; existing threads are kept.
    threads: Option<Vec<SessionThread>>,
    warning: Option<String>,
}

impl Coordinator {
    pub(crate) fn enqueue_source_refresh(
        self: &Arc<Self>,
        provider: ProviderId,
        paths: Option<HashSet<String>>,
    ) {
        let scope: RefreshScope = paths.and_then(|paths| {
            let normalized: BTreeSet<String> = paths
                .iter()
                .map(|path| normalize_path(path))
                .filter(|path| !path.is_empty())
                .collect();
            // An empty scope carries no restriction.
            (!normalized.is_empty()).then_some(normalized)
        });

        let start_processor = self
            .source_queue
            .enqueue(provider.clone(), scope, merge_scopes);
        debug!(
            provider = %provider,
            queued = self.source_queue.len(),
            "enqueued provider refresh"
        );
        if !start_processor {
            return;
        }

        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            loop {
                let Some(this) = weak.upgrade() else { break };
                let Some((provider, scope)) = this.source_queue.take_next() else {
                    debug!("provider refresh queue drained; processor stopping");
                    break;
                };

                if !this.gate.is_active().await {
                    debug!(provider = %provider, "refresh gate closed; deferring provider refresh");
                    this.source_queue.requeue(provider, scope, merge_scopes);
                    let retry = this.config.gate_retry_interval;
                    drop(this);
                    tokio::time::sleep(retry).await;
                    continue;
                }

                let refresh_id = this.refresh_ids.fetch_add(1, Ordering::Relaxed) + 1;
                if let Err(error) = this
                    .refresh_provider_threads(&provider, refresh_id, scope)
                    .await
                {
                    warn!(
                        provider = %provider,
                        refresh_id,
                        error = %format!("{error:#}"),
                        "provider refresh failed"
                    );
                }
            }
        });
        self.track(handle);
    }

    async fn refresh_provider_threads(
        &self,
        provider: &ProviderId,
        refresh_id: u64,
        scope: RefreshScope,
    ) -> Result<()> {
        let _guard = self.refresh_mutex.lock().await;

        let Some(source) = self
            .registry
            .sources()
            .into_iter()
            .find(|source| source.provider() == *provider)
        else {
            debug!(provider = %provider, "no session source registered; skipping refresh");
            return Ok(());
        };

        let state = self.store.snapshot();
        let known_ids_by_path = collect_loaded_provider_thread_ids_by_path(&state, provider);
        let target_paths = self.resolve_target_paths(&state, scope).await;
        if target_paths.is_empty() {
            debug!(provider = %provider, refresh_id, "no paths to refresh");
            return Ok(());
        }
        debug!(
            provider = %provider,
            refresh_id,
            paths = target_paths.len(),
            "refreshing provider sessions"
        );

        let prefetched: HashMap<String, Vec<SessionThread>> =
            match source.prefetch_threads(&target_paths).await {
                Ok(threads_by_path) => threads_by_path
                    .into_iter()
                    .map(|(path, threads)| (normalize_path(&path), threads))
                    .collect(),
                Err(error) => {
                    warn!(
                        provider = %provider,
                        refresh_id,
                        error = %format!("{error:#}"),
                        "bulk session prefetch failed; falling back to per-path listing"
                    );
                    HashMap::new()
                }
            };

        let listed = join_all(target_paths.iter().map(|path| {
            let source = &source;
            let prefetched = &prefetched;
            async move {
                let threads = match prefetched.get(path) {
                    Some(threads) => Ok(threads.clone()),
                    None => source.list_threads_from_closed_project(path).await,
                };
                (path.clone(), threads)
            }
        }))
        .await;

        let mut outcomes: HashMap<String, ProviderRefreshOutcome> = HashMap::new();
        for (path, threads) in listed {
            match threads {
                Ok(threads) => {
                    let threads = self.apply_archive_suppressions(&path, provider, threads);
                    outcomes.insert(
                        path,
                        ProviderRefreshOutcome {
                            threads: Some(threads),
                            warning: None,
                        },
                    );
                }
                Err(error) => {
                    warn!(
                        provider = %provider,
                        refresh_id,
                        path,
                        error = %format!("{error:#}"),
                        "session listing failed"
                    );
                    outcomes.insert(
                        path,
                        ProviderRefreshOutcome {
                            threads: None,
                            warning: Some(provider_warning_message(provider, &error)),
                        },
                    );
                }
            }
        }

        // Only ids that are new relative to the last published snapshot of
        // a loaded path may be handed to a pending tab; old threads are
        // never candidates.
        let allowed_new_ids = compute_new_thread_ids(&outcomes, &known_ids_by_path);

        self.bind_pending_tabs(provider, &outcomes, &allowed_new_ids, refresh_id)
            .await;
        self.sync_tab_presentation(provider, &outcomes, refresh_id)
            .await;
        let projected = self
            .merge_pending_threads_from_open_tabs(provider, &mut outcomes, refresh_id)
            .await;

        self.store.update(|state| {
            apply_outcomes_to_state(state, provider, &outcomes, &projected)
        });
        Ok(())
    }

    /// Paths a scope-less refresh covers: every loaded path plus every
    /// path with an open chat tab, deduplicated in encounter order.
    async fn resolve_target_paths(&self, state: &SessionsState, scope: RefreshScope) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut paths = Vec::new();
        match scope {
            Some(requested) => {
                for path in requested {
                    if seen.insert(path.clone()) {
                        paths.push(path);
                    }
                }
            }
            None => {
                for path in collect_loaded_paths(state) {
                    if seen.insert(path.clone()) {
                        paths.push(path);
                    }
                }
                match self.tabs.open_project_paths().await {
                    Ok(open) => {
                        for path in open {
                            let path = normalize_path(&path);
                            if !path.is_empty() && seen.insert(path.clone()) {
                                paths.push(path);
                            }
                        }
                    }
                    Err(error) => {
                        warn!(
                            error = %format!("{error:#}"),
                            "failed to collect open tab paths for provider refresh"
                        );
                    }
                }
            }
        }
        paths
    }

    async fn bind_pending_tabs(
        &self,
        provider: &ProviderId,
        outcomes: &HashMap<String, ProviderRefreshOutcome>,
        allowed_new_ids: &HashMap<String, HashSet<String>>,
        refresh_id: u64,
    ) {
        let pending_raw = match self.tabs.open_pending_tabs_by_path().await {
            Ok(pending) => pending,
            Err(error) => {
                warn!(
                    refresh_id,
                    error = %format!("{error:#}"),
                    "failed to collect pending chat tabs"
                );
                return;
            }
        };

        let mut pending_by_path: HashMap<String, Vec<PendingTabSnapshot>> = HashMap::new();
        for (path, tabs) in pending_raw {
            let path = normalize_path(&path);
            let tabs: Vec<PendingTabSnapshot> = tabs
                .into_iter()
                .filter(|tab| {
                    parse_thread_identity(&tab.pending_identity)
                        .is_some_and(|(p, id)| p == *provider && is_pending_session_id(id))
                })
                .collect();
            if !tabs.is_empty() {
                pending_by_path.entry(path).or_default().extend(tabs);
            }
        }
        if pending_by_path.is_empty() {
            self.clear_ambiguity_state(provider);
            return;
        }

        let mut candidates_by_path: HashMap<String, Vec<RebindTarget>> = HashMap::new();
        for (path, outcome) in outcomes {
            let Some(threads) = &outcome.threads else { continue };
            let Some(allowed) = allowed_new_ids.get(path) else {
                continue;
            };
            let candidates: Vec<RebindTarget> = threads
                .iter()
                .filter(|thread| thread.provider == *provider && allowed.contains(&thread.id))
                .map(|thread| RebindTarget {
                    thread_identity: thread.identity(),
                    thread_id: thread.id.clone(),
                    shell_command: resume_command(provider, &thread.id),
                    thread_title: thread.title.clone(),
                    thread_activity: thread.activity,
                    thread_updated_at: thread.updated_at,
                })
                .collect();
            if !candidates.is_empty() {
                candidates_by_path.insert(path.clone(), candidates);
            }
        }

        let concrete_by_path: HashMap<String, HashSet<String>> = match self
            .tabs
            .open_concrete_thread_identities_by_path()
            .await
        {
            Ok(concrete) => concrete
                .into_iter()
                .map(|(path, identities)| (normalize_path(&path), identities))
                .collect(),
            Err(error) => {
                warn!(
                    refresh_id,
                    error = %format!("{error:#}"),
                    "failed to collect concrete tab identities; matching without exclusions"
                );
                HashMap::new()
            }
        };

        let outcome = match_pending_tabs(
            &pending_by_path,
            &candidates_by_path,
            &concrete_by_path,
            self.config.match_window,
        );
        self.report_matching_gaps(provider, refresh_id, &outcome);

        for (path, bindings) in &outcome.bindings_by_path {
            for binding in bindings {
                let rebound = self
                    .tabs
                    .rebind_pending_tab(path, &binding.pending_identity, binding.target.clone())
                    .await;
                if rebound {
                    debug!(
                        refresh_id,
                        path = %path,
                        pending = %binding.pending_identity,
                        thread = %binding.target.thread_id,
                        "rebound pending chat tab"
                    );
                }
            }
        }
    }

    /// Track unresolved pending tabs across polls. A tab must stay
    /// ambiguous for several consecutive polls before the first warning,
    /// and repeat warnings honor the cooldown. A tab that leaves the
    /// unresolved set restarts from zero.
    fn report_matching_gaps(&self, provider: &ProviderId, refresh_id: u64, outcome: &MatchOutcome) {
        let mut tracked: HashSet<(String, String)> = HashSet::new();
        let now = tokio::time::Instant::now();
        let mut ledger = self.ambiguity.lock().expect("ambiguity lock poisoned");

        for (path, identities) in &outcome.ambiguous_by_path {
            for identity in identities {
                let key = (path.clone(), identity.clone());
                tracked.insert(key.clone());
                let entry = ledger.entry(key).or_insert(AmbiguityState {
                    poll_count: 0,
                    last_warned_at: None,
                });
                entry.poll_count += 1;
                let cooled = entry.last_warned_at.map_or(true, |at| {
                    now.duration_since(at) >= self.config.ambiguity_notify_cooldown
                });
                if entry.poll_count >= self.config.ambiguity_notify_after_polls && cooled {
                    entry.last_warned_at = Some(now);
                    warn!(
                        refresh_id,
                        path = %path,
                        pending = %identity,
                        polls = entry.poll_count,
                        "pending chat tab matches multiple sessions; leaving unbound"
                    );
                }
            }
        }
        for (path, identities) in &outcome.no_match_by_path {
            for identity in identities {
                let key = (path.clone(), identity.clone());
                tracked.insert(key.clone());
                ledger.entry(key).or_insert(AmbiguityState {
                    poll_count: 0,
                    last_warned_at: None,
                });
            }
        }

        // Resolved or closed tabs drop out so a later recurrence starts a
        // fresh count. Other providers' entries are untouched.
        let prefix = format!("{provider}:");
        ledger.retain(|key, _| !key.1.starts_with(&prefix) || tracked.contains(key));
    }

    fn clear_ambiguity_state(&self, provider: &ProviderId) {
        let prefix = format!("{provider}:");
        self.ambiguity
            .lock()
            .expect("ambiguity lock poisoned")
            .retain(|(_, identity), _| !identity.starts_with(&prefix));
    }

    /// Push refreshed titles and activity flags into open tabs.
    async fn sync_tab_presentation(
        &self,
        provider: &ProviderId,
        outcomes: &HashMap<String, ProviderRefreshOutcome>,
        refresh_id: u64,
    ) {
        let mut titles: HashMap<(String, String), String> = HashMap::new();
        let mut activities: HashMap<(String, String), ThreadActivity> = HashMap::new();
        for (path, outcome) in outcomes {
            let Some(threads) = &outcome.threads else { continue };
            for thread in threads {
                let key = (path.clone(), thread.identity());
                titles.insert(key.clone(), thread.title.clone());
                activities.insert(key, thread.activity);
            }
        }
        if titles.is_empty() {
            return;
        }

        let updated = self.tabs.update_tab_presentation(titles, activities).await;
        if updated > 0 {
            debug!(provider = %provider, refresh_id, updated, "synced open tab presentation");
        }
    }

    /// Project still-pending tabs into the session lists as placeholder
    /// threads so the tree shows them before the provider assigns an id.
    /// Returns the paths that received a projection; those paths get their
    /// outcome applied even when they never finished a real load.
    async fn merge_pending_threads_from_open_tabs(
        &self,
        provider: &ProviderId,
        outcomes: &mut HashMap<String, ProviderRefreshOutcome>,
        refresh_id: u64,
    ) -> HashSet<String> {
        // Queried again after binding: tabs rebound above are concrete now
        // and must not be projected.
        let pending_raw = match self.tabs.open_pending_tabs_by_path().await {
            Ok(pending) => pending,
            Err(error) => {
                warn!(
                    refresh_id,
                    error = %format!("{error:#}"),
                    "failed to collect pending chat tabs for projection"
                );
                return HashSet::new();
            }
        };

        let mut projected = HashSet::new();
        for (path, tabs) in pending_raw {
            let path = normalize_path(&path);
            if !outcomes.contains_key(&path) {
                continue;
            }

            let mut placeholders: HashMap<String, SessionThread> = HashMap::new();
            for tab in tabs {
                let Some((tab_provider, id)) = parse_thread_identity(&tab.pending_identity) else {
                    continue;
                };
                if tab_provider != *provider || !is_pending_session_id(id) {
                    continue;
                }
                let updated_at = tab.anchor_ms().unwrap_or(0);
                let keep = placeholders
                    .get(id)
                    .map_or(true, |existing| updated_at >= existing.updated_at);
                if keep {
                    placeholders.insert(
                        id.to_string(),
                        SessionThread {
                            id: id.to_string(),
                            title: "New session".to_string(),
                            updated_at,
                            archived: false,
                            activity: ThreadActivity::Ready,
                            provider: provider.clone(),
                            sub_agents: Vec::new(),
                        },
                    );
                }
            }
            if placeholders.is_empty() {
                continue;
            }

            let outcome = outcomes.get_mut(&path).expect("path checked above");
            let mut threads = outcome.threads.take().unwrap_or_default();
            for (id, placeholder) in placeholders {
                match threads
                    .iter_mut()
                    .find(|thread| thread.id == id && thread.provider == *provider)
                {
                    Some(existing) => {
                        if placeholder.updated_at >= existing.updated_at {
                            *existing = placeholder;
                        }
                    }
                    None => threads.push(placeholder),
                }
            }
            threads.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
            outcome.threads = Some(threads);

            debug!(refresh_id, path = %path, "projected pending chat tabs into session list");
            projected.insert(path);
        }
        projected
    }
}

/// Ids in the fresh listings that the last published snapshot of a loaded
/// path did not contain. Paths that never loaded have no snapshot to diff
/// against and contribute no candidates.
fn compute_new_thread_ids(
    outcomes: &HashMap<String, ProviderRefreshOutcome>,
    known_ids_by_path: &HashMap<String, HashSet<String>>,
) -> HashMap<String, HashSet<String>> {
    let mut result = HashMap::new();
    for (path, outcome) in outcomes {
        let Some(threads) = &outcome.threads else { continue };
        let Some(known) = known_ids_by_path.get(path) else {
            continue;
        };
        let new_ids: HashSet<String> = threads
            .iter()
            .filter(|thread| !known.contains(&thread.id))
            .map(|thread| thread.id.clone())
            .collect();
        result.insert(path.clone(), new_ids);
    }
    result
}

/// Apply a provider's refresh outcomes to the aggregate state. A path
/// takes its outcome only when it has completed a load before, or when
/// it carries projected pending placeholders.
fn apply_outcomes_to_state(
    state: &SessionsState,
    provider: &ProviderId,
    outcomes: &HashMap<String, ProviderRefreshOutcome>,
    projected: &HashSet<String>,
) -> SessionsState {
    let mut next = state.clone();
    let mut changed = false;

    for project in &mut next.projects {
        if project.has_loaded || projected.contains(&project.path) {
            if let Some(outcome) = outcomes.get(&project.path) {
                changed |= apply_outcome(
                    &mut project.threads,
                    &mut project.provider_warnings,
                    provider,
                    outcome,
                );
            }
        }
        for worktree in &mut project.worktrees {
            if !worktree.has_loaded && !projected.contains(&worktree.path) {
                continue;
            }
            if let Some(outcome) = outcomes.get(&worktree.path) {
                changed |= apply_outcome(
                    &mut worktree.threads,
                    &mut worktree.provider_warnings,
                    provider,
                    outcome,
                );
            }
        }
    }

    if changed {
        next.last_updated_at = Some(now_ms());
        next
    } else {
        state.clone()
    }
}

fn apply_outcome(
    threads: &mut Vec<SessionThread>,
    warnings: &mut Vec<ProviderWarning>,
    provider: &ProviderId,
    outcome: &ProviderRefreshOutcome,
) -> bool {
    let mut changed = false;
    match &outcome.threads {
        Some(new_threads) => {
            let merged = merge_threads_for_provider(threads, provider, new_threads.clone());
            if merged != *threads {
                *threads = merged;
                changed = true;
            }
            let next = replace_provider_warning(warnings, provider, None);
            if next != *warnings {
                *warnings = next;
                changed = true;
            }
        }
        // Failed listing: keep the last good threads, surface the warning.
        None => {
            let next = replace_provider_warning(warnings, provider, outcome.warning.clone());
            if next != *warnings {
                *warnings = next;
                changed = true;
            }
        }
    }
    changed
}
