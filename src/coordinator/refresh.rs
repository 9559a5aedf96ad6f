//! Full-refresh execution: catalog sync, preview seeding, and the
//! concurrent per-path load fan-out.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::future::join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use tracing::{debug, warn};

use crate::loader::{merge_source_load_results, PathLoadResult, SourceLoadResult};
use crate::model::{
    normalize_path, ProjectEntry, ProjectSessions, ProviderId, SessionThread, SessionsState,
    ThreadPreview, WorktreeSessions,
};
use crate::source::SessionSource;

use super::{Coordinator, RefreshKind};

/// Which open paths a refresh cycle actually reloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoadScope {
    /// Every open path (explicit refresh).
    AllOpen,
    /// Only paths that just transitioned closed→open (catalog sync).
    NewlyOpenedOnly,
}

/// One path scheduled for loading, with enough addressing to write the
/// result back into the tree.
struct LoadTarget {
    project_path: String,
    worktree_path: Option<String>,
}

impl LoadTarget {
    fn path(&self) -> &str {
        self.worktree_path.as_deref().unwrap_or(&self.project_path)
    }
}

struct RefreshBootstrap {
    open_paths: HashSet<String>,
    load_targets: Vec<LoadTarget>,
    initial_projects: Vec<ProjectSessions>,
    initial_counts: HashMap<String, usize>,
}

impl Coordinator {
    pub(super) async fn execute_refresh(self: &Arc<Self>, kind: RefreshKind) -> Result<()> {
        let _guard = self.refresh_mutex.lock().await;
        // The source set may have changed since the last refresh.
        self.ensure_source_update_observers();
        let scope = match kind {
            RefreshKind::FullRefresh => LoadScope::AllOpen,
            RefreshKind::CatalogSync => LoadScope::NewlyOpenedOnly,
        };
        self.refresh_now(scope).await
    }

    async fn refresh_now(&self, scope: LoadScope) -> Result<()> {
        let current = self.store.snapshot();
        let entries = self
            .catalog
            .project_entries()
            .await
            .context("project catalog query failed")?;

        let bootstrap = self.build_bootstrap(&current, &entries, scope);
        self.previews.retain_open(&bootstrap.open_paths);
        self.store
            .replace_projects(bootstrap.initial_projects, bootstrap.initial_counts);

        if bootstrap.load_targets.is_empty() {
            self.store.touch();
            return Ok(());
        }
        debug!(paths = bootstrap.load_targets.len(), "loading agent sessions");

        let sources = self.registry.sources();
        let load_paths: Vec<String> = bootstrap
            .load_targets
            .iter()
            .map(|target| target.path().to_string())
            .collect();
        let prefetched = self.prefetch_all(&sources, &load_paths).await;

        join_all(
            bootstrap
                .load_targets
                .iter()
                .map(|target| self.load_target(&sources, target, &prefetched)),
        )
        .await;

        self.store.touch();
        Ok(())
    }

    /// Project the catalog onto the current state: which paths exist,
    /// which are open, which must load this cycle, and the placeholder
    /// threads each path starts with.
    fn build_bootstrap(
        &self,
        current: &SessionsState,
        entries: &[ProjectEntry],
        scope: LoadScope,
    ) -> RefreshBootstrap {
        let existing_projects: HashMap<&str, &ProjectSessions> = current
            .projects
            .iter()
            .map(|project| (project.path.as_str(), project))
            .collect();
        let existing_worktrees: HashMap<&str, &WorktreeSessions> = current
            .projects
            .iter()
            .flat_map(|project| &project.worktrees)
            .map(|worktree| (worktree.path.as_str(), worktree))
            .collect();

        let mut open_paths = HashSet::new();
        let mut load_targets = Vec::new();
        let mut loading = HashSet::new();
        let mut known_paths = Vec::new();
        let mut initial_projects = Vec::new();

        for entry in entries {
            let path = normalize_path(&entry.path);
            if path.is_empty() {
                continue;
            }
            known_paths.push(path.clone());
            if entry.is_open {
                open_paths.insert(path.clone());
            }

            let existing = existing_projects.get(path.as_str()).copied();
            let was_open = existing.is_some_and(|project| project.is_open);
            let should_load =
                entry.is_open && (scope == LoadScope::AllOpen || !was_open);
            if should_load && loading.insert(path.clone()) {
                load_targets.push(LoadTarget {
                    project_path: path.clone(),
                    worktree_path: None,
                });
            }

            let mut worktrees = Vec::with_capacity(entry.worktrees.len());
            for worktree_entry in &entry.worktrees {
                let worktree_path = normalize_path(&worktree_entry.path);
                if worktree_path.is_empty() {
                    continue;
                }
                known_paths.push(worktree_path.clone());
                if worktree_entry.is_open {
                    open_paths.insert(worktree_path.clone());
                }

                let existing_worktree =
                    existing_worktrees.get(worktree_path.as_str()).copied();
                let worktree_was_open =
                    existing_worktree.is_some_and(|worktree| worktree.is_open);
                let worktree_should_load = worktree_entry.is_open
                    && (scope == LoadScope::AllOpen || !worktree_was_open);
                if worktree_should_load && loading.insert(worktree_path.clone()) {
                    load_targets.push(LoadTarget {
                        project_path: path.clone(),
                        worktree_path: Some(worktree_path.clone()),
                    });
                }

                let worktree_threads = self.seeded_threads(
                    existing_worktree.map(|worktree| worktree.threads.as_slice()),
                    worktree_should_load,
                    &worktree_path,
                );
                // A brand-new path seeded from previews counts as loaded
                // until the real load lands.
                let worktree_has_loaded = existing_worktree
                    .map(|worktree| worktree.has_loaded)
                    .unwrap_or(!worktree_threads.is_empty());
                worktrees.push(WorktreeSessions {
                    path: worktree_path.clone(),
                    name: worktree_entry.name.clone(),
                    branch: worktree_entry.branch.clone(),
                    is_open: worktree_entry.is_open,
                    threads: worktree_threads,
                    is_loading: worktree_should_load,
                    has_loaded: worktree_has_loaded,
                    has_unknown_thread_count: !worktree_should_load
                        && existing_worktree
                            .is_some_and(|worktree| worktree.has_unknown_thread_count),
                    error_message: if worktree_should_load {
                        None
                    } else {
                        existing_worktree.and_then(|worktree| worktree.error_message.clone())
                    },
                    provider_warnings: if worktree_should_load {
                        Vec::new()
                    } else {
                        existing_worktree
                            .map(|worktree| worktree.provider_warnings.clone())
                            .unwrap_or_default()
                    },
                });
            }

            let threads = self.seeded_threads(
                existing.map(|project| project.threads.as_slice()),
                should_load,
                &path,
            );
            let has_loaded = existing
                .map(|project| project.has_loaded)
                .unwrap_or(!threads.is_empty());
            initial_projects.push(ProjectSessions {
                path: path.clone(),
                name: entry.name.clone(),
                branch: entry.branch.clone(),
                is_open: entry.is_open,
                threads,
                is_loading: should_load,
                has_loaded,
                has_unknown_thread_count: !should_load
                    && existing.is_some_and(|project| project.has_unknown_thread_count),
                error_message: if should_load {
                    None
                } else {
                    existing.and_then(|project| project.error_message.clone())
                },
                provider_warnings: if should_load {
                    Vec::new()
                } else {
                    existing
                        .map(|project| project.provider_warnings.clone())
                        .unwrap_or_default()
                },
                worktrees,
            });
        }

        let initial_counts = self.store.initial_visible_thread_counts(&known_paths);
        RefreshBootstrap {
            open_paths,
            load_targets,
            initial_projects,
            initial_counts,
        }
    }

    /// Placeholder threads for a path entering a refresh cycle: keep what
    /// it already shows, else fall back to cached previews while loading.
    fn seeded_threads(
        &self,
        existing: Option<&[SessionThread]>,
        should_load: bool,
        path: &str,
    ) -> Vec<SessionThread> {
        match existing {
            Some(threads) if !threads.is_empty() => threads.to_vec(),
            _ if should_load => self
                .previews
                .get(path)
                .unwrap_or_default()
                .into_iter()
                .map(ThreadPreview::into_cached_thread)
                .collect(),
            _ => Vec::new(),
        }
    }

    async fn prefetch_all(
        &self,
        sources: &[Arc<dyn SessionSource>],
        paths: &[String],
    ) -> HashMap<ProviderId, HashMap<String, Vec<SessionThread>>> {
        join_all(sources.iter().map(|source| async move {
            let provider = source.provider();
            match source.prefetch_threads(paths).await {
                Ok(threads_by_path) => {
                    let normalized = threads_by_path
                        .into_iter()
                        .map(|(path, threads)| (normalize_path(&path), threads))
                        .collect();
                    (provider, normalized)
                }
                Err(error) => {
                    warn!(
                        provider = %provider,
                        error = %format!("{error:#}"),
                        "bulk session prefetch failed; falling back to per-path listing"
                    );
                    (provider, HashMap::new())
                }
            }
        }))
        .await
        .into_iter()
        .collect()
    }

    async fn load_target(
        &self,
        sources: &[Arc<dyn SessionSource>],
        target: &LoadTarget,
        prefetched: &HashMap<ProviderId, HashMap<String, Vec<SessionThread>>>,
    ) {
        let result = self
            .load_sources_incrementally(sources, target.path(), prefetched, |partial, complete| {
                self.apply_path_result(target, partial, !complete, false);
            })
            .await;
        self.apply_path_result(target, &result, false, true);

        if result.error_message.is_none() {
            self.previews.set(
                target.path(),
                result.threads.iter().map(ThreadPreview::from).collect(),
            );
        }
    }

    /// Query every source for one path, publishing the merged partial
    /// result as each source finishes so fast providers surface first.
    async fn load_sources_incrementally(
        &self,
        sources: &[Arc<dyn SessionSource>],
        path: &str,
        prefetched: &HashMap<ProviderId, HashMap<String, Vec<SessionThread>>>,
        mut publish: impl FnMut(&PathLoadResult, bool),
    ) -> PathLoadResult {
        let total = sources.len();
        let mut in_flight: FuturesUnordered<_> = sources
            .iter()
            .map(|source| self.load_source_for_open_path(source.as_ref(), path, prefetched))
            .collect();

        let mut results = Vec::with_capacity(total);
        while let Some(result) = in_flight.next().await {
            results.push(result);
            let partial = merge_source_load_results(&results);
            publish(&partial, results.len() == total);
        }
        merge_source_load_results(&results)
    }

    async fn load_source_for_open_path(
        &self,
        source: &dyn SessionSource,
        path: &str,
        prefetched: &HashMap<ProviderId, HashMap<String, Vec<SessionThread>>>,
    ) -> SourceLoadResult {
        let provider = source.provider();
        let listed = match prefetched
            .get(&provider)
            .and_then(|threads_by_path| threads_by_path.get(path))
        {
            Some(threads) => Ok(threads.clone()),
            None => source.list_threads_from_open_project(path).await,
        };
        match listed {
            Ok(threads) => SourceLoadResult {
                result: Ok(self.apply_archive_suppressions(path, &provider, threads)),
                has_unknown_total: !source.can_report_exact_thread_count(),
                provider,
            },
            Err(error) => {
                warn!(
                    provider = %provider,
                    path,
                    error = %format!("{error:#}"),
                    "session listing failed"
                );
                SourceLoadResult {
                    provider,
                    result: Err(error),
                    has_unknown_total: false,
                }
            }
        }
    }

    /// Write a merged result back into the tree. Partial publishes carry
    /// threads and warnings only; the error and unknown-count flags are
    /// stamped once every source has answered, so a fast failure does not
    /// flash an error over a path whose other sources are still loading.
    fn apply_path_result(
        &self,
        target: &LoadTarget,
        result: &PathLoadResult,
        partial: bool,
        mark_loaded: bool,
    ) {
        match &target.worktree_path {
            None => self.store.update_project(&target.project_path, |project| {
                ProjectSessions {
                    threads: result.threads.clone(),
                    is_loading: partial,
                    has_loaded: project.has_loaded || mark_loaded,
                    has_unknown_thread_count: if partial {
                        project.has_unknown_thread_count
                    } else {
                        result.has_unknown_thread_count
                    },
                    error_message: if partial {
                        project.error_message.clone()
                    } else {
                        result.error_message.clone()
                    },
                    provider_warnings: result.provider_warnings.clone(),
                    ..project.clone()
                }
            }),
            Some(worktree_path) => self.store.update_worktree(
                &target.project_path,
                worktree_path,
                |worktree| WorktreeSessions {
                    threads: result.threads.clone(),
                    is_loading: partial,
                    has_loaded: worktree.has_loaded || mark_loaded,
                    has_unknown_thread_count: if partial {
                        worktree.has_unknown_thread_count
                    } else {
                        result.has_unknown_thread_count
                    },
                    error_message: if partial {
                        worktree.error_message.clone()
                    } else {
                        result.error_message.clone()
                    },
                    provider_warnings: result.provider_warnings.clone(),
                    ..worktree.clone()
                },
            ),
        }
    }

    /// Closed-path load used by the on-demand entry points: every source
    /// is queried with its plain CLI listing, no prefetch.
    pub(super) async fn load_threads_from_closed_path(&self, path: &str) -> PathLoadResult {
        let sources = self.registry.sources();
        let results = join_all(sources.iter().map(|source| async move {
            let provider = source.provider();
            match source.list_threads_from_closed_project(path).await {
                Ok(threads) => SourceLoadResult {
                    result: Ok(self.apply_archive_suppressions(path, &provider, threads)),
                    has_unknown_total: !source.can_report_exact_thread_count(),
                    provider,
                },
                Err(error) => {
                    warn!(
                        provider = %provider,
                        path,
                        error = %format!("{error:#}"),
                        "closed-path session listing failed"
                    );
                    SourceLoadResult {
                        provider,
                        result: Err(error),
                        has_unknown_total: false,
                    }
                }
            }
        }))
        .await;
        merge_source_load_results(&results)
    }
}
