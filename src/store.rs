use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::watch;

use crate::model::{now_ms, ProjectSessions, SessionsState, WorktreeSessions};

/// Single source of truth for all known projects and their threads.
///
/// Holds the current immutable snapshot behind a `watch` channel: every
/// update builds a complete replacement value and swaps it in, so
/// concurrent readers always observe an internally consistent state.
/// Uses latest-value semantics via `watch`, like the backend snapshot
/// channel.
pub struct StateStore {
    tx: watch::Sender<Arc<SessionsState>>,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Arc::new(SessionsState::default()));
        Self { tx }
    }

    /// Current snapshot. Non-blocking; cheap Arc clone.
    pub fn snapshot(&self) -> Arc<SessionsState> {
        self.tx.borrow().clone()
    }

    /// Subscribe to snapshot broadcasts. The receiver immediately sees the
    /// current value.
    pub fn subscribe(&self) -> watch::Receiver<Arc<SessionsState>> {
        self.tx.subscribe()
    }

    /// Atomically apply a pure transformation to the state. Observers are
    /// only notified when the value actually changed.
    pub fn update(&self, f: impl FnOnce(&SessionsState) -> SessionsState) {
        self.tx.send_if_modified(|current| {
            let next = f(current);
            if next == **current {
                false
            } else {
                *current = Arc::new(next);
                true
            }
        });
    }

    /// Atomic partial update of one project. Silent no-op when the path is
    /// not present (the project may have closed between scheduling and
    /// execution).
    pub fn update_project(&self, path: &str, f: impl FnOnce(&ProjectSessions) -> ProjectSessions) {
        let mut f = Some(f);
        self.update(|state| {
            let mut next = state.clone();
            for project in &mut next.projects {
                if project.path == path {
                    if let Some(f) = f.take() {
                        *project = f(project);
                    }
                    break;
                }
            }
            next
        });
    }

    /// Atomic partial update of one worktree under a project. Silent no-op
    /// when either path is not present.
    pub fn update_worktree(
        &self,
        project_path: &str,
        worktree_path: &str,
        f: impl FnOnce(&WorktreeSessions) -> WorktreeSessions,
    ) {
        let mut f = Some(f);
        self.update(|state| {
            let mut next = state.clone();
            for project in &mut next.projects {
                if project.path != project_path {
                    continue;
                }
                for worktree in &mut project.worktrees {
                    if worktree.path == worktree_path {
                        if let Some(f) = f.take() {
                            *worktree = f(worktree);
                        }
                        break;
                    }
                }
                break;
            }
            next
        });
    }

    /// Bulk replace at the start of a refresh cycle: seeds the shape of the
    /// tree (which paths exist, which are loading) before per-path loads
    /// complete. Clears any previous global error.
    pub fn replace_projects(
        &self,
        projects: Vec<ProjectSessions>,
        visible_thread_counts: HashMap<String, usize>,
    ) {
        self.update(|state| SessionsState {
            projects: projects.clone(),
            last_updated_at: state.last_updated_at,
            error_message: None,
            visible_thread_counts: visible_thread_counts.clone(),
        });
    }

    /// Visible-thread counts restricted to paths that survive the next
    /// catalog swap.
    pub fn initial_visible_thread_counts(&self, known_paths: &[String]) -> HashMap<String, usize> {
        let state = self.snapshot();
        known_paths
            .iter()
            .filter_map(|path| {
                state
                    .visible_thread_counts
                    .get(path)
                    .map(|count| (path.clone(), *count))
            })
            .collect()
    }

    /// Stamp a global error message on the aggregate state (whole-refresh
    /// failure; per-path state is left as is).
    pub fn mark_load_failure(&self, message: impl Into<String>) {
        let message = message.into();
        self.update(|state| SessionsState {
            error_message: Some(message.clone()),
            last_updated_at: Some(now_ms()),
            ..state.clone()
        });
    }

    /// Stamp `last_updated_at` without touching anything else.
    pub fn touch(&self) {
        self.update(|state| SessionsState {
            last_updated_at: Some(now_ms()),
            ..state.clone()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project(path: &str) -> ProjectSessions {
        ProjectSessions {
            path: path.to_string(),
            name: path.rsplit('/').next().unwrap_or(path).to_string(),
            branch: None,
            is_open: true,
            threads: Vec::new(),
            is_loading: false,
            has_loaded: false,
            has_unknown_thread_count: false,
            error_message: None,
            provider_warnings: Vec::new(),
            worktrees: Vec::new(),
        }
    }

    #[test]
    fn update_project_is_a_noop_for_unknown_paths() {
        let store = StateStore::new();
        store.replace_projects(vec![project("/a")], HashMap::new());

        store.update_project("/missing", |p| ProjectSessions {
            is_loading: true,
            ..p.clone()
        });

        let state = store.snapshot();
        assert_eq!(state.projects.len(), 1);
        assert!(!state.projects[0].is_loading);
    }

    #[test]
    fn update_project_swaps_whole_value() {
        let store = StateStore::new();
        store.replace_projects(vec![project("/a")], HashMap::new());
        let before = store.snapshot();

        store.update_project("/a", |p| ProjectSessions {
            is_loading: true,
            ..p.clone()
        });

        let after = store.snapshot();
        assert!(!Arc::ptr_eq(&before, &after));
        assert!(!before.projects[0].is_loading);
        assert!(after.projects[0].is_loading);
    }

    #[test]
    fn subscribers_only_notified_on_real_changes() {
        let store = StateStore::new();
        store.replace_projects(vec![project("/a")], HashMap::new());
        let mut rx = store.subscribe();
        rx.borrow_and_update();

        // Identity transformation must not wake subscribers.
        store.update(|state| state.clone());
        assert!(!rx.has_changed().unwrap());

        store.update_project("/a", |p| ProjectSessions {
            has_loaded: true,
            ..p.clone()
        });
        assert!(rx.has_changed().unwrap());
    }

    #[test]
    fn visible_thread_counts_survive_known_paths_only() {
        let store = StateStore::new();
        let mut counts = HashMap::new();
        counts.insert("/a".to_string(), 5);
        counts.insert("/b".to_string(), 10);
        store.replace_projects(vec![project("/a"), project("/b")], counts);

        let retained = store.initial_visible_thread_counts(&["/a".to_string()]);
        assert_eq!(retained.len(), 1);
        assert_eq!(retained.get("/a"), Some(&5));
    }

    #[test]
    fn mark_load_failure_sets_global_error_and_replace_clears_it() {
        let store = StateStore::new();
        store.mark_load_failure("catalog unavailable");
        assert_eq!(
            store.snapshot().error_message.as_deref(),
            Some("catalog unavailable")
        );

        store.replace_projects(vec![project("/a")], HashMap::new());
        assert!(store.snapshot().error_message.is_none());
    }

    #[test]
    fn update_worktree_targets_exact_path() {
        let store = StateStore::new();
        let mut p = project("/a");
        p.worktrees.push(WorktreeSessions {
            path: "/a-wt".to_string(),
            name: "a-wt".to_string(),
            branch: Some("feature".to_string()),
            is_open: false,
            threads: Vec::new(),
            is_loading: false,
            has_loaded: false,
            has_unknown_thread_count: false,
            error_message: None,
            provider_warnings: Vec::new(),
        });
        store.replace_projects(vec![p], HashMap::new());

        store.update_worktree("/a", "/a-wt", |wt| WorktreeSessions {
            has_loaded: true,
            ..wt.clone()
        });
        store.update_worktree("/a", "/missing", |wt| WorktreeSessions {
            is_loading: true,
            ..wt.clone()
        });

        let state = store.snapshot();
        let wt = &state.projects[0].worktrees[0];
        assert!(wt.has_loaded);
        assert!(!wt.is_loading);
    }
}
