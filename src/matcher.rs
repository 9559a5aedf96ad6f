//! Reconciles pending (not-yet-identified) chat tabs against freshly
//! discovered candidate threads.
//!
//! Per path, the matcher builds a bipartite graph whose edges connect a
//! pending tab to every candidate whose `updated_at` falls inside the
//! tab's time window, then repeatedly binds "forced pairs" (a pending tab
//! and candidate that are each other's only remaining edge) to fixpoint.
//! Genuinely ambiguous cases are reported, never guessed: silently
//! repointing an open chat tab at the wrong backend session is far worse
//! than leaving it pending.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::model::{PendingTabSnapshot, RebindTarget};

/// One firm pending-tab → candidate binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTabBinding {
    pub pending_identity: String,
    pub target: RebindTarget,
}

/// Matcher output: firm bindings plus diagnostics for the rest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchOutcome {
    pub bindings_by_path: HashMap<String, Vec<PendingTabBinding>>,
    /// Pending tabs with edges but no forced resolution.
    pub ambiguous_by_path: HashMap<String, BTreeSet<String>>,
    /// Pending tabs that never had a candidate in window.
    pub no_match_by_path: HashMap<String, BTreeSet<String>>,
}

/// Time window around a pending tab's anchor in which a candidate's
/// `updated_at` counts as temporally close.
#[derive(Debug, Clone, Copy)]
pub struct MatchWindow {
    pub pre_ms: i64,
    pub post_ms: i64,
}

impl Default for MatchWindow {
    fn default() -> Self {
        Self {
            pre_ms: 20_000,
            post_ms: 120_000,
        }
    }
}

/// Match pending tabs against candidates, per path independently.
/// Candidates whose identity some other open tab already displays are
/// excluded up front.
pub fn match_pending_tabs(
    pending_by_path: &HashMap<String, Vec<PendingTabSnapshot>>,
    candidates_by_path: &HashMap<String, Vec<RebindTarget>>,
    open_concrete_by_path: &HashMap<String, HashSet<String>>,
    window: MatchWindow,
) -> MatchOutcome {
    let mut outcome = MatchOutcome::default();
    static EMPTY_CANDIDATES: Vec<RebindTarget> = Vec::new();

    for (path, pending_tabs) in pending_by_path {
        if pending_tabs.is_empty() {
            continue;
        }
        let candidates = candidates_by_path.get(path).unwrap_or(&EMPTY_CANDIDATES);
        let concrete = open_concrete_by_path.get(path);
        let path_result = match_path(pending_tabs, candidates, concrete, window);

        if !path_result.bindings.is_empty() {
            outcome
                .bindings_by_path
                .insert(path.clone(), path_result.bindings);
        }
        if !path_result.ambiguous.is_empty() {
            outcome
                .ambiguous_by_path
                .insert(path.clone(), path_result.ambiguous);
        }
        if !path_result.no_match.is_empty() {
            outcome
                .no_match_by_path
                .insert(path.clone(), path_result.no_match);
        }
    }

    outcome
}

struct PathMatchResult {
    bindings: Vec<PendingTabBinding>,
    ambiguous: BTreeSet<String>,
    no_match: BTreeSet<String>,
}

fn match_path(
    pending_tabs: &[PendingTabSnapshot],
    candidates: &[RebindTarget],
    open_concrete: Option<&HashSet<String>>,
    window: MatchWindow,
) -> PathMatchResult {
    // Dedupe pending tabs by identity (first occurrence wins) and
    // candidates by identity (most recently updated wins), then drop
    // candidates already shown by a concrete tab.
    let mut unique_pending: Vec<&PendingTabSnapshot> = Vec::new();
    let mut seen = BTreeSet::new();
    for tab in pending_tabs {
        if seen.insert(tab.pending_identity.as_str()) {
            unique_pending.push(tab);
        }
    }
    let candidate_by_identity = deduplicate_candidates(candidates, open_concrete);

    // Bipartite adjacency, both directions. BTreeMaps keep iteration
    // deterministic.
    let mut pending_edges: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    let mut candidate_edges: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    let mut initial_edge_counts: BTreeMap<&str, usize> = BTreeMap::new();

    for tab in &unique_pending {
        let mut connected: BTreeSet<&str> = BTreeSet::new();
        if let Some(anchor) = tab.anchor_ms() {
            let min = anchor - window.pre_ms;
            let max = anchor + window.post_ms;
            for (identity, candidate) in &candidate_by_identity {
                if candidate.thread_updated_at <= 0 {
                    continue;
                }
                if (min..=max).contains(&candidate.thread_updated_at) {
                    connected.insert(*identity);
                    candidate_edges
                        .entry(*identity)
                        .or_default()
                        .insert(tab.pending_identity.as_str());
                }
            }
        }
        initial_edge_counts.insert(tab.pending_identity.as_str(), connected.len());
        pending_edges.insert(tab.pending_identity.as_str(), connected);
    }

    // Forced-pair propagation to fixpoint: bind only pairs that are each
    // other's sole remaining edge, remove both endpoints, repeat.
    let mut bindings: BTreeMap<String, RebindTarget> = BTreeMap::new();
    loop {
        let forced: Vec<(&str, &str)> = pending_edges
            .iter()
            .filter(|(_, edges)| edges.len() == 1)
            .filter_map(|(pending, edges)| {
                let candidate = *edges.iter().next()?;
                let back = candidate_edges.get(candidate)?;
                (back.len() == 1 && back.contains(pending)).then_some((*pending, candidate))
            })
            .collect();
        if forced.is_empty() {
            break;
        }

        for (pending, candidate) in forced {
            if !pending_edges.contains_key(pending) || !candidate_edges.contains_key(candidate) {
                continue;
            }
            let Some(target) = candidate_by_identity.get(candidate) else {
                continue;
            };
            bindings.insert(pending.to_string(), (*target).clone());

            pending_edges.remove(pending);
            candidate_edges.remove(candidate);
            for edges in pending_edges.values_mut() {
                edges.remove(candidate);
            }
            for edges in candidate_edges.values_mut() {
                edges.remove(pending);
            }
        }
    }

    let mut ambiguous = BTreeSet::new();
    let mut no_match = BTreeSet::new();
    for (pending, remaining) in &pending_edges {
        let initial = initial_edge_counts.get(pending).copied().unwrap_or(0);
        if !remaining.is_empty() || initial > 0 {
            ambiguous.insert((*pending).to_string());
        } else {
            no_match.insert((*pending).to_string());
        }
    }

    let bindings = bindings
        .into_iter()
        .map(|(pending_identity, target)| PendingTabBinding {
            pending_identity,
            target,
        })
        .collect();

    PathMatchResult {
        bindings,
        ambiguous,
        no_match,
    }
}

fn deduplicate_candidates<'a>(
    candidates: &'a [RebindTarget],
    open_concrete: Option<&HashSet<String>>,
) -> BTreeMap<&'a str, &'a RebindTarget> {
    let mut result: BTreeMap<&str, &RebindTarget> = BTreeMap::new();
    for candidate in candidates {
        if open_concrete.is_some_and(|c| c.contains(&candidate.thread_identity)) {
            continue;
        }
        match result.get(candidate.thread_identity.as_str()) {
            Some(existing) if candidate.thread_updated_at < existing.thread_updated_at => {}
            _ => {
                result.insert(candidate.thread_identity.as_str(), candidate);
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{thread_identity, ProviderId, ThreadActivity};
    use proptest::prelude::*;

    const PATH: &str = "/home/dev/project";

    fn pending(identity: &str, anchor: i64) -> PendingTabSnapshot {
        PendingTabSnapshot {
            pending_identity: identity.to_string(),
            created_at_ms: Some(anchor),
            first_input_at_ms: None,
        }
    }

    fn candidate(id: &str, updated_at: i64) -> RebindTarget {
        RebindTarget {
            thread_identity: thread_identity(&ProviderId::codex(), id),
            thread_id: id.to_string(),
            shell_command: vec!["codex".into(), "resume".into(), id.into()],
            thread_title: format!("thread {id}"),
            thread_activity: ThreadActivity::Ready,
            thread_updated_at: updated_at,
        }
    }

    fn run(
        pending_tabs: Vec<PendingTabSnapshot>,
        candidates: Vec<RebindTarget>,
    ) -> MatchOutcome {
        let pending_by_path = HashMap::from([(PATH.to_string(), pending_tabs)]);
        let candidates_by_path = HashMap::from([(PATH.to_string(), candidates)]);
        match_pending_tabs(
            &pending_by_path,
            &candidates_by_path,
            &HashMap::new(),
            MatchWindow::default(),
        )
    }

    #[test]
    fn unique_pair_in_window_binds() {
        let outcome = run(
            vec![pending("codex:new-1", 100_000)],
            vec![candidate("t1", 110_000)],
        );
        let bindings = &outcome.bindings_by_path[PATH];
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].pending_identity, "codex:new-1");
        assert_eq!(bindings[0].target.thread_id, "t1");
        assert!(outcome.ambiguous_by_path.is_empty());
        assert!(outcome.no_match_by_path.is_empty());
    }

    #[test]
    fn candidate_outside_window_reports_no_match() {
        // Window is [anchor - 20s, anchor + 120s].
        let outcome = run(
            vec![pending("codex:new-1", 100_000)],
            vec![candidate("t1", 100_000 + 121_000)],
        );
        assert!(outcome.bindings_by_path.is_empty());
        assert!(outcome.no_match_by_path[PATH].contains("codex:new-1"));
    }

    #[test]
    fn two_pending_one_candidate_is_ambiguous_for_both() {
        let outcome = run(
            vec![
                pending("codex:new-1", 100_000),
                pending("codex:new-2", 101_000),
            ],
            vec![candidate("t1", 105_000)],
        );
        assert!(outcome.bindings_by_path.is_empty());
        let ambiguous = &outcome.ambiguous_by_path[PATH];
        assert!(ambiguous.contains("codex:new-1"));
        assert!(ambiguous.contains("codex:new-2"));
    }

    #[test]
    fn one_pending_two_candidates_is_ambiguous() {
        let outcome = run(
            vec![pending("codex:new-1", 100_000)],
            vec![candidate("t1", 105_000), candidate("t2", 106_000)],
        );
        assert!(outcome.bindings_by_path.is_empty());
        assert!(outcome.ambiguous_by_path[PATH].contains("codex:new-1"));
    }

    #[test]
    fn propagation_resolves_chained_pairs() {
        // new-1 sees only t1; new-2 sees t1 and t2. Binding (new-1, t1)
        // leaves (new-2, t2) forced on the second pass.
        let outcome = run(
            vec![
                pending("codex:new-1", 100_000),
                pending("codex:new-2", 215_000),
            ],
            vec![candidate("t1", 110_000), candidate("t2", 220_000)],
        );
        let bindings = &outcome.bindings_by_path[PATH];
        assert_eq!(bindings.len(), 2);
        let by_pending: HashMap<_, _> = bindings
            .iter()
            .map(|b| (b.pending_identity.as_str(), b.target.thread_id.as_str()))
            .collect();
        assert_eq!(by_pending["codex:new-1"], "t1");
        assert_eq!(by_pending["codex:new-2"], "t2");
    }

    #[test]
    fn concrete_open_identity_is_not_a_candidate() {
        let concrete: HashSet<String> =
            [thread_identity(&ProviderId::codex(), "t1")].into_iter().collect();
        let pending_by_path =
            HashMap::from([(PATH.to_string(), vec![pending("codex:new-1", 100_000)])]);
        let candidates_by_path =
            HashMap::from([(PATH.to_string(), vec![candidate("t1", 110_000)])]);
        let open_by_path = HashMap::from([(PATH.to_string(), concrete)]);

        let outcome = match_pending_tabs(
            &pending_by_path,
            &candidates_by_path,
            &open_by_path,
            MatchWindow::default(),
        );
        assert!(outcome.bindings_by_path.is_empty());
        assert!(outcome.no_match_by_path[PATH].contains("codex:new-1"));
    }

    #[test]
    fn duplicate_candidates_keep_most_recent() {
        let outcome = run(
            vec![pending("codex:new-1", 100_000)],
            vec![candidate("t1", 105_000), candidate("t1", 115_000)],
        );
        let bindings = &outcome.bindings_by_path[PATH];
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].target.thread_updated_at, 115_000);
    }

    #[test]
    fn pending_tab_without_anchor_never_binds() {
        let tab = PendingTabSnapshot {
            pending_identity: "codex:new-1".to_string(),
            created_at_ms: None,
            first_input_at_ms: None,
        };
        let outcome = run(vec![tab], vec![candidate("t1", 110_000)]);
        assert!(outcome.bindings_by_path.is_empty());
        assert!(outcome.no_match_by_path[PATH].contains("codex:new-1"));
    }

    #[test]
    fn candidate_with_zero_timestamp_is_ignored() {
        let outcome = run(
            vec![pending("codex:new-1", 10_000)],
            vec![candidate("t1", 0)],
        );
        assert!(outcome.bindings_by_path.is_empty());
        assert!(outcome.no_match_by_path[PATH].contains("codex:new-1"));
    }

    #[test]
    fn paths_are_matched_independently() {
        let pending_by_path = HashMap::from([
            ("/a".to_string(), vec![pending("codex:new-1", 100_000)]),
            ("/b".to_string(), vec![pending("codex:new-2", 100_000)]),
        ]);
        let candidates_by_path =
            HashMap::from([("/a".to_string(), vec![candidate("t1", 110_000)])]);

        let outcome = match_pending_tabs(
            &pending_by_path,
            &candidates_by_path,
            &HashMap::new(),
            MatchWindow::default(),
        );
        assert_eq!(outcome.bindings_by_path.len(), 1);
        assert!(outcome.no_match_by_path["/b"].contains("codex:new-2"));
    }

    proptest! {
        /// Precision over completeness: any binding the matcher produces
        /// must be a candidate inside the pending tab's window, and no
        /// candidate may be handed to two pending tabs.
        #[test]
        fn bindings_are_in_window_and_unique(
            anchors in prop::collection::vec(0i64..1_000_000, 0..6),
            stamps in prop::collection::vec(1i64..1_000_000, 0..6),
        ) {
            let pending_tabs: Vec<PendingTabSnapshot> = anchors
                .iter()
                .enumerate()
                .map(|(i, anchor)| pending(&format!("codex:new-{i}"), *anchor))
                .collect();
            let candidates: Vec<RebindTarget> = stamps
                .iter()
                .enumerate()
                .map(|(i, at)| candidate(&format!("t{i}"), *at))
                .collect();

            let anchor_by_identity: HashMap<String, i64> = pending_tabs
                .iter()
                .map(|t| (t.pending_identity.clone(), t.anchor_ms().unwrap()))
                .collect();

            let window = MatchWindow::default();
            let outcome = run(pending_tabs, candidates);

            let mut used_targets = HashSet::new();
            for bindings in outcome.bindings_by_path.values() {
                for binding in bindings {
                    let anchor = anchor_by_identity[&binding.pending_identity];
                    let at = binding.target.thread_updated_at;
                    prop_assert!(at >= anchor - window.pre_ms);
                    prop_assert!(at <= anchor + window.post_ms);
                    prop_assert!(used_targets.insert(binding.target.thread_identity.clone()));
                }
            }
        }
    }
}
