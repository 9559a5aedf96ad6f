use anyhow::Result;

use crate::model::{ProviderId, ProviderWarning, SessionThread};

/// Outcome of one provider's listing call for one path.
pub(crate) struct SourceLoadResult {
    pub provider: ProviderId,
    pub result: Result<Vec<SessionThread>>,
    /// Success, but the source cannot report an exact total.
    pub has_unknown_total: bool,
}

/// Merged multi-provider state for one path.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct PathLoadResult {
    pub threads: Vec<SessionThread>,
    pub has_unknown_thread_count: bool,
    pub error_message: Option<String>,
    pub provider_warnings: Vec<ProviderWarning>,
}

/// Merge per-provider results for a single path. Failures become provider
/// warnings; only when every provider failed does the path carry an error
/// message (there is nothing to show at all).
pub(crate) fn merge_source_load_results(results: &[SourceLoadResult]) -> PathLoadResult {
    let mut threads = Vec::new();
    let mut warnings = Vec::new();
    let mut has_unknown = false;
    let mut failures = 0usize;

    for source_result in results {
        match &source_result.result {
            Ok(provider_threads) => {
                threads.extend(provider_threads.iter().cloned());
                has_unknown |= source_result.has_unknown_total;
            }
            Err(error) => {
                failures += 1;
                warnings.push(ProviderWarning {
                    provider: source_result.provider.clone(),
                    message: provider_warning_message(&source_result.provider, error),
                });
            }
        }
    }
    threads.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));

    let error_message = if !results.is_empty() && failures == results.len() {
        Some("Failed to load sessions".to_string())
    } else {
        None
    };

    PathLoadResult {
        threads,
        has_unknown_thread_count: has_unknown,
        error_message,
        provider_warnings: warnings,
    }
}

/// Replace one provider's partition of a thread list: drop that provider's
/// existing threads, insert the new list, resort by recency. Other
/// providers' threads are untouched.
pub(crate) fn merge_threads_for_provider(
    existing: &[SessionThread],
    provider: &ProviderId,
    new_provider_threads: Vec<SessionThread>,
) -> Vec<SessionThread> {
    let mut merged: Vec<SessionThread> = existing
        .iter()
        .filter(|thread| thread.provider != *provider)
        .cloned()
        .collect();
    merged.extend(new_provider_threads);
    merged.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    merged
}

/// Replace (never append to) a provider's warning slot for a path.
pub(crate) fn replace_provider_warning(
    warnings: &[ProviderWarning],
    provider: &ProviderId,
    message: Option<String>,
) -> Vec<ProviderWarning> {
    let mut next: Vec<ProviderWarning> = warnings
        .iter()
        .filter(|warning| warning.provider != *provider)
        .cloned()
        .collect();
    if let Some(message) = message {
        next.push(ProviderWarning {
            provider: provider.clone(),
            message,
        });
    }
    next
}

/// Append a warning unless an identical one is already present.
pub(crate) fn merge_provider_warning(
    warnings: &[ProviderWarning],
    warning: ProviderWarning,
) -> Vec<ProviderWarning> {
    if warnings
        .iter()
        .any(|w| w.provider == warning.provider && w.message == warning.message)
    {
        return warnings.to_vec();
    }
    let mut next = warnings.to_vec();
    next.push(warning);
    next
}

pub(crate) fn provider_warning_message(provider: &ProviderId, error: &anyhow::Error) -> String {
    format!("{provider} sessions are unavailable: {error:#}")
}

pub(crate) fn provider_unavailable_message(provider: &ProviderId) -> String {
    format!("{provider} sessions are unavailable")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ThreadActivity;

    fn thread(provider: ProviderId, id: &str, updated_at: i64) -> SessionThread {
        SessionThread {
            id: id.to_string(),
            title: format!("thread {id}"),
            updated_at,
            archived: false,
            activity: ThreadActivity::Ready,
            provider,
            sub_agents: Vec::new(),
        }
    }

    #[test]
    fn merge_keeps_other_providers_partition_intact() {
        let existing = vec![
            thread(ProviderId::codex(), "c1", 300),
            thread(ProviderId::claude(), "a1", 200),
            thread(ProviderId::codex(), "c2", 100),
        ];

        let merged = merge_threads_for_provider(
            &existing,
            &ProviderId::codex(),
            vec![thread(ProviderId::codex(), "c3", 400)],
        );

        let claude: Vec<_> = merged
            .iter()
            .filter(|t| t.provider == ProviderId::claude())
            .collect();
        assert_eq!(claude.len(), 1);
        assert_eq!(claude[0].id, "a1");
        assert!(merged.iter().all(|t| t.id != "c1" && t.id != "c2"));
        assert_eq!(merged[0].id, "c3");
    }

    #[test]
    fn merge_resorts_by_recency() {
        let merged = merge_threads_for_provider(
            &[thread(ProviderId::claude(), "a1", 250)],
            &ProviderId::codex(),
            vec![
                thread(ProviderId::codex(), "c1", 100),
                thread(ProviderId::codex(), "c2", 300),
            ],
        );
        let ids: Vec<_> = merged.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, ["c2", "a1", "c1"]);
    }

    #[test]
    fn partial_failure_yields_warning_not_error() {
        let results = [
            SourceLoadResult {
                provider: ProviderId::codex(),
                result: Ok(vec![thread(ProviderId::codex(), "c1", 100)]),
                has_unknown_total: false,
            },
            SourceLoadResult {
                provider: ProviderId::claude(),
                result: Err(anyhow::anyhow!("claude CLI not found")),
                has_unknown_total: false,
            },
        ];

        let merged = merge_source_load_results(&results);
        assert_eq!(merged.threads.len(), 1);
        assert!(merged.error_message.is_none());
        assert_eq!(merged.provider_warnings.len(), 1);
        assert_eq!(merged.provider_warnings[0].provider, ProviderId::claude());
    }

    #[test]
    fn total_failure_yields_error_message() {
        let results = [SourceLoadResult {
            provider: ProviderId::codex(),
            result: Err(anyhow::anyhow!("boom")),
            has_unknown_total: false,
        }];
        let merged = merge_source_load_results(&results);
        assert!(merged.error_message.is_some());
        assert_eq!(merged.provider_warnings.len(), 1);
    }

    #[test]
    fn unknown_total_propagates_from_any_success() {
        let results = [
            SourceLoadResult {
                provider: ProviderId::codex(),
                result: Ok(Vec::new()),
                has_unknown_total: true,
            },
            SourceLoadResult {
                provider: ProviderId::claude(),
                result: Ok(Vec::new()),
                has_unknown_total: false,
            },
        ];
        assert!(merge_source_load_results(&results).has_unknown_thread_count);
    }

    #[test]
    fn replace_warning_swaps_single_provider_slot() {
        let warnings = vec![
            ProviderWarning {
                provider: ProviderId::codex(),
                message: "old".to_string(),
            },
            ProviderWarning {
                provider: ProviderId::claude(),
                message: "keep".to_string(),
            },
        ];

        let next =
            replace_provider_warning(&warnings, &ProviderId::codex(), Some("new".to_string()));
        assert_eq!(next.len(), 2);
        assert!(next
            .iter()
            .any(|w| w.provider == ProviderId::codex() && w.message == "new"));

        let cleared = replace_provider_warning(&next, &ProviderId::codex(), None);
        assert_eq!(cleared.len(), 1);
        assert_eq!(cleared[0].provider, ProviderId::claude());
    }
}
