use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::model::ThreadPreview;

/// In-memory cache of the last successfully loaded thread previews per
/// open path. A refresh seeds placeholder rows from here so the tree can
/// show something while the real provider queries run.
#[derive(Default)]
pub struct PreviewCache {
    by_path: Mutex<HashMap<String, Vec<ThreadPreview>>>,
}

impl PreviewCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str) -> Option<Vec<ThreadPreview>> {
        self.by_path.lock().expect("preview cache poisoned").get(path).cloned()
    }

    pub fn set(&self, path: &str, previews: Vec<ThreadPreview>) {
        self.by_path
            .lock()
            .expect("preview cache poisoned")
            .insert(path.to_string(), previews);
    }

    /// Drop cached previews for paths that are no longer open.
    pub fn retain_open(&self, open_paths: &HashSet<String>) {
        self.by_path
            .lock()
            .expect("preview cache poisoned")
            .retain(|path, _| open_paths.contains(path));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ProviderId;

    fn preview(id: &str) -> ThreadPreview {
        ThreadPreview {
            id: id.to_string(),
            title: format!("thread {id}"),
            updated_at: 100,
            provider: ProviderId::codex(),
        }
    }

    #[test]
    fn retain_open_drops_closed_paths() {
        let cache = PreviewCache::new();
        cache.set("/open", vec![preview("a")]);
        cache.set("/closed", vec![preview("b")]);

        let open: HashSet<String> = ["/open".to_string()].into_iter().collect();
        cache.retain_open(&open);

        assert!(cache.get("/open").is_some());
        assert!(cache.get("/closed").is_none());
    }
}
