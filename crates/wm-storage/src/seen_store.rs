//! On-disk seen-sets: one JSON object mapping site key to an array of
//! fingerprints, oldest first.

use std::path::{Path, PathBuf};

use tracing::{info, warn};
use wm_core::seen::{total_seen, DEFAULT_MAX_ITEMS_PER_SITE};
use wm_core::SeenMap;

use crate::{read_state_file, write_json_atomic, StoreError};

/// Evict the oldest fingerprints of every site until each holds at most
/// `cap`. Returns the total number evicted.
pub fn trim_in_place(map: &mut SeenMap, cap: usize) -> usize {
    map.values_mut().map(|set| set.trim_to(cap)).sum()
}

#[derive(Debug, Clone)]
pub struct SeenStore {
    path: PathBuf,
    max_items_per_site: usize,
}

impl SeenStore {
    pub fn new(path: impl Into<PathBuf>, max_items_per_site: usize) -> Self {
        Self {
            path: path.into(),
            max_items_per_site,
        }
    }

    pub fn with_default_cap(path: impl Into<PathBuf>) -> Self {
        Self::new(path, DEFAULT_MAX_ITEMS_PER_SITE)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn max_items_per_site(&self) -> usize {
        self.max_items_per_site
    }

    pub async fn load_checked(&self) -> Result<SeenMap, StoreError> {
        let text = read_state_file(&self.path).await?;
        serde_json::from_str(&text).map_err(|source| StoreError::Malformed {
            path: self.path.display().to_string(),
            source,
        })
    }

    /// Load the seen map; a missing, empty or corrupt file yields an empty
    /// map.
    pub async fn load(&self) -> SeenMap {
        match self.load_checked().await {
            Ok(map) => {
                info!(
                    path = %self.path.display(),
                    sites = map.len(),
                    fingerprints = total_seen(&map),
                    "loaded seen watches"
                );
                map
            }
            Err(StoreError::NotFound { .. }) => {
                info!(path = %self.path.display(), "no seen watches file, starting fresh");
                SeenMap::new()
            }
            Err(err) => {
                warn!(error = %err, "discarding unreadable seen watches file");
                SeenMap::new()
            }
        }
    }

    /// Copy of `map` with every site trimmed to the cap.
    pub fn trim(&self, map: &SeenMap) -> SeenMap {
        let mut trimmed = map.clone();
        trim_in_place(&mut trimmed, self.max_items_per_site);
        trimmed
    }

    /// Persist a trimmed view of `map`. The caller's map is left untouched.
    pub async fn save(&self, map: &SeenMap) -> Result<(), StoreError> {
        let trimmed = self.trim(map);
        write_json_atomic(&self.path, &trimmed).await
    }

    /// Forget the named sites, or every site when `sites` is empty.
    /// Returns the number of fingerprints dropped.
    pub async fn reset(&self, sites: &[String]) -> Result<usize, StoreError> {
        let mut map = match self.load_checked().await {
            Ok(map) => map,
            Err(StoreError::NotFound { .. }) | Err(StoreError::Empty { .. }) => SeenMap::new(),
            Err(err) => return Err(err),
        };

        let dropped = if sites.is_empty() {
            let dropped = total_seen(&map);
            map.clear();
            dropped
        } else {
            sites
                .iter()
                .filter_map(|site| map.remove(site))
                .map(|set| set.len())
                .sum()
        };

        self.save(&map).await?;
        info!(dropped, sites = ?sites, "reset seen watches");
        Ok(dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use wm_core::{Fingerprint, SeenSet};

    fn set_with(prefix: &str, count: usize) -> SeenSet {
        (0..count).map(|i| Fingerprint::new(format!("{prefix}{i}"))).collect()
    }

    #[tokio::test]
    async fn missing_file_loads_empty() {
        let dir = tempdir().expect("tempdir");
        let store = SeenStore::with_default_cap(dir.path().join("seen.json"));

        assert!(matches!(store.load_checked().await, Err(StoreError::NotFound { .. })));
        assert!(store.load().await.is_empty());
    }

    #[tokio::test]
    async fn corrupt_file_loads_empty() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("seen.json");
        std::fs::write(&path, "{\"grimmeissen\": [\"abc\", ").unwrap();
        let store = SeenStore::with_default_cap(&path);

        assert!(matches!(store.load_checked().await, Err(StoreError::Malformed { .. })));
        assert!(store.load().await.is_empty());
    }

    #[tokio::test]
    async fn save_then_load_preserves_order_and_sites() {
        let dir = tempdir().expect("tempdir");
        let store = SeenStore::with_default_cap(dir.path().join("seen.json"));

        let mut map = SeenMap::new();
        map.insert("grimmeissen".into(), set_with("g", 3));
        map.insert("watch_out".into(), SeenSet::new());
        store.save(&map).await.expect("save");

        let loaded = store.load().await;
        assert_eq!(loaded, map);
        let first = loaded["grimmeissen"].iter().next().map(Fingerprint::as_str);
        assert_eq!(first, Some("g0"));
    }

    #[tokio::test]
    async fn save_bounds_every_site_keeping_newest() {
        let dir = tempdir().expect("tempdir");
        let store = SeenStore::new(dir.path().join("seen.json"), 10);

        let mut map = SeenMap::new();
        map.insert("a".into(), set_with("a", 25));
        map.insert("b".into(), set_with("b", 4));
        store.save(&map).await.expect("save");

        assert_eq!(map["a"].len(), 25, "caller map is not trimmed");
        let loaded = store.load().await;
        assert_eq!(loaded["a"].len(), 10);
        assert_eq!(loaded["b"].len(), 4);
        assert!(loaded["a"].contains(&"a24".into()));
        assert!(!loaded["a"].contains(&"a14".into()));

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["seen.json".to_string()]);
    }

    #[tokio::test]
    async fn reset_drops_named_sites_only() {
        let dir = tempdir().expect("tempdir");
        let store = SeenStore::with_default_cap(dir.path().join("seen.json"));

        let mut map = SeenMap::new();
        map.insert("a".into(), set_with("a", 3));
        map.insert("b".into(), set_with("b", 2));
        store.save(&map).await.expect("save");

        let dropped = store.reset(&["a".to_string()]).await.expect("reset");
        assert_eq!(dropped, 3);
        let loaded = store.load().await;
        assert!(!loaded.contains_key("a"));
        assert_eq!(loaded["b"].len(), 2);

        assert_eq!(store.reset(&[]).await.expect("reset all"), 2);
        assert!(store.load().await.is_empty());
    }

    #[test]
    fn trim_in_place_reports_evictions() {
        let mut map = SeenMap::new();
        map.insert("a".into(), set_with("a", 7));
        map.insert("b".into(), set_with("b", 2));
        assert_eq!(trim_in_place(&mut map, 3), 4);
        assert_eq!(map["a"].len(), 3);
        assert_eq!(map["b"].len(), 2);
    }
}
