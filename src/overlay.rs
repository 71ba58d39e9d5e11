use std::{
    collections::{BTreeMap, HashMap},
    path::Path,
    sync::{PoisonError, RwLock},
};
use tracing::debug;
use walkdir::WalkDir;

use crate::meta_store::META_FILE_NAME;

/// Name of the origin that stands for the game's own data directory.
pub const BASE_ORIGIN: &str = "data";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OriginId(pub u32);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    pub id: OriginId,
    pub name: String,
    pub priority: i32,
}

/// One file as seen through the overlay: who provides it now, and every
/// other origin that also carries it, lowest priority first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayFile {
    pub path: String,
    pub origin: OriginId,
    pub alternatives: Vec<OriginId>,
}

/// Read side of the overlay filesystem that decides which origin wins a
/// file.
pub trait OverlayView: Send + Sync {
    fn origin_exists(&self, name: &str) -> bool;
    fn origin_by_name(&self, name: &str) -> Option<Origin>;
    fn origin_by_id(&self, id: OriginId) -> Option<Origin>;
    /// Every file `origin` contributes, whether or not it currently wins.
    fn files(&self, origin: OriginId) -> Vec<OverlayFile>;
}

#[derive(Debug, Clone, Default)]
pub struct OverlaySnapshot {
    origins: Vec<Origin>,
    by_name: HashMap<String, OriginId>,
    files_by_origin: HashMap<OriginId, Vec<OverlayFile>>,
}

impl OverlaySnapshot {
    pub fn builder() -> OverlayBuilder {
        OverlayBuilder::default()
    }
}

impl OverlayView for OverlaySnapshot {
    fn origin_exists(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    fn origin_by_name(&self, name: &str) -> Option<Origin> {
        let id = self.by_name.get(name)?;
        self.origin_by_id(*id)
    }

    fn origin_by_id(&self, id: OriginId) -> Option<Origin> {
        self.origins.get(id.0 as usize).cloned()
    }

    fn files(&self, origin: OriginId) -> Vec<OverlayFile> {
        self.files_by_origin.get(&origin).cloned().unwrap_or_default()
    }
}

/// Collects origins and the relative paths they provide, then resolves
/// winners by priority.
#[derive(Debug, Default)]
pub struct OverlayBuilder {
    origins: Vec<(String, i32, Vec<String>)>,
}

impl OverlayBuilder {
    /// Registers an origin with an explicit file list.
    pub fn origin<I, S>(mut self, name: &str, priority: i32, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let files = files
            .into_iter()
            .map(|file| normalize_path(file.as_ref()))
            .collect();
        self.origins.push((name.to_string(), priority, files));
        self
    }

    /// Registers an origin whose files are the contents of `dir`.
    pub fn origin_dir(self, name: &str, priority: i32, dir: &Path) -> Self {
        let files = scan_files(dir);
        debug!(origin = %name, files = files.len(), "overlay origin scanned");
        self.origin(name, priority, files)
    }

    pub fn build(self) -> OverlaySnapshot {
        let mut snapshot = OverlaySnapshot::default();
        let mut providers: BTreeMap<String, Vec<OriginId>> = BTreeMap::new();

        for (index, (name, priority, files)) in self.origins.into_iter().enumerate() {
            let id = OriginId(index as u32);
            snapshot.by_name.insert(name.clone(), id);
            snapshot.origins.push(Origin { id, name, priority });
            for file in files {
                let list = providers.entry(file).or_default();
                if !list.contains(&id) {
                    list.push(id);
                }
            }
        }

        for (path, mut ids) in providers {
            ids.sort_by_key(|id| (snapshot.origins[id.0 as usize].priority, id.0));
            let Some(winner) = ids.pop() else {
                continue;
            };
            for id in ids.iter().copied().chain(std::iter::once(winner)) {
                let alternatives = ids.clone();
                snapshot
                    .files_by_origin
                    .entry(id)
                    .or_default()
                    .push(OverlayFile {
                        path: path.clone(),
                        origin: winner,
                        alternatives,
                    });
            }
        }

        snapshot
    }
}

/// An overlay whose snapshot can be swapped while entries hold on to it.
#[derive(Debug, Default)]
pub struct SharedOverlay {
    current: RwLock<OverlaySnapshot>,
}

impl SharedOverlay {
    pub fn new(snapshot: OverlaySnapshot) -> Self {
        Self {
            current: RwLock::new(snapshot),
        }
    }

    pub fn replace(&self, snapshot: OverlaySnapshot) {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        *current = snapshot;
    }
}

impl OverlayView for SharedOverlay {
    fn origin_exists(&self, name: &str) -> bool {
        let current = self.current.read().unwrap_or_else(PoisonError::into_inner);
        current.origin_exists(name)
    }

    fn origin_by_name(&self, name: &str) -> Option<Origin> {
        let current = self.current.read().unwrap_or_else(PoisonError::into_inner);
        current.origin_by_name(name)
    }

    fn origin_by_id(&self, id: OriginId) -> Option<Origin> {
        let current = self.current.read().unwrap_or_else(PoisonError::into_inner);
        current.origin_by_id(id)
    }

    fn files(&self, origin: OriginId) -> Vec<OverlayFile> {
        let current = self.current.read().unwrap_or_else(PoisonError::into_inner);
        current.files(origin)
    }
}

fn scan_files(dir: &Path) -> Vec<String> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(_) => continue,
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(dir) else {
            continue;
        };
        if entry.depth() == 1 && entry.file_name() == META_FILE_NAME {
            continue;
        }
        files.push(relative_to_string(relative));
    }
    files
}

fn relative_to_string(path: &Path) -> String {
    let parts: Vec<String> = path
        .components()
        .map(|part| part.as_os_str().to_string_lossy().to_string())
        .collect();
    parts.join("/")
}

fn normalize_path(path: &str) -> String {
    path.replace('\\', "/")
        .trim_start_matches('/')
        .to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn highest_priority_provides_and_others_are_alternatives() {
        let overlay = OverlaySnapshot::builder()
            .origin(BASE_ORIGIN, 0, ["textures/sky.dds"])
            .origin("A", 10, ["textures/sky.dds", "a.esp"])
            .origin("B", 5, ["Textures\\Sky.dds"])
            .build();

        let a = overlay.origin_by_name("A").unwrap();
        let b = overlay.origin_by_name("B").unwrap();
        let data = overlay.origin_by_name(BASE_ORIGIN).unwrap();

        let sky = overlay
            .files(b.id)
            .into_iter()
            .find(|file| file.path == "textures/sky.dds")
            .unwrap();
        assert_eq!(sky.origin, a.id);
        assert_eq!(sky.alternatives, vec![data.id, b.id]);

        let plugin = overlay
            .files(a.id)
            .into_iter()
            .find(|file| file.path == "a.esp")
            .unwrap();
        assert!(plugin.alternatives.is_empty());
    }

    #[test]
    fn origin_dir_skips_metadata_file() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("meshes")).unwrap();
        fs::write(dir.path().join("meshes/rock.nif"), b"x").unwrap();
        fs::write(dir.path().join(META_FILE_NAME), b"{}").unwrap();

        let overlay = OverlaySnapshot::builder()
            .origin_dir("Rocks", 1, dir.path())
            .build();
        let origin = overlay.origin_by_name("Rocks").unwrap();
        let files: Vec<String> = overlay.files(origin.id).into_iter().map(|f| f.path).collect();
        assert_eq!(files, vec!["meshes/rock.nif".to_string()]);
    }

    #[test]
    fn shared_overlay_swaps_snapshots() {
        let shared = SharedOverlay::default();
        assert!(!shared.origin_exists("A"));
        shared.replace(OverlaySnapshot::builder().origin("A", 1, ["x"]).build());
        assert!(shared.origin_exists("A"));
    }
}
