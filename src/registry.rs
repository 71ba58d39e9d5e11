//! The ordered collection of managed mods.
//!
//! All structural changes (create, remove, rename, refresh) run under one
//! registry lock. Entry locks are only ever taken while the registry lock is
//! held or on their own, never the other way round. Helpers that need the
//! lock take the already locked state instead of locking again.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::{
        mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError},
        Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
    },
    time::Duration,
};
use tracing::{debug, info, warn};

use crate::{
    capability::{
        Categorized, Checkable, Conflicting, Endorsable, ForeignInstalled, Installed, ModFlag,
        NexusLink, Note, OverwriteLocation, Position, Positioning, RepositoryLink,
        SteamInstalled, SteamLink, Versioned,
    },
    categories::CategoryCatalog,
    clock::{Clock, SystemClock},
    entry::{is_acceptable_name, ModEntry},
    error::RegistryError,
    manifest::KeyValueTree,
    overlay::OverlayView,
    remote::{
        NexusBridge, OfflineNexusBridge, OfflineWorkshopClient, RemoteOutcome, RemoteReply,
        ReplyTarget, WorkshopClient,
    },
    version::VersionInfo,
};

pub const OVERWRITE_NAME: &str = "Overwrite";
const UPDATE_CHUNK: usize = 255;
const PLUGIN_EXTENSIONS: &[&str] = &["esp", "esm"];

/// Paths and switches the registry reads during a refresh.
#[derive(Debug, Clone, Default)]
pub struct RegistrySettings {
    pub mods_dir: PathBuf,
    /// The game's data directory; foreign plugins live here.
    pub data_dir: PathBuf,
    pub overwrite_dir: PathBuf,
    pub game_name: String,
    pub display_foreign: bool,
    pub dlc_plugins: Vec<String>,
    pub workshop_manifest: Option<PathBuf>,
    pub workshop_content_dir: Option<PathBuf>,
}

/// Collaborators shared by every entry.
#[derive(Clone)]
pub struct RegistryServices {
    pub overlay: Arc<dyn OverlayView>,
    pub nexus: Arc<dyn NexusBridge>,
    pub workshop: Arc<dyn WorkshopClient>,
    pub catalog: Arc<CategoryCatalog>,
    pub clock: Arc<dyn Clock>,
}

impl RegistryServices {
    /// Services that never touch the network.
    pub fn offline(overlay: Arc<dyn OverlayView>) -> Self {
        Self {
            overlay,
            nexus: Arc::new(OfflineNexusBridge),
            workshop: Arc::new(OfflineWorkshopClient),
            catalog: Arc::new(CategoryCatalog::default()),
            clock: Arc::new(SystemClock),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    ModDetailsUpdated {
        name: String,
        success: bool,
        message: Option<String>,
    },
    Refreshed {
        count: usize,
    },
    Removed {
        name: String,
    },
    Renamed {
        from: String,
        to: String,
    },
}

/// Shared handle to one entry. Handles do not survive a refresh: look the
/// entry up again by name or position afterwards.
#[derive(Clone)]
pub struct EntryRef(Arc<RwLock<ModEntry>>);

impl EntryRef {
    fn new(entry: ModEntry) -> Self {
        Self(Arc::new(RwLock::new(entry)))
    }

    pub fn read(&self) -> RwLockReadGuard<'_, ModEntry> {
        self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, ModEntry> {
        self.0.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn ptr_eq(&self, other: &EntryRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Name to position lookup, shared with the conflict classifier.
#[derive(Debug, Default)]
pub struct NameIndex {
    positions: RwLock<HashMap<String, usize>>,
}

impl NameIndex {
    pub fn position(&self, name: &str) -> Option<usize> {
        self.positions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .copied()
    }

    pub(crate) fn rebuild(&self, names: impl IntoIterator<Item = String>) {
        let positions = names
            .into_iter()
            .enumerate()
            .map(|(position, name)| (name, position))
            .collect();
        *self.positions.write().unwrap_or_else(PoisonError::into_inner) = positions;
    }

    fn remove(&self, name: &str) {
        self.positions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.positions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[derive(Default)]
struct RegistryState {
    entries: Vec<EntryRef>,
    by_repository_id: HashMap<String, Vec<usize>>,
}

pub struct ModRegistry {
    settings: RegistrySettings,
    services: RegistryServices,
    state: Mutex<RegistryState>,
    names: Arc<NameIndex>,
    reply_tx: Sender<RemoteReply>,
    reply_rx: Mutex<Receiver<RemoteReply>>,
    subscribers: Mutex<Vec<Sender<RegistryEvent>>>,
}

impl ModRegistry {
    pub fn new(settings: RegistrySettings, services: RegistryServices) -> Self {
        let (reply_tx, reply_rx) = mpsc::channel();
        Self {
            settings,
            services,
            state: Mutex::new(RegistryState::default()),
            names: Arc::new(NameIndex::default()),
            reply_tx,
            reply_rx: Mutex::new(reply_rx),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn settings(&self) -> &RegistrySettings {
        &self.settings
    }

    pub fn services(&self) -> &RegistryServices {
        &self.services
    }

    pub fn subscribe(&self) -> Receiver<RegistryEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    fn publish(&self, event: RegistryEvent) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    fn push(&self, state: &mut RegistryState, entry: ModEntry) -> EntryRef {
        let entry = EntryRef::new(entry);
        state.entries.push(entry.clone());
        entry
    }

    fn build_from_directory(&self, dir: &Path) -> ModEntry {
        let name = dir
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        let builder = ModEntry::builder(&name, self.services.clock.clone());
        if is_backup_name(&name) {
            return builder.flag(ModFlag::Backup).backing_path(dir).build();
        }
        builder
            .with(Categorized::new(self.services.catalog.clone()))
            .with(Conflicting::new(
                self.services.overlay.clone(),
                self.names.clone(),
                self.services.clock.clone(),
            ))
            .with(Endorsable::new())
            .with(Installed::new(dir))
            .with(Note::new())
            .with(Positioning::default())
            .with(Versioned::new())
            .with(NexusLink::new(
                self.services.nexus.clone(),
                self.services.catalog.clone(),
                self.reply_tx.clone(),
            ))
            .build()
    }

    fn build_foreign(&self, plugin_name: &str) -> ModEntry {
        let base_name = Path::new(plugin_name)
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .unwrap_or_else(|| plugin_name.to_string());
        ModEntry::builder(
            &format!("Unmanaged: {base_name}"),
            self.services.clock.clone(),
        )
        .flag(ModFlag::Foreign)
        .with(Positioning::new(
            Checkable::FixedActive,
            Position::UserPositionable,
        ))
        .with(ForeignInstalled::new(&self.settings.data_dir, plugin_name))
        .build()
    }

    fn build_from_remote_item(&self, path: &Path, key: &str) -> ModEntry {
        ModEntry::builder(&format!("Steam: {key}"), self.services.clock.clone())
            .flag(ModFlag::Foreign)
            .with(Positioning::default())
            .with(SteamLink::new(
                key,
                self.services.workshop.clone(),
                self.reply_tx.clone(),
            ))
            .with(Versioned::new())
            .with(SteamInstalled::new(path))
            .build()
    }

    fn build_overwrite(&self) -> ModEntry {
        ModEntry::builder(OVERWRITE_NAME, self.services.clock.clone())
            .with(OverwriteLocation::new(&self.settings.overwrite_dir))
            .with(Positioning::new(
                Checkable::FixedActive,
                Position::FixedHighest,
            ))
            .build()
    }

    /// Adds a mod directory with the standard capabilities, or a bare
    /// backup entry when the name looks like a backup.
    pub fn create_from_directory(&self, dir: &Path) -> EntryRef {
        let entry = self.build_from_directory(dir);
        let mut state = self.lock();
        let entry = self.push(&mut state, entry);
        self.update_indices(&mut state);
        entry
    }

    pub fn create_foreign(&self, plugin_name: &str) -> EntryRef {
        let entry = self.build_foreign(plugin_name);
        let mut state = self.lock();
        let entry = self.push(&mut state, entry);
        self.update_indices(&mut state);
        entry
    }

    /// Adds a workshop item and asks the workshop for its details.
    pub fn create_from_remote_item(&self, path: &Path, key: &str) -> EntryRef {
        let entry = self.build_from_remote_item(path, key);
        let mut state = self.lock();
        let entry = self.push(&mut state, entry);
        self.update_indices(&mut state);
        entry.write().update_info();
        entry
    }

    pub fn create_overwrite_sentinel(&self) -> EntryRef {
        let entry = self.build_overwrite();
        let mut state = self.lock();
        let entry = self.push(&mut state, entry);
        self.update_indices(&mut state);
        entry
    }

    /// Throws away every entry and rebuilds the list from disk.
    ///
    /// Pending metadata is written first. Handles obtained before the
    /// refresh keep pointing at the discarded entries.
    pub fn refresh_from_disk(&self) {
        let mut state = self.lock();
        persist_all(&state.entries);
        state.entries.clear();
        state.by_repository_id.clear();

        for dir in list_dirs(&self.settings.mods_dir) {
            let entry = self.build_from_directory(&dir);
            self.push(&mut state, entry);
        }

        let mut remote_items = Vec::new();
        for (path, key) in self.workshop_items() {
            let entry = self.build_from_remote_item(&path, &key);
            remote_items.push(self.push(&mut state, entry));
        }

        for plugin in self.foreign_plugins() {
            let entry = self.build_foreign(&plugin);
            self.push(&mut state, entry);
        }

        let overwrite = self.build_overwrite();
        self.push(&mut state, overwrite);

        self.sort_entries(&mut state);
        let count = state.entries.len();
        drop(state);

        for entry in remote_items {
            entry.write().update_info();
        }
        info!(count, "mod list refreshed");
        self.publish(RegistryEvent::Refreshed { count });
    }

    /// Workshop items listed in the manifest that have content on disk. An
    /// unreadable manifest means no workshop items.
    fn workshop_items(&self) -> Vec<(PathBuf, String)> {
        let (Some(manifest), Some(content_dir)) = (
            &self.settings.workshop_manifest,
            &self.settings.workshop_content_dir,
        ) else {
            return Vec::new();
        };
        if !manifest.exists() {
            debug!(path = %manifest.display(), "no workshop file");
            return Vec::new();
        }
        let tree = match KeyValueTree::read(manifest) {
            Ok(tree) => tree,
            Err(err) => {
                warn!(path = %manifest.display(), error = %err, "ignoring unreadable workshop file");
                return Vec::new();
            }
        };
        let items = tree.get_map("AppWorkshop").get_map("WorkshopItemDetails");
        let mut found = Vec::new();
        for key in items.keys() {
            if items.get_map(key).get_string("manifest") == "-1" {
                debug!(key, "skipping legacy workshop item");
                continue;
            }
            let path = content_dir.join(key);
            if !path.exists() {
                warn!(key, "no content directory for workshop item");
                continue;
            }
            found.push((path, key.to_string()));
        }
        found
    }

    /// Plugin files in the game's data directory worth listing on their own.
    fn foreign_plugins(&self) -> Vec<String> {
        let Ok(entries) = fs::read_dir(&self.settings.data_dir) else {
            return Vec::new();
        };
        let mut plugins: Vec<String> = entries
            .flatten()
            .filter(|entry| entry.path().is_file())
            .filter_map(|entry| {
                let path = entry.path();
                let extension = path.extension()?.to_string_lossy().to_lowercase();
                if !PLUGIN_EXTENSIONS.contains(&extension.as_str()) {
                    return None;
                }
                let file_name = entry.file_name().to_string_lossy().to_string();
                let base_name = path.file_stem()?.to_string_lossy().to_string();
                let is_dlc = self
                    .settings
                    .dlc_plugins
                    .iter()
                    .any(|dlc| dlc.eq_ignore_ascii_case(&file_name));
                let hidden = base_name.eq_ignore_ascii_case("Update")
                    || base_name.eq_ignore_ascii_case(&self.settings.game_name);
                (!hidden && (self.settings.display_foreign || is_dlc)).then_some(file_name)
            })
            .collect();
        plugins.sort();
        plugins
    }

    /// Orders entries case-insensitively by display name and reindexes.
    fn sort_entries(&self, state: &mut RegistryState) {
        state
            .entries
            .sort_by_cached_key(|entry| entry.read().name().to_lowercase());
        self.update_indices(state);
    }

    fn update_indices(&self, state: &mut RegistryState) {
        self.names
            .rebuild(state.entries.iter().map(|entry| entry.read().internal_name()));
        state.by_repository_id.clear();
        for (position, entry) in state.entries.iter().enumerate() {
            if let Some(id) = entry.read().repository_id() {
                state.by_repository_id.entry(id).or_default().push(position);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the current entry handles in order.
    pub fn entries(&self) -> Vec<EntryRef> {
        self.lock().entries.clone()
    }

    pub fn get_by_position(&self, position: usize) -> Result<EntryRef, RegistryError> {
        let state = self.lock();
        state
            .entries
            .get(position)
            .cloned()
            .ok_or(RegistryError::InvalidIndex {
                index: position,
                len: state.entries.len(),
            })
    }

    pub fn get_by_name(&self, name: &str) -> Result<EntryRef, RegistryError> {
        self.find_by_name(name)
            .ok_or_else(|| RegistryError::UnknownName(name.to_string()))
    }

    pub fn find_by_name(&self, name: &str) -> Option<EntryRef> {
        let state = self.lock();
        let position = self.names.position(name)?;
        state.entries.get(position).cloned()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        let _state = self.lock();
        self.names.position(name)
    }

    pub fn get_by_repository_id(&self, id: &str) -> Vec<EntryRef> {
        let state = self.lock();
        state
            .by_repository_id
            .get(id)
            .map(|positions| {
                positions
                    .iter()
                    .filter_map(|position| state.entries.get(*position).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn find(&self, predicate: impl Fn(&ModEntry) -> bool) -> Option<usize> {
        let state = self.lock();
        state
            .entries
            .iter()
            .position(|entry| predicate(&entry.read()))
    }

    /// Drops the entry at `position` and deletes its directory. A failed
    /// delete is logged; the entry is gone either way.
    pub fn remove(&self, position: usize) -> Result<(), RegistryError> {
        let mut state = self.lock();
        let len = state.entries.len();
        let Some(entry) = state.entries.get(position).cloned() else {
            return Err(RegistryError::InvalidIndex {
                index: position,
                len,
            });
        };

        let name = entry.read().internal_name();
        self.names.remove(&name);

        if let Err(err) = entry.write().remove_from_disk() {
            warn!(mod_name = %name, error = %format!("{err:#}"), "failed to delete mod directory");
        }
        state.entries.remove(position);
        self.update_indices(&mut state);
        clear_conflict_caches(&state.entries);
        drop(state);

        info!(mod_name = %name, "mod removed");
        self.publish(RegistryEvent::Removed { name });
        Ok(())
    }

    /// Renames the entry at `position`; installed mods are renamed on disk
    /// first and keep their old name when that fails.
    pub fn rename(&self, position: usize, new_name: &str) -> Result<(), RegistryError> {
        let mut state = self.lock();
        let len = state.entries.len();
        let entry = state
            .entries
            .get(position)
            .cloned()
            .ok_or(RegistryError::InvalidIndex {
                index: position,
                len,
            })?;
        if !is_acceptable_name(new_name) {
            return Err(RegistryError::InvalidName(new_name.to_string()));
        }
        if matches!(self.names.position(new_name), Some(other) if other != position) {
            return Err(RegistryError::NameTaken(new_name.to_string()));
        }

        let old_name = entry.read().internal_name();
        entry.write().rename(new_name)?;

        self.sort_entries(&mut state);
        clear_conflict_caches(&state.entries);
        drop(state);

        self.publish(RegistryEvent::Renamed {
            from: old_name,
            to: new_name.to_string(),
        });
        Ok(())
    }

    /// Asks the entry's repository for fresh details.
    pub fn request_update(&self, name: &str) -> Result<bool, RegistryError> {
        let state = self.lock();
        let position = self
            .names
            .position(name)
            .ok_or_else(|| RegistryError::UnknownName(name.to_string()))?;
        let entry = state
            .entries
            .get(position)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownName(name.to_string()))?;
        let issued = entry.write().update_info();
        Ok(issued)
    }

    pub fn endorse(&self, name: &str, endorse: bool) -> Result<bool, RegistryError> {
        let entry = self.get_by_name(name)?;
        let issued = entry.read().endorse(endorse);
        Ok(issued)
    }

    /// Requests the newest version of every mod linked to the hosting
    /// site, in batches. Returns the number of requests sent.
    pub fn check_all_for_update(&self) -> usize {
        let state = self.lock();
        let mut ids: Vec<i64> = state
            .entries
            .iter()
            .filter_map(|entry| {
                let entry = entry.read();
                let info = entry.get::<NexusLink>()?.info();
                let id = info.numeric_id();
                (info.can_be_updated() && id > 0).then_some(id)
            })
            .collect();
        drop(state);
        ids.sort_unstable();
        ids.dedup();

        let mut requests = 0;
        for chunk in ids.chunks(UPDATE_CHUNK) {
            let target = ReplyTarget::new("", self.reply_tx.clone());
            self.services.nexus.request_updates(target, chunk.to_vec());
            requests += 1;
        }
        debug!(mods = ids.len(), requests, "update check requested");
        requests
    }

    /// Applies every reply that already arrived. Never blocks.
    pub fn process_replies(&self) -> usize {
        let mut applied = 0;
        loop {
            let reply = {
                let rx = self.reply_rx.lock().unwrap_or_else(PoisonError::into_inner);
                match rx.try_recv() {
                    Ok(reply) => reply,
                    Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
                }
            };
            self.apply_reply(reply);
            applied += 1;
        }
        applied
    }

    /// Waits up to `timeout` for one reply and applies it.
    pub fn wait_for_reply(&self, timeout: Duration) -> bool {
        let reply = {
            let rx = self.reply_rx.lock().unwrap_or_else(PoisonError::into_inner);
            match rx.recv_timeout(timeout) {
                Ok(reply) => reply,
                Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => return false,
            }
        };
        self.apply_reply(reply);
        true
    }

    fn apply_reply(&self, reply: RemoteReply) {
        let mut state = self.lock();
        if let RemoteOutcome::Updates(versions) = &reply.outcome {
            let mut updated = Vec::new();
            for version in versions {
                let Some(positions) = state.by_repository_id.get(&version.mod_id.to_string())
                else {
                    continue;
                };
                for position in positions {
                    if let Some(entry) = state.entries.get(*position) {
                        let mut entry = entry.write();
                        entry.set_newest_version(VersionInfo::parse(&version.version));
                        updated.push(entry.internal_name());
                    }
                }
            }
            drop(state);
            for name in updated {
                self.publish(RegistryEvent::ModDetailsUpdated {
                    name,
                    success: true,
                    message: None,
                });
            }
            return;
        }

        if reply.entry.is_empty() {
            drop(state);
            if let RemoteOutcome::Failed { message, .. } = reply.outcome {
                warn!(request = reply.request_id, error = %message, "batch request failed");
                self.publish(RegistryEvent::ModDetailsUpdated {
                    name: String::new(),
                    success: false,
                    message: Some(message),
                });
            }
            return;
        }

        let Some(entry) = self
            .names
            .position(&reply.entry)
            .and_then(|position| state.entries.get(position).cloned())
        else {
            debug!(mod_name = %reply.entry, "dropping reply for a mod that is gone");
            return;
        };
        let result = entry.write().apply_remote(&reply.outcome);
        if result.is_ok() && matches!(reply.outcome, RemoteOutcome::WorkshopDetails(_)) {
            // the display name may have changed
            self.sort_entries(&mut state);
            clear_conflict_caches(&state.entries);
        }
        drop(state);

        let event = match result {
            Ok(()) => RegistryEvent::ModDetailsUpdated {
                name: reply.entry,
                success: true,
                message: None,
            },
            Err(message) => {
                warn!(mod_name = %reply.entry, error = %message, "remote request failed");
                RegistryEvent::ModDetailsUpdated {
                    name: reply.entry,
                    success: false,
                    message: Some(message),
                }
            }
        };
        self.publish(event);
    }

    /// Forces every conflict classification to be recomputed on next read.
    pub fn clear_caches(&self) {
        let state = self.lock();
        clear_conflict_caches(&state.entries);
    }

    /// Writes all pending metadata and empties the registry.
    pub fn teardown(&self) {
        let mut state = self.lock();
        persist_all(&state.entries);
        state.entries.clear();
        self.update_indices(&mut state);
    }

    #[cfg(test)]
    fn indexed_names(&self) -> usize {
        self.names.len()
    }
}

fn persist_all(entries: &[EntryRef]) {
    for entry in entries {
        let entry = entry.read();
        if let Err(err) = entry.save_meta() {
            warn!(mod_name = %entry.internal_name(), error = %format!("{err:#}"), "failed to save meta information");
        }
    }
}

fn clear_conflict_caches(entries: &[EntryRef]) {
    for entry in entries {
        if let Some(conflicts) = entry.read().conflicts() {
            conflicts.clear_caches();
        }
    }
}

/// Backups are directories named like `<anything>backup<digits>`.
fn is_backup_name(name: &str) -> bool {
    name.trim_end_matches(|ch: char| ch.is_ascii_digit())
        .ends_with("backup")
}

fn list_dirs(root: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(root) else {
        warn!(path = %root.display(), "mods directory is not readable");
        return Vec::new();
    };
    entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{ConflictState, EndorsedState};
    use crate::meta_store::MetaStore;
    use crate::overlay::{OverlaySnapshot, SharedOverlay, BASE_ORIGIN};
    use crate::remote::testing::{FakeNexus, FakeWorkshop};
    use crate::remote::{ModDescription, RemoteVersion, WorkshopDetails};
    use std::thread;
    use tempfile::TempDir;

    struct Fixture {
        _root: TempDir,
        mods: PathBuf,
        data: PathBuf,
        settings: RegistrySettings,
    }

    impl Fixture {
        fn new() -> Self {
            let root = TempDir::new().unwrap();
            let mods = root.path().join("mods");
            let data = root.path().join("game/data");
            let overwrite = root.path().join("overwrite");
            for dir in [&mods, &data, &overwrite] {
                fs::create_dir_all(dir).unwrap();
            }
            let settings = RegistrySettings {
                mods_dir: mods.clone(),
                data_dir: data.clone(),
                overwrite_dir: overwrite,
                game_name: "Skyrim".into(),
                display_foreign: true,
                dlc_plugins: vec!["Dawnguard.esm".into()],
                workshop_manifest: Some(root.path().join("workshop/appworkshop_72850.acf")),
                workshop_content_dir: Some(root.path().join("workshop/content/72850")),
            };
            Self {
                _root: root,
                mods,
                data,
                settings,
            }
        }

        fn add_mod(&self, name: &str, files: &[&str]) -> PathBuf {
            let dir = self.mods.join(name);
            fs::create_dir_all(&dir).unwrap();
            for file in files {
                let path = dir.join(file);
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).unwrap();
                }
                fs::write(path, b"x").unwrap();
            }
            dir
        }

        fn registry(&self) -> ModRegistry {
            self.registry_with(RegistryServices::offline(Arc::new(SharedOverlay::default())))
        }

        fn registry_with(&self, services: RegistryServices) -> ModRegistry {
            ModRegistry::new(self.settings.clone(), services)
        }
    }

    fn names(registry: &ModRegistry) -> Vec<String> {
        registry
            .entries()
            .iter()
            .map(|entry| entry.read().internal_name())
            .collect()
    }

    #[test]
    fn refresh_sorts_entries_case_insensitively() {
        let fixture = Fixture::new();
        fixture.add_mod("beta", &["beta.esp"]);
        fixture.add_mod("Alpha", &["textures/a.dds"]);
        fixture.add_mod("Alpha_backup2", &["textures/a.dds"]);
        let registry = fixture.registry();
        registry.refresh_from_disk();

        assert_eq!(
            names(&registry),
            vec!["Alpha", "Alpha_backup2", "beta", OVERWRITE_NAME]
        );
        let backup = registry.get_by_name("Alpha_backup2").unwrap();
        assert!(backup.read().has_flag(ModFlag::Backup));
        assert!(!backup.read().has::<Installed>());
        let overwrite = registry.get_by_name(OVERWRITE_NAME).unwrap();
        assert!(overwrite.read().has_flag(ModFlag::Overwrite));
    }

    #[test]
    fn positions_and_names_resolve_to_the_same_entry() {
        let fixture = Fixture::new();
        for name in ["One", "two", "Three", "four"] {
            fixture.add_mod(name, &["plugin.esp"]);
        }
        let registry = fixture.registry();
        registry.refresh_from_disk();

        for position in 0..registry.len() {
            let by_position = registry.get_by_position(position).unwrap();
            let name = by_position.read().internal_name();
            let by_name = registry.get_by_name(&name).unwrap();
            assert!(by_position.ptr_eq(&by_name));
            assert_eq!(registry.index_of(&name), Some(position));
        }
    }

    #[test]
    fn lookups_of_unknown_entries_fail_cleanly() {
        let fixture = Fixture::new();
        let registry = fixture.registry();
        registry.refresh_from_disk();

        assert!(matches!(
            registry.get_by_position(7),
            Err(RegistryError::InvalidIndex { index: 7, len: 1 })
        ));
        assert!(matches!(
            registry.get_by_name("nope"),
            Err(RegistryError::UnknownName(_))
        ));
        assert!(registry.find_by_name("nope").is_none());
        assert!(registry.get_by_repository_id("42").is_empty());
    }

    #[test]
    fn foreign_plugins_respect_display_setting() {
        let mut fixture = Fixture::new();
        for plugin in ["Skyrim.esm", "Update.esm", "Dawnguard.esm", "Lanterns.esp", "notes.txt"] {
            fs::write(fixture.data.join(plugin), b"").unwrap();
        }
        let registry = fixture.registry();
        registry.refresh_from_disk();
        assert_eq!(
            names(&registry),
            vec![OVERWRITE_NAME, "Unmanaged: Dawnguard", "Unmanaged: Lanterns"]
        );
        let dawnguard = registry.get_by_name("Unmanaged: Dawnguard").unwrap();
        assert!(dawnguard.read().has_flag(ModFlag::Foreign));
        assert!(dawnguard.read().has::<ForeignInstalled>());

        fixture.settings.display_foreign = false;
        let registry = fixture.registry();
        registry.refresh_from_disk();
        assert_eq!(names(&registry), vec![OVERWRITE_NAME, "Unmanaged: Dawnguard"]);
    }

    #[test]
    fn workshop_items_come_from_manifest() {
        let fixture = Fixture::new();
        let manifest = fixture.settings.workshop_manifest.clone().unwrap();
        let content = fixture.settings.workshop_content_dir.clone().unwrap();
        fs::create_dir_all(content.join("111")).unwrap();
        fs::create_dir_all(content.join("222")).unwrap();
        fs::create_dir_all(manifest.parent().unwrap()).unwrap();
        fs::write(
            &manifest,
            r#""AppWorkshop"
            {
                "WorkshopItemDetails"
                {
                    "111" { "manifest" "5" }
                    "222" { "manifest" "-1" }
                    "333" { "manifest" "7" }
                }
            }"#,
        )
        .unwrap();

        let mut services = RegistryServices::offline(Arc::new(SharedOverlay::default()));
        services.workshop = Arc::new(FakeWorkshop {
            details: Some(WorkshopDetails {
                title: "Lanterns".into(),
                description: "Lights".into(),
                time_updated: 99,
            }),
        });
        let registry = fixture.registry_with(services);
        let events = registry.subscribe();
        registry.refresh_from_disk();
        assert_eq!(names(&registry), vec![OVERWRITE_NAME, "Steam: 111"]);

        assert!(registry.wait_for_reply(Duration::from_secs(5)));
        let entry = registry.get_by_name("Steam: 111").unwrap();
        assert_eq!(entry.read().name(), "Steam: Lanterns");
        assert_eq!(registry.get_by_repository_id("111").len(), 1);

        let received: Vec<RegistryEvent> = events.try_iter().collect();
        assert!(received.contains(&RegistryEvent::ModDetailsUpdated {
            name: "Steam: 111".into(),
            success: true,
            message: None,
        }));
    }

    #[test]
    fn malformed_manifest_does_not_abort_refresh() {
        let fixture = Fixture::new();
        fixture.add_mod("Sky", &["sky.esp"]);
        let manifest = fixture.settings.workshop_manifest.clone().unwrap();
        fs::create_dir_all(manifest.parent().unwrap()).unwrap();
        fs::write(&manifest, "\"AppWorkshop\" { \"unterminated").unwrap();

        let registry = fixture.registry();
        registry.refresh_from_disk();
        assert_eq!(names(&registry), vec![OVERWRITE_NAME, "Sky"]);
    }

    #[test]
    fn remove_shrinks_registry_and_reindexes() {
        let fixture = Fixture::new();
        let doomed = fixture.add_mod("B", &["b.esp"]);
        for name in ["A", "C", "D"] {
            fixture.add_mod(name, &["p.esp"]);
        }
        let registry = fixture.registry();
        registry.refresh_from_disk();
        let events = registry.subscribe();
        let before = registry.len();

        registry.remove(1).unwrap();
        assert_eq!(registry.len(), before - 1);
        assert!(!doomed.exists());
        assert!(registry.find_by_name("B").is_none());
        assert_eq!(registry.indexed_names(), registry.len());
        for (position, name) in names(&registry).iter().enumerate() {
            assert_eq!(registry.index_of(name), Some(position));
        }
        assert_eq!(
            events.try_recv().unwrap(),
            RegistryEvent::Removed { name: "B".into() }
        );
        assert!(matches!(
            registry.remove(99),
            Err(RegistryError::InvalidIndex { .. })
        ));
    }

    #[test]
    fn rename_rejects_separators_and_keeps_index() {
        let fixture = Fixture::new();
        fixture.add_mod("Sky", &["sky.esp"]);
        fixture.add_mod("Rocks", &["rocks.esp"]);
        let registry = fixture.registry();
        registry.refresh_from_disk();
        let position = registry.index_of("Sky").unwrap();

        for bad in ["a/b", "a\\b", ""] {
            assert!(matches!(
                registry.rename(position, bad),
                Err(RegistryError::InvalidName(_))
            ));
        }
        assert!(matches!(
            registry.rename(position, "Rocks"),
            Err(RegistryError::NameTaken(_))
        ));
        assert_eq!(registry.index_of("Sky"), Some(position));
        assert_eq!(registry.indexed_names(), registry.len());
    }

    #[test]
    fn rename_moves_directory_and_resorts() {
        let fixture = Fixture::new();
        fixture.add_mod("Sky", &["sky.esp"]);
        fixture.add_mod("Rocks", &["rocks.esp"]);
        let registry = fixture.registry();
        registry.refresh_from_disk();

        let position = registry.index_of("Sky").unwrap();
        registry.rename(position, "Aurora").unwrap();
        assert!(fixture.mods.join("Aurora").exists());
        assert!(!fixture.mods.join("Sky").exists());
        assert_eq!(names(&registry), vec!["Aurora", OVERWRITE_NAME, "Rocks"]);
        assert_eq!(registry.index_of("Aurora"), Some(0));
        assert_eq!(registry.index_of("Sky"), None);
    }

    #[test]
    fn repository_index_groups_shared_ids() {
        let fixture = Fixture::new();
        for name in ["Sky", "Sky Patch", "Rocks"] {
            let dir = fixture.add_mod(name, &["p.esp"]);
            let mut store = MetaStore::empty(&dir);
            let id = if name == "Rocks" { "9" } else { "42" };
            store.set("modid", id);
            store.sync().unwrap();
        }
        let registry = fixture.registry();
        registry.refresh_from_disk();

        let shared = registry.get_by_repository_id("42");
        assert_eq!(shared.len(), 2);
        assert_eq!(registry.get_by_repository_id("9").len(), 1);
        assert!(registry.get_by_repository_id("-1").is_empty());
    }

    #[test]
    fn update_check_sets_newest_versions_by_id() {
        let fixture = Fixture::new();
        for (name, id) in [("Sky", "42"), ("Sky Patch", "42"), ("Rocks", "9"), ("Local", "-1")] {
            let dir = fixture.add_mod(name, &["p.esp"]);
            let mut store = MetaStore::empty(&dir);
            store.set("modid", id);
            store.sync().unwrap();
        }
        let nexus = Arc::new(FakeNexus {
            versions: vec![RemoteVersion {
                mod_id: 42,
                version: "3.0".into(),
            }],
            ..FakeNexus::default()
        });
        let mut services = RegistryServices::offline(Arc::new(SharedOverlay::default()));
        services.nexus = nexus.clone();
        let registry = fixture.registry_with(services);
        registry.refresh_from_disk();

        assert_eq!(registry.check_all_for_update(), 1);
        assert_eq!(
            nexus.calls(),
            vec![crate::remote::testing::Call::Updates(vec![9, 42])]
        );
        assert_eq!(registry.process_replies(), 1);
        for entry in registry.get_by_repository_id("42") {
            assert_eq!(
                entry.read().repository().unwrap().info().newest_version(),
                &VersionInfo::parse("3.0")
            );
        }
    }

    #[test]
    fn description_reply_reaches_entry_and_subscribers() {
        let fixture = Fixture::new();
        let dir = fixture.add_mod("Sky", &["p.esp"]);
        let mut store = MetaStore::empty(&dir);
        store.set("modid", "42");
        store.set("version", "1.0");
        store.sync().unwrap();

        let mut services = RegistryServices::offline(Arc::new(SharedOverlay::default()));
        services.nexus = Arc::new(FakeNexus {
            description: Some(ModDescription {
                version: "1.1".into(),
                description: "Better sky".into(),
                endorsed: Some(true),
                category_id: None,
            }),
            ..FakeNexus::default()
        });
        let registry = fixture.registry_with(services);
        registry.refresh_from_disk();
        let events = registry.subscribe();

        assert!(registry.request_update("Sky").unwrap());
        assert!(registry.wait_for_reply(Duration::from_secs(1)));
        let entry = registry.get_by_name("Sky").unwrap();
        assert!(entry.read().update_available());
        assert_eq!(
            entry.read().get::<Endorsable>().unwrap().endorsed_state(),
            EndorsedState::True
        );
        assert_eq!(
            events.try_recv().unwrap(),
            RegistryEvent::ModDetailsUpdated {
                name: "Sky".into(),
                success: true,
                message: None,
            }
        );
    }

    #[test]
    fn offline_failures_are_reported_not_thrown() {
        let fixture = Fixture::new();
        let dir = fixture.add_mod("Sky", &["p.esp"]);
        let mut store = MetaStore::empty(&dir);
        store.set("modid", "42");
        store.sync().unwrap();
        let registry = fixture.registry();
        registry.refresh_from_disk();
        let events = registry.subscribe();

        assert!(registry.request_update("Sky").unwrap());
        assert_eq!(registry.process_replies(), 1);
        match events.try_recv().unwrap() {
            RegistryEvent::ModDetailsUpdated {
                success, message, ..
            } => {
                assert!(!success);
                assert!(message.is_some());
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(matches!(
            registry.request_update("Nope"),
            Err(RegistryError::UnknownName(_))
        ));
    }

    #[test]
    fn replies_for_removed_entries_are_dropped() {
        let fixture = Fixture::new();
        let dir = fixture.add_mod("Sky", &["p.esp"]);
        let mut store = MetaStore::empty(&dir);
        store.set("modid", "42");
        store.sync().unwrap();
        let registry = fixture.registry();
        registry.refresh_from_disk();

        assert!(registry.request_update("Sky").unwrap());
        let position = registry.index_of("Sky").unwrap();
        registry.remove(position).unwrap();
        let events = registry.subscribe();
        assert_eq!(registry.process_replies(), 1);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn conflicts_use_registry_positions() {
        let fixture = Fixture::new();
        let high = fixture.add_mod("High", &["shared.esp", "textures/high.dds"]);
        let low = fixture.add_mod("Low", &["shared.esp", "textures/low.dds"]);
        let overlay = Arc::new(SharedOverlay::new(
            OverlaySnapshot::builder()
                .origin(BASE_ORIGIN, 0, ["skyrim.esm"])
                .origin_dir("Low", 1, &low)
                .origin_dir("High", 2, &high)
                .build(),
        ));
        let registry = fixture.registry_with(RegistryServices::offline(overlay));
        registry.refresh_from_disk();

        let high_position = registry.index_of("High").unwrap();
        let low_position = registry.index_of("Low").unwrap();
        let high = registry.get_by_position(high_position).unwrap();
        let low = registry.get_by_position(low_position).unwrap();

        let high_record = high.read().conflicts().unwrap().record();
        assert_eq!(high_record.state, ConflictState::Overwrite);
        assert!(high_record.overwriting.contains(&low_position));
        assert!(low.read().has_flag(ModFlag::ConflictOverwritten));
    }

    #[test]
    fn teardown_persists_dirty_entries() {
        let fixture = Fixture::new();
        let dir = fixture.add_mod("Sky", &["p.esp"]);
        let registry = fixture.registry();
        registry.refresh_from_disk();
        let entry = registry.get_by_name("Sky").unwrap();
        entry.write().get_mut::<Note>().unwrap().set("keep");
        drop(entry);

        registry.teardown();
        assert!(registry.is_empty());
        let store = MetaStore::open(&dir).unwrap();
        assert_eq!(store.string("notes").as_deref(), Some("keep"));
    }

    #[test]
    fn readers_survive_concurrent_refreshes() {
        let fixture = Fixture::new();
        for name in ["A", "B", "C"] {
            fixture.add_mod(name, &["p.esp"]);
        }
        let registry = Arc::new(fixture.registry());
        registry.refresh_from_disk();

        let reader = {
            let registry = registry.clone();
            thread::spawn(move || {
                for _ in 0..200 {
                    for entry in registry.entries() {
                        let entry = entry.read();
                        let _ = entry.flags();
                        let _ = entry.name();
                    }
                }
            })
        };
        for _ in 0..20 {
            registry.refresh_from_disk();
        }
        reader.join().unwrap();
        assert_eq!(registry.len(), 4);
    }

    /// Workshop client answering with a per-key title and counting calls.
    #[derive(Default)]
    struct KeyedWorkshop {
        titles: HashMap<String, String>,
        fetched: Mutex<Vec<String>>,
    }

    impl KeyedWorkshop {
        fn with_titles(titles: &[(&str, &str)]) -> Self {
            Self {
                titles: titles
                    .iter()
                    .map(|(key, title)| (key.to_string(), title.to_string()))
                    .collect(),
                fetched: Mutex::default(),
            }
        }

        fn fetched(&self) -> Vec<String> {
            self.fetched.lock().unwrap().clone()
        }
    }

    impl WorkshopClient for KeyedWorkshop {
        fn fetch_details(&self, key: &str) -> anyhow::Result<WorkshopDetails> {
            self.fetched.lock().unwrap().push(key.to_string());
            let title = self
                .titles
                .get(key)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("no workshop item {key}"))?;
            Ok(WorkshopDetails {
                title,
                description: String::new(),
                time_updated: 1,
            })
        }
    }

    #[test]
    fn directory_constructor_attaches_standard_set_and_indexes() {
        let fixture = Fixture::new();
        let sky = fixture.add_mod("Sky", &["sky.esp"]);
        let backup = fixture.add_mod("Sky_backup1", &["sky.esp"]);
        let registry = fixture.registry();

        let entry = registry.create_from_directory(&sky);
        {
            let entry = entry.read();
            assert!(entry.has::<Installed>());
            assert!(entry.has::<NexusLink>());
            assert!(entry.has::<Conflicting>());
            assert!(entry.has::<Categorized>());
            assert!(entry.has::<Endorsable>());
            assert!(entry.has::<Note>());
            assert!(entry.has::<Positioning>());
            assert!(entry.has::<Versioned>());
        }
        assert_eq!(registry.index_of("Sky"), Some(0));

        let copy = registry.create_from_directory(&backup);
        assert!(copy.read().has_flag(ModFlag::Backup));
        assert!(!copy.read().has::<Positioning>());
        assert!(!copy.read().has::<Installed>());
        assert_eq!(registry.index_of("Sky_backup1"), Some(1));
        assert!(registry.get_by_name("Sky_backup1").unwrap().ptr_eq(&copy));
    }

    #[test]
    fn foreign_constructor_gets_fixed_active_positioning_only() {
        let fixture = Fixture::new();
        fs::write(fixture.data.join("Lanterns.esp"), b"").unwrap();
        let registry = fixture.registry();

        let entry = registry.create_foreign("Lanterns.esp");
        let entry = entry.read();
        assert_eq!(entry.internal_name(), "Unmanaged: Lanterns");
        assert!(entry.has_flag(ModFlag::Foreign));
        assert!(entry.has::<ForeignInstalled>());
        let positioning = entry.get::<Positioning>().unwrap();
        assert_eq!(positioning.checkable(), Checkable::FixedActive);
        assert_eq!(positioning.position(), Position::UserPositionable);
        for missing in [
            entry.has::<Installed>(),
            entry.has::<Note>(),
            entry.has::<NexusLink>(),
            entry.has::<Conflicting>(),
            entry.has::<Versioned>(),
        ] {
            assert!(!missing);
        }
        assert_eq!(entry.absolute_path(), fixture.data);
        drop(entry);
        assert_eq!(registry.index_of("Unmanaged: Lanterns"), Some(0));
    }

    #[test]
    fn overwrite_sentinel_is_fixed_highest_and_active() {
        let fixture = Fixture::new();
        let registry = fixture.registry();

        let entry = registry.create_overwrite_sentinel();
        let entry = entry.read();
        assert_eq!(entry.internal_name(), OVERWRITE_NAME);
        assert!(entry.has::<OverwriteLocation>());
        assert!(entry.has_flag(ModFlag::Overwrite));
        assert_eq!(entry.absolute_path(), fixture.settings.overwrite_dir);
        let positioning = entry.get::<Positioning>().unwrap();
        assert_eq!(positioning.checkable(), Checkable::FixedActive);
        assert_eq!(positioning.position(), Position::FixedHighest);
        assert!(positioning.is_position_fixed());
        assert!(!entry.has::<Note>());
        drop(entry);
        assert_eq!(registry.index_of(OVERWRITE_NAME), Some(0));
    }

    #[test]
    fn remote_item_constructor_issues_one_workshop_request() {
        let fixture = Fixture::new();
        let content = fixture.settings.workshop_content_dir.clone().unwrap();
        fs::create_dir_all(content.join("111")).unwrap();
        let workshop = Arc::new(KeyedWorkshop::with_titles(&[("111", "Lanterns")]));
        let mut services = RegistryServices::offline(Arc::new(SharedOverlay::default()));
        services.workshop = workshop.clone();
        let registry = fixture.registry_with(services);

        let entry = registry.create_from_remote_item(&content.join("111"), "111");
        assert_eq!(registry.index_of("Steam: 111"), Some(0));
        assert_eq!(registry.get_by_repository_id("111").len(), 1);
        {
            let entry = entry.read();
            assert!(entry.has_flag(ModFlag::Foreign));
            assert!(entry.has::<SteamLink>());
            assert!(entry.has::<SteamInstalled>());
            assert!(entry.has::<Versioned>());
            assert!(!entry.has::<NexusLink>());
        }

        assert!(registry.wait_for_reply(Duration::from_secs(5)));
        assert_eq!(workshop.fetched(), vec!["111".to_string()]);
        assert_eq!(entry.read().name(), "Steam: Lanterns");
    }

    #[test]
    fn workshop_titles_resort_the_list() {
        let fixture = Fixture::new();
        let manifest = fixture.settings.workshop_manifest.clone().unwrap();
        let content = fixture.settings.workshop_content_dir.clone().unwrap();
        fs::create_dir_all(content.join("111")).unwrap();
        fs::create_dir_all(content.join("222")).unwrap();
        fs::create_dir_all(manifest.parent().unwrap()).unwrap();
        fs::write(
            &manifest,
            r#""AppWorkshop" { "WorkshopItemDetails" {
                "111" { "manifest" "5" }
                "222" { "manifest" "6" }
            } }"#,
        )
        .unwrap();
        let workshop = Arc::new(KeyedWorkshop::with_titles(&[
            ("111", "Zebra Stripes"),
            ("222", "Apple Trees"),
        ]));
        let mut services = RegistryServices::offline(Arc::new(SharedOverlay::default()));
        services.workshop = workshop;
        let registry = fixture.registry_with(services);
        registry.refresh_from_disk();
        assert_eq!(
            names(&registry),
            vec![OVERWRITE_NAME, "Steam: 111", "Steam: 222"]
        );

        assert!(registry.wait_for_reply(Duration::from_secs(5)));
        assert!(registry.wait_for_reply(Duration::from_secs(5)));
        assert_eq!(
            names(&registry),
            vec![OVERWRITE_NAME, "Steam: 222", "Steam: 111"]
        );
        assert_eq!(registry.index_of("Steam: 222"), Some(1));
        assert_eq!(registry.index_of("Steam: 111"), Some(2));
    }

    #[test]
    fn backup_names_need_trailing_backup_marker() {
        assert!(is_backup_name("Sky_backup"));
        assert!(is_backup_name("Skybackup12"));
        assert!(!is_backup_name("backup of Sky"));
        assert!(!is_backup_name("Sky"));
    }
}
