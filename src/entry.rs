//! One managed mod and the capabilities attached to it.

use anyhow::{Context, Result};
use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
    time::SystemTime,
};
use tracing::{debug, error, warn};

use crate::{
    capability::{
        Capability, CapabilityKind, CapabilityVariant, Categorized, Conflicting, DiskLocation,
        EndorsedState, Endorsable, EntryState, Installed, ModFlag, NexusLink, Owner,
        RepositoryLink, SteamLink, Versioned,
    },
    clock::{Clock, TimedCache, CONTENT_STALENESS},
    content::{self, ContentType},
    error::RegistryError,
    meta_store::MetaStore,
    remote::RemoteOutcome,
    version::VersionInfo,
};

const INI_TWEAKS: &str = "INI Tweaks";
const ENDORSEMENT_HINT: &str = "The site rejects endorsements for 15 minutes after a failed \
attempt, so this error message may be misleading.";

pub struct ModEntry {
    state: Arc<EntryState>,
    base_flags: BTreeSet<ModFlag>,
    slots: Vec<Capability>,
    by_kind: BTreeMap<CapabilityKind, usize>,
    backing_path: Option<PathBuf>,
    valid: bool,
    content: Mutex<TimedCache<Vec<ContentType>>>,
    clock: Arc<dyn Clock>,
}

/// Collects everything an entry starts with so capabilities are attached
/// and metadata is read before anyone else sees the entry.
pub struct EntryBuilder {
    name: String,
    flags: BTreeSet<ModFlag>,
    capabilities: Vec<Capability>,
    backing_path: Option<PathBuf>,
    clock: Arc<dyn Clock>,
}

impl EntryBuilder {
    pub fn flag(mut self, flag: ModFlag) -> Self {
        self.flags.insert(flag);
        self
    }

    pub fn with(mut self, capability: impl Into<Capability>) -> Self {
        self.capabilities.push(capability.into());
        self
    }

    /// Directory that belongs to the entry even without a disk location
    /// capability (backups).
    pub fn backing_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.backing_path = Some(path.into());
        self
    }

    pub fn build(self) -> ModEntry {
        let mut entry = ModEntry {
            state: Arc::new(EntryState::new(&self.name)),
            base_flags: self.flags,
            slots: Vec::new(),
            by_kind: BTreeMap::new(),
            backing_path: self.backing_path,
            valid: true,
            content: Mutex::new(TimedCache::new(CONTENT_STALENESS)),
            clock: self.clock,
        };
        for capability in self.capabilities {
            entry.attach(capability);
        }
        entry.valid = entry
            .managed_dir()
            .map(|dir| content::is_valid_mod_dir(&dir))
            .unwrap_or(true);
        entry.read_meta();
        entry
    }
}

impl ModEntry {
    pub fn builder(name: &str, clock: Arc<dyn Clock>) -> EntryBuilder {
        EntryBuilder {
            name: name.to_string(),
            flags: BTreeSet::new(),
            capabilities: Vec::new(),
            backing_path: None,
            clock,
        }
    }

    /// Attaches a capability, replacing one of the same kind. Concrete
    /// locations and links also become the entry's general location or link.
    ///
    /// Attaching a location or link of a different concrete kind only moves
    /// the general alias. The earlier one stays attached under its own kind.
    pub fn attach(&mut self, capability: impl Into<Capability>) {
        let mut capability = capability.into();
        capability.attach(Owner::new(&self.state));
        let kind = capability.kind();
        let slot = match self.by_kind.get(&kind) {
            Some(slot) => {
                self.slots[*slot] = capability;
                *slot
            }
            None => {
                self.slots.push(capability);
                self.slots.len() - 1
            }
        };
        self.by_kind.insert(kind, slot);
        if let Some(general) = kind.general() {
            self.by_kind.insert(general, slot);
        }
    }

    pub fn has<T: CapabilityVariant>(&self) -> bool {
        self.by_kind.contains_key(&T::KIND)
    }

    pub fn get<T: CapabilityVariant>(&self) -> Option<&T> {
        let slot = self.by_kind.get(&T::KIND)?;
        T::from_ref(&self.slots[*slot])
    }

    pub fn get_mut<T: CapabilityVariant>(&mut self) -> Option<&mut T> {
        let slot = *self.by_kind.get(&T::KIND)?;
        T::from_mut(&mut self.slots[slot])
    }

    pub fn has_kind(&self, kind: CapabilityKind) -> bool {
        self.by_kind.contains_key(&kind)
    }

    pub fn capability(&self, kind: CapabilityKind) -> Option<&Capability> {
        let slot = self.by_kind.get(&kind)?;
        self.slots.get(*slot)
    }

    pub fn disk_location(&self) -> Option<&dyn DiskLocation> {
        self.capability(CapabilityKind::DiskLocation)?
            .as_disk_location()
    }

    pub fn repository(&self) -> Option<&dyn RepositoryLink> {
        self.capability(CapabilityKind::RepositoryLink)?
            .as_repository()
    }

    pub fn repository_mut(&mut self) -> Option<&mut dyn RepositoryLink> {
        let slot = *self.by_kind.get(&CapabilityKind::RepositoryLink)?;
        self.slots[slot].as_repository_mut()
    }

    pub fn conflicts(&self) -> Option<&Conflicting> {
        self.get::<Conflicting>()
    }

    /// Registry key. Only changes through a rename.
    pub fn internal_name(&self) -> String {
        self.state.name()
    }

    /// Name shown to the user; workshop items use their title once known.
    pub fn name(&self) -> String {
        if let Some(title) = self.get::<SteamLink>().and_then(|link| link.remote_name()) {
            return format!("Steam: {title}");
        }
        self.internal_name()
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn is_dirty(&self) -> bool {
        self.state.is_dirty()
    }

    pub fn mark_dirty(&self) {
        self.state.set_dirty(true);
    }

    pub fn flags(&self) -> BTreeSet<ModFlag> {
        let origin = self.internal_name();
        let mut flags = self.base_flags.clone();
        if !self.valid {
            flags.insert(ModFlag::Invalid);
        }
        for capability in &self.slots {
            flags.extend(capability.flags(&origin));
        }
        flags
    }

    pub fn has_flag(&self, flag: ModFlag) -> bool {
        self.flags().contains(&flag)
    }

    pub fn absolute_path(&self) -> PathBuf {
        self.disk_location()
            .map(|location| location.absolute_path())
            .or_else(|| self.backing_path.clone())
            .unwrap_or_default()
    }

    /// Directory the entry owns outright: an installed mod or a backup.
    fn managed_dir(&self) -> Option<PathBuf> {
        self.get::<Installed>()
            .map(|installed| installed.absolute_path())
            .or_else(|| self.backing_path.clone())
    }

    pub fn archives(&self) -> Vec<PathBuf> {
        self.disk_location()
            .map(|location| location.archives())
            .unwrap_or_default()
    }

    /// Content tags, rescanned once the cached list is a minute old.
    pub fn contents(&self) -> Vec<ContentType> {
        let path = self.absolute_path();
        let now = self.clock.now();
        let mut cache = self.content.lock().unwrap_or_else(PoisonError::into_inner);
        cache
            .get_or_refresh(now, || content::detect(&path))
            .clone()
    }

    pub fn has_content(&self, kind: ContentType) -> bool {
        self.contents().contains(&kind)
    }

    pub fn is_empty(&self) -> bool {
        if self.disk_location().is_none() && self.backing_path.is_none() {
            return true;
        }
        content::is_empty_dir(&self.absolute_path())
    }

    pub fn ini_tweaks(&self) -> Vec<PathBuf> {
        let path = self.absolute_path();
        let store = match MetaStore::open(&path) {
            Ok(store) => store,
            Err(err) => {
                warn!(mod_name = %self.internal_name(), error = %err, "failed to read ini tweaks");
                return Vec::new();
            }
        };
        let tweaks: Vec<PathBuf> = store
            .array(INI_TWEAKS)
            .iter()
            .filter_map(|row| row.get("name").and_then(|name| name.as_str()))
            .map(|name| path.join(INI_TWEAKS).join(name))
            .collect();
        if !tweaks.is_empty() {
            debug!(mod_name = %self.internal_name(), count = tweaks.len(), "active ini tweaks");
        }
        tweaks
    }

    pub fn creation_time(&self) -> Option<SystemTime> {
        let metadata = fs::metadata(self.absolute_path()).ok()?;
        metadata.created().or_else(|_| metadata.modified()).ok()
    }

    /// One-line summary for listings.
    pub fn description(&self) -> String {
        if self.base_flags.contains(&ModFlag::Backup) {
            return "This is the backup of a mod".to_string();
        }
        if !self.valid {
            return format!(
                "{} contains no plugin and no asset (textures, meshes, interface, ...) directory",
                self.name()
            );
        }
        match self.get::<Categorized>() {
            Some(categorized) if !categorized.categories().is_empty() => {
                format!("Categories: {}", categorized.category_names().join(", "))
            }
            _ => String::new(),
        }
    }

    pub(crate) fn read_meta(&mut self) {
        let path = self.absolute_path();
        if path.as_os_str().is_empty() || !path.exists() {
            return;
        }
        match MetaStore::open(&path) {
            Ok(store) => {
                for capability in &mut self.slots {
                    capability.read_meta(&store);
                }
            }
            Err(err) => {
                warn!(mod_name = %self.internal_name(), error = %err, "failed to read mod metadata");
            }
        }
        self.state.set_dirty(false);
    }

    /// Writes metadata when something changed and the mod still exists on
    /// disk. Returns whether a write happened.
    pub fn save_meta(&self) -> Result<bool> {
        if !self.state.is_dirty() {
            return Ok(false);
        }
        let path = self.absolute_path();
        if path.as_os_str().is_empty() || !path.exists() {
            return Ok(false);
        }
        let mut store = MetaStore::open(&path).unwrap_or_else(|err| {
            warn!(path = %path.display(), error = %err, "replacing unreadable mod metadata");
            MetaStore::empty(&path)
        });
        for capability in &self.slots {
            capability.save_meta(&mut store);
        }
        store
            .sync()
            .with_context(|| format!("failed to write {}", store.path().display()))?;
        self.state.set_dirty(false);
        Ok(true)
    }

    /// Deletes the entry's own directory. Entries that merely point into
    /// shared directories keep their files.
    pub(crate) fn remove_from_disk(&mut self) -> Result<()> {
        self.state.set_dirty(false);
        let Some(dir) = self.managed_dir() else {
            return Ok(());
        };
        if !dir.exists() {
            return Ok(());
        }
        fs::remove_dir_all(&dir).with_context(|| format!("remove {}", dir.display()))
    }

    /// Renames the entry and, for installed mods, its directory.
    pub(crate) fn rename(&mut self, new_name: &str) -> Result<(), RegistryError> {
        if !is_acceptable_name(new_name) {
            return Err(RegistryError::InvalidName(new_name.to_string()));
        }
        let old_name = self.internal_name();
        if let Some(installed) = self.get_mut::<Installed>() {
            installed
                .rename_dir(new_name)
                .map_err(|source| RegistryError::RenameFailed {
                    from: old_name.clone(),
                    to: new_name.to_string(),
                    source,
                })?;
        }
        self.state.set_name(new_name);
        if let Some(conflicts) = self.conflicts() {
            conflicts.clear_caches();
        }
        debug!(from = %old_name, to = %new_name, "mod renamed");
        Ok(())
    }

    /// Applies a remote reply to the capabilities it concerns. `Err` carries
    /// the message to show for a failed request.
    pub fn apply_remote(&mut self, outcome: &RemoteOutcome) -> Result<(), String> {
        match outcome {
            RemoteOutcome::Description(description) => {
                let category = match (description.category_id, self.get::<NexusLink>()) {
                    (Some(remote), Some(link)) => link.translate_category(&remote.to_string()),
                    _ => 0,
                };
                if let Some(repository) = self.repository_mut() {
                    let info = repository.info_mut();
                    info.set_newest_version(VersionInfo::parse(&description.version));
                    info.set_description(&description.description);
                    info.mark_queried();
                }
                if let (Some(endorsed), Some(endorsable)) =
                    (description.endorsed, self.get_mut::<Endorsable>())
                {
                    if endorsable.endorsed_state() != EndorsedState::Never {
                        endorsable.set_endorsed_state(endorsed_state(endorsed));
                    }
                }
                if category > 0 {
                    if let Some(categorized) = self.get_mut::<Categorized>() {
                        categorized.set(category, true);
                    }
                }
            }
            RemoteOutcome::EndorsementToggled(endorsed) => {
                if let Some(endorsable) = self.get_mut::<Endorsable>() {
                    endorsable.set_endorsed_state(endorsed_state(*endorsed));
                }
            }
            RemoteOutcome::WorkshopDetails(details) => {
                if let Some(link) = self.get_mut::<SteamLink>() {
                    link.set_title(&details.title);
                    let info = link.info_mut();
                    info.set_description(&details.description);
                    info.set_newest_version(VersionInfo::from_parts(details.time_updated, 0, 0));
                    info.mark_queried();
                }
            }
            RemoteOutcome::Updates(versions) => {
                let Some(repository) = self.repository_mut() else {
                    return Ok(());
                };
                let mod_id = repository.info().numeric_id();
                if let Some(found) = versions.iter().find(|version| version.mod_id == mod_id) {
                    repository
                        .info_mut()
                        .set_newest_version(VersionInfo::parse(&found.version));
                }
                return Ok(());
            }
            RemoteOutcome::Failed {
                message,
                endorsement,
            } => {
                let mut message = message.clone();
                if *endorsement {
                    message.push('\n');
                    message.push_str(ENDORSEMENT_HINT);
                }
                return Err(message);
            }
        }
        self.mark_dirty();
        Ok(())
    }

    pub fn update_info(&mut self) -> bool {
        self.repository_mut()
            .map(|repository| repository.update_info())
            .unwrap_or(false)
    }

    pub fn update_available(&self) -> bool {
        self.compare_with_newest(|installed, newest| installed < newest)
    }

    pub fn downgrade_available(&self) -> bool {
        self.compare_with_newest(|installed, newest| newest < installed)
    }

    fn compare_with_newest(&self, compare: impl Fn(&VersionInfo, &VersionInfo) -> bool) -> bool {
        let (Some(repository), Some(versioned)) = (self.repository(), self.get::<Versioned>())
        else {
            return false;
        };
        let info = repository.info();
        info.newest_version().is_valid()
            && !info.update_ignored()
            && compare(versioned.get(), info.newest_version())
    }

    pub fn ignore_update(&mut self, ignore: bool) {
        if let Some(repository) = self.repository_mut() {
            repository.info_mut().ignore_update(ignore);
        }
    }

    /// Asks the hosting site to change the endorsement when it differs from
    /// what we know. Returns whether a request went out.
    pub fn endorse(&self, endorse: bool) -> bool {
        let Some(endorsable) = self.get::<Endorsable>() else {
            return false;
        };
        if endorse == (endorsable.endorsed_state() == EndorsedState::True) {
            return false;
        }
        self.get::<NexusLink>()
            .map(|link| link.set_endorsed(endorse))
            .unwrap_or(false)
    }

    pub fn set_version(&mut self, version: VersionInfo) {
        if let Some(versioned) = self.get_mut::<Versioned>() {
            versioned.set(version);
        }
    }

    pub fn set_newest_version(&mut self, version: VersionInfo) {
        if let Some(repository) = self.repository_mut() {
            repository.info_mut().set_newest_version(version);
        }
    }

    pub fn set_is_endorsed(&mut self, endorsed: bool) {
        if let Some(endorsable) = self.get_mut::<Endorsable>() {
            endorsable.set_is_endorsed(endorsed);
        }
    }

    pub fn set_repo_mod_id(&mut self, mod_id: i64) {
        if let Some(repository) = self.repository_mut() {
            repository.info_mut().set_mod_id(&mod_id.to_string());
        }
    }

    pub fn set_installation_file(&mut self, file_name: &str) {
        if let Some(installed) = self.get_mut::<Installed>() {
            installed.set_installation_file(file_name);
        }
    }

    pub fn add_remote_category(&mut self, remote_id: i64) {
        let Some(link) = self.get::<NexusLink>() else {
            return;
        };
        let category = link.translate_category(&remote_id.to_string());
        if let Some(categorized) = self.get_mut::<Categorized>() {
            categorized.set(category, true);
        }
    }

    pub(crate) fn repository_id(&self) -> Option<String> {
        let id = self.repository()?.info().mod_id().to_string();
        (!id.is_empty() && id != "-1").then_some(id)
    }
}

impl Drop for ModEntry {
    fn drop(&mut self) {
        if let Err(err) = self.save_meta() {
            let message = format!("{err:#}");
            error!(mod_name = %self.internal_name(), error = %message, "failed to save meta information");
        }
    }
}

pub(crate) fn is_acceptable_name(name: &str) -> bool {
    !name.trim().is_empty() && !name.contains(['/', '\\']) && !Path::new(name).is_absolute()
}

fn endorsed_state(endorsed: bool) -> EndorsedState {
    if endorsed {
        EndorsedState::True
    } else {
        EndorsedState::False
    }
}
