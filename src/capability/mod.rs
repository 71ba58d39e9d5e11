//! Per-mod capabilities.
//!
//! An entry holds at most one capability of each kind. Concrete disk
//! locations and repository links are also reachable through their general
//! kind ([`CapabilityKind::DiskLocation`], [`CapabilityKind::RepositoryLink`]).
//! Capabilities keep a weak [`Owner`] handle to their entry and use it to
//! flag unsaved changes.

pub mod conflict;
pub mod location;
pub mod metadata;
pub mod repository;

use serde::Serialize;
use std::{
    collections::BTreeSet,
    fmt,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, PoisonError, RwLock, Weak,
    },
};

use crate::meta_store::MetaStore;

pub use conflict::{ConflictRecord, ConflictState, Conflicting};
pub use location::{ForeignInstalled, Installed, OverwriteLocation, SteamInstalled};
pub use metadata::{
    Categorized, Checkable, EndorsedState, Endorsable, Note, Position, Positioning, Versioned,
};
pub use repository::{NexusLink, RepositoryInfo, SteamLink};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModFlag {
    Backup,
    Foreign,
    Overwrite,
    Invalid,
    Notes,
    NotEndorsed,
    ConflictOverwrite,
    ConflictOverwritten,
    ConflictMixed,
    ConflictRedundant,
}

impl ModFlag {
    pub fn label(self) -> &'static str {
        match self {
            ModFlag::Backup => "backup",
            ModFlag::Foreign => "foreign",
            ModFlag::Overwrite => "overwrite",
            ModFlag::Invalid => "invalid",
            ModFlag::Notes => "notes",
            ModFlag::NotEndorsed => "not-endorsed",
            ModFlag::ConflictOverwrite => "overwrites",
            ModFlag::ConflictOverwritten => "overwritten",
            ModFlag::ConflictMixed => "mixed-conflict",
            ModFlag::ConflictRedundant => "redundant",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CapabilityKind {
    Note,
    Categorized,
    Versioned,
    Endorsable,
    Positioning,
    RepositoryLink,
    NexusLink,
    SteamLink,
    DiskLocation,
    Installed,
    ForeignInstalled,
    SteamInstalled,
    OverwriteLocation,
    Conflicting,
}

impl CapabilityKind {
    /// The broader kind a concrete variant is also registered under.
    pub fn general(self) -> Option<CapabilityKind> {
        match self {
            CapabilityKind::NexusLink | CapabilityKind::SteamLink => {
                Some(CapabilityKind::RepositoryLink)
            }
            CapabilityKind::Installed
            | CapabilityKind::ForeignInstalled
            | CapabilityKind::SteamInstalled
            | CapabilityKind::OverwriteLocation => Some(CapabilityKind::DiskLocation),
            _ => None,
        }
    }
}

/// Shared between an entry and the capabilities attached to it.
#[derive(Debug, Default)]
pub(crate) struct EntryState {
    name: RwLock<String>,
    dirty: AtomicBool,
}

impl EntryState {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: RwLock::new(name.to_string()),
            dirty: AtomicBool::new(false),
        }
    }

    pub(crate) fn name(&self) -> String {
        self.name
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_name(&self, name: &str) {
        let mut current = self.name.write().unwrap_or_else(PoisonError::into_inner);
        *current = name.to_string();
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    pub(crate) fn set_dirty(&self, dirty: bool) {
        self.dirty.store(dirty, Ordering::SeqCst);
    }
}

/// Non-owning handle from a capability back to its entry.
#[derive(Debug, Clone, Default)]
pub struct Owner {
    state: Weak<EntryState>,
}

impl Owner {
    pub(crate) fn new(state: &Arc<EntryState>) -> Self {
        Self {
            state: Arc::downgrade(state),
        }
    }

    /// Flags the entry as having unsaved metadata.
    pub fn mark_dirty(&self) {
        if let Some(state) = self.state.upgrade() {
            state.set_dirty(true);
        }
    }

    pub fn entry_name(&self) -> Option<String> {
        self.state.upgrade().map(|state| state.name())
    }

    pub fn is_attached(&self) -> bool {
        self.state.strong_count() > 0
    }
}

/// Behaviour every capability shares.
pub trait Feature {
    fn attach(&mut self, _owner: Owner) {}

    fn save_meta(&self, _store: &mut MetaStore) {}

    fn read_meta(&mut self, _store: &MetaStore) {}

    /// Flags contributed to the entry; `origin` is the entry's internal name.
    fn flags(&self, _origin: &str) -> BTreeSet<ModFlag> {
        BTreeSet::new()
    }
}

/// Where a mod's files live.
pub trait DiskLocation {
    fn absolute_path(&self) -> PathBuf;
    fn archives(&self) -> Vec<PathBuf>;
}

/// Link to a remote repository that can refresh version and description.
pub trait RepositoryLink {
    fn info(&self) -> &RepositoryInfo;
    fn info_mut(&mut self) -> &mut RepositoryInfo;
    fn repository_name(&self) -> &'static str;
    /// Issues an asynchronous refresh. Returns false when nothing was sent.
    fn update_info(&mut self) -> bool;
    fn translate_category(&self, remote_id: &str) -> i64;
    /// Name of the mod as the repository knows it, when that differs.
    fn remote_name(&self) -> Option<String> {
        None
    }
}

/// Static link between a concrete capability type and its enum variant.
pub trait CapabilityVariant: Feature + Sized {
    const KIND: CapabilityKind;
    fn from_ref(capability: &Capability) -> Option<&Self>;
    fn from_mut(capability: &mut Capability) -> Option<&mut Self>;
}

macro_rules! capabilities {
    ($($variant:ident),* $(,)?) => {
        pub enum Capability {
            $($variant($variant)),*
        }

        impl Capability {
            pub fn kind(&self) -> CapabilityKind {
                match self {
                    $(Capability::$variant(_) => CapabilityKind::$variant),*
                }
            }

            fn feature(&self) -> &dyn Feature {
                match self {
                    $(Capability::$variant(inner) => inner),*
                }
            }

            fn feature_mut(&mut self) -> &mut dyn Feature {
                match self {
                    $(Capability::$variant(inner) => inner),*
                }
            }
        }

        $(
            impl CapabilityVariant for $variant {
                const KIND: CapabilityKind = CapabilityKind::$variant;

                fn from_ref(capability: &Capability) -> Option<&Self> {
                    match capability {
                        Capability::$variant(inner) => Some(inner),
                        _ => None,
                    }
                }

                fn from_mut(capability: &mut Capability) -> Option<&mut Self> {
                    match capability {
                        Capability::$variant(inner) => Some(inner),
                        _ => None,
                    }
                }
            }

            impl From<$variant> for Capability {
                fn from(value: $variant) -> Self {
                    Capability::$variant(value)
                }
            }
        )*
    };
}

capabilities!(
    Note,
    Categorized,
    Versioned,
    Endorsable,
    Positioning,
    NexusLink,
    SteamLink,
    Installed,
    ForeignInstalled,
    SteamInstalled,
    OverwriteLocation,
    Conflicting,
);

impl Capability {
    pub fn attach(&mut self, owner: Owner) {
        self.feature_mut().attach(owner);
    }

    pub fn save_meta(&self, store: &mut MetaStore) {
        self.feature().save_meta(store);
    }

    pub fn read_meta(&mut self, store: &MetaStore) {
        self.feature_mut().read_meta(store);
    }

    pub fn flags(&self, origin: &str) -> BTreeSet<ModFlag> {
        self.feature().flags(origin)
    }

    pub fn as_disk_location(&self) -> Option<&dyn DiskLocation> {
        match self {
            Capability::Installed(inner) => Some(inner),
            Capability::ForeignInstalled(inner) => Some(inner),
            Capability::SteamInstalled(inner) => Some(inner),
            Capability::OverwriteLocation(inner) => Some(inner),
            _ => None,
        }
    }

    pub fn as_repository(&self) -> Option<&dyn RepositoryLink> {
        match self {
            Capability::NexusLink(inner) => Some(inner),
            Capability::SteamLink(inner) => Some(inner),
            _ => None,
        }
    }

    pub fn as_repository_mut(&mut self) -> Option<&mut dyn RepositoryLink> {
        match self {
            Capability::NexusLink(inner) => Some(inner),
            Capability::SteamLink(inner) => Some(inner),
            _ => None,
        }
    }
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Capability::{:?}", self.kind())
    }
}
