use serde_json::Value;
use std::{collections::BTreeSet, sync::Arc};

use super::{Feature, ModFlag, Owner};
use crate::{categories::CategoryCatalog, meta_store::MetaStore, version::VersionInfo};

/// Free-form user notes.
#[derive(Debug, Default)]
pub struct Note {
    text: String,
    owner: Owner,
}

impl Note {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, note: &str) {
        self.text = note.to_string();
        self.owner.mark_dirty();
    }

    pub fn get(&self) -> &str {
        &self.text
    }
}

impl Feature for Note {
    fn attach(&mut self, owner: Owner) {
        self.owner = owner;
    }

    fn save_meta(&self, store: &mut MetaStore) {
        store.set("notes", self.text.as_str());
    }

    fn read_meta(&mut self, store: &MetaStore) {
        self.text = store.string("notes").unwrap_or_default();
    }

    fn flags(&self, _origin: &str) -> BTreeSet<ModFlag> {
        let mut flags = BTreeSet::new();
        if !self.text.is_empty() {
            flags.insert(ModFlag::Notes);
        }
        flags
    }
}

/// Categories assigned to a mod, one of them primary.
#[derive(Debug)]
pub struct Categorized {
    primary: i64,
    categories: BTreeSet<i64>,
    catalog: Arc<CategoryCatalog>,
    owner: Owner,
}

impl Categorized {
    pub fn new(catalog: Arc<CategoryCatalog>) -> Self {
        Self {
            primary: -1,
            categories: BTreeSet::new(),
            catalog,
            owner: Owner::default(),
        }
    }

    /// True when the mod carries `category_id` or one of its descendants.
    pub fn is_set(&self, category_id: i64) -> bool {
        self.categories
            .iter()
            .any(|id| *id == category_id || self.catalog.is_descendant_of(*id, category_id))
    }

    pub fn set(&mut self, category_id: i64, active: bool) {
        if active {
            self.categories.insert(category_id);
            if self.primary == -1 {
                self.primary = category_id;
            }
        } else {
            self.categories.remove(&category_id);
            if category_id == self.primary {
                self.primary = self.categories.iter().next().copied().unwrap_or(-1);
            }
        }
        self.owner.mark_dirty();
    }

    pub fn categories(&self) -> &BTreeSet<i64> {
        &self.categories
    }

    pub fn category_names(&self) -> Vec<String> {
        self.categories
            .iter()
            .filter_map(|id| self.catalog.name(*id))
            .map(str::to_string)
            .collect()
    }

    pub fn primary(&self) -> i64 {
        self.primary
    }

    pub fn set_primary(&mut self, category_id: i64) {
        self.primary = category_id;
        self.owner.mark_dirty();
    }
}

impl Feature for Categorized {
    fn attach(&mut self, owner: Owner) {
        self.owner = owner;
    }

    fn save_meta(&self, store: &mut MetaStore) {
        let mut parts = Vec::new();
        if self.primary != -1 || !self.categories.is_empty() {
            parts.push(self.primary.to_string());
        }
        parts.extend(
            self.categories
                .iter()
                .filter(|id| **id != self.primary)
                .map(|id| id.to_string()),
        );
        store.set("category", parts.join(","));
    }

    fn read_meta(&mut self, store: &MetaStore) {
        let raw = store.string("category").unwrap_or_default();
        self.primary = -1;
        self.categories.clear();
        for part in raw.split(',') {
            let Ok(category_id) = part.trim().parse::<i64>() else {
                continue;
            };
            if category_id <= 0 || !self.catalog.exists(category_id) {
                continue;
            }
            self.categories.insert(category_id);
            if self.primary == -1 {
                self.primary = category_id;
            }
        }
    }
}

/// Installed version of the mod.
#[derive(Debug, Default)]
pub struct Versioned {
    version: VersionInfo,
    owner: Owner,
}

impl Versioned {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the version without touching the mod's files.
    pub fn set(&mut self, version: VersionInfo) {
        self.version = version;
        self.owner.mark_dirty();
    }

    pub fn get(&self) -> &VersionInfo {
        &self.version
    }
}

impl Feature for Versioned {
    fn attach(&mut self, owner: Owner) {
        self.owner = owner;
    }

    fn save_meta(&self, store: &mut MetaStore) {
        store.set("version", self.version.canonical_string());
    }

    fn read_meta(&mut self, store: &MetaStore) {
        self.version = VersionInfo::parse(&store.string("version").unwrap_or_default());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndorsedState {
    False,
    True,
    Unknown,
    Never,
}

impl EndorsedState {
    fn code(self) -> i64 {
        match self {
            EndorsedState::False => 0,
            EndorsedState::True => 1,
            EndorsedState::Unknown => 2,
            EndorsedState::Never => 3,
        }
    }

    fn from_code(code: i64) -> Self {
        match code {
            0 => EndorsedState::False,
            1 => EndorsedState::True,
            3 => EndorsedState::Never,
            _ => EndorsedState::Unknown,
        }
    }
}

/// Whether the user endorsed the mod on its repository.
#[derive(Debug)]
pub struct Endorsable {
    state: EndorsedState,
    owner: Owner,
}

impl Default for Endorsable {
    fn default() -> Self {
        Self {
            state: EndorsedState::Unknown,
            owner: Owner::default(),
        }
    }
}

impl Endorsable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Updates the cached state; ignored once the user opted out.
    pub fn set_is_endorsed(&mut self, endorsed: bool) {
        if self.state != EndorsedState::Never {
            self.state = if endorsed {
                EndorsedState::True
            } else {
                EndorsedState::False
            };
            self.owner.mark_dirty();
        }
    }

    pub fn set_never_endorse(&mut self) {
        self.state = EndorsedState::Never;
        self.owner.mark_dirty();
    }

    pub fn endorsed_state(&self) -> EndorsedState {
        self.state
    }

    pub fn set_endorsed_state(&mut self, state: EndorsedState) {
        if state != self.state {
            self.state = state;
            self.owner.mark_dirty();
        }
    }
}

impl Feature for Endorsable {
    fn attach(&mut self, owner: Owner) {
        self.owner = owner;
    }

    fn save_meta(&self, store: &mut MetaStore) {
        if self.state != EndorsedState::Unknown {
            store.set("endorsed", self.state.code());
        }
    }

    fn read_meta(&mut self, store: &MetaStore) {
        self.state = match store.value("endorsed") {
            None => return,
            Some(Value::Bool(endorsed)) => {
                if *endorsed {
                    EndorsedState::True
                } else {
                    EndorsedState::False
                }
            }
            Some(Value::String(raw)) if raw.eq_ignore_ascii_case("true") => EndorsedState::True,
            Some(Value::String(raw)) if raw.eq_ignore_ascii_case("false") => {
                EndorsedState::False
            }
            Some(value) => crate::meta_store::value_as_int(value)
                .map(EndorsedState::from_code)
                .unwrap_or(EndorsedState::Unknown),
        };
    }

    fn flags(&self, _origin: &str) -> BTreeSet<ModFlag> {
        let mut flags = BTreeSet::new();
        if self.state == EndorsedState::False {
            flags.insert(ModFlag::NotEndorsed);
        }
        flags
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkable {
    UserCheckable,
    FixedActive,
    FixedInactive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    UserPositionable,
    FixedLowest,
    FixedHighest,
}

/// Whether the user may toggle or reorder the mod.
#[derive(Debug, Clone)]
pub struct Positioning {
    checkable: Checkable,
    position: Position,
}

impl Default for Positioning {
    fn default() -> Self {
        Self::new(Checkable::UserCheckable, Position::UserPositionable)
    }
}

impl Positioning {
    pub fn new(checkable: Checkable, position: Position) -> Self {
        Self {
            checkable,
            position,
        }
    }

    pub fn is_position_fixed(&self) -> bool {
        self.position != Position::UserPositionable
    }

    pub fn checkable(&self) -> Checkable {
        self.checkable
    }

    pub fn position(&self) -> Position {
        self.position
    }
}

impl Feature for Positioning {}
