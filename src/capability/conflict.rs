//! Which entries a mod overwrites, and which overwrite it.

use serde::Serialize;
use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
};
use tracing::trace;

use super::{Feature, ModFlag, Owner};
use crate::{
    clock::{Clock, TimedCache, CONFLICT_STALENESS},
    overlay::{OverlayView, BASE_ORIGIN},
    registry::NameIndex,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictState {
    #[default]
    None,
    Overwrite,
    Overwritten,
    Mixed,
    Redundant,
}

impl ConflictState {
    pub fn label(self) -> &'static str {
        match self {
            ConflictState::None => "none",
            ConflictState::Overwrite => "overwrite",
            ConflictState::Overwritten => "overwritten",
            ConflictState::Mixed => "mixed",
            ConflictState::Redundant => "redundant",
        }
    }

    fn flag(self) -> Option<ModFlag> {
        match self {
            ConflictState::None => None,
            ConflictState::Overwrite => Some(ModFlag::ConflictOverwrite),
            ConflictState::Overwritten => Some(ModFlag::ConflictOverwritten),
            ConflictState::Mixed => Some(ModFlag::ConflictMixed),
            ConflictState::Redundant => Some(ModFlag::ConflictRedundant),
        }
    }
}

/// Outcome of one conflict pass. Sets hold registry positions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConflictRecord {
    pub state: ConflictState,
    pub overwriting: BTreeSet<usize>,
    pub overwritten_by: BTreeSet<usize>,
}

/// Classifies the origin `name` against every other origin in `overlay`.
///
/// `position_of` maps an origin name to the position of the entry that owns
/// it. Origins without an entry (the base data directory, stale names) are
/// left out of both sets.
pub fn classify<F>(overlay: &dyn OverlayView, name: &str, position_of: F) -> ConflictRecord
where
    F: Fn(&str) -> Option<usize>,
{
    let mut record = ConflictRecord::default();
    let Some(origin) = overlay.origin_by_name(name) else {
        return record;
    };
    let base = overlay.origin_by_name(BASE_ORIGIN).map(|base| base.id);
    let position_of_id = |id| {
        overlay
            .origin_by_id(id)
            .and_then(|other| position_of(&other.name))
    };

    let mut regular = false;
    for file in overlay.files(origin.id) {
        let alternatives = &file.alternatives;
        if alternatives.is_empty() || Some(alternatives[0]) == base {
            regular = true;
            continue;
        }

        if file.origin != origin.id {
            if let Some(position) = position_of_id(file.origin) {
                record.overwritten_by.insert(position);
            }
        }

        for alternative in alternatives {
            if Some(*alternative) == base || *alternative == origin.id {
                continue;
            }
            let Some(other) = overlay.origin_by_id(*alternative) else {
                continue;
            };
            let Some(position) = position_of(&other.name) else {
                continue;
            };
            if origin.priority > other.priority {
                record.overwriting.insert(position);
            } else {
                record.overwritten_by.insert(position);
            }
        }
    }

    record.state = match (
        record.overwriting.is_empty(),
        record.overwritten_by.is_empty(),
    ) {
        (false, false) => ConflictState::Mixed,
        (false, true) => ConflictState::Overwrite,
        (true, false) if !regular => ConflictState::Redundant,
        (true, false) => ConflictState::Overwritten,
        (true, true) => ConflictState::None,
    };
    record
}

/// Conflict status of one entry, recomputed at most once per staleness
/// window.
pub struct Conflicting {
    overlay: Arc<dyn OverlayView>,
    names: Arc<NameIndex>,
    clock: Arc<dyn Clock>,
    cache: Mutex<TimedCache<ConflictRecord>>,
    recomputes: AtomicU64,
    owner: Owner,
}

impl Conflicting {
    pub fn new(overlay: Arc<dyn OverlayView>, names: Arc<NameIndex>, clock: Arc<dyn Clock>) -> Self {
        Self {
            overlay,
            names,
            clock,
            cache: Mutex::new(TimedCache::new(CONFLICT_STALENESS)),
            recomputes: AtomicU64::new(0),
            owner: Owner::default(),
        }
    }

    /// Current record for the owning entry.
    pub fn record(&self) -> ConflictRecord {
        let name = self.owner.entry_name().unwrap_or_default();
        self.record_for(&name)
    }

    fn record_for(&self, origin: &str) -> ConflictRecord {
        let now = self.clock.now();
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        cache
            .get_or_refresh(now, || {
                self.recomputes.fetch_add(1, Ordering::Relaxed);
                trace!(origin = %origin, "recomputing conflicts");
                classify(self.overlay.as_ref(), origin, |name| {
                    self.names.position(name)
                })
            })
            .clone()
    }

    pub fn state(&self) -> ConflictState {
        self.record().state
    }

    pub fn overwrite_set(&self) -> BTreeSet<usize> {
        self.record().overwriting
    }

    pub fn overwritten_set(&self) -> BTreeSet<usize> {
        self.record().overwritten_by
    }

    /// True when the entry's origin exists but wins none of its files.
    pub fn is_redundant(&self) -> bool {
        let name = self.owner.entry_name().unwrap_or_default();
        let Some(origin) = self.overlay.origin_by_name(&name) else {
            return false;
        };
        !self
            .overlay
            .files(origin.id)
            .iter()
            .any(|file| file.origin == origin.id)
    }

    /// Forces the next read to recompute.
    pub fn clear_caches(&self) {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .invalidate();
    }

    pub fn recompute_count(&self) -> u64 {
        self.recomputes.load(Ordering::Relaxed)
    }
}

impl Feature for Conflicting {
    fn attach(&mut self, owner: Owner) {
        self.owner = owner;
    }

    fn flags(&self, origin: &str) -> BTreeSet<ModFlag> {
        self.record_for(origin).state.flag().into_iter().collect()
    }
}
