//! Registry of installed game mods with composable per-mod capabilities,
//! priority-based conflict classification and asynchronous repository
//! lookups.

pub mod capability;
pub mod categories;
pub mod cli;
pub mod clock;
pub mod config;
pub mod content;
pub mod entry;
pub mod error;
pub mod logging;
pub mod manifest;
pub mod meta_store;
pub mod overlay;
pub mod registry;
pub mod remote;
pub mod version;

pub use entry::ModEntry;
pub use error::RegistryError;
pub use registry::{EntryRef, ModRegistry, RegistryEvent, RegistryServices, RegistrySettings};
