use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::Sender,
        Arc,
    },
    thread,
};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tracing::{debug, warn};

use super::{Feature, Owner, RepositoryLink};
use crate::{
    categories::CategoryCatalog,
    meta_store::MetaStore,
    remote::{NexusBridge, RemoteOutcome, RemoteReply, ReplyTarget, WorkshopClient},
    version::VersionInfo,
};

/// State every repository link keeps, whatever the remote is.
#[derive(Debug)]
pub struct RepositoryInfo {
    mod_id: String,
    newest: VersionInfo,
    ignored: VersionInfo,
    description: String,
    last_query: Option<OffsetDateTime>,
    owner: Owner,
}

impl Default for RepositoryInfo {
    fn default() -> Self {
        Self::new("-1")
    }
}

impl RepositoryInfo {
    pub fn new(mod_id: &str) -> Self {
        Self {
            mod_id: mod_id.to_string(),
            newest: VersionInfo::default(),
            ignored: VersionInfo::default(),
            description: String::new(),
            last_query: None,
            owner: Owner::default(),
        }
    }

    pub fn mod_id(&self) -> &str {
        &self.mod_id
    }

    /// The id as a number, -1 when it is not one.
    pub fn numeric_id(&self) -> i64 {
        self.mod_id.trim().parse().unwrap_or(-1)
    }

    pub fn set_mod_id(&mut self, mod_id: &str) {
        if self.mod_id != mod_id {
            self.mod_id = mod_id.to_string();
            self.owner.mark_dirty();
        }
    }

    pub fn newest_version(&self) -> &VersionInfo {
        &self.newest
    }

    pub fn set_newest_version(&mut self, version: VersionInfo) {
        if self.newest != version {
            self.newest = version;
            self.owner.mark_dirty();
        }
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn set_description(&mut self, description: &str) {
        if self.description != description {
            self.description = description.to_string();
            self.owner.mark_dirty();
        }
    }

    /// Ignores the currently known newest version, or stops ignoring.
    pub fn ignore_update(&mut self, ignore: bool) {
        if ignore {
            self.ignored = self.newest.clone();
        } else {
            self.ignored.clear();
        }
        self.owner.mark_dirty();
    }

    pub fn update_ignored(&self) -> bool {
        self.ignored.is_valid() && self.ignored == self.newest
    }

    pub fn can_be_updated(&self) -> bool {
        self.numeric_id() >= 0
    }

    pub fn last_query_time(&self) -> Option<OffsetDateTime> {
        self.last_query
    }

    pub fn mark_queried(&mut self) {
        self.last_query = Some(OffsetDateTime::now_utc());
        self.owner.mark_dirty();
    }

    fn attach(&mut self, owner: Owner) {
        self.owner = owner;
    }

    fn owner(&self) -> &Owner {
        &self.owner
    }

    fn save_meta(&self, store: &mut MetaStore, repository: &str) {
        store.set("ignoredVersion", self.ignored.canonical_string());
        store.set("newestVersion", self.newest.canonical_string());
        store.set("repository", repository);
        store.set("modid", self.mod_id.as_str());
        store.set("nexusDescription", self.description.as_str());
        let last_query = self
            .last_query
            .and_then(|at| at.format(&Rfc3339).ok())
            .unwrap_or_default();
        store.set("lastNexusQuery", last_query);
    }

    fn read_meta(&mut self, store: &MetaStore) {
        if let Some(mod_id) = store.string("modid") {
            self.mod_id = mod_id;
        }
        self.newest = VersionInfo::parse(&store.string("newestVersion").unwrap_or_default());
        self.ignored = VersionInfo::parse(&store.string("ignoredVersion").unwrap_or_default());
        self.description = store.string("nexusDescription").unwrap_or_default();
        self.last_query = store
            .string("lastNexusQuery")
            .and_then(|raw| OffsetDateTime::parse(&raw, &Rfc3339).ok());
    }
}

/// Link to a mod page on the hosting site.
pub struct NexusLink {
    info: RepositoryInfo,
    bridge: Arc<dyn NexusBridge>,
    catalog: Arc<CategoryCatalog>,
    replies: Sender<RemoteReply>,
}

impl NexusLink {
    pub fn new(
        bridge: Arc<dyn NexusBridge>,
        catalog: Arc<CategoryCatalog>,
        replies: Sender<RemoteReply>,
    ) -> Self {
        Self {
            info: RepositoryInfo::default(),
            bridge,
            catalog,
            replies,
        }
    }

    fn target(&self) -> ReplyTarget {
        let entry = self.info.owner().entry_name().unwrap_or_default();
        ReplyTarget::new(&entry, self.replies.clone())
    }

    /// Asks the site to endorse or un-endorse the mod. The answer arrives
    /// as a reply like any other request.
    pub fn set_endorsed(&self, endorsed: bool) -> bool {
        let mod_id = self.info.numeric_id();
        if mod_id <= 0 {
            return false;
        }
        self.bridge
            .request_toggle_endorsement(self.target(), mod_id, endorsed);
        true
    }
}

impl RepositoryLink for NexusLink {
    fn info(&self) -> &RepositoryInfo {
        &self.info
    }

    fn info_mut(&mut self) -> &mut RepositoryInfo {
        &mut self.info
    }

    fn repository_name(&self) -> &'static str {
        "Nexus"
    }

    fn update_info(&mut self) -> bool {
        let mod_id = self.info.numeric_id();
        if mod_id <= 0 {
            return false;
        }
        debug!(mod_id, "refreshing mod info");
        self.bridge.request_description(self.target(), mod_id);
        true
    }

    fn translate_category(&self, remote_id: &str) -> i64 {
        remote_id
            .trim()
            .parse()
            .map(|id| self.catalog.resolve_remote_id(id))
            .unwrap_or(0)
    }
}

impl Feature for NexusLink {
    fn attach(&mut self, owner: Owner) {
        self.info.attach(owner);
    }

    fn save_meta(&self, store: &mut MetaStore) {
        self.info.save_meta(store, self.repository_name());
    }

    fn read_meta(&mut self, store: &MetaStore) {
        self.info.read_meta(store);
    }
}

/// Releases the single in-flight slot of a [`SteamLink`] when dropped,
/// whichever way the request ended.
struct InFlight {
    slot: Arc<AtomicBool>,
}

impl InFlight {
    fn acquire(slot: &Arc<AtomicBool>) -> Option<Self> {
        slot.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { slot: slot.clone() })
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.slot.store(false, Ordering::Release);
    }
}

/// Link to a workshop item, keyed by its published file id.
pub struct SteamLink {
    info: RepositoryInfo,
    title: String,
    client: Arc<dyn WorkshopClient>,
    replies: Sender<RemoteReply>,
    in_flight: Arc<AtomicBool>,
}

impl SteamLink {
    pub fn new(key: &str, client: Arc<dyn WorkshopClient>, replies: Sender<RemoteReply>) -> Self {
        Self {
            info: RepositoryInfo::new(key),
            title: String::new(),
            client,
            replies,
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn set_title(&mut self, title: &str) {
        self.title = title.to_string();
    }

    pub fn is_updating(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }
}

impl RepositoryLink for SteamLink {
    fn info(&self) -> &RepositoryInfo {
        &self.info
    }

    fn info_mut(&mut self) -> &mut RepositoryInfo {
        &mut self.info
    }

    fn repository_name(&self) -> &'static str {
        "Steam"
    }

    fn update_info(&mut self) -> bool {
        let key = self.info.mod_id().to_string();
        if key.is_empty() {
            return false;
        }
        let Some(guard) = InFlight::acquire(&self.in_flight) else {
            debug!(key = %key, "workshop request already in flight");
            return false;
        };

        let entry = self.info.owner().entry_name().unwrap_or_default();
        let target = ReplyTarget::new(&entry, self.replies.clone());
        let client = self.client.clone();
        let spawned = thread::Builder::new()
            .name(format!("workshop-{key}"))
            .spawn(move || {
                let outcome = {
                    let _slot = guard;
                    match client.fetch_details(&key) {
                        Ok(details) => RemoteOutcome::WorkshopDetails(details),
                        Err(err) => {
                            warn!(key = %key, error = %err, "failed to query workshop info");
                            RemoteOutcome::Failed {
                                message: format!("{err:#}"),
                                endorsement: false,
                            }
                        }
                    }
                };
                target.send(outcome);
            });
        match spawned {
            Ok(_) => true,
            Err(err) => {
                warn!(error = %err, "failed to start workshop worker");
                false
            }
        }
    }

    fn translate_category(&self, _remote_id: &str) -> i64 {
        0
    }

    fn remote_name(&self) -> Option<String> {
        (!self.title.is_empty()).then(|| self.title.clone())
    }
}

impl Feature for SteamLink {
    fn attach(&mut self, owner: Owner) {
        self.info.attach(owner);
    }

    fn save_meta(&self, store: &mut MetaStore) {
        self.info.save_meta(store, self.repository_name());
    }

    fn read_meta(&mut self, store: &MetaStore) {
        self.info.read_meta(store);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::EntryState;
    use crate::remote::testing::{Call, FakeNexus, FakeWorkshop};
    use crate::remote::{WorkshopDetails, WorkshopClient};
    use anyhow::Result;
    use std::sync::{mpsc, Mutex, PoisonError};
    use std::time::Duration;
    use tempfile::TempDir;

    fn nexus(fake: Arc<FakeNexus>) -> (NexusLink, mpsc::Receiver<RemoteReply>) {
        let (tx, rx) = mpsc::channel();
        (NexusLink::new(fake, Arc::default(), tx), rx)
    }

    #[test]
    fn nexus_update_requires_positive_id() {
        let fake = Arc::new(FakeNexus::default());
        let (mut link, rx) = nexus(fake.clone());
        assert!(!link.update_info());
        link.info_mut().set_mod_id("0");
        assert!(!link.update_info());

        let state = Arc::new(EntryState::new("Sky"));
        link.attach(Owner::new(&state));
        link.info_mut().set_mod_id("42");
        assert!(state.is_dirty());
        assert!(link.update_info());
        assert_eq!(fake.calls(), vec![Call::Description(42)]);
        let reply = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(reply.entry, "Sky");
    }

    #[test]
    fn newest_version_and_description_only_dirty_on_change() {
        let state = Arc::new(EntryState::new("Sky"));
        let mut info = RepositoryInfo::new("1");
        info.attach(Owner::new(&state));
        info.set_newest_version(VersionInfo::default());
        info.set_description("");
        assert!(!state.is_dirty());
        info.set_description("new");
        assert!(state.is_dirty());
    }

    #[test]
    fn ignored_update_tracks_newest_version() {
        let mut info = RepositoryInfo::new("1");
        info.set_newest_version(VersionInfo::parse("2.0"));
        assert!(!info.update_ignored());
        info.ignore_update(true);
        assert!(info.update_ignored());
        info.set_newest_version(VersionInfo::parse("2.1"));
        assert!(!info.update_ignored());
        info.ignore_update(false);
        assert!(!info.update_ignored());
    }

    #[test]
    fn repository_meta_round_trip() {
        let dir = TempDir::new().unwrap();
        let mut info = RepositoryInfo::new("77");
        info.set_newest_version(VersionInfo::parse("1.5"));
        info.set_description("Rocks");
        info.mark_queried();

        let mut store = MetaStore::empty(dir.path());
        info.save_meta(&mut store, "Nexus");
        assert_eq!(store.string("repository").as_deref(), Some("Nexus"));

        let mut restored = RepositoryInfo::default();
        restored.read_meta(&store);
        assert_eq!(restored.mod_id(), "77");
        assert_eq!(restored.newest_version(), &VersionInfo::parse("1.5"));
        assert_eq!(restored.description(), "Rocks");
        assert!(restored.last_query_time().is_some());
    }

    #[test]
    fn nexus_translates_categories_through_catalog() {
        let (link, _rx) = nexus(Arc::new(FakeNexus::default()));
        assert_eq!(link.translate_category("55"), 19);
        assert_eq!(link.translate_category("nope"), 0);
    }

    struct GatedWorkshop {
        gate: Mutex<mpsc::Receiver<()>>,
    }

    impl WorkshopClient for GatedWorkshop {
        fn fetch_details(&self, _key: &str) -> Result<WorkshopDetails> {
            let gate = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
            let _ = gate.recv();
            Ok(WorkshopDetails {
                title: "Lanterns".into(),
                description: String::new(),
                time_updated: 5,
            })
        }
    }

    #[test]
    fn steam_allows_one_request_in_flight() {
        let (open_tx, open_rx) = mpsc::channel();
        let client = Arc::new(GatedWorkshop {
            gate: Mutex::new(open_rx),
        });
        let (tx, rx) = mpsc::channel();
        let mut link = SteamLink::new("123", client, tx);

        assert!(link.update_info());
        assert!(link.is_updating());
        assert!(!link.update_info());

        open_tx.send(()).unwrap();
        let reply = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(reply.outcome, RemoteOutcome::WorkshopDetails(_)));
        assert!(!link.is_updating());

        open_tx.send(()).unwrap();
        assert!(link.update_info());
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn steam_failure_still_releases_slot() {
        let (tx, rx) = mpsc::channel();
        let mut link = SteamLink::new("9", Arc::new(FakeWorkshop { details: None }), tx);
        assert!(link.update_info());
        let reply = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(!reply.outcome.is_success());
        assert!(!link.is_updating());
    }

    #[test]
    fn steam_without_key_sends_nothing() {
        let (tx, _rx) = mpsc::channel();
        let mut link = SteamLink::new("", Arc::new(FakeWorkshop { details: None }), tx);
        assert!(!link.update_info());
        assert_eq!(link.translate_category("5"), 0);
        assert_eq!(link.remote_name(), None);
    }
}
