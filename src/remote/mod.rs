//! Clients for the mod-hosting site and the workshop service.
//!
//! Requests never block the caller. Every reply, success or failure, comes
//! back as a [`RemoteReply`] on the channel the registry drains.

pub mod nexus;
pub mod workshop;

use anyhow::Result;
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        mpsc::Sender,
    },
    time::Duration,
};

pub use nexus::{HttpNexusBridge, OfflineNexusBridge};
pub use workshop::{HttpWorkshopClient, OfflineWorkshopClient};

pub(crate) const USER_AGENT: &str = concat!("modroster/", env!("CARGO_PKG_VERSION"));

pub type RequestId = u64;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_request_id() -> RequestId {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

pub(crate) fn agent(read_timeout: Duration) -> ureq::Agent {
    ureq::AgentBuilder::new()
        .timeout_connect(Duration::from_secs(5))
        .timeout_read(read_timeout)
        .timeout_write(Duration::from_secs(10))
        .build()
}

/// Description of one mod as the hosting site reports it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModDescription {
    pub version: String,
    pub description: String,
    /// `None` when the reply did not say whether the user voted.
    pub endorsed: Option<bool>,
    pub category_id: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkshopDetails {
    pub title: String,
    pub description: String,
    pub time_updated: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteVersion {
    pub mod_id: i64,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteOutcome {
    Description(ModDescription),
    EndorsementToggled(bool),
    WorkshopDetails(WorkshopDetails),
    Updates(Vec<RemoteVersion>),
    Failed {
        message: String,
        /// Set when the failed request was an endorsement toggle.
        endorsement: bool,
    },
}

impl RemoteOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, RemoteOutcome::Failed { .. })
    }
}

#[derive(Debug, Clone)]
pub struct RemoteReply {
    pub request_id: RequestId,
    /// Internal name of the entry that issued the request; empty for
    /// batch requests that are not tied to one entry.
    pub entry: String,
    pub outcome: RemoteOutcome,
}

/// Where a reply has to go once a request completes.
#[derive(Debug, Clone)]
pub struct ReplyTarget {
    pub request_id: RequestId,
    pub entry: String,
    sender: Sender<RemoteReply>,
}

impl ReplyTarget {
    pub fn new(entry: &str, sender: Sender<RemoteReply>) -> Self {
        Self {
            request_id: next_request_id(),
            entry: entry.to_string(),
            sender,
        }
    }

    /// Posts the outcome. A dropped receiver means nobody is interested any
    /// more, which is not an error.
    pub fn send(self, outcome: RemoteOutcome) {
        let _ = self.sender.send(RemoteReply {
            request_id: self.request_id,
            entry: self.entry,
            outcome,
        });
    }
}

/// Asynchronous access to the mod-hosting site.
pub trait NexusBridge: Send + Sync {
    fn request_description(&self, target: ReplyTarget, mod_id: i64);
    fn request_toggle_endorsement(&self, target: ReplyTarget, mod_id: i64, endorse: bool);
    fn request_updates(&self, target: ReplyTarget, mod_ids: Vec<i64>);
}

/// Blocking access to the workshop service; callers run it off-thread.
pub trait WorkshopClient: Send + Sync {
    fn fetch_details(&self, key: &str) -> Result<WorkshopDetails>;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use anyhow::anyhow;
    use std::sync::{Mutex, PoisonError};

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Call {
        Description(i64),
        Endorse(i64, bool),
        Updates(Vec<i64>),
    }

    /// Records requests and answers them from a fixed script.
    #[derive(Default)]
    pub struct FakeNexus {
        pub calls: Mutex<Vec<Call>>,
        pub description: Option<ModDescription>,
        pub fail_with: Option<String>,
        pub versions: Vec<RemoteVersion>,
    }

    impl FakeNexus {
        pub fn calls(&self) -> Vec<Call> {
            self.calls
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }

        fn record(&self, call: Call) {
            self.calls
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(call);
        }

        fn failure(&self, endorsement: bool) -> Option<RemoteOutcome> {
            self.fail_with.as_ref().map(|message| RemoteOutcome::Failed {
                message: message.clone(),
                endorsement,
            })
        }
    }

    impl NexusBridge for FakeNexus {
        fn request_description(&self, target: ReplyTarget, mod_id: i64) {
            self.record(Call::Description(mod_id));
            let outcome = self.failure(false).unwrap_or_else(|| {
                RemoteOutcome::Description(self.description.clone().unwrap_or_default())
            });
            target.send(outcome);
        }

        fn request_toggle_endorsement(&self, target: ReplyTarget, mod_id: i64, endorse: bool) {
            self.record(Call::Endorse(mod_id, endorse));
            let outcome = self
                .failure(true)
                .unwrap_or(RemoteOutcome::EndorsementToggled(endorse));
            target.send(outcome);
        }

        fn request_updates(&self, target: ReplyTarget, mod_ids: Vec<i64>) {
            self.record(Call::Updates(mod_ids));
            target.send(RemoteOutcome::Updates(self.versions.clone()));
        }
    }

    pub struct FakeWorkshop {
        pub details: Option<WorkshopDetails>,
    }

    impl WorkshopClient for FakeWorkshop {
        fn fetch_details(&self, key: &str) -> Result<WorkshopDetails> {
            self.details
                .clone()
                .ok_or_else(|| anyhow!("no workshop item {key}"))
        }
    }
}
