use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::json;
use std::{sync::Arc, thread, time::Duration};
use tracing::{debug, warn};

use super::{
    agent, ModDescription, NexusBridge, RemoteOutcome, RemoteVersion, ReplyTarget, USER_AGENT,
};

const API_BASE: &str = "https://api.nexusmods.com/v1";

#[derive(Debug, Deserialize)]
struct ModInfoResponse {
    #[serde(default)]
    mod_id: i64,
    #[serde(default)]
    version: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    category_id: Option<i64>,
    #[serde(default)]
    endorsement: Option<EndorsementResponse>,
}

#[derive(Debug, Deserialize)]
struct EndorsementResponse {
    #[serde(default)]
    endorse_status: String,
}

impl From<ModInfoResponse> for ModDescription {
    fn from(response: ModInfoResponse) -> Self {
        let endorsed = response
            .endorsement
            .and_then(|endorsement| match endorsement.endorse_status.as_str() {
                "Endorsed" => Some(true),
                "Abstained" | "Undecided" => Some(false),
                _ => None,
            });
        ModDescription {
            version: response.version,
            description: response.description,
            endorsed,
            category_id: response.category_id,
        }
    }
}

struct NexusApi {
    agent: ureq::Agent,
    api_key: String,
    game_domain: String,
}

impl NexusApi {
    fn mod_url(&self, mod_id: i64, suffix: &str) -> String {
        format!("{API_BASE}/games/{}/mods/{mod_id}{suffix}", self.game_domain)
    }

    fn fetch_mod(&self, mod_id: i64) -> Result<ModInfoResponse> {
        let response = self
            .agent
            .get(&self.mod_url(mod_id, ".json"))
            .set("User-Agent", USER_AGENT)
            .set("apikey", &self.api_key)
            .call()
            .with_context(|| format!("fetch mod {mod_id}"))?;
        response
            .into_json()
            .with_context(|| format!("decode mod {mod_id}"))
    }

    fn toggle_endorsement(&self, mod_id: i64, endorse: bool, version: &str) -> Result<()> {
        let action = if endorse { "/endorse.json" } else { "/abstain.json" };
        self.agent
            .post(&self.mod_url(mod_id, action))
            .set("User-Agent", USER_AGENT)
            .set("apikey", &self.api_key)
            .send_json(json!({ "version": version }))
            .with_context(|| format!("toggle endorsement for mod {mod_id}"))?;
        Ok(())
    }
}

/// Talks to the hosting site's REST API, one worker thread per request.
#[derive(Clone)]
pub struct HttpNexusBridge {
    api: Arc<NexusApi>,
}

impl HttpNexusBridge {
    pub fn new(api_key: &str, game_domain: &str) -> Self {
        Self {
            api: Arc::new(NexusApi {
                agent: agent(Duration::from_secs(15)),
                api_key: api_key.to_string(),
                game_domain: game_domain.to_string(),
            }),
        }
    }

    fn spawn<F>(&self, target: ReplyTarget, endorsement: bool, job: F)
    where
        F: FnOnce(&NexusApi) -> Result<RemoteOutcome> + Send + 'static,
    {
        let api = self.api.clone();
        let request_id = target.request_id;
        let spawned = thread::Builder::new()
            .name(format!("nexus-{request_id}"))
            .spawn(move || {
                let outcome = job(&api).unwrap_or_else(|err| {
                    warn!(request = request_id, error = %err, "nexus request failed");
                    RemoteOutcome::Failed {
                        message: format!("{err:#}"),
                        endorsement,
                    }
                });
                target.send(outcome);
            });
        if let Err(err) = spawned {
            warn!(request = request_id, error = %err, "failed to start nexus worker");
        }
    }
}

impl NexusBridge for HttpNexusBridge {
    fn request_description(&self, target: ReplyTarget, mod_id: i64) {
        debug!(mod_id, "requesting mod description");
        self.spawn(target, false, move |api| {
            let response = api.fetch_mod(mod_id)?;
            Ok(RemoteOutcome::Description(response.into()))
        });
    }

    fn request_toggle_endorsement(&self, target: ReplyTarget, mod_id: i64, endorse: bool) {
        debug!(mod_id, endorse, "requesting endorsement toggle");
        self.spawn(target, true, move |api| {
            let current = api.fetch_mod(mod_id)?;
            api.toggle_endorsement(mod_id, endorse, &current.version)?;
            Ok(RemoteOutcome::EndorsementToggled(endorse))
        });
    }

    fn request_updates(&self, target: ReplyTarget, mod_ids: Vec<i64>) {
        debug!(count = mod_ids.len(), "requesting update check");
        self.spawn(target, false, move |api| {
            let mut versions = Vec::with_capacity(mod_ids.len());
            for mod_id in mod_ids {
                match api.fetch_mod(mod_id) {
                    Ok(response) => versions.push(RemoteVersion {
                        mod_id: if response.mod_id > 0 {
                            response.mod_id
                        } else {
                            mod_id
                        },
                        version: response.version,
                    }),
                    Err(err) => warn!(mod_id, error = %err, "update check skipped mod"),
                }
            }
            Ok(RemoteOutcome::Updates(versions))
        });
    }
}

/// Stand-in used when no API key is configured; every request fails at once.
#[derive(Debug, Default, Clone, Copy)]
pub struct OfflineNexusBridge;

impl OfflineNexusBridge {
    fn fail(target: ReplyTarget, endorsement: bool) {
        target.send(RemoteOutcome::Failed {
            message: "no Nexus API key configured".to_string(),
            endorsement,
        });
    }
}

impl NexusBridge for OfflineNexusBridge {
    fn request_description(&self, target: ReplyTarget, _mod_id: i64) {
        Self::fail(target, false);
    }

    fn request_toggle_endorsement(&self, target: ReplyTarget, _mod_id: i64, _endorse: bool) {
        Self::fail(target, true);
    }

    fn request_updates(&self, target: ReplyTarget, _mod_ids: Vec<i64>) {
        Self::fail(target, false);
    }
}
