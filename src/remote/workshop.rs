use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use std::time::Duration;

use super::{agent, WorkshopClient, WorkshopDetails, USER_AGENT};

const DETAILS_URL: &str =
    "https://api.steampowered.com/ISteamRemoteStorage/GetPublishedFileDetails/v1/";

#[derive(Debug, Deserialize)]
struct DetailsEnvelope {
    response: DetailsResponse,
}

#[derive(Debug, Deserialize)]
struct DetailsResponse {
    #[serde(default)]
    resultcount: u32,
    #[serde(default)]
    publishedfiledetails: Vec<PublishedFile>,
}

#[derive(Debug, Deserialize)]
struct PublishedFile {
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    time_updated: u64,
}

fn parse_details(key: &str, raw: &str) -> Result<WorkshopDetails> {
    let envelope: DetailsEnvelope =
        serde_json::from_str(raw).with_context(|| format!("parse workshop response for {key}"))?;
    if envelope.response.resultcount != 1 {
        bail!("no results in workshop response for {key}");
    }
    let file = envelope
        .response
        .publishedfiledetails
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("empty workshop details for {key}"))?;
    Ok(WorkshopDetails {
        title: file.title,
        description: file.description,
        time_updated: file.time_updated,
    })
}

pub struct HttpWorkshopClient {
    agent: ureq::Agent,
}

impl HttpWorkshopClient {
    pub fn new() -> Self {
        Self {
            agent: agent(Duration::from_secs(10)),
        }
    }
}

impl Default for HttpWorkshopClient {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkshopClient for HttpWorkshopClient {
    fn fetch_details(&self, key: &str) -> Result<WorkshopDetails> {
        let response = self
            .agent
            .post(DETAILS_URL)
            .set("User-Agent", USER_AGENT)
            .send_form(&[
                ("format", "json"),
                ("itemcount", "1"),
                ("publishedfileids[0]", key),
            ])
            .with_context(|| format!("query workshop info for {key}"))?;
        let raw = response
            .into_string()
            .with_context(|| format!("read workshop response for {key}"))?;
        parse_details(key, &raw)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct OfflineWorkshopClient;

impl WorkshopClient for OfflineWorkshopClient {
    fn fetch_details(&self, key: &str) -> Result<WorkshopDetails> {
        bail!("workshop lookups are disabled ({key})")
    }
}
