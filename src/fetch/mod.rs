// src/fetch/mod.rs

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::Client;
use std::{future::Future, time::Duration};
use tracing::{debug, warn};
use url::Url;

use crate::{config::FetchConfig, countries::CountryTarget, error::FetchFailure};

pub mod pace;
pub mod urls;

pub use pace::Paced;
pub use urls::UrlTemplate;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchStatus {
    Ok,
    Failed(FetchFailure),
}

impl FetchStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, FetchStatus::Ok)
    }

    pub fn failure(&self) -> Option<&FetchFailure> {
        match self {
            FetchStatus::Ok => None,
            FetchStatus::Failed(f) => Some(f),
        }
    }
}

/// The HTML of one country page. Consumed by the extractor and then dropped.
#[derive(Debug, Clone)]
pub struct RawPage {
    pub target: CountryTarget,
    pub html: String,
    pub fetched_at: DateTime<Utc>,
    pub status: FetchStatus,
}

impl RawPage {
    pub fn new(target: CountryTarget, status: FetchStatus, html: String) -> Self {
        Self {
            target,
            html,
            fetched_at: Utc::now(),
            status,
        }
    }

    pub fn failed(target: CountryTarget, failure: FetchFailure) -> Self {
        Self::new(target, FetchStatus::Failed(failure), String::new())
    }
}

/// Anything that can produce the page for a country.
///
/// Implementations report failures through `RawPage::status`, never by panicking.
pub trait PageSource {
    fn fetch(&self, target: &CountryTarget) -> impl Future<Output = RawPage> + Send;
}

/// Fetches country pages over HTTP with one shared, reusable client.
#[derive(Clone)]
pub struct PageFetcher {
    client: Client,
    template: UrlTemplate,
    timeout: Duration,
}

impl PageFetcher {
    pub fn new(cfg: &FetchConfig) -> Result<Self> {
        let template = UrlTemplate::parse(&cfg.url_template)?;
        let client = Client::builder()
            .user_agent(cfg.user_agent.clone())
            .cookie_store(true)
            .timeout(cfg.timeout())
            .build()
            .context("building HTTP client")?;
        Ok(Self {
            client,
            template,
            timeout: cfg.timeout(),
        })
    }

    pub fn url_for(&self, target: &CountryTarget) -> Result<Url> {
        self.template.url_for(target.id)
    }

    async fn get_text(&self, url: &Url) -> Result<String, FetchFailure> {
        let resp = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchFailure::Status {
                status: status.as_u16(),
            });
        }

        resp.text().await.map_err(|e| self.classify(e))
    }

    fn classify(&self, err: reqwest::Error) -> FetchFailure {
        if err.is_timeout() {
            FetchFailure::Timeout {
                after_ms: self.timeout.as_millis() as u64,
            }
        } else if let Some(status) = err.status() {
            FetchFailure::Status {
                status: status.as_u16(),
            }
        } else {
            FetchFailure::Network {
                reason: err.to_string(),
            }
        }
    }
}

impl PageSource for PageFetcher {
    async fn fetch(&self, target: &CountryTarget) -> RawPage {
        let url = match self.url_for(target) {
            Ok(u) => u,
            Err(e) => {
                return RawPage::failed(
                    target.clone(),
                    FetchFailure::Network {
                        reason: e.to_string(),
                    },
                )
            }
        };

        debug!(country_id = target.id, %url, "GET");
        match self.get_text(&url).await {
            Ok(html) => {
                debug!(country_id = target.id, bytes = html.len(), "fetched");
                RawPage::new(target.clone(), FetchStatus::Ok, html)
            }
            Err(failure) => {
                warn!(country_id = target.id, %url, error = %failure, "fetch failed");
                RawPage::failed(target.clone(), failure)
            }
        }
    }
}
