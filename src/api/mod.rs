use crate::error::SyncError;
use crate::models::{PollEnvelope, PollSnapshot, ResultsBreakdown};
use async_trait::async_trait;
use chrono::Utc;
use log::debug;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;

// One authoritative read of a poll; retries are the caller's business
#[async_trait]
pub trait PollSource: Send + Sync + 'static {
    async fn fetch_poll_snapshot(&self, poll_id: &str) -> Result<PollSnapshot, SyncError>;

    async fn fetch_results(&self, poll_id: &str) -> Result<ResultsBreakdown, SyncError>;
}

pub struct HttpPollSource {
    client: Client,
    base_url: String,
}

impl HttpPollSource {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, SyncError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Network(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, poll_id: &str) -> Result<T, SyncError> {
        let url = self.url(path);
        debug!("GET {}", url);
        let response = self.client.get(&url).send().await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(SyncError::NotFound(poll_id.to_string()));
        }
        if !status.is_success() {
            return Err(SyncError::Server(format!("GET {} returned {}", url, status)));
        }
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl PollSource for HttpPollSource {
    async fn fetch_poll_snapshot(&self, poll_id: &str) -> Result<PollSnapshot, SyncError> {
        // Taken before the request goes out so a slow response cannot look newer than it is
        let requested_at = Utc::now();
        let envelope: PollEnvelope = self.get_json(&format!("polls/{}/", poll_id), poll_id).await?;
        Ok(envelope.into_record().into_snapshot(poll_id, requested_at))
    }

    async fn fetch_results(&self, poll_id: &str) -> Result<ResultsBreakdown, SyncError> {
        self.get_json(&format!("vote/results/{}/", poll_id), poll_id).await
    }
}
