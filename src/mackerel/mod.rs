//! Mackerel time-series write API.

use async_trait::async_trait;
use reqwest::Url;
use serde::Deserialize;
use tracing::debug;

use crate::config::MackerelConfig;
use crate::models::{HostMetricValue, MetricValue};
use crate::{RelayError, Result};

#[async_trait]
pub trait MonitoringSink: Send + Sync {
    async fn post_service_metric_values(&self, service: &str, values: &[MetricValue])
        -> Result<()>;

    async fn post_host_metric_values(&self, values: &[HostMetricValue]) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ErrorDetail {
    Message { message: String },
    Text(String),
}

pub struct MackerelClient {
    http: reqwest::Client,
    base: Url,
    api_key: String,
}

impl MackerelClient {
    pub fn new(config: &MackerelConfig) -> Result<Self> {
        let base = Url::parse(&config.base_url)
            .map_err(|e| RelayError::Configuration(format!("invalid Mackerel base URL: {}", e)))?;
        if base.cannot_be_a_base() {
            return Err(RelayError::Configuration(format!(
                "Mackerel base URL {} cannot carry a path",
                base
            )));
        }
        let http = reqwest::Client::builder()
            .user_agent(concat!("cw2mkr/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RelayError::Configuration(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base,
            api_key: config.api_key.clone(),
        })
    }

    /// Appends `segments` to the base path, percent-encoding each one so a
    /// service name can never add segments or a query.
    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| RelayError::Publish(format!("{} cannot carry a path", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn post<T: serde::Serialize + ?Sized>(&self, url: Url, body: &T) -> Result<()> {
        let path = url.path().to_string();
        debug!(%url, "POST");

        let response = self
            .http
            .post(url)
            .header("X-Api-Key", &self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| RelayError::Publish(format!("POST {} failed: {}", path, e)))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let text = response.text().await.unwrap_or_default();
        let detail = match serde_json::from_str::<ErrorBody>(&text) {
            Ok(ErrorBody {
                error: ErrorDetail::Message { message },
            }) => message,
            Ok(ErrorBody {
                error: ErrorDetail::Text(message),
            }) => message,
            Err(_) => text,
        };
        Err(RelayError::Publish(format!(
            "POST {} returned {}: {}",
            path, status, detail
        )))
    }
}

#[async_trait]
impl MonitoringSink for MackerelClient {
    async fn post_service_metric_values(
        &self,
        service: &str,
        values: &[MetricValue],
    ) -> Result<()> {
        let url = self.endpoint(&["api", "v0", "services", service, "tsdb"])?;
        self.post(url, values).await
    }

    async fn post_host_metric_values(&self, values: &[HostMetricValue]) -> Result<()> {
        let url = self.endpoint(&["api", "v0", "tsdb"])?;
        self.post(url, values).await
    }
}
