//! CloudWatch `GetMetricData` over the AWS JSON 1.0 protocol.

pub mod sigv4;

use std::time::{Duration as StdDuration, SystemTime};

use async_trait::async_trait;
use aws_credential_types::provider::{ProvideCredentials, SharedCredentialsProvider};
use chrono::{DateTime, Duration, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::AwsConfig;
use crate::models::DataPoint;
use crate::{RelayError, Result};

use self::sigv4::{Credentials, SignableRequest};

const SERVICE: &str = "monitoring";
const TARGET: &str = "GraniteServiceVersion20100801.GetMetricData";
const CONTENT_TYPE: &str = "application/x-amz-json-1.0";
/// Credentials this close to expiry are refreshed before signing.
const CREDENTIAL_REFRESH_MARGIN: StdDuration = StdDuration::from_secs(5 * 60);

/// A query as written in the query file. Only the label and period are
/// interpreted; every other field is forwarded to CloudWatch as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MetricDataQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric_stat: Option<MetricStat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MetricStat {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MetricDataQuery {
    /// Sampling period, `MetricStat.Period` first, then the expression `Period`.
    /// A value too large to represent counts as no period.
    pub fn period(&self) -> Option<Duration> {
        self.metric_stat
            .as_ref()
            .and_then(|stat| stat.period)
            .or(self.period)
            .and_then(Duration::try_seconds)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct GetMetricDataInput {
    #[serde(with = "chrono::serde::ts_seconds")]
    pub start_time: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub end_time: DateTime<Utc>,
    pub metric_data_queries: Vec<MetricDataQuery>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_token: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GetMetricDataOutput {
    #[serde(default)]
    pub metric_data_results: Vec<MetricDataResult>,
    #[serde(default)]
    pub next_token: Option<String>,
    #[serde(default)]
    pub messages: Vec<MessageData>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MetricDataResult {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    /// Epoch seconds.
    #[serde(default)]
    pub timestamps: Vec<f64>,
    #[serde(default)]
    pub values: Vec<f64>,
    #[serde(default)]
    pub status_code: Option<String>,
}

impl MetricDataResult {
    pub fn points(&self) -> Vec<DataPoint> {
        self.timestamps
            .iter()
            .zip(&self.values)
            .filter_map(|(ts, value)| {
                DateTime::from_timestamp(ts.trunc() as i64, 0).map(|t| DataPoint::new(t, *value))
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MessageData {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AwsErrorBody {
    #[serde(rename = "__type", default)]
    kind: Option<String>,
    #[serde(alias = "Message", default)]
    message: Option<String>,
}

#[async_trait]
pub trait MetricDataSource: Send + Sync {
    async fn get_metric_data(&self, input: &GetMetricDataInput) -> Result<GetMetricDataOutput>;
}

pub struct CloudWatchClient {
    http: reqwest::Client,
    endpoint: Url,
    host: String,
    region: String,
    provider: SharedCredentialsProvider,
    cached: Mutex<Option<aws_credential_types::Credentials>>,
}

impl CloudWatchClient {
    pub fn new(config: &AwsConfig) -> Result<Self> {
        let endpoint = Url::parse(&config.endpoint()).map_err(|e| {
            RelayError::Configuration(format!("invalid CloudWatch endpoint: {}", e))
        })?;
        let host = match (endpoint.host_str(), endpoint.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => {
                return Err(RelayError::Configuration(format!(
                    "CloudWatch endpoint {} has no host",
                    endpoint
                )))
            }
        };
        let http = reqwest::Client::builder()
            .user_agent(concat!("cw2mkr/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RelayError::Configuration(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            endpoint,
            host,
            region: config.region.clone(),
            provider: config.credentials.clone(),
            cached: Mutex::new(None),
        })
    }

    async fn credentials(&self) -> Result<Credentials> {
        let mut cached = self.cached.lock().await;
        if let Some(current) = cached.as_ref().filter(|c| !expires_soon(c)) {
            return Ok(signing_credentials(current));
        }

        debug!("resolving AWS credentials");
        let fresh = self
            .provider
            .provide_credentials()
            .await
            .map_err(|e| RelayError::Fetch(format!("failed to resolve AWS credentials: {}", e)))?;
        let signing = signing_credentials(&fresh);
        *cached = Some(fresh);
        Ok(signing)
    }
}

fn expires_soon(credentials: &aws_credential_types::Credentials) -> bool {
    credentials
        .expiry()
        .map_or(false, |expiry| expiry <= SystemTime::now() + CREDENTIAL_REFRESH_MARGIN)
}

fn signing_credentials(credentials: &aws_credential_types::Credentials) -> Credentials {
    Credentials {
        access_key_id: credentials.access_key_id().to_string(),
        secret_access_key: credentials.secret_access_key().to_string(),
        session_token: credentials.session_token().map(str::to_string),
    }
}

#[async_trait]
impl MetricDataSource for CloudWatchClient {
    async fn get_metric_data(&self, input: &GetMetricDataInput) -> Result<GetMetricDataOutput> {
        let credentials = self.credentials().await?;
        let body = serde_json::to_vec(input)?;
        let now = Utc::now();
        let amz_date = sigv4::amz_date(now);

        let mut headers = vec![
            ("content-type".to_string(), CONTENT_TYPE.to_string()),
            ("host".to_string(), self.host.clone()),
            ("x-amz-date".to_string(), amz_date),
            ("x-amz-target".to_string(), TARGET.to_string()),
        ];
        if let Some(token) = &credentials.session_token {
            headers.push(("x-amz-security-token".to_string(), token.clone()));
        }
        let authorization = sigv4::authorization(
            &credentials,
            &self.region,
            SERVICE,
            now,
            &SignableRequest {
                method: "POST",
                path: self.endpoint.path(),
                query: "",
                headers: headers.clone(),
                payload: &body,
            },
        );

        debug!(
            start = %input.start_time,
            end = %input.end_time,
            queries = input.metric_data_queries.len(),
            next_token = input.next_token.as_deref().unwrap_or(""),
            "GetMetricData"
        );

        let mut request = self.http.post(self.endpoint.clone());
        for (name, value) in headers.iter().filter(|(name, _)| name != "host") {
            request = request.header(name.as_str(), value.as_str());
        }
        let response = request
            .header("authorization", authorization)
            .body(body)
            .send()
            .await
            .map_err(|e| RelayError::Fetch(format!("GetMetricData request failed: {}", e)))?;

        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| RelayError::Fetch(format!("failed to read GetMetricData response: {}", e)))?;

        if !status.is_success() {
            let detail = serde_json::from_slice::<AwsErrorBody>(&bytes)
                .ok()
                .map(|err| {
                    format!(
                        "{}: {}",
                        err.kind.unwrap_or_default(),
                        err.message.unwrap_or_default()
                    )
                })
                .unwrap_or_else(|| String::from_utf8_lossy(&bytes).into_owned());
            return Err(RelayError::Fetch(format!(
                "GetMetricData returned {}: {}",
                status, detail
            )));
        }

        serde_json::from_slice(&bytes)
            .map_err(|e| RelayError::Fetch(format!("invalid GetMetricData response: {}", e)))
    }
}
