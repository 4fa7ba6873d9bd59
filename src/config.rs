use std::env;
use std::path::Path;

use aws_config::{BehaviorVersion, SdkConfig};
use aws_credential_types::provider::{ProvideCredentials, SharedCredentialsProvider};
use chrono::{DateTime, Duration, Utc};

use crate::cloudwatch::MetricDataQuery;
use crate::{RelayError, Result};

/// Default lookback when no start time is given.
pub const DEFAULT_LOOKBACK_SECS: i64 = 3 * 60;

pub const DEFAULT_MACKEREL_BASE: &str = "https://api.mackerelio.com/";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if start >= end {
            return Err(RelayError::Configuration(format!(
                "start time {} must be before end time {}",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    /// Resolves command-line offsets against `now`.
    ///
    /// `0` selects the default (`now - 3m` for start, `now` for end), a
    /// positive value is unix seconds and a negative value is an offset in
    /// seconds before `now`.
    pub fn resolve(start: i64, end: i64, now: DateTime<Utc>) -> Result<Self> {
        let start = resolve_instant(start, now)?
            .unwrap_or_else(|| now - Duration::seconds(DEFAULT_LOOKBACK_SECS));
        let end = resolve_instant(end, now)?.unwrap_or(now);
        Self::new(start, end)
    }
}

fn resolve_instant(value: i64, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
    match value {
        0 => Ok(None),
        v if v < 0 => Duration::try_seconds(v)
            .and_then(|offset| now.checked_add_signed(offset))
            .map(Some)
            .ok_or_else(|| RelayError::Configuration(format!("offset {} is out of range", v))),
        v => DateTime::from_timestamp(v, 0)
            .map(Some)
            .ok_or_else(|| RelayError::Configuration(format!("time {} is out of range", v))),
    }
}

#[derive(Debug, Clone)]
pub struct MackerelConfig {
    pub api_key: String,
    pub base_url: String,
}

impl MackerelConfig {
    pub fn new(api_key: Option<String>, base_url: Option<String>) -> Result<Self> {
        let api_key = api_key.filter(|k| !k.is_empty()).ok_or_else(|| {
            RelayError::Configuration(
                "--api-key or MACKEREL_APIKEY environment variable is required".to_string(),
            )
        })?;
        Ok(Self {
            api_key,
            base_url: base_url
                .filter(|b| !b.is_empty())
                .unwrap_or_else(|| DEFAULT_MACKEREL_BASE.to_string()),
        })
    }
}

#[derive(Debug, Clone)]
pub struct AwsConfig {
    pub region: String,
    pub credentials: SharedCredentialsProvider,
    pub endpoint: Option<String>,
}

impl AwsConfig {
    /// Resolves region and credentials through the AWS default provider
    /// chain: environment variables, the shared config and credentials files
    /// (honouring `AWS_PROFILE`), web identity tokens, then ECS and EC2
    /// instance roles.
    pub async fn load() -> Result<Self> {
        let sdk = aws_config::defaults(BehaviorVersion::latest()).load().await;
        Self::from_sdk_config(&sdk, |key| env::var(key).ok())
    }

    /// `AWS_ENDPOINT_URL_CLOUDWATCH` takes precedence over the shared
    /// `AWS_ENDPOINT_URL` setting.
    pub fn from_sdk_config<F>(sdk: &SdkConfig, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let region = sdk.region().map(|r| r.to_string()).ok_or_else(|| {
            RelayError::Configuration(
                "AWS region is not configured; set AWS_REGION or a region in the AWS profile"
                    .to_string(),
            )
        })?;
        let credentials = sdk.credentials_provider().ok_or_else(|| {
            RelayError::Configuration("no AWS credentials provider is available".to_string())
        })?;
        let endpoint = lookup("AWS_ENDPOINT_URL_CLOUDWATCH")
            .filter(|v| !v.is_empty())
            .or_else(|| sdk.endpoint_url().map(str::to_string));

        Ok(Self {
            region,
            credentials,
            endpoint,
        })
    }

    pub fn with_credentials(
        region: impl Into<String>,
        credentials: impl ProvideCredentials + 'static,
    ) -> Self {
        Self {
            region: region.into(),
            credentials: SharedCredentialsProvider::new(credentials),
            endpoint: None,
        }
    }

    pub fn endpoint(&self) -> String {
        self.endpoint
            .clone()
            .unwrap_or_else(|| format!("https://monitoring.{}.amazonaws.com/", self.region))
    }
}

/// Everything a run needs, resolved once before any network call.
#[derive(Debug, Clone)]
pub struct Options {
    pub window: TimeWindow,
    pub mackerel: MackerelConfig,
    pub aws: AwsConfig,
}

pub fn parse_queries(blob: &[u8]) -> Result<Vec<MetricDataQuery>> {
    serde_json::from_slice(blob).map_err(|e| {
        RelayError::Configuration(format!("failed to parse query as MetricDataQuery: {}", e))
    })
}

pub fn load_queries(path: &Path) -> Result<Vec<MetricDataQuery>> {
    let blob = std::fs::read(path).map_err(|e| {
        RelayError::Configuration(format!("failed to read {}: {}", path.display(), e))
    })?;
    parse_queries(&blob)
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_config::Region;
    use aws_credential_types::Credentials;
    use chrono::TimeZone;
    use std::collections::HashMap;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 30).unwrap()
    }

    #[test]
    fn test_default_window() {
        let window = TimeWindow::resolve(0, 0, now()).unwrap();
        assert_eq!(window.end, now());
        assert_eq!(window.start, now() - Duration::minutes(3));
    }

    #[test]
    fn test_relative_and_absolute_window() {
        let window = TimeWindow::resolve(-600, -60, now()).unwrap();
        assert_eq!(window.start, now() - Duration::minutes(10));
        assert_eq!(window.end, now() - Duration::minutes(1));

        let start = now().timestamp() - 3600;
        let window = TimeWindow::resolve(start, 0, now()).unwrap();
        assert_eq!(window.start.timestamp(), start);
    }

    #[test]
    fn test_inverted_window_is_rejected() {
        let err = TimeWindow::resolve(-60, -600, now()).unwrap_err();
        assert!(matches!(err, RelayError::Configuration(_)));
    }

    #[test]
    fn test_out_of_range_offsets_are_rejected() {
        for value in [i64::MIN, -(i64::MAX / 1_000)] {
            let err = TimeWindow::resolve(value, 0, now()).unwrap_err();
            assert!(matches!(err, RelayError::Configuration(_)), "{:?}", err);
        }
        assert!(TimeWindow::resolve(0, i64::MAX, now()).is_err());
    }

    #[test]
    fn test_mackerel_api_key_required() {
        assert!(MackerelConfig::new(None, None).is_err());
        assert!(MackerelConfig::new(Some(String::new()), None).is_err());

        let cfg = MackerelConfig::new(Some("key".into()), None).unwrap();
        assert_eq!(cfg.base_url, DEFAULT_MACKEREL_BASE);
    }

    fn sdk_config(region: Option<&'static str>, endpoint: Option<&str>, keys: bool) -> SdkConfig {
        let mut builder = SdkConfig::builder();
        if let Some(region) = region {
            builder = builder.region(Region::new(region));
        }
        if let Some(endpoint) = endpoint {
            builder = builder.endpoint_url(endpoint);
        }
        if keys {
            builder = builder.credentials_provider(SharedCredentialsProvider::new(
                Credentials::new("AKID", "secret", None, None, "profile"),
            ));
        }
        builder.build()
    }

    #[tokio::test]
    async fn test_aws_config_from_sdk_config() {
        let sdk = sdk_config(Some("ap-northeast-1"), None, true);

        let cfg = AwsConfig::from_sdk_config(&sdk, |_| None).unwrap();
        assert_eq!(cfg.region, "ap-northeast-1");
        assert_eq!(cfg.endpoint(), "https://monitoring.ap-northeast-1.amazonaws.com/");

        let resolved = cfg.credentials.provide_credentials().await.unwrap();
        assert_eq!(resolved.access_key_id(), "AKID");
        assert_eq!(resolved.secret_access_key(), "secret");
        assert!(resolved.session_token().is_none());
    }

    #[test]
    fn test_cloudwatch_endpoint_override() {
        let sdk = sdk_config(Some("us-east-1"), Some("http://localhost:4566"), true);
        let vars: HashMap<&str, &str> =
            [("AWS_ENDPOINT_URL_CLOUDWATCH", "http://localhost:9999/")].into_iter().collect();

        let shared = AwsConfig::from_sdk_config(&sdk, |_| None).unwrap();
        assert_eq!(shared.endpoint(), "http://localhost:4566");

        let specific =
            AwsConfig::from_sdk_config(&sdk, |k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(specific.endpoint(), "http://localhost:9999/");
    }

    #[test]
    fn test_aws_config_requires_region_and_credentials() {
        let err = AwsConfig::from_sdk_config(&sdk_config(None, None, true), |_| None).unwrap_err();
        assert!(err.to_string().contains("AWS_REGION"), "{}", err);

        let err = AwsConfig::from_sdk_config(&sdk_config(Some("us-east-1"), None, false), |_| None)
            .unwrap_err();
        assert!(matches!(err, RelayError::Configuration(_)));
    }

    #[test]
    fn test_parse_queries() {
        let blob = br#"[
            {
                "Id": "m1",
                "Label": "service=prod:elb.requests",
                "MetricStat": {
                    "Metric": {"Namespace": "AWS/ELB", "MetricName": "RequestCount"},
                    "Period": 60,
                    "Stat": "Sum"
                }
            },
            {"Id": "e1", "Expression": "m1 * 2", "Label": "host=abc:doubled", "Period": 300}
        ]"#;
        let queries = parse_queries(blob).unwrap();
        assert_eq!(queries.len(), 2);
        assert_eq!(queries[0].period(), Some(Duration::seconds(60)));
        assert_eq!(queries[1].period(), Some(Duration::seconds(300)));

        let err = parse_queries(b"{not json").unwrap_err();
        assert!(matches!(err, RelayError::Configuration(_)));
    }

    #[test]
    fn test_load_missing_query_file() {
        let err = load_queries(Path::new("/nonexistent/query.json")).unwrap_err();
        assert!(matches!(err, RelayError::Configuration(_)));
    }
}
