use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single sample returned by the metrics query API.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DataPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

impl DataPoint {
    pub fn new(timestamp: DateTime<Utc>, value: f64) -> Self {
        Self { timestamp, value }
    }

    pub fn zero(timestamp: DateTime<Utc>) -> Self {
        Self::new(timestamp, 0.0)
    }
}

/// Mackerel service metric value. `time` is unix seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricValue {
    pub name: String,
    pub time: i64,
    pub value: f64,
}

/// Mackerel host metric value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostMetricValue {
    #[serde(rename = "hostId")]
    pub host_id: String,
    #[serde(flatten)]
    pub metric: MetricValue,
}
