use std::collections::BTreeMap;

use crate::models::{HostMetricValue, MetricValue};

use super::fetcher::FetchResults;

/// Values ready for posting, split by destination.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupedMetrics {
    pub services: BTreeMap<String, Vec<MetricValue>>,
    pub hosts: Vec<HostMetricValue>,
}

impl GroupedMetrics {
    pub fn len(&self) -> usize {
        self.services.values().map(Vec::len).sum::<usize>() + self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub fn group(results: &FetchResults) -> GroupedMetrics {
    let mut grouped = GroupedMetrics::default();

    for series in results.values() {
        let label = &series.label;
        for point in &series.points {
            let value = MetricValue {
                name: label.name.clone(),
                time: point.timestamp.timestamp(),
                value: point.value,
            };
            if label.is_service() {
                grouped
                    .services
                    .entry(label.service.clone())
                    .or_default()
                    .push(value);
            } else {
                grouped.hosts.push(HostMetricValue {
                    host_id: label.host_id.clone(),
                    metric: value,
                });
            }
        }
    }

    grouped
}
