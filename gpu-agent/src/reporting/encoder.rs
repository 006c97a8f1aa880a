//! Time-series encoding for `projects.timeSeries.create`

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use crate::discovery::HostIdentity;
use crate::metrics::{DeviceId, DeviceMetrics, GpuMetric};

const METRIC_TYPE_PREFIX: &str = "custom.googleapis.com";
const RESOURCE_TYPE: &str = "gce_instance";

/// Request body of one report
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeSeriesBatch {
    pub time_series: Vec<TimeSeries>,
}

impl TimeSeriesBatch {
    pub fn len(&self) -> usize {
        self.time_series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time_series.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeSeries {
    pub metric: Metric,
    pub resource: MonitoredResource,
    pub points: Vec<Point>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Metric {
    #[serde(rename = "type")]
    pub metric_type: String,
    pub labels: MetricLabels,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricLabels {
    pub gpu_type: String,
    pub gpu_bus_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitoredResource {
    #[serde(rename = "type")]
    pub resource_type: &'static str,
    pub labels: ResourceLabels,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceLabels {
    pub project_id: String,
    pub instance_id: String,
    pub zone: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Point {
    pub interval: TimeInterval,
    pub value: TypedValue,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeInterval {
    pub end_time: String,
}

/// Every metric, counts included, is sent as a double
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TypedValue {
    pub double_value: f64,
}

/// Build the single-point time series for one reading
pub fn encode(
    timestamp: DateTime<Utc>,
    metric: GpuMetric,
    value: f64,
    device: &DeviceId,
    host: &HostIdentity,
) -> TimeSeries {
    TimeSeries {
        metric: Metric {
            metric_type: format!("{}/{}", METRIC_TYPE_PREFIX, metric.metric_path()),
            labels: MetricLabels {
                gpu_type: device.device_type.clone(),
                gpu_bus_id: device.bus_id.clone(),
            },
        },
        resource: MonitoredResource {
            resource_type: RESOURCE_TYPE,
            labels: ResourceLabels {
                project_id: host.project_id.clone(),
                instance_id: host.instance_id.clone(),
                zone: host.zone.clone(),
            },
        },
        points: vec![Point {
            interval: TimeInterval {
                end_time: timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
            },
            value: TypedValue {
                double_value: value,
            },
        }],
    }
}

/// Encode every reading of a cycle under one shared timestamp
pub fn encode_batch(
    metrics: &DeviceMetrics,
    host: &HostIdentity,
    timestamp: DateTime<Utc>,
) -> TimeSeriesBatch {
    let time_series = metrics
        .iter()
        .flat_map(move |(device, reading)| {
            reading
                .iter()
                .map(move |(metric, value)| encode(timestamp, *metric, *value, device, host))
        })
        .collect();

    TimeSeriesBatch { time_series }
}
