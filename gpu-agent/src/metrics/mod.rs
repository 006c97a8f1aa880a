//! GPU metrics collection for the agent
//!
//! Provides per-device readings from nvidia-smi:
//! - Closed set of recognized metrics and their Cloud Monitoring paths
//! - Device identity keyed by (GPU name, PCI bus id)
//! - CSV report parsing with a computed memory used percentage

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

use crate::error::CollectError;
use crate::execution::run_command;

/// Metrics the agent knows how to query and report
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum GpuMetric {
    Utilization,
    MemoryUtilization,
    MemoryTotal,
    MemoryUsed,
    MemoryFree,
    Temperature,
    /// Derived from `MemoryUsed` / `MemoryTotal`, never queried
    MemoryUsedPercent,
}

impl GpuMetric {
    /// Metrics requested from the query tool
    pub const QUERIED: [GpuMetric; 6] = [
        GpuMetric::Utilization,
        GpuMetric::MemoryUtilization,
        GpuMetric::MemoryTotal,
        GpuMetric::MemoryUsed,
        GpuMetric::MemoryFree,
        GpuMetric::Temperature,
    ];

    #[cfg(test)]
    pub const ALL: [GpuMetric; 7] = [
        GpuMetric::Utilization,
        GpuMetric::MemoryUtilization,
        GpuMetric::MemoryTotal,
        GpuMetric::MemoryUsed,
        GpuMetric::MemoryFree,
        GpuMetric::Temperature,
        GpuMetric::MemoryUsedPercent,
    ];

    /// Field name understood by `nvidia-smi --query-gpu`
    pub fn query_field(self) -> &'static str {
        match self {
            GpuMetric::Utilization => "utilization.gpu",
            GpuMetric::MemoryUtilization => "utilization.memory",
            GpuMetric::MemoryTotal => "memory.total",
            GpuMetric::MemoryUsed => "memory.used",
            GpuMetric::MemoryFree => "memory.free",
            GpuMetric::Temperature => "temperature.gpu",
            GpuMetric::MemoryUsedPercent => "memory.used_percent",
        }
    }

    /// Custom metric path under `custom.googleapis.com/`
    pub fn metric_path(self) -> &'static str {
        match self {
            GpuMetric::Utilization => "instance/gpu/utilization",
            GpuMetric::MemoryUtilization => "instance/gpu/memory_utilization",
            GpuMetric::MemoryTotal => "instance/gpu/memory_total",
            GpuMetric::MemoryUsed => "instance/gpu/memory_used",
            GpuMetric::MemoryFree => "instance/gpu/memory_free",
            GpuMetric::Temperature => "instance/gpu/temperature",
            GpuMetric::MemoryUsedPercent => "instance/gpu/memory_used_percent",
        }
    }

    /// Queried metrics ordered by field name, the column order of the report
    pub fn query_columns() -> Vec<GpuMetric> {
        let mut columns = Self::QUERIED.to_vec();
        columns.sort_by_key(|metric| metric.query_field());
        columns
    }
}

/// One physical GPU on the host
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId {
    pub device_type: String,
    pub bus_id: String,
}

impl DeviceId {
    pub fn new(device_type: impl Into<String>, bus_id: impl Into<String>) -> Self {
        Self {
            device_type: device_type.into(),
            bus_id: bus_id.into(),
        }
    }
}

/// Readings for a single device in one cycle
pub type DeviceReading = BTreeMap<GpuMetric, f64>;

/// Readings for every device in one cycle
pub type DeviceMetrics = BTreeMap<DeviceId, DeviceReading>;

/// Source of one cycle's device readings
#[async_trait]
pub trait MetricsCollector: Send {
    async fn collect(&mut self) -> Result<DeviceMetrics, CollectError>;
}

/// `nvidia-smi` backed collector
pub struct NvidiaSmi {
    tool: PathBuf,
    timeout: Duration,
}

impl NvidiaSmi {
    pub fn new(tool: PathBuf, timeout: Duration) -> Self {
        Self { tool, timeout }
    }

    /// Arguments of the per-cycle query invocation
    pub fn query_args() -> Vec<String> {
        let fields: Vec<&str> = ["gpu_name", "gpu_bus_id"]
            .into_iter()
            .chain(GpuMetric::query_columns().into_iter().map(GpuMetric::query_field))
            .collect();

        vec![
            format!("--query-gpu={}", fields.join(",")),
            "--format=csv,noheader,nounits".to_string(),
        ]
    }
}

#[async_trait]
impl MetricsCollector for NvidiaSmi {
    async fn collect(&mut self) -> Result<DeviceMetrics, CollectError> {
        debug!("Collecting GPU metrics...");

        let args = Self::query_args();
        let report = run_command(&self.tool, &args[..], self.timeout).await?;
        let metrics = parse_report(&report)?;

        debug!("Collected readings for {} GPU(s)", metrics.len());
        Ok(metrics)
    }
}

/// Parse a `--format=csv,noheader,nounits` report into per-device readings
pub fn parse_report(report: &str) -> Result<DeviceMetrics, CollectError> {
    let columns = GpuMetric::query_columns();
    let expected = columns.len() + 2;
    let mut devices = DeviceMetrics::new();

    for (index, line) in report.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }

        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() != expected {
            return Err(CollectError::FieldCount {
                line: index + 1,
                expected,
                found: fields.len(),
            });
        }

        let device = DeviceId::new(fields[0], fields[1]);
        let mut reading = DeviceReading::new();

        for (metric, raw) in columns.iter().zip(&fields[2..]) {
            if is_unavailable(raw) {
                debug!("{} unavailable on {}: {}", metric.query_field(), device.bus_id, raw);
                continue;
            }

            let value = raw
                .parse::<f64>()
                .ok()
                .filter(|value| value.is_finite())
                .ok_or_else(|| CollectError::InvalidValue {
                    line: index + 1,
                    field: metric.query_field(),
                    value: raw.to_string(),
                })?;
            reading.insert(*metric, value);
        }

        if let Some(percent) = memory_used_percent(&reading) {
            reading.insert(GpuMetric::MemoryUsedPercent, percent);
        }

        devices.insert(device, reading);
    }

    Ok(devices)
}

/// `round(used / total * 100)`, absent when total is zero or either input is missing
pub fn memory_used_percent(reading: &DeviceReading) -> Option<f64> {
    let used = *reading.get(&GpuMetric::MemoryUsed)?;
    let total = *reading.get(&GpuMetric::MemoryTotal)?;

    if total == 0.0 {
        return None;
    }

    Some((used / total * 100.0).round_ties_even())
}

// nvidia-smi prints "[N/A]" or "[Not Supported]" for fields a board lacks
fn is_unavailable(raw: &str) -> bool {
    raw.starts_with("[N/A]") || raw.starts_with("[Not Supported]")
}
