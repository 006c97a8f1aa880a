//! Cloud Monitoring reporting
//!
//! `encoder` turns device readings into the API's time-series schema,
//! `client` delivers one batch per cycle with bearer token refresh.

pub mod client;
pub mod encoder;

pub use client::{MetricsSink, MonitoringClient, TokenSource};
pub use encoder::{encode, encode_batch, TimeSeries, TimeSeriesBatch};
