//! `monitoring.coreos.com/v1` resources

pub mod alertmanager;
pub mod monitors;
pub mod prometheus;

pub use alertmanager::{Alertmanager, AlertmanagerSpec};
pub use monitors::{PodMonitor, Probe, ServiceMonitor};
pub use prometheus::{CommonPrometheusFields, Prometheus, PrometheusSpec};
