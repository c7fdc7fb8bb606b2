// Copyright 2025 Vigil Maintainers
// SPDX-License-Identifier: Apache-2.0

//! Custom resource definitions watched by the vigil operator

pub mod common;
pub mod v1;
pub mod v1_alpha1;

pub use v1::{Alertmanager, PodMonitor, Probe, Prometheus, ServiceMonitor};
pub use v1_alpha1::PrometheusAgent;
