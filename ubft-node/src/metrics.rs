// SPDX-License-Identifier: Apache-2.0

//! Ambient instrumentation, following `consensus-core`'s `Context { metrics, .. }`
//! pattern: one `Metrics` struct registered against a `prometheus::Registry` once at
//! startup and handed (by reference) to whatever needs to bump a counter.

use prometheus::{IntCounter, Registry};

pub struct Metrics {
    pub requests_accepted: IntCounter,
    pub requests_proposed: IntCounter,
    pub instances_decided: IntCounter,
    pub view_changes: IntCounter,
    pub checkpoints: IntCounter,
}

impl Metrics {
    pub fn new(registry: &Registry) -> Self {
        let requests_accepted = IntCounter::new("ubft_requests_accepted_total", "client requests admitted into local ingress").unwrap();
        let requests_proposed = IntCounter::new("ubft_requests_proposed_total", "client requests packed into a proposed batch").unwrap();
        let instances_decided = IntCounter::new("ubft_instances_decided_total", "consensus instances decided").unwrap();
        let view_changes = IntCounter::new("ubft_view_changes_total", "view changes completed").unwrap();
        let checkpoints = IntCounter::new("ubft_checkpoints_total", "checkpoints triggered").unwrap();

        for counter in [&requests_accepted, &requests_proposed, &instances_decided, &view_changes, &checkpoints] {
            registry.register(Box::new(counter.clone())).expect("metric names are unique within this process");
        }

        Self { requests_accepted, requests_proposed, instances_decided, view_changes, checkpoints }
    }
}
