//! Load-driven weight recomputation
//!
//! When no weight is pinned, a periodic task samples process-host CPU
//! utilization, smooths it, and maps the headroom to an integer weight that
//! client-side load balancers consume. A changed weight rewrites the local
//! meta and gossips it to the cluster.

use crate::registry::RegistryDelegate;
use std::sync::Arc;
use std::time::Duration;
use svcmesh_gossip::Cluster;
use sysinfo::System;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, warn};

/// Smallest weight ever advertised; zero would drop the node from rotation.
pub const MIN_WEIGHT: i32 = 1;

/// Weight advertised by an idle node.
pub const MAX_WEIGHT: i32 = 100;

/// EWMA factor applied to each new CPU sample.
const SMOOTHING: f64 = 0.3;

/// Map smoothed CPU utilization (percent) to a weight.
pub(crate) fn weight_from_usage(cpu_percent: f64) -> i32 {
    let headroom = (100.0 - cpu_percent.clamp(0.0, 100.0)) / 100.0;
    (f64::from(MIN_WEIGHT) + headroom * f64::from(MAX_WEIGHT - MIN_WEIGHT)).round() as i32
}

/// Smoothed CPU sampler.
pub(crate) struct WeightSampler {
    sys: System,
    ewma: f64,
}

impl WeightSampler {
    pub(crate) fn new() -> Self {
        Self {
            sys: System::new(),
            ewma: 0.0,
        }
    }

    /// Take one sample and return the resulting weight.
    pub(crate) fn sample(&mut self) -> i32 {
        self.sys.refresh_cpu();
        let usage = f64::from(self.sys.global_cpu_info().cpu_usage());
        self.ewma = SMOOTHING * usage + (1.0 - SMOOTHING) * self.ewma;
        weight_from_usage(self.ewma)
    }
}

/// Start the recomputation task. Ends when the cluster shuts down.
pub(crate) fn spawn_weight_loop(
    cluster: Arc<Cluster>,
    delegate: Arc<RegistryDelegate>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut sampler = WeightSampler::new();
        let mut ticker = interval(period);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    let weight = sampler.sample();
                    if weight == delegate.weight() {
                        continue;
                    }
                    let mut merged = delegate.merged();
                    merged.meta.weight = weight;
                    match delegate.set_meta(merged) {
                        Ok(()) => {
                            debug!(weight, "recomputed weight");
                            if let Err(e) = cluster.update_meta() {
                                warn!("weight gossip failed: {e}");
                            }
                        }
                        Err(e) => warn!("weight meta rewrite failed: {e}"),
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weight_mapping() {
        assert_eq!(weight_from_usage(0.0), MAX_WEIGHT);
        assert_eq!(weight_from_usage(100.0), MIN_WEIGHT);
        assert_eq!(weight_from_usage(50.0), 51);
        // Out-of-range samples are clamped.
        assert_eq!(weight_from_usage(-5.0), MAX_WEIGHT);
        assert_eq!(weight_from_usage(250.0), MIN_WEIGHT);
    }

    #[test]
    fn test_weight_monotone_in_load() {
        let mut previous = weight_from_usage(0.0);
        for load in 1..=100 {
            let weight = weight_from_usage(f64::from(load));
            assert!(weight <= previous);
            previous = weight;
        }
    }

    #[test]
    fn test_sampler_smooths() {
        let mut sampler = WeightSampler::new();
        // The first sample leaves most of the EWMA at zero, so the weight
        // stays near the idle maximum regardless of instantaneous load.
        let weight = sampler.sample();
        assert!(weight >= weight_from_usage(SMOOTHING * 100.0));
        assert!(weight <= MAX_WEIGHT);
    }
}
