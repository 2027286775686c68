//! The per-cycle decision function: containers over their entitlement
//! get punished, everyone else gets released.

use crate::{
    enforcer::Enforcer,
    error::{AggregateError, Error},
    metrics::MetricsSource,
    service::Runnable,
    ContainerMetrics,
};

pub struct Throttler<M, E> {
    metrics_source: M,
    enforcer: E,
}

impl<M, E> Throttler<M, E> {
    pub fn new(metrics_source: M, enforcer: E) -> Self {
        Throttler {
            metrics_source,
            enforcer,
        }
    }
}

impl<M: MetricsSource, E: Enforcer> Throttler<M, E> {
    fn throttle(&self, handle: &str, metric: ContainerMetrics) -> Result<(), Error> {
        if metric.cpu_entitlement < metric.cpu.usage {
            tracing::debug!(
                handle,
                entitlement = metric.cpu_entitlement,
                usage = metric.cpu.usage,
                "punishing container"
            );
            self.enforcer.punish(handle)
        } else {
            tracing::debug!(
                handle,
                entitlement = metric.cpu_entitlement,
                usage = metric.cpu.usage,
                "releasing container"
            );
            self.enforcer.release(handle)
        }
    }
}

impl<M: MetricsSource + Send + Sync, E: Enforcer + Send + Sync> Runnable for Throttler<M, E> {
    fn name(&self) -> &'static str {
        "throttler"
    }

    /// One cycle. Enforcement failures are collected per handle rather
    /// than short-circuiting, so one broken container never shields
    /// the rest from a decision.
    fn run(&self) -> Result<(), Error> {
        tracing::info!("throttle cycle starting");
        let metrics = self.metrics_source.collect_metrics()?;

        let mut failures = AggregateError::default();
        for (handle, metric) in metrics {
            if let Err(error) = self.throttle(&handle, metric) {
                failures.push(handle, error);
            }
        }
        tracing::info!("throttle cycle finished");
        failures.into_result()
    }
}
