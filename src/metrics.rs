//! Per-cycle metric collection from the external container manager.

use crate::{
    error::{BoxError, Error},
    ContainerMetrics,
};
use std::collections::HashMap;

/// The container manager collaborator: owns the set of live containers
/// and their measured CPU accounting.
pub trait ContainerManager {
    fn handles(&self) -> Result<Vec<String>, BoxError>;
    fn metrics(&self, handle: &str) -> Result<ContainerMetrics, BoxError>;
}

pub trait MetricsSource {
    fn collect_metrics(&self) -> Result<HashMap<String, ContainerMetrics>, Error>;
}

#[derive(Debug)]
pub struct ContainerMetricsSource<M> {
    container_manager: M,
}

impl<M> ContainerMetricsSource<M> {
    pub fn new(container_manager: M) -> Self {
        ContainerMetricsSource { container_manager }
    }
}

impl<M: ContainerManager> MetricsSource for ContainerMetricsSource<M> {
    /// Failing to list containers fails the whole collection; failing
    /// to fetch one container's metric only drops that container from
    /// the result, so one unhealthy container cannot stall throttling
    /// decisions for all the others.
    fn collect_metrics(&self) -> Result<HashMap<String, ContainerMetrics>, Error> {
        let handles = self
            .container_manager
            .handles()
            .map_err(|cause| Error::ListContainers { cause })?;

        let mut metrics = HashMap::with_capacity(handles.len());
        for handle in handles {
            match self.container_manager.metrics(&handle) {
                Ok(metric) => {
                    metrics.insert(handle, metric);
                }
                Err(error) => {
                    tracing::error!(handle = %handle, %error, "failed to fetch container metrics, skipping");
                }
            }
        }
        Ok(metrics)
    }
}
