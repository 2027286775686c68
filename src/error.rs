use crate::{cgfs::CgroupError, hierarchy::StartError};
use std::fmt;

/// Opaque error type used at collaborator seams (container manager,
/// memory provider). Collaborators live outside this crate and report
/// whatever error type they like.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("cgroup hierarchy bootstrap failed")]
    Bootstrap {
        #[from]
        cause: StartError,
    },
    #[error("cgroup manipulation failed")]
    Cgroup {
        #[from]
        cause: CgroupError,
    },
    #[error("failed to list container handles")]
    ListContainers {
        #[source]
        cause: BoxError,
    },
    #[error("failed to read total system memory")]
    TotalMemory {
        #[source]
        cause: BoxError,
    },
    #[error("{cause}")]
    Aggregate {
        #[from]
        cause: AggregateError,
    },
}

/// Collects per-item failures of one cycle so a single misbehaving
/// container (or runnable) never hides the rest. Each entry is labeled
/// with the handle or runnable it came from.
#[derive(Debug, Default)]
pub struct AggregateError {
    pub failures: Vec<(String, Error)>,
}

impl AggregateError {
    pub fn push(&mut self, label: impl Into<String>, error: Error) {
        self.failures.push((label.into(), error));
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    /// Ok if nothing failed, the aggregate otherwise.
    pub fn into_result(self) -> Result<(), Error> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self.into())
        }
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} failure(s):", self.failures.len())?;
        for (label, error) in &self.failures {
            writeln!(f, "{}:", label)?;
            let mut cur = error as &dyn std::error::Error;
            loop {
                writeln!(f, "\t{}", cur)?;
                cur = match cur.source() {
                    Some(next) => next,
                    None => break,
                };
            }
        }
        Ok(())
    }
}

impl std::error::Error for AggregateError {}
