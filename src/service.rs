//! The scheduling harness: composes the per-cycle units of work and
//! drives them from an externally owned timer on one background
//! worker.

use crate::error::{AggregateError, Error};
use crossbeam_channel::{Receiver, Sender};
use std::{sync::Arc, thread, time::Instant};

/// One unit of periodic work (throttler, shares balancer, ...).
pub trait Runnable: Send + Sync {
    fn name(&self) -> &'static str;
    fn run(&self) -> Result<(), Error>;
}

/// Runs an ordered list of runnables as one: every member runs on
/// every cycle regardless of earlier failures, and the failures come
/// back as a single labeled aggregate.
pub struct CompositeRunnable {
    runnables: Vec<Box<dyn Runnable>>,
}

impl CompositeRunnable {
    pub fn new(runnables: Vec<Box<dyn Runnable>>) -> Self {
        CompositeRunnable { runnables }
    }
}

impl Runnable for CompositeRunnable {
    fn name(&self) -> &'static str {
        "composite"
    }

    fn run(&self) -> Result<(), Error> {
        let mut failures = AggregateError::default();
        for runnable in &self.runnables {
            if let Err(error) = runnable.run() {
                failures.push(runnable.name(), error);
            }
        }
        failures.into_result()
    }
}

/// Owns the single background worker that executes one full run of its
/// runnable per tick of an externally supplied timer. Errors from a
/// run are logged, never propagated: throttling is a best-effort
/// background concern and the next tick always gets its chance.
pub struct PollingService {
    runnable: Arc<dyn Runnable>,
    ticker: Receiver<Instant>,
    stop: Option<Sender<()>>,
    worker: Option<thread::JoinHandle<()>>,
}

impl PollingService {
    pub fn new(runnable: Arc<dyn Runnable>, ticker: Receiver<Instant>) -> Self {
        PollingService {
            runnable,
            ticker,
            stop: None,
            worker: None,
        }
    }

    /// Spawns the worker. Calling start on an already started service
    /// is a no-op.
    pub fn start(&mut self) {
        if self.worker.is_some() {
            return;
        }
        let (stop_tx, stop_rx) = crossbeam_channel::bounded(0);
        let runnable = self.runnable.clone();
        let ticker = self.ticker.clone();
        self.stop = Some(stop_tx);
        self.worker = Some(thread::spawn(move || poll(runnable, ticker, stop_rx)));
    }

    /// Signals the worker and waits for it to exit. A run already in
    /// flight completes first, so no cgroup mutation is ever cut off
    /// half-applied by a stop.
    pub fn stop(&mut self) {
        self.stop.take();
        if let Some(worker) = self.worker.take() {
            worker.join().ok();
        }
    }
}

impl Drop for PollingService {
    fn drop(&mut self) {
        self.stop();
    }
}

fn poll(runnable: Arc<dyn Runnable>, ticker: Receiver<Instant>, stop: Receiver<()>) {
    loop {
        crossbeam_channel::select! {
            recv(ticker) -> tick => {
                if tick.is_err() {
                    tracing::info!("tick source closed, polling worker exiting");
                    return;
                }
                tracing::debug!(runnable = runnable.name(), "tick");
                if let Err(error) = runnable.run() {
                    tracing::error!(runnable = runnable.name(), %error, "run failed");
                }
            }
            recv(stop) -> _ => {
                tracing::info!("stop requested, polling worker exiting");
                return;
            }
        }
    }
}
