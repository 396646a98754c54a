use crate::backend::ActiveBackend;
use crate::collectors::gpu::collect_gpus;
use crate::collectors::host::{HostError, HostStats};
use crate::record::{aggregate, CycleRecord};
use crate::sink::{Publisher, SinkError};
use std::future::Future;
use std::io::Write;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Sampling,
    ErrorBackoff,
}

#[derive(Debug, Clone, Copy)]
pub struct Cadence {
    pub interval: Duration,
    pub error_backoff: Duration,
    pub vendor_timeout: Duration,
}

impl Cadence {
    pub fn delay_after(&self, phase: Phase) -> Duration {
        match phase {
            Phase::Sampling => self.interval,
            Phase::ErrorBackoff => self.error_backoff,
        }
    }
}

#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Host(#[from] HostError),
    #[error(transparent)]
    Publish(SinkError),
}

pub trait Sleeper {
    fn sleep(&mut self, duration: Duration) -> impl Future<Output = ()> + Send;
}

pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&mut self, duration: Duration) -> impl Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }
}

pub struct Scheduler<H, W: Write, S> {
    backend: ActiveBackend,
    host: H,
    publisher: Publisher<W>,
    sleeper: S,
    cadence: Cadence,
}

impl<H, W, S> Scheduler<H, W, S>
where
    H: HostStats,
    W: Write,
    S: Sleeper,
{
    pub fn new(
        backend: ActiveBackend,
        host: H,
        publisher: Publisher<W>,
        sleeper: S,
        cadence: Cadence,
    ) -> Self {
        Self {
            backend,
            host,
            publisher,
            sleeper,
            cadence,
        }
    }

    /// Runs until `shutdown` flips. Shutdown is only observed between cycles,
    /// so the line of an in-flight cycle is always written in full. Returns
    /// an error only when the output stream breaks.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), SinkError> {
        info!(
            backend = self.backend.label(),
            interval = ?self.cadence.interval,
            error_backoff = ?self.cadence.error_backoff,
            "запуск цикла сбора"
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            let phase = self.run_cycle().await?;
            let wait = self.cadence.delay_after(phase);
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("получен сигнал остановки цикла сбора");
                    break;
                }
                _ = self.sleeper.sleep(wait) => {}
            }
        }
        Ok(())
    }

    /// One scheduler tick: exactly one record reaches the stream.
    pub async fn run_cycle(&mut self) -> Result<Phase, SinkError> {
        match self.sample_and_publish().await {
            Ok(()) => Ok(Phase::Sampling),
            Err(CycleError::Publish(err)) if err.is_fatal() => Err(err),
            Err(err) => {
                warn!(error = %err, "цикл сбора завершился ошибкой");
                self.publisher.publish(&CycleRecord::failed(&err))?;
                Ok(Phase::ErrorBackoff)
            }
        }
    }

    async fn sample_and_publish(&mut self) -> Result<(), CycleError> {
        let devices = collect_gpus(&self.backend, self.cadence.vendor_timeout).await;
        let host = self.host.sample()?;
        let record = aggregate(devices, host);
        debug!(gpus = record.devices().len(), "цикл сбора выполнен");
        self.publisher
            .publish(&record)
            .map_err(CycleError::Publish)
    }

    #[cfg(test)]
    fn publisher(&self) -> &Publisher<W> {
        &self.publisher
    }
}
