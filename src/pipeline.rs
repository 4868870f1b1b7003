#[cfg(test)]
mod tests;

use std::{future::Future, num::NonZeroUsize, time::Duration};

use chrono::Utc;
use thiserror::Error;
use tokio::{
    sync::mpsc::{self, Receiver, Sender},
    task::{self, JoinError},
    time::{self, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{
    bme280::{EnvironmentSensor, SensorError},
    measurements::{AveragedSample, EnvironmentSample, Window},
    sink::{Record, Sink},
};

/***
 * Pipeline
 *
 *  sensor --tick--> sample_sensor --[1]--> average_window --[1]--> write_records --> sink
 *
 *  Each stage is its own task and the channels between them hold a single
 * item, so sampling never runs ahead of the averager. Only the sampler
 * watches for shutdown. It stops by dropping its sender, and every stage
 * after it stops once its input is closed and drained.
 */

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("sensor read failed: {0}")]
    Sensor(#[from] SensorError),
    #[error("pipeline task failed: {0}")]
    Task(#[from] JoinError),
}

/// Reads `sensor` once per `interval` until `shutdown` resolves. A failed
/// read ends sampling with the error. The sensor is released on return.
pub async fn sample_sensor<E, F>(
    mut sensor: E,
    interval: Duration,
    samples: Sender<EnvironmentSample>,
    shutdown: F,
) -> Result<(), PipelineError>
where
    E: EnvironmentSensor + 'static,
    F: Future<Output = ()>,
{
    let mut ticker = time::interval(interval);
    // ticks missed while blocked on the averager are dropped, the phase is kept
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // the first tick completes immediately, readings start one interval in
    ticker.tick().await;
    tokio::pin!(shutdown);

    info!(?interval, "sampling started");
    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown => {
                info!("shutdown requested, sampling stopped");
                break;
            }
            at = ticker.tick() => {
                debug!(?at, "tick");
                let (returned, read) = task::spawn_blocking(move || {
                    let read = sensor.sense();
                    (sensor, read)
                })
                .await?;
                sensor = returned;
                let sample = read?;
                info!("{sample}");

                if samples.send(sample).await.is_err() {
                    warn!("averager is gone, sampling stopped");
                    break;
                }
            }
        }
    }

    Ok(())
}

/// Averages every `window` consecutive samples. A partial window left when
/// the input closes is discarded.
pub async fn average_window(
    window: NonZeroUsize,
    mut samples: Receiver<EnvironmentSample>,
    averages: Sender<AveragedSample>,
) {
    let mut window = Window::new(window);

    while let Some(sample) = samples.recv().await {
        let Some(average) = window.push(&sample) else {
            debug!(pending = window.pending(), size = window.size().get(), "accumulating");
            continue;
        };

        if averages.send(average).await.is_err() {
            warn!("writer is gone, averaging stopped");
            return;
        }
    }

    if window.pending() > 0 {
        info!(pending = window.pending(), "discarding partial window");
    }
    debug!("averaging finished");
}

/// Writes each average to `sink` in arrival order. A failed write is logged
/// and the record dropped.
pub async fn write_records<S: Sink>(mut sink: S, mut averages: Receiver<AveragedSample>) {
    while let Some(average) = averages.recv().await {
        let record = Record::new(&average, Utc::now());

        match sink.write(&record).await {
            Ok(()) => info!(timestamp = %record.timestamp, "wrote record {average}"),
            Err(err) => warn!(%err, "dropping record {average}"),
        }
    }

    debug!("writing finished");
}

#[derive(Debug, Clone, Copy)]
pub struct Pipeline {
    window: NonZeroUsize,
    read_interval: Duration,
}

impl Pipeline {
    pub fn new(window: NonZeroUsize, read_interval: Duration) -> Self {
        Self { window, read_interval }
    }

    /// Runs until `shutdown` resolves and every stage has drained, or until
    /// the sensor fails.
    pub async fn run<E, S, F>(&self, sensor: E, sink: S, shutdown: F) -> Result<(), PipelineError>
    where
        E: EnvironmentSensor + 'static,
        S: Sink + 'static,
        F: Future<Output = ()> + Send + 'static,
    {
        let (sample_tx, sample_rx) = mpsc::channel(1);
        let (average_tx, average_rx) = mpsc::channel(1);

        let writer = tokio::spawn(write_records(sink, average_rx));
        let averager = tokio::spawn(average_window(self.window, sample_rx, average_tx));
        let sampler = tokio::spawn(sample_sensor(sensor, self.read_interval, sample_tx, shutdown));

        // a sensor failure is fatal, the downstream stages are not waited on
        sampler.await??;
        averager.await?;
        writer.await?;

        info!("pipeline drained");
        Ok(())
    }
}
