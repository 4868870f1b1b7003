use super::*;

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    thread,
};

use async_trait::async_trait;
use chrono::DateTime;
use futures::future;
use mockall::Sequence;
use reqwest::StatusCode;
use tokio::{sync::oneshot, time::Instant};

use crate::{
    bme280::MockEnvironmentSensor,
    sink::{MockSink, SinkError},
};

const INTERVAL: Duration = Duration::from_secs(15);

fn env(temperature: i32, pressure: u32, humidity: u32) -> EnvironmentSample {
    EnvironmentSample {
        temperature,
        pressure,
        humidity,
    }
}

fn window(n: usize) -> NonZeroUsize {
    NonZeroUsize::new(n).unwrap()
}

/// Replays fixed readings and fires `exhausted` once the last one is taken.
struct ScriptedSensor {
    readings: VecDeque<EnvironmentSample>,
    reads: Arc<Mutex<Vec<Instant>>>,
    exhausted: Option<oneshot::Sender<()>>,
}

impl EnvironmentSensor for ScriptedSensor {
    fn sense(&mut self) -> Result<EnvironmentSample, SensorError> {
        self.reads.lock().unwrap().push(Instant::now());
        let sample = self.readings.pop_front().expect("script exhausted");
        if self.readings.is_empty() {
            if let Some(tx) = self.exhausted.take() {
                let _ = tx.send(());
            }
        }
        Ok(sample)
    }
}

/// A sensor replaying `readings`, the instants it was read at, and a
/// shutdown future that resolves right after the last reading.
fn scripted(
    readings: Vec<EnvironmentSample>,
) -> (ScriptedSensor, Arc<Mutex<Vec<Instant>>>, impl Future<Output = ()> + Send + 'static) {
    let (tx, rx) = oneshot::channel();
    let reads = Arc::new(Mutex::new(Vec::new()));
    let sensor = ScriptedSensor {
        readings: readings.into(),
        reads: reads.clone(),
        exhausted: Some(tx),
    };

    (sensor, reads, async move {
        let _ = rx.await;
    })
}

#[derive(Clone, Default)]
struct RecordingSink {
    records: Arc<Mutex<Vec<Record>>>,
    delays: Vec<Duration>,
}

#[async_trait]
impl Sink for RecordingSink {
    async fn write(&mut self, record: &Record) -> Result<(), SinkError> {
        let n = self.records.lock().unwrap().len();
        if !self.delays.is_empty() {
            time::sleep(self.delays[n % self.delays.len()]).await;
        }
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }
}

mod stage_tests {
    use super::*;

    #[tokio::test]
    async fn averager_discards_a_partial_window() {
        let (sample_tx, sample_rx) = mpsc::channel(4);
        let (average_tx, mut average_rx) = mpsc::channel(4);
        sample_tx.send(env(1, 1, 1)).await.unwrap();
        sample_tx.send(env(2, 2, 2)).await.unwrap();
        drop(sample_tx);

        average_window(window(3), sample_rx, average_tx).await;

        assert_eq!(average_rx.recv().await, None);
    }

    #[tokio::test]
    async fn averager_emits_each_full_window_in_order() {
        let (sample_tx, sample_rx) = mpsc::channel(8);
        let (average_tx, mut average_rx) = mpsc::channel(8);
        for t in [1, 3, 10, 20, 7] {
            sample_tx.send(env(t, 0, 0)).await.unwrap();
        }
        drop(sample_tx);

        average_window(window(2), sample_rx, average_tx).await;

        assert_eq!(average_rx.recv().await.map(|a| a.temperature), Some(2));
        assert_eq!(average_rx.recv().await.map(|a| a.temperature), Some(15));
        assert_eq!(average_rx.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn sampler_first_reads_one_interval_after_start() {
        let (sensor, reads, shutdown) = scripted(vec![env(0, 0, 0), env(0, 0, 0)]);
        let (sample_tx, mut sample_rx) = mpsc::channel(4);
        let start = Instant::now();

        sample_sensor(sensor, INTERVAL, sample_tx, shutdown).await.unwrap();

        assert_eq!(*reads.lock().unwrap(), vec![start + INTERVAL, start + INTERVAL * 2]);
        assert!(sample_rx.recv().await.is_some());
        assert!(sample_rx.recv().await.is_some());
        assert_eq!(sample_rx.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn sampler_keeps_its_phase_after_backpressure() {
        let (sensor, reads, shutdown) = scripted(vec![env(0, 0, 0); 4]);
        let (sample_tx, mut sample_rx) = mpsc::channel(1);
        let start = Instant::now();
        let consumer = tokio::spawn(async move {
            time::sleep(Duration::from_secs(50)).await;
            let mut n = 0;
            while sample_rx.recv().await.is_some() {
                n += 1;
            }
            n
        });

        sample_sensor(sensor, INTERVAL, sample_tx, shutdown).await.unwrap();

        assert_eq!(consumer.await.unwrap(), 4);
        // the 45s tick is missed while blocked, it is read late and the
        // schedule stays on multiples of the interval
        let offsets: Vec<Duration> = reads.lock().unwrap().iter().map(|at| *at - start).collect();
        assert_eq!(offsets, [15, 30, 50, 60].map(Duration::from_secs));
    }

    #[tokio::test(start_paused = true)]
    async fn sampler_reads_off_the_runtime_thread() {
        let reader = Arc::new(Mutex::new(None));
        let (done_tx, done_rx) = oneshot::channel();
        let done_tx = Mutex::new(Some(done_tx));
        let seen = reader.clone();
        let mut sensor = MockEnvironmentSensor::new();
        sensor.expect_sense().times(1).returning(move || {
            *seen.lock().unwrap() = Some(thread::current().id());
            if let Some(tx) = done_tx.lock().unwrap().take() {
                let _ = tx.send(());
            }
            Ok(env(0, 0, 0))
        });
        let (sample_tx, _sample_rx) = mpsc::channel(1);

        sample_sensor(sensor, INTERVAL, sample_tx, async move {
            let _ = done_rx.await;
        })
        .await
        .unwrap();

        let reader = reader.lock().unwrap().expect("sensor was not read");
        assert_ne!(reader, thread::current().id());
    }

    #[tokio::test(start_paused = true)]
    async fn writer_keeps_going_after_a_failed_write() {
        let mut sink = MockSink::new();
        let mut seq = Sequence::new();
        sink.expect_write().times(1).in_sequence(&mut seq).returning(|_| {
            Err(SinkError::Rejected {
                status: StatusCode::SERVICE_UNAVAILABLE,
                body: String::new(),
            })
        });
        sink.expect_write()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|r| r.temperature == 2.0)
            .returning(|_| Ok(()));

        let (average_tx, average_rx) = mpsc::channel(2);
        average_tx.send(AveragedSample { temperature: 1_000, pressure: 0, humidity: 0 }).await.unwrap();
        average_tx.send(AveragedSample { temperature: 2_000, pressure: 0, humidity: 0 }).await.unwrap();
        drop(average_tx);

        write_records(sink, average_rx).await;
    }
}

mod pipeline_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn averages_a_window_of_three() {
        let started: DateTime<Utc> = Utc::now();
        let (sensor, reads, shutdown) = scripted(vec![
            env(20_000, 100_000_000, 40_000),
            env(21_000, 100_200_000, 42_000),
            env(22_000, 100_100_000, 41_000),
        ]);
        let sink = RecordingSink::default();
        let records = sink.records.clone();

        Pipeline::new(window(3), INTERVAL).run(sensor, sink, shutdown).await.unwrap();

        let records = records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].temperature, 21.0);
        assert_eq!(records[0].pressure, 1001.0);
        assert_eq!(records[0].humidity, 0.41);
        assert!(records[0].timestamp >= started);
        assert_eq!(reads.lock().unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn window_of_one_writes_every_reading() {
        let readings = vec![
            env(-3_500, 98_765_000, 12_000),
            env(18_250, 101_325_000, 55_500),
            env(30_000, 100_000_000, 99_000),
        ];
        let (sensor, _, shutdown) = scripted(readings.clone());
        let sink = RecordingSink::default();
        let records = sink.records.clone();

        Pipeline::new(window(1), INTERVAL).run(sensor, sink, shutdown).await.unwrap();

        let records = records.lock().unwrap();
        assert_eq!(records.len(), readings.len());
        for (record, reading) in records.iter().zip(&readings) {
            let expected = Record::new(
                &AveragedSample {
                    temperature: reading.temperature,
                    pressure: reading.pressure,
                    humidity: reading.humidity,
                },
                record.timestamp,
            );
            assert_eq!(*record, expected);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_mid_window_drops_the_partial_average() {
        let (sensor, reads, shutdown) = scripted(vec![
            env(10_000, 0, 0),
            env(20_000, 0, 0),
            env(30_000, 0, 0),
            env(40_000, 0, 0),
            env(50_000, 0, 0),
        ]);
        let sink = RecordingSink::default();
        let records = sink.records.clone();

        let pipeline = Pipeline::new(window(3), INTERVAL);
        let run = pipeline.run(sensor, sink, shutdown);
        time::timeout(INTERVAL * 20, run).await.expect("pipeline did not drain").unwrap();

        let records = records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].temperature, 20.0);
        assert_eq!(reads.lock().unwrap().len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_sink_keeps_records_in_order() {
        let temperatures = [1_000, 2_000, 3_000, 4_000, 5_000, 6_000, 7_000, 8_000];
        let (sensor, reads, shutdown) = scripted(temperatures.iter().map(|t| env(*t, 0, 0)).collect());
        let sink = RecordingSink {
            delays: vec![Duration::from_secs(60), Duration::from_secs(5)],
            ..Default::default()
        };
        let records = sink.records.clone();

        Pipeline::new(window(1), INTERVAL).run(sensor, sink, shutdown).await.unwrap();

        let written: Vec<f64> = records.lock().unwrap().iter().map(|r| r.temperature).collect();
        assert_eq!(written, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);

        // backpressure from the slow writer spaces the reads out beyond the interval
        let reads = reads.lock().unwrap();
        assert!(reads.windows(2).any(|w| w[1] - w[0] > INTERVAL));
    }

    #[tokio::test(start_paused = true)]
    async fn sink_failure_does_not_stop_the_pipeline() {
        let (sensor, _, shutdown) = scripted(vec![env(1_000, 0, 0), env(2_000, 0, 0), env(3_000, 0, 0)]);
        let mut sink = MockSink::new();
        let mut seq = Sequence::new();
        sink.expect_write().times(1).in_sequence(&mut seq).returning(|_| {
            Err(SinkError::Rejected {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                body: "engine: disk full".to_string(),
            })
        });
        sink.expect_write().times(2).in_sequence(&mut seq).returning(|_| Ok(()));

        let result = Pipeline::new(window(1), INTERVAL).run(sensor, sink, shutdown).await;

        assert!(result.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn sensor_failure_is_fatal() {
        let mut sensor = MockEnvironmentSensor::new();
        sensor.expect_sense().times(1).returning(|| Err(SensorError::Stalled));
        let mut sink = MockSink::new();
        sink.expect_write().never();

        let result = Pipeline::new(window(1), INTERVAL)
            .run(sensor, sink, future::pending())
            .await;

        assert!(matches!(result, Err(PipelineError::Sensor(SensorError::Stalled))));
    }
}
