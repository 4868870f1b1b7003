use std::{env, process};

use anyhow::Context;
use tokio::task;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod bme280;
use bme280::Bme280;
mod config;
use config::Config;
mod measurements;
mod pipeline;
use pipeline::Pipeline;
mod shutdown;
mod sink;
use sink::InfluxSink;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() {
    init_tracing();

    let args: Vec<String> = env::args().collect();
    let config = match config::parse_config(&args) {
        Ok(config) => config,
        Err(err) => err.exit(),
    };

    if let Err(err) = run(config).await {
        error!("{err:#}");
        process::exit(1);
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let shutdown = shutdown::shutdown_signal().context("installing signal handlers")?;
    let sink = InfluxSink::new(&config.influx()).context("configuring influxdb sink")?;
    info!(
        window = config.window.get(),
        read_interval = ?config.read_interval(),
        sink = %sink.write_url(),
        "starting"
    );

    // the sampler owns the sensor, and with it the bus, until the pipeline stops
    let bus = bme280::open_bus(config.i2c_bus, config.address).context("opening i2c bus")?;
    // reset and calibration readout sleep between bus transactions
    let sensor = task::spawn_blocking(move || Bme280::new(bus))
        .await?
        .context("initialising sensor")?;

    Pipeline::new(config.window, config.read_interval())
        .run(sensor, sink, shutdown)
        .await?;

    info!("stopped");
    Ok(())
}
