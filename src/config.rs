
use std::{
    num::{NonZeroU64, NonZeroUsize},
    time::Duration,
};

use clap::Parser;

use crate::{bme280::DEFAULT_ADDRESS, sink::InfluxSettings};

/// Averages BME280 readings over a fixed window and writes them to InfluxDB.
#[derive(Debug, Clone, Parser)]
#[command(version, about)]
pub struct Config {
    /// Size of the averaging window
    #[arg(long, default_value = "8")]
    pub window: NonZeroUsize,

    /// Time to wait between each read of the sensor (s)
    #[arg(long, alias = "read_interval", default_value = "15")]
    pub read_interval: NonZeroU64,

    /// I2C bus number, the default bus when omitted
    #[arg(long)]
    pub i2c_bus: Option<u8>,

    /// Sensor address on the bus, decimal or 0x-prefixed hex
    #[arg(long, default_value_t = DEFAULT_ADDRESS, value_parser = parse_address)]
    pub address: u16,

    /// InfluxDB base url
    #[arg(long, env = "INFLUX_URL", default_value = "http://localhost:8086")]
    pub influx_url: String,

    /// InfluxDB organisation
    #[arg(long, env = "INFLUX_ORG", default_value = "")]
    pub influx_org: String,

    /// Bucket the records are written to
    #[arg(long, env = "INFLUX_BUCKET", default_value = "environment")]
    pub influx_bucket: String,

    /// InfluxDB API token, no Authorization header when empty
    #[arg(long, env = "INFLUX_TOKEN", default_value = "", hide_env_values = true)]
    pub influx_token: String,

    /// Measurement name the records are written under
    #[arg(long, default_value = "env")]
    pub measurement: String,

    /// Timeout for a single write to InfluxDB (s)
    #[arg(long, default_value = "10")]
    pub write_timeout: NonZeroU64,
}

impl Config {
    pub fn read_interval(&self) -> Duration {
        Duration::from_secs(self.read_interval.get())
    }

    pub fn influx(&self) -> InfluxSettings {
        InfluxSettings {
            url: self.influx_url.clone(),
            org: self.influx_org.clone(),
            bucket: self.influx_bucket.clone(),
            token: self.influx_token.clone(),
            measurement: self.measurement.clone(),
            timeout: Duration::from_secs(self.write_timeout.get()),
        }
    }
}

fn parse_address(s: &str) -> Result<u16, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => s.parse(),
    };
    let address = parsed.map_err(|e| format!("invalid address {s:?}: {e}"))?;
    // 7-bit addressing, 0x00..=0x07 and 0x78.. are reserved
    if !(0x08..=0x77).contains(&address) {
        return Err(format!("address 0x{address:02X} is outside 0x08..=0x77"));
    }

    Ok(address)
}

/// Parses the process arguments; `args[0]` is the command name.
pub fn parse_config(args: &[String]) -> Result<Config, clap::Error> {
    Config::try_parse_from(args)
}
