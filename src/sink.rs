
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use itertools::Itertools;
use reqwest::{
    header::{AUTHORIZATION, CONTENT_TYPE},
    Client, StatusCode, Url,
};
use thiserror::Error;

use crate::measurements::AveragedSample;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("invalid sink url {0}")]
    InvalidUrl(String),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("write rejected with {status}: {body}")]
    Rejected { status: StatusCode, body: String },
}

/// One averaged window in output units, stamped at write time.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub timestamp: DateTime<Utc>,
    /// °C
    pub temperature: f64,
    /// hPa
    pub pressure: f64,
    /// 0..=1
    pub humidity: f64,
}

impl Record {
    pub fn new(sample: &AveragedSample, timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            temperature: f64::from(sample.temperature) / 1_000.0,
            pressure: f64::from(sample.pressure) / 100_000.0,
            humidity: f64::from(sample.humidity) / 100_000.0,
        }
    }

    // CF: https://docs.influxdata.com/influxdb/v2/reference/syntax/line-protocol/
    pub fn to_line_protocol(&self, measurement: &str) -> String {
        let fields = [
            ("temp", self.temperature),
            ("pressure", self.pressure),
            ("humidity", self.humidity),
        ]
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .join(",");

        format!(
            "{} {} {}",
            escape_measurement(measurement),
            fields,
            self.timestamp.timestamp_millis()
        )
    }
}

fn escape_measurement(name: &str) -> String {
    name.replace(',', "\\,").replace(' ', "\\ ")
}

/// Durably accepts one record per call.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Sink: Send {
    async fn write(&mut self, record: &Record) -> Result<(), SinkError>;
}

#[derive(Debug, Clone)]
pub struct InfluxSettings {
    pub url: String,
    pub org: String,
    pub bucket: String,
    pub token: String,
    pub measurement: String,
    pub timeout: Duration,
}

/// InfluxDB v2 write API, one blocking request per record.
pub struct InfluxSink {
    client: Client,
    write_url: Url,
    token: String,
    measurement: String,
}

impl InfluxSink {
    pub fn new(settings: &InfluxSettings) -> Result<Self, SinkError> {
        let base = settings.url.trim_end_matches('/');
        let write_url = Url::parse_with_params(
            &format!("{base}/api/v2/write"),
            &[
                ("org", settings.org.as_str()),
                ("bucket", settings.bucket.as_str()),
                ("precision", "ms"),
            ],
        )
        .map_err(|e| SinkError::InvalidUrl(format!("{}: {e}", settings.url)))?;

        let client = Client::builder().timeout(settings.timeout).build()?;

        Ok(Self {
            client,
            write_url,
            token: settings.token.clone(),
            measurement: settings.measurement.clone(),
        })
    }

    pub fn write_url(&self) -> &Url {
        &self.write_url
    }
}

#[async_trait]
impl Sink for InfluxSink {
    async fn write(&mut self, record: &Record) -> Result<(), SinkError> {
        let mut request = self
            .client
            .post(self.write_url.clone())
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(record.to_line_protocol(&self.measurement));
        if !self.token.is_empty() {
            request = request.header(AUTHORIZATION, format!("Token {}", self.token));
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SinkError::Rejected { status, body });
        }

        Ok(())
    }
}
