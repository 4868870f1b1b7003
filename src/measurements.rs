
use std::fmt;
use std::num::NonZeroUsize;

/***
 * Measurements
 *
 *  A sample is one complete reading of the environment sensor. Fields are
 * fixed-point integers so that window averages are reproducible:
 *      - temperature in milli-degrees Celsius
 *      - pressure in milli-pascals
 *      - humidity in milli-percent relative humidity
 *
 *  A Window accumulates a configurable number of samples. When that number
 * has been reached, each measure is averaged (truncating division) and the
 * window starts over empty.
 *
 *  The window size is passed into the constructor and is immutable.
 */

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EnvironmentSample {
    pub temperature: i32,
    pub pressure: u32,
    pub humidity: u32,
}

/// Mean of exactly one full window of samples, in the same units.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AveragedSample {
    pub temperature: i32,
    pub pressure: u32,
    pub humidity: u32,
}

fn write_env(f: &mut fmt::Formatter<'_>, temperature: i32, pressure: u32, humidity: u32) -> fmt::Result {
    write!(
        f,
        "{:8.3}°C {:10.3}hPa {:6.2}%rH",
        temperature as f64 / 1_000.0,
        pressure as f64 / 100_000.0,
        humidity as f64 / 1_000.0
    )
}

impl fmt::Display for EnvironmentSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_env(f, self.temperature, self.pressure, self.humidity)
    }
}

impl fmt::Display for AveragedSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_env(f, self.temperature, self.pressure, self.humidity)
    }
}

/// Running per-field sum. The sums are wider than the sample fields so a
/// window of any practical size cannot overflow.
#[derive(Debug, Default, Clone)]
pub struct Accumulator {
    temperature: i64,
    pressure: u64,
    humidity: u64,
    count: usize,
}

impl Accumulator {
    pub fn add(&mut self, sample: &EnvironmentSample) {
        self.temperature += i64::from(sample.temperature);
        self.pressure += u64::from(sample.pressure);
        self.humidity += u64::from(sample.humidity);
        self.count += 1;
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Truncating mean of everything added so far, `None` if nothing was.
    pub fn average(&self) -> Option<AveragedSample> {
        if self.is_empty() {
            return None;
        }
        let n = self.count as u64;

        // the mean of i32/u32 values always fits back into the field type
        Some(AveragedSample {
            temperature: (self.temperature / n as i64) as i32,
            pressure: (self.pressure / n) as u32,
            humidity: (self.humidity / n) as u32,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Window {
    size: NonZeroUsize,
    acc: Accumulator,
}

impl Window {
    pub fn new(size: NonZeroUsize) -> Self {
        Self {
            size,
            acc: Accumulator::default(),
        }
    }

    pub fn size(&self) -> NonZeroUsize {
        self.size
    }

    /// Number of samples held towards the next average.
    pub fn pending(&self) -> usize {
        self.acc.len()
    }

    /// Adds a sample. Returns the window average when this sample completes
    /// the window, after which the window is empty again.
    pub fn push(&mut self, sample: &EnvironmentSample) -> Option<AveragedSample> {
        self.acc.add(sample);
        if self.acc.len() < self.size.get() {
            return None;
        }

        let average = self.acc.average();
        self.acc = Accumulator::default();
        average
    }
}
