
use std::{thread, time::Duration};

use rppal::i2c::I2c;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::measurements::EnvironmentSample;

// BME280 / BMP280 combined environment sensor on I2C
//  see datasheet:  https://www.bosch-sensortec.com/media/boschsensortec/downloads/datasheets/bst-bme280-ds002.pdf

pub const DEFAULT_ADDRESS: u16 = 0x76;

const REG_CALIB_TP: u8 = 0x88; // 0x88..=0x9F, dig_T1..dig_P9
const REG_CALIB_H1: u8 = 0xA1;
const REG_CHIP_ID: u8 = 0xD0;
const REG_RESET: u8 = 0xE0;
const REG_CALIB_H2: u8 = 0xE1; // 0xE1..=0xE7, dig_H2..dig_H6
const REG_CTRL_HUM: u8 = 0xF2;
const REG_STATUS: u8 = 0xF3;
const REG_CTRL_MEAS: u8 = 0xF4;
const REG_DATA: u8 = 0xF7; // 0xF7..=0xFE, press, temp, hum

const RESET_COMMAND: u8 = 0xB6;
const STATUS_MEASURING: u8 = 0x08;
const STATUS_IM_UPDATE: u8 = 0x01;

// x4 oversampling on every channel
const OSRS_X4: u8 = 0b011;
const MODE_SLEEP: u8 = 0b00;
const MODE_FORCED: u8 = 0b01;

const CHIP_ID_BME280: u8 = 0x60;
const CHIP_IDS_BMP280: [u8; 3] = [0x56, 0x57, 0x58];

// typical conversion time for x4 on all three channels
const MEASUREMENT_TIME: Duration = Duration::from_millis(30);
const POLL_INTERVAL: Duration = Duration::from_millis(5);
const POLL_ATTEMPTS: usize = 40;

#[derive(Debug, Error)]
pub enum SensorError {
    #[error("i2c bus error: {0}")]
    Bus(#[from] rppal::i2c::Error),
    #[error("unsupported chip id 0x{0:02X}")]
    UnsupportedChip(u8),
    #[error("measurement did not complete")]
    Stalled,
}

/// Produces one complete environment reading on demand.
#[cfg_attr(test, mockall::automock)]
pub trait EnvironmentSensor: Send {
    fn sense(&mut self) -> Result<EnvironmentSample, SensorError>;
}

/// Register level access to a device on the bus.
#[cfg_attr(test, mockall::automock)]
pub trait RegisterBus: Send {
    fn write_register(&mut self, register: u8, value: u8) -> Result<(), rppal::i2c::Error>;
    fn read_registers(&mut self, start: u8, buf: &mut [u8]) -> Result<(), rppal::i2c::Error>;
}

impl RegisterBus for I2c {
    fn write_register(&mut self, register: u8, value: u8) -> Result<(), rppal::i2c::Error> {
        self.write(&[register, value])?;
        Ok(())
    }

    fn read_registers(&mut self, start: u8, buf: &mut [u8]) -> Result<(), rppal::i2c::Error> {
        self.write_read(&[start], buf)
    }
}

/// Opens `bus`, or the default bus when none is given, and addresses the
/// sensor at `address`. The bus is closed when the handle is dropped.
pub fn open_bus(bus: Option<u8>, address: u16) -> Result<I2c, SensorError> {
    let mut i2c = match bus {
        Some(n) => I2c::with_bus(n)?,
        None => I2c::new()?,
    };
    i2c.set_slave_address(address)?;
    info!(bus = i2c.bus(), address = format_args!("0x{address:02X}"), "opened i2c bus");

    Ok(i2c)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Calibration {
    dig_t1: u16,
    dig_t2: i16,
    dig_t3: i16,
    dig_p1: u16,
    dig_p2: i16,
    dig_p3: i16,
    dig_p4: i16,
    dig_p5: i16,
    dig_p6: i16,
    dig_p7: i16,
    dig_p8: i16,
    dig_p9: i16,
    dig_h1: u8,
    dig_h2: i16,
    dig_h3: u8,
    dig_h4: i16,
    dig_h5: i16,
    dig_h6: i8,
}

impl Calibration {
    /// `tp` is 0x88..=0x9F, `h1` is 0xA1, `h` is 0xE1..=0xE7.
    pub fn from_registers(tp: &[u8; 24], h1: u8, h: &[u8; 7]) -> Self {
        let u = |i: usize| u16::from_le_bytes([tp[i], tp[i + 1]]);
        let s = |i: usize| i16::from_le_bytes([tp[i], tp[i + 1]]);

        Self {
            dig_t1: u(0),
            dig_t2: s(2),
            dig_t3: s(4),
            dig_p1: u(6),
            dig_p2: s(8),
            dig_p3: s(10),
            dig_p4: s(12),
            dig_p5: s(14),
            dig_p6: s(16),
            dig_p7: s(18),
            dig_p8: s(20),
            dig_p9: s(22),
            dig_h1: h1,
            dig_h2: i16::from_le_bytes([h[0], h[1]]),
            dig_h3: h[2],
            // H4 and H5 are 12-bit values sharing the nibbles of 0xE5
            dig_h4: (i16::from(h[3] as i8) << 4) | i16::from(h[4] & 0x0F),
            dig_h5: (i16::from(h[5] as i8) << 4) | i16::from(h[4] >> 4),
            dig_h6: h[6] as i8,
        }
    }

    /// Returns (t_fine, temperature in 0.01 °C).
    fn temperature(&self, adc_t: i32) -> (i32, i32) {
        let t1 = i32::from(self.dig_t1);
        let var1 = (((adc_t >> 3) - (t1 << 1)) * i32::from(self.dig_t2)) >> 11;
        let var2 = (((((adc_t >> 4) - t1) * ((adc_t >> 4) - t1)) >> 12) * i32::from(self.dig_t3)) >> 14;
        let t_fine = var1 + var2;

        (t_fine, (t_fine * 5 + 128) >> 8)
    }

    /// Pressure in Pa as Q24.8.
    fn pressure(&self, adc_p: i32, t_fine: i32) -> u32 {
        let mut var1 = i64::from(t_fine) - 128_000;
        let mut var2 = var1 * var1 * i64::from(self.dig_p6);
        var2 += (var1 * i64::from(self.dig_p5)) << 17;
        var2 += i64::from(self.dig_p4) << 35;
        var1 = ((var1 * var1 * i64::from(self.dig_p3)) >> 8) + ((var1 * i64::from(self.dig_p2)) << 12);
        var1 = (((1i64 << 47) + var1) * i64::from(self.dig_p1)) >> 33;
        if var1 == 0 {
            return 0;
        }

        let mut p = 1_048_576 - i64::from(adc_p);
        p = (((p << 31) - var2) * 3125) / var1;
        var1 = (i64::from(self.dig_p9) * (p >> 13) * (p >> 13)) >> 25;
        var2 = (i64::from(self.dig_p8) * p) >> 19;

        (((p + var1 + var2) >> 8) + (i64::from(self.dig_p7) << 4)) as u32
    }

    /// Relative humidity in % as Q22.10.
    fn humidity(&self, adc_h: i32, t_fine: i32) -> u32 {
        let mut v = t_fine - 76_800;
        v = ((((adc_h << 14) - (i32::from(self.dig_h4) << 20) - (i32::from(self.dig_h5) * v)) + 16_384) >> 15)
            * (((((((v * i32::from(self.dig_h6)) >> 10) * (((v * i32::from(self.dig_h3)) >> 11) + 32_768)) >> 10)
                + 2_097_152)
                * i32::from(self.dig_h2)
                + 8_192)
                >> 14);
        v -= ((((v >> 15) * (v >> 15)) >> 7) * i32::from(self.dig_h1)) >> 4;
        v = v.clamp(0, 419_430_400);

        (v >> 12) as u32
    }

    /// Compensates one burst read of 0xF7..=0xFE.
    pub fn compensate(&self, raw: &[u8; 8], has_humidity: bool) -> EnvironmentSample {
        let (adc_p, adc_t, adc_h) = adc_values(raw);
        let (t_fine, centi_celsius) = self.temperature(adc_t);
        let pressure = self.pressure(adc_p, t_fine);
        let humidity = if has_humidity { self.humidity(adc_h, t_fine) } else { 0 };

        EnvironmentSample {
            temperature: centi_celsius * 10,
            pressure: (u64::from(pressure) * 1_000 / 256) as u32,
            humidity: (u64::from(humidity) * 1_000 / 1_024) as u32,
        }
    }
}

/// Unpacks (adc_P, adc_T, adc_H): pressure and temperature are 20 bit,
/// msb/lsb/xlsb[7:4]; humidity is 16 bit.
fn adc_values(raw: &[u8; 8]) -> (i32, i32, i32) {
    let adc_20 = |msb: u8, lsb: u8, xlsb: u8| (i32::from(msb) << 12) | (i32::from(lsb) << 4) | (i32::from(xlsb) >> 4);

    (
        adc_20(raw[0], raw[1], raw[2]),
        adc_20(raw[3], raw[4], raw[5]),
        (i32::from(raw[6]) << 8) | i32::from(raw[7]),
    )
}

/// A BME280 (or humidity-less BMP280) driven in forced mode. The device is
/// put to sleep when this is dropped.
pub struct Bme280<B: RegisterBus> {
    bus: B,
    calibration: Calibration,
    has_humidity: bool,
}

impl<B: RegisterBus> Bme280<B> {
    pub fn new(mut bus: B) -> Result<Self, SensorError> {
        bus.write_register(REG_RESET, RESET_COMMAND)?;
        thread::sleep(Duration::from_millis(2));

        // wait for the NVM calibration copy to finish
        wait_for_status(&mut bus, STATUS_IM_UPDATE)?;

        let mut id = [0u8; 1];
        bus.read_registers(REG_CHIP_ID, &mut id)?;
        let has_humidity = match id[0] {
            CHIP_ID_BME280 => true,
            x if CHIP_IDS_BMP280.contains(&x) => false,
            x => return Err(SensorError::UnsupportedChip(x)),
        };

        let mut tp = [0u8; 24];
        bus.read_registers(REG_CALIB_TP, &mut tp)?;
        let mut h = [0u8; 7];
        let mut h1 = [0u8; 1];
        if has_humidity {
            bus.read_registers(REG_CALIB_H1, &mut h1)?;
            bus.read_registers(REG_CALIB_H2, &mut h)?;
        }
        let calibration = Calibration::from_registers(&tp, h1[0], &h);
        debug!(?calibration, "read calibration");
        info!(chip_id = format_args!("0x{:02X}", id[0]), has_humidity, "sensor initialised");

        Ok(Self {
            bus,
            calibration,
            has_humidity,
        })
    }
}

fn wait_for_status<B: RegisterBus>(bus: &mut B, mask: u8) -> Result<(), SensorError> {
    let mut status = [0u8; 1];
    for _ in 0..POLL_ATTEMPTS {
        bus.read_registers(REG_STATUS, &mut status)?;
        if status[0] & mask == 0 {
            return Ok(());
        }
        thread::sleep(POLL_INTERVAL);
    }

    Err(SensorError::Stalled)
}

impl<B: RegisterBus> EnvironmentSensor for Bme280<B> {
    // blocks for the ~30ms conversion, callers in async code run this on the blocking pool
    fn sense(&mut self) -> Result<EnvironmentSample, SensorError> {
        if self.has_humidity {
            // ctrl_hum only takes effect after a write to ctrl_meas
            self.bus.write_register(REG_CTRL_HUM, OSRS_X4)?;
        }
        self.bus
            .write_register(REG_CTRL_MEAS, (OSRS_X4 << 5) | (OSRS_X4 << 2) | MODE_FORCED)?;
        thread::sleep(MEASUREMENT_TIME);
        wait_for_status(&mut self.bus, STATUS_MEASURING)?;

        let mut raw = [0u8; 8];
        self.bus.read_registers(REG_DATA, &mut raw)?;

        Ok(self.calibration.compensate(&raw, self.has_humidity))
    }
}

impl<B: RegisterBus> Drop for Bme280<B> {
    fn drop(&mut self) {
        match self.bus.write_register(REG_CTRL_MEAS, MODE_SLEEP) {
            Ok(()) => debug!("sensor halted"),
            Err(err) => warn!(%err, "failed to halt sensor"),
        }
    }
}
