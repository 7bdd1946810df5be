//! Single-wire temperature/humidity sensor link (DHT-style framing).
//!
//! The host holds the line low for at least 18 ms, releases it, and the sensor
//! answers with a low/high acknowledgement followed by 40 self-timed bits. Each
//! bit is a ~50 µs low followed by a high pulse whose width carries the value:
//! ~26 µs for `0`, ~70 µs for `1`. Bits arrive MSB-first as
//! `[humidity_int, humidity_frac, temp_int, temp_frac, checksum]`.

use core::fmt;

use log::{debug, warn};
use thiserror::Error;

use crate::{config::SensorConfig, hal::SingleWireBus, types::SensorReading};

pub const FRAME_BITS: u8 = 40;

/// Settle time after releasing the line before looking for the answer.
const RELEASE_SETTLE_US: u32 = 40;
/// Longest a single bit edge may take once framing has started. A bit is at
/// most ~50 µs low plus ~70 µs high, so this bounds every masked wait.
const BIT_EDGE_TIMEOUT_US: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStage {
    Response,
    Preamble,
    FirstBit,
    BitStart(u8),
    BitEnd(u8),
}

impl fmt::Display for WaitStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Response => write!(f, "sensor response"),
            Self::Preamble => write!(f, "response preamble"),
            Self::FirstBit => write!(f, "first bit"),
            Self::BitStart(index) => write!(f, "rising edge of bit {index}"),
            Self::BitEnd(index) => write!(f, "falling edge of bit {index}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SensorError {
    #[error("timed out waiting for {stage}")]
    Timeout { stage: WaitStage },
    #[error("checksum mismatch (computed {expected:#04x}, received {actual:#04x})")]
    ChecksumMismatch { expected: u8, actual: u8 },
    #[error("line control failed (esp_err_t {0})")]
    Line(i32),
}

/// Validates a raw frame. Temperature is the integer byte only; this sensor
/// variant reports no fraction and no sign.
pub fn decode_frame(bytes: [u8; 5]) -> Result<SensorReading, SensorError> {
    let expected = bytes[..4]
        .iter()
        .fold(0_u8, |sum, byte| sum.wrapping_add(*byte));
    if expected != bytes[4] {
        return Err(SensorError::ChecksumMismatch {
            expected,
            actual: bytes[4],
        });
    }

    Ok(SensorReading::valid(
        i32::from(bytes[2]),
        Some(i32::from(bytes[0])),
    ))
}

pub struct SensorLink<B> {
    bus: B,
    config: SensorConfig,
}

impl<B: SingleWireBus> SensorLink<B> {
    pub fn new(bus: B, config: SensorConfig) -> Self {
        Self { bus, config }
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    /// Performs one blocking transaction. Any failure yields `present == false`;
    /// there is no retry here.
    pub fn read(&mut self) -> SensorReading {
        match self.try_read() {
            Ok(reading) => {
                debug!(
                    "[sensor] {}°C, humidity {:?}%",
                    reading.temperature, reading.humidity
                );
                reading
            }
            Err(err) => {
                warn!("sensor read failed: {err}");
                SensorReading::missing()
            }
        }
    }

    pub fn try_read(&mut self) -> Result<SensorReading, SensorError> {
        let bytes = self.read_frame()?;
        decode_frame(bytes)
    }

    fn read_frame(&mut self) -> Result<[u8; 5], SensorError> {
        self.bus.drive_low()?;
        self.bus.delay_ms(self.config.start_low_ms);
        self.bus.release()?;
        self.bus.delay_us(RELEASE_SETTLE_US);

        // The handshake may take as long as the configured timeout, so it runs
        // with interrupts enabled. Only the bit loop is masked.
        let timeout_us = self.config.wait_timeout_us;
        wait_for_level(&mut self.bus, false, timeout_us, WaitStage::Response)?;
        wait_for_level(&mut self.bus, true, timeout_us, WaitStage::Preamble)?;
        wait_for_level(&mut self.bus, false, timeout_us, WaitStage::FirstBit)?;

        let threshold_us = self.config.bit_threshold_us;
        self.bus.with_interrupts_masked(|bus| capture_bits(bus, threshold_us))
    }
}

fn capture_bits<B: SingleWireBus>(
    bus: &mut B,
    threshold_us: u64,
) -> Result<[u8; 5], SensorError> {
    let mut bytes = [0_u8; 5];

    for index in 0..FRAME_BITS {
        let rise_us =
            wait_for_level(bus, true, BIT_EDGE_TIMEOUT_US, WaitStage::BitStart(index))?;
        let fall_us = wait_for_level(bus, false, BIT_EDGE_TIMEOUT_US, WaitStage::BitEnd(index))?;

        if fall_us.saturating_sub(rise_us) > threshold_us {
            bytes[usize::from(index / 8)] |= 1 << (7 - index % 8);
        }
    }

    Ok(bytes)
}

/// Spins until the line reads `high`, returning the timestamp it was observed at.
fn wait_for_level<B: SingleWireBus>(
    bus: &mut B,
    high: bool,
    timeout_us: u64,
    stage: WaitStage,
) -> Result<u64, SensorError> {
    let start_us = bus.now_us();
    loop {
        if bus.is_high() == high {
            return Ok(bus.now_us());
        }
        if bus.now_us().saturating_sub(start_us) > timeout_us {
            return Err(SensorError::Timeout { stage });
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::sim::{LineFault, SimulatedSensorLine};

    fn link(line: SimulatedSensorLine) -> SensorLink<SimulatedSensorLine> {
        SensorLink::new(line, SensorConfig::default())
    }

    fn checksum(bytes: [u8; 4]) -> u8 {
        bytes.iter().fold(0_u8, |sum, byte| sum.wrapping_add(*byte))
    }

    #[test]
    fn valid_frames_report_temperature_byte() {
        for (humidity, humidity_frac, temp, temp_frac) in [
            (0, 0, 0, 0),
            (45, 0, 28, 0),
            (99, 9, 33, 7),
            (255, 255, 255, 255),
            (170, 85, 85, 170),
        ] {
            let payload = [humidity, humidity_frac, temp, temp_frac];
            let mut frame = [0_u8; 5];
            frame[..4].copy_from_slice(&payload);
            frame[4] = checksum(payload);

            let mut link = link(SimulatedSensorLine::with_frame(frame));
            let reading = link.read();

            assert_eq!(
                reading,
                SensorReading::valid(i32::from(temp), Some(i32::from(humidity)))
            );
        }
    }

    #[test]
    fn wrong_checksum_is_rejected() {
        let mut line = SimulatedSensorLine::with_reading(28, 45);
        line.set_fault(LineFault::CorruptChecksum);
        let mut link = link(line);

        assert!(matches!(
            link.try_read(),
            Err(SensorError::ChecksumMismatch { .. })
        ));
        assert!(!link.read().present);
    }

    #[test]
    fn checksum_wraps_modulo_256() {
        let frame = [200, 100, 30, 0, 74];
        assert_eq!(decode_frame(frame), Ok(SensorReading::valid(30, Some(200))));
    }

    #[test]
    fn silent_sensor_times_out_at_response() {
        let mut line = SimulatedSensorLine::with_reading(28, 45);
        line.set_fault(LineFault::Silent);
        let mut link = link(line);

        assert_eq!(
            link.try_read(),
            Err(SensorError::Timeout {
                stage: WaitStage::Response
            })
        );
    }

    #[test]
    fn stuck_line_stops_at_the_bit_that_never_rose() {
        let mut line = SimulatedSensorLine::with_reading(28, 45);
        line.set_fault(LineFault::StuckLowAfterBits(10));
        let mut link = link(line);

        assert_eq!(
            link.try_read(),
            Err(SensorError::Timeout {
                stage: WaitStage::BitStart(10)
            })
        );
        assert!(!link.read().present);
    }

    #[test]
    fn timeout_is_bounded_by_configured_wait() {
        let mut line = SimulatedSensorLine::with_reading(28, 45);
        line.set_fault(LineFault::Silent);
        let config = SensorConfig {
            wait_timeout_us: 5_000,
            ..SensorConfig::default()
        };
        let mut link = SensorLink::new(line, config);

        let started = link.bus_mut().now_us();
        let _ = link.read();
        let elapsed = link.bus_mut().now_us() - started;

        // 18 ms start pulse plus one 5 ms wait, nothing more.
        assert!(elapsed < 18_000 + 5_000 + 100, "elapsed {elapsed} µs");
    }

    #[test]
    fn sampling_runs_with_interrupts_masked() {
        let mut link = link(SimulatedSensorLine::with_reading(21, 50));
        let _ = link.read();
        assert_eq!(link.bus_mut().masked_sections(), 1);
    }

    #[test]
    fn silent_sensor_never_masks_interrupts() {
        let mut line = SimulatedSensorLine::with_reading(28, 45);
        line.set_fault(LineFault::Silent);
        let mut link = link(line);

        assert!(!link.read().present);
        assert_eq!(link.bus_mut().masked_sections(), 0);
        assert_eq!(link.bus_mut().longest_masked_us(), 0);
    }

    #[test]
    fn masked_span_stays_at_frame_scale() {
        for fault in [
            None,
            Some(LineFault::StuckLowAfterBits(0)),
            Some(LineFault::StuckLowAfterBits(39)),
        ] {
            let mut line = SimulatedSensorLine::with_reading(28, 45);
            line.set_fault(fault);
            let mut link = link(line);
            let _ = link.read();

            // 40 bits of at most 120 µs each, plus one edge timeout.
            let longest = link.bus_mut().longest_masked_us();
            assert!(longest < 5_000, "{fault:?} masked for {longest} µs");
        }
    }

    #[test]
    fn line_errors_carry_the_driver_code() {
        assert_eq!(
            SensorError::Line(259).to_string(),
            "line control failed (esp_err_t 259)"
        );
    }

    #[test]
    fn start_pulse_holds_the_line_low_for_the_configured_time() {
        let mut link = link(SimulatedSensorLine::with_reading(28, 45));
        let _ = link.read();

        assert_eq!(link.bus_mut().last_start_pulse_us(), Some(18_000));
    }
}
