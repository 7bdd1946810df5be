//! Software model of the single-wire sensor.
//!
//! Time is virtual: every line sample advances the clock by one microsecond and
//! delays advance it by their full length, so a transaction replays the exact
//! waveform a real sensor would produce without any wall-clock waiting.

use crate::{hal::SingleWireBus, sensor::SensorError};

const HOST_RELEASE_US: u64 = 30;
const ACK_LOW_US: u64 = 80;
const ACK_HIGH_US: u64 = 80;
const BIT_LOW_US: u64 = 50;
const ZERO_HIGH_US: u64 = 26;
const ONE_HIGH_US: u64 = 70;
const TRAILER_LOW_US: u64 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineFault {
    /// The sensor never answers the start pulse.
    Silent,
    /// The line is held low forever after this many bits.
    StuckLowAfterBits(u8),
    /// The checksum byte is off by one.
    CorruptChecksum,
}

#[derive(Debug, Clone)]
pub struct SimulatedSensorLine {
    now_us: u64,
    frame: [u8; 5],
    fault: Option<LineFault>,
    driven_low: bool,
    released_at_us: Option<u64>,
    // (level, duration) pairs after the host releases the line.
    segments: Vec<(bool, u64)>,
    tail_high: bool,
    transactions: u32,
    masked_sections: u32,
    longest_masked_us: u64,
    driven_low_at_us: Option<u64>,
    last_start_pulse_us: Option<u64>,
}

impl SimulatedSensorLine {
    pub fn with_frame(frame: [u8; 5]) -> Self {
        Self {
            now_us: 0,
            frame,
            fault: None,
            driven_low: false,
            released_at_us: None,
            segments: Vec::new(),
            tail_high: true,
            transactions: 0,
            masked_sections: 0,
            longest_masked_us: 0,
            driven_low_at_us: None,
            last_start_pulse_us: None,
        }
    }

    pub fn with_reading(temperature: u8, humidity: u8) -> Self {
        let mut line = Self::with_frame([0; 5]);
        line.set_reading(temperature, humidity);
        line
    }

    pub fn set_reading(&mut self, temperature: u8, humidity: u8) {
        let checksum = humidity.wrapping_add(temperature);
        self.frame = [humidity, 0, temperature, 0, checksum];
    }

    pub fn set_frame(&mut self, frame: [u8; 5]) {
        self.frame = frame;
    }

    pub fn set_fault(&mut self, fault: impl Into<Option<LineFault>>) {
        self.fault = fault.into();
    }

    pub fn transactions(&self) -> u32 {
        self.transactions
    }

    pub fn masked_sections(&self) -> u32 {
        self.masked_sections
    }

    /// Virtual time spent inside the longest masked section so far.
    pub fn longest_masked_us(&self) -> u64 {
        self.longest_masked_us
    }

    /// How long the host held the line low before the last release.
    pub fn last_start_pulse_us(&self) -> Option<u64> {
        self.last_start_pulse_us
    }

    fn build_waveform(&mut self) {
        self.segments.clear();
        self.tail_high = true;
        self.segments.push((true, HOST_RELEASE_US));

        if self.fault == Some(LineFault::Silent) {
            return;
        }

        let mut frame = self.frame;
        if self.fault == Some(LineFault::CorruptChecksum) {
            frame[4] = frame[4].wrapping_add(1);
        }

        self.segments.push((false, ACK_LOW_US));
        self.segments.push((true, ACK_HIGH_US));

        for index in 0..40_u8 {
            self.segments.push((false, BIT_LOW_US));
            if self.fault == Some(LineFault::StuckLowAfterBits(index)) {
                self.tail_high = false;
                return;
            }

            let bit = frame[usize::from(index / 8)] & (1 << (7 - index % 8)) != 0;
            let width = if bit { ONE_HIGH_US } else { ZERO_HIGH_US };
            self.segments.push((true, width));
        }

        self.segments.push((false, TRAILER_LOW_US));
    }

    fn level_now(&self) -> bool {
        if self.driven_low {
            return false;
        }

        let Some(released_at) = self.released_at_us else {
            return true;
        };

        let mut offset = self.now_us.saturating_sub(released_at);
        for (level, duration) in &self.segments {
            if offset < *duration {
                return *level;
            }
            offset -= duration;
        }
        self.tail_high
    }
}

impl SingleWireBus for SimulatedSensorLine {
    fn drive_low(&mut self) -> Result<(), SensorError> {
        self.driven_low = true;
        self.driven_low_at_us = Some(self.now_us);
        self.released_at_us = None;
        Ok(())
    }

    fn release(&mut self) -> Result<(), SensorError> {
        self.driven_low = false;
        self.last_start_pulse_us = self
            .driven_low_at_us
            .take()
            .map(|at| self.now_us.saturating_sub(at));
        self.released_at_us = Some(self.now_us);
        self.transactions = self.transactions.saturating_add(1);
        self.build_waveform();
        Ok(())
    }

    fn is_high(&mut self) -> bool {
        let level = self.level_now();
        self.now_us += 1;
        level
    }

    fn now_us(&mut self) -> u64 {
        self.now_us
    }

    fn delay_us(&mut self, us: u32) {
        self.now_us += u64::from(us);
    }

    fn delay_ms(&mut self, ms: u32) {
        self.now_us += u64::from(ms) * 1_000;
    }

    fn with_interrupts_masked<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        self.masked_sections = self.masked_sections.saturating_add(1);
        let entered_us = self.now_us;
        let result = f(self);
        self.longest_masked_us = self
            .longest_masked_us
            .max(self.now_us.saturating_sub(entered_us));
        result
    }
}
