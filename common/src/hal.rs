//! Capability interfaces between the control logic and the board.
//!
//! Every piece of hardware the station touches is reached through one of these
//! traits. The ESP32 build implements them over esp-idf drivers, the host build
//! over simulations, and the tests over recording fakes.

use std::time::Duration;

use thiserror::Error;

use crate::{dispatch::NetStack, sensor::SensorError, types::Color};

#[derive(Debug, Error)]
#[error("display write failed: {0}")]
pub struct DisplayError(pub String);

/// The sensor's bidirectional data line, plus the timing primitives the protocol needs.
pub trait SingleWireBus {
    fn drive_low(&mut self) -> Result<(), SensorError>;

    /// Stop driving; the pull-up takes the line high.
    fn release(&mut self) -> Result<(), SensorError>;

    fn is_high(&mut self) -> bool;

    /// Free-running microsecond counter.
    fn now_us(&mut self) -> u64;

    fn delay_us(&mut self, us: u32);

    fn delay_ms(&mut self, ms: u32);

    /// Runs `f` with every source of sampling jitter (interrupts, task switches) held off.
    fn with_interrupts_masked<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R
    where
        Self: Sized,
    {
        f(self)
    }
}

/// Two active-low buttons and a two-axis analog joystick.
pub trait InputPins {
    fn enter_active(&mut self) -> bool;
    fn back_active(&mut self) -> bool;
    fn joystick_x(&mut self) -> u16;
    fn joystick_y(&mut self) -> u16;
}

pub trait TextDisplay {
    /// `clear` erases the whole screen before drawing `text` at (`x`, `y`).
    fn write_text(&mut self, text: &str, x: u32, y: u32, clear: bool) -> Result<(), DisplayError>;
}

/// LED matrix color and buzzer tone. Both are shared with the pulse callback.
pub trait Indicators {
    fn set_color(&mut self, color: Color);
    fn set_buzzer(&mut self, on: bool);
}

/// A periodic timer whose callback was bound at construction.
pub trait PulseTimer {
    fn start(&mut self, half_period: Duration);
    fn stop(&mut self);
}

/// One concrete implementation of every capability, chosen per target.
pub trait Board {
    type Bus: SingleWireBus;
    type Pins: InputPins;
    type Display: TextDisplay;
    type Indicators: Indicators + Send + 'static;
    type Timer: PulseTimer;
    type Net: NetStack;
}
