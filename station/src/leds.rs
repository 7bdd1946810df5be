use std::time::Duration;

use anyhow::Context;
use esp_idf_hal::{
    gpio::OutputPin,
    peripheral::Peripheral,
    rmt::{config::TransmitConfig, PinState, Pulse, RmtChannel, TxRmtDriver, VariableLengthSignal},
};
use log::{debug, warn};

use thermal_alarm_common::{Color, Indicators};

/// 5x5 WS2812 matrix, driven as one solid color.
pub const MATRIX_LEDS: usize = 25;
const BITS_PER_LED: usize = 24;
const DIMMING_SHIFT: u8 = 3;

const T0H: Duration = Duration::from_nanos(400);
const T0L: Duration = Duration::from_nanos(850);
const T1H: Duration = Duration::from_nanos(800);
const T1L: Duration = Duration::from_nanos(450);

pub struct LedMatrix {
    tx: TxRmtDriver<'static>,
    zero: [Pulse; 2],
    one: [Pulse; 2],
    failed_frames: u64,
}

impl LedMatrix {
    pub fn new<C, P>(
        channel: impl Peripheral<P = C> + 'static,
        pin: impl Peripheral<P = P> + 'static,
    ) -> anyhow::Result<Self>
    where
        C: RmtChannel,
        P: OutputPin,
    {
        let config = TransmitConfig::new().clock_divider(1);
        let tx = TxRmtDriver::new(channel, pin, &config).context("failed to init RMT LED driver")?;

        let ticks_hz = tx.counter_clock()?;
        let zero = [
            Pulse::new_with_duration(ticks_hz, PinState::High, &T0H)?,
            Pulse::new_with_duration(ticks_hz, PinState::Low, &T0L)?,
        ];
        let one = [
            Pulse::new_with_duration(ticks_hz, PinState::High, &T1H)?,
            Pulse::new_with_duration(ticks_hz, PinState::Low, &T1L)?,
        ];

        Ok(Self {
            tx,
            zero,
            one,
            failed_frames: 0,
        })
    }

    pub fn fill(&mut self, color: Color) -> anyhow::Result<()> {
        let word = grb_word(color);

        let mut signal = VariableLengthSignal::with_capacity(MATRIX_LEDS * BITS_PER_LED * 2);
        for _ in 0..MATRIX_LEDS {
            for bit in (0..BITS_PER_LED).rev() {
                let [high, low] = if word >> bit & 1 == 1 {
                    &self.one
                } else {
                    &self.zero
                };
                signal
                    .push([high, low])
                    .context("failed to convert LED frame to RMT signal")?;
            }
        }

        self.tx
            .start_blocking(&signal)
            .context("failed to transmit LED frame over RMT")?;
        Ok(())
    }
}

/// WS2812 wire order is green, red, blue, MSB first.
fn grb_word(color: Color) -> u32 {
    let (r, g, b) = color.rgb();
    let dim = |channel: u8| u32::from(channel >> DIMMING_SHIFT);
    dim(g) << 16 | dim(r) << 8 | dim(b)
}

/// The matrix plus the LEDC-driven buzzer, shared with the pulse timer.
pub struct AlarmOutputs<B> {
    pub matrix: LedMatrix,
    pub buzzer: B,
}

/// PWM tone output.
pub trait Tone {
    fn set_tone(&mut self, on: bool) -> anyhow::Result<()>;
}

impl<B: Tone> Indicators for AlarmOutputs<B> {
    fn set_color(&mut self, color: Color) {
        if let Err(err) = self.matrix.fill(color) {
            self.matrix.failed_frames = self.matrix.failed_frames.saturating_add(1);
            warn!(
                "LED matrix update failed ({} so far): {err:#}",
                self.matrix.failed_frames
            );
        }
    }

    fn set_buzzer(&mut self, on: bool) {
        if let Err(err) = self.buzzer.set_tone(on) {
            warn!("buzzer update failed: {err:#}");
        } else {
            debug!("buzzer {}", if on { "on" } else { "off" });
        }
    }
}
