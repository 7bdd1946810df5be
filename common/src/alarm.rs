use std::sync::{
    atomic::{AtomicBool, Ordering},
    Mutex, PoisonError,
};

use log::info;

use crate::{
    config::AlarmConfig,
    hal::Indicators,
    types::{AlarmStatus, AlertRequest, Color, DeviceIdentity, SensorReading, Thresholds},
};

/// Side effects requested by one evaluation. The caller executes them in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlarmAction {
    StartPulse,
    StopPulse,
    SteadyColor(Color),
    Buzzer(bool),
    Dispatch(AlertRequest),
}

#[derive(Debug, Clone)]
pub struct AlarmEngine {
    config: AlarmConfig,
    device_id: DeviceIdentity,
    active: bool,
    status: Option<AlarmStatus>,
    last_dispatch_ms: Option<u64>,
}

impl AlarmEngine {
    pub fn new(config: AlarmConfig, device_id: DeviceIdentity) -> Self {
        Self {
            config,
            device_id,
            active: false,
            status: None,
            last_dispatch_ms: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn status(&self) -> AlarmStatus {
        self.status.unwrap_or(AlarmStatus::Normal)
    }

    pub fn last_dispatch_ms(&self) -> Option<u64> {
        self.last_dispatch_ms
    }

    pub fn evaluate(
        &mut self,
        reading: &SensorReading,
        thresholds: &Thresholds,
        now_ms: u64,
    ) -> Vec<AlarmAction> {
        let mut actions = Vec::new();

        if !reading.present {
            if self.active {
                info!("alarm cleared: sensor unavailable");
                self.active = false;
                actions.push(AlarmAction::StopPulse);
            }
            if self.status != Some(AlarmStatus::SensorError) {
                actions.push(AlarmAction::SteadyColor(Color::Yellow));
                actions.push(AlarmAction::Buzzer(false));
            }
            self.status = Some(AlarmStatus::SensorError);
            return actions;
        }

        match thresholds.violation(reading.temperature) {
            Some(violation) => {
                if !self.active {
                    info!(
                        "alarm raised: {}°C is {} (min {}, max {})",
                        reading.temperature,
                        violation.as_str(),
                        thresholds.min,
                        thresholds.max
                    );
                    self.active = true;
                    actions.push(AlarmAction::StartPulse);

                    if self.dispatch_allowed(now_ms) {
                        self.last_dispatch_ms = Some(now_ms);
                        actions.push(AlarmAction::Dispatch(AlertRequest {
                            device_id: self.device_id.clone(),
                            temperature: reading.temperature,
                            threshold_max: thresholds.max,
                            threshold_min: thresholds.min,
                        }));
                    }
                }
                self.status = Some(violation);
            }
            None => {
                if self.active {
                    info!("alarm cleared at {}°C", reading.temperature);
                    self.active = false;
                    actions.push(AlarmAction::StopPulse);
                }
                if self.status != Some(AlarmStatus::Normal) {
                    actions.push(AlarmAction::SteadyColor(Color::Green));
                    actions.push(AlarmAction::Buzzer(false));
                }
                self.status = Some(AlarmStatus::Normal);
            }
        }

        actions
    }

    // The window counts from the last attempt, successful or not.
    fn dispatch_allowed(&self, now_ms: u64) -> bool {
        self.last_dispatch_ms
            .map_or(true, |last| now_ms.saturating_sub(last) >= self.config.alert_cooldown_ms)
    }
}

/// What the indicators should show for one pulse half-period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PulseFrame {
    pub color: Color,
    pub buzzer: bool,
}

/// State shared between the main loop and the pulse timer callback.
///
/// Only the main loop arms and disarms; the callback only advances the phase
/// and never starts or stops itself.
#[derive(Debug, Default)]
pub struct PulseSignal {
    active: AtomicBool,
    phase: AtomicBool,
}

impl PulseSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&self) {
        self.phase.store(false, Ordering::Relaxed);
        self.active.store(true, Ordering::Release);
    }

    pub fn disarm(&self) {
        self.active.store(false, Ordering::Release);
    }

    pub fn is_armed(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Flips the phase and returns the frame to show, or `None` once disarmed.
    pub fn advance(&self) -> Option<PulseFrame> {
        if !self.is_armed() {
            return None;
        }

        let on = !self.phase.fetch_xor(true, Ordering::AcqRel);
        Some(if on {
            PulseFrame {
                color: Color::Red,
                buzzer: true,
            }
        } else {
            PulseFrame {
                color: Color::Off,
                buzzer: false,
            }
        })
    }
}

/// Body of the periodic timer callback.
///
/// The armed check happens under the indicator lock, so a frame can never be
/// applied after the main loop has disarmed and restored steady outputs.
pub fn pulse_tick<I: Indicators>(signal: &PulseSignal, indicators: &Mutex<I>) {
    let mut indicators = indicators.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(frame) = signal.advance() {
        indicators.set_color(frame.color);
        indicators.set_buzzer(frame.buzzer);
    }
}
