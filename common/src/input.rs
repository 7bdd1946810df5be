use crate::{config::InputConfig, hal::InputPins, types::InputEvents};

#[derive(Debug, Clone, Copy, Default)]
struct ButtonLatch {
    pressed: bool,
    last_accepted_ms: Option<u64>,
}

/// Polls the buttons and joystick once per tick.
///
/// Presses are edge-triggered and debounced; releases are taken immediately.
/// Anything shorter than one tick between two polls is simply never seen.
#[derive(Debug, Clone)]
pub struct InputSampler {
    config: InputConfig,
    enter: ButtonLatch,
    back: ButtonLatch,
    shared_last_accepted_ms: Option<u64>,
}

impl InputSampler {
    pub fn new(config: InputConfig) -> Self {
        Self {
            config,
            enter: ButtonLatch::default(),
            back: ButtonLatch::default(),
            shared_last_accepted_ms: None,
        }
    }

    pub fn sample<P: InputPins>(&mut self, pins: &mut P, now_ms: u64) -> InputEvents {
        let enter_active = pins.enter_active();
        let back_active = pins.back_active();

        // Both axes are converted every tick; only Y carries meaning.
        let _x = pins.joystick_x();
        let y = pins.joystick_y();

        let enter_pressed = self.update(Button::Enter, enter_active, now_ms);
        let back_pressed = self.update(Button::Back, back_active, now_ms);

        InputEvents {
            enter_pressed,
            back_pressed,
            joystick_up: y > self.config.joystick_high,
            joystick_down: y < self.config.joystick_low,
        }
    }

    fn update(&mut self, button: Button, active: bool, now_ms: u64) -> bool {
        let debounce_ms = self.config.debounce_ms;
        let shared = self.config.shared_debounce;
        let shared_last = self.shared_last_accepted_ms;

        let latch = match button {
            Button::Enter => &mut self.enter,
            Button::Back => &mut self.back,
        };

        if !active {
            latch.pressed = false;
            return false;
        }
        if latch.pressed {
            return false;
        }

        let last = if shared { shared_last } else { latch.last_accepted_ms };
        let settled = last.map_or(true, |last| now_ms.saturating_sub(last) >= debounce_ms);
        if !settled {
            return false;
        }

        latch.pressed = true;
        latch.last_accepted_ms = Some(now_ms);
        self.shared_last_accepted_ms = Some(now_ms);
        true
    }
}

#[derive(Debug, Clone, Copy)]
enum Button {
    Enter,
    Back,
}
