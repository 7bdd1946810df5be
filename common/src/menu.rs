use log::info;

use crate::{
    config::{AlarmConfig, InputConfig},
    types::{InputEvents, MenuSelection, MenuState, Thresholds},
};

/// Threshold editing menu.
///
/// Live thresholds are only written when an edit is confirmed; everything else
/// happens on staged copies. Joystick adjustments are rate-limited by a settle
/// window instead of sleeping, so the loop keeps its cadence while a stick is held.
#[derive(Debug, Clone)]
pub struct MenuController {
    state: MenuState,
    selection: MenuSelection,
    staged_max: i32,
    staged_min: i32,
    last_adjust_ms: Option<u64>,
    settle_ms: u64,
    ceiling_c: i32,
    floor_c: i32,
}

/// Minimum distance kept between the bounds while editing.
const BOUND_GAP: i32 = 2;

impl MenuController {
    pub fn new(input: &InputConfig, alarm: &AlarmConfig, thresholds: &Thresholds) -> Self {
        Self {
            state: MenuState::Monitoring,
            selection: MenuSelection::Max,
            staged_max: thresholds.max,
            staged_min: thresholds.min,
            last_adjust_ms: None,
            settle_ms: input.settle_ms,
            ceiling_c: alarm.ceiling_c,
            floor_c: alarm.floor_c,
        }
    }

    pub fn state(&self) -> MenuState {
        self.state
    }

    pub fn selection(&self) -> MenuSelection {
        self.selection
    }

    pub fn staged_max(&self) -> i32 {
        self.staged_max
    }

    pub fn staged_min(&self) -> i32 {
        self.staged_min
    }

    pub fn is_monitoring(&self) -> bool {
        self.state == MenuState::Monitoring
    }

    /// Applies one tick of input. Returns `true` when the screen needs a redraw.
    pub fn handle(&mut self, events: InputEvents, now_ms: u64, thresholds: &mut Thresholds) -> bool {
        match self.state {
            MenuState::Monitoring => {
                if events.enter_pressed {
                    self.stage(thresholds);
                    self.selection = MenuSelection::Max;
                    self.state = MenuState::MainMenu;
                    return true;
                }
                false
            }
            MenuState::MainMenu => {
                if events.enter_pressed {
                    self.stage(thresholds);
                    self.state = match self.selection {
                        MenuSelection::Max => MenuState::EditingMax,
                        MenuSelection::Min => MenuState::EditingMin,
                    };
                    return true;
                }
                if events.back_pressed {
                    self.state = MenuState::Monitoring;
                    return true;
                }
                if (events.joystick_up || events.joystick_down) && self.settled(now_ms) {
                    self.last_adjust_ms = Some(now_ms);
                    self.selection = self.selection.toggled();
                    return true;
                }
                false
            }
            MenuState::EditingMax => {
                if events.enter_pressed {
                    thresholds.max = self.staged_max;
                    info!("max threshold set to {}°C", thresholds.max);
                    self.state = MenuState::MainMenu;
                    return true;
                }
                if events.back_pressed {
                    self.staged_max = thresholds.max;
                    self.state = MenuState::MainMenu;
                    return true;
                }
                match self.direction(events, now_ms) {
                    Some(step) => {
                        let before = self.staged_max;
                        self.staged_max = (self.staged_max + step)
                            .clamp(thresholds.min + BOUND_GAP, self.ceiling_c.max(thresholds.min + BOUND_GAP));
                        self.staged_max != before
                    }
                    None => false,
                }
            }
            MenuState::EditingMin => {
                if events.enter_pressed {
                    thresholds.min = self.staged_min;
                    info!("min threshold set to {}°C", thresholds.min);
                    self.state = MenuState::MainMenu;
                    return true;
                }
                if events.back_pressed {
                    self.staged_min = thresholds.min;
                    self.state = MenuState::MainMenu;
                    return true;
                }
                match self.direction(events, now_ms) {
                    Some(step) => {
                        let before = self.staged_min;
                        self.staged_min = (self.staged_min + step)
                            .clamp(self.floor_c.min(thresholds.max - BOUND_GAP), thresholds.max - BOUND_GAP);
                        self.staged_min != before
                    }
                    None => false,
                }
            }
        }
    }

    fn stage(&mut self, thresholds: &Thresholds) {
        self.staged_max = thresholds.max;
        self.staged_min = thresholds.min;
    }

    fn settled(&self, now_ms: u64) -> bool {
        self.last_adjust_ms
            .map_or(true, |last| now_ms.saturating_sub(last) >= self.settle_ms)
    }

    /// `+1` for up, `-1` for down, once per settle window.
    fn direction(&mut self, events: InputEvents, now_ms: u64) -> Option<i32> {
        let step = if events.joystick_up {
            1
        } else if events.joystick_down {
            -1
        } else {
            return None;
        };

        if !self.settled(now_ms) {
            return None;
        }
        self.last_adjust_ms = Some(now_ms);
        Some(step)
    }
}
