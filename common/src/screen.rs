//! Text frames for the status display.

use crate::{
    hal::{DisplayError, TextDisplay},
    types::{AlarmStatus, MenuSelection, MenuState, SensorReading, Thresholds},
};

/// Pixel rows between two text lines on the 128x64 panel.
pub const LINE_HEIGHT: u32 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub lines: Vec<String>,
}

impl Frame {
    fn new(lines: impl IntoIterator<Item = String>) -> Self {
        Self {
            lines: lines.into_iter().collect(),
        }
    }

    pub fn splash() -> Self {
        Self::new(["Display ready!".to_string()])
    }

    pub fn sensor_error() -> Self {
        Self::new([
            "Sensor read error!".to_string(),
            "Check connections!".to_string(),
        ])
    }

    pub fn monitoring(reading: &SensorReading, thresholds: &Thresholds, status: AlarmStatus) -> Self {
        let mut lines = vec![format!("Temp: {} C", reading.temperature)];
        if let Some(humidity) = reading.humidity {
            lines.push(format!("Humidity: {humidity}%"));
        }
        lines.push(format!("Max: {} Min: {}", thresholds.max, thresholds.min));
        lines.push(format!("Status: {}", status.as_str()));
        Self::new(lines)
    }

    /// Shown while monitoring before the first reading completes.
    pub fn waiting(thresholds: &Thresholds) -> Self {
        Self::new([
            "Reading sensor...".to_string(),
            format!("Max: {} Min: {}", thresholds.max, thresholds.min),
        ])
    }

    pub fn main_menu(selection: MenuSelection, staged_max: i32, staged_min: i32) -> Self {
        let marker = |row: MenuSelection| if row == selection { '>' } else { ' ' };
        Self::new([
            "== Thresholds ==".to_string(),
            format!("{} Max: {} C", marker(MenuSelection::Max), staged_max),
            format!("{} Min: {} C", marker(MenuSelection::Min), staged_min),
            "Enter:edit Back:exit".to_string(),
        ])
    }

    pub fn edit(bound: MenuSelection, value: i32) -> Self {
        let title = match bound {
            MenuSelection::Max => "Set max temp",
            MenuSelection::Min => "Set min temp",
        };
        Self::new([
            title.to_string(),
            format!("Value: {value} C"),
            "Up/Down: adjust".to_string(),
            "Enter:save Back:undo".to_string(),
        ])
    }

    /// Picks the frame for the current menu state and latest reading.
    pub fn for_state(
        state: MenuState,
        selection: MenuSelection,
        staged: &Thresholds,
        live: &Thresholds,
        reading: Option<&SensorReading>,
        status: AlarmStatus,
    ) -> Self {
        match state {
            MenuState::Monitoring => match reading {
                Some(reading) if reading.present => Self::monitoring(reading, live, status),
                Some(_) => Self::sensor_error(),
                None => Self::waiting(live),
            },
            MenuState::MainMenu => Self::main_menu(selection, staged.max, staged.min),
            MenuState::EditingMax => Self::edit(MenuSelection::Max, staged.max),
            MenuState::EditingMin => Self::edit(MenuSelection::Min, staged.min),
        }
    }
}

/// Writes every line of `frame`; only the first write clears the panel.
pub fn draw<D: TextDisplay>(display: &mut D, frame: &Frame) -> Result<(), DisplayError> {
    for (row, line) in frame.lines.iter().enumerate() {
        let y = row as u32 * LINE_HEIGHT;
        display.write_text(line, 0, y, row == 0)?;
    }
    Ok(())
}
