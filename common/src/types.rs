use serde::{Deserialize, Serialize};

/// One outcome of a sensor transaction. `present == false` carries no values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorReading {
    pub present: bool,
    pub temperature: i32,
    pub humidity: Option<i32>,
}

impl SensorReading {
    pub fn valid(temperature: i32, humidity: Option<i32>) -> Self {
        Self {
            present: true,
            temperature,
            humidity,
        }
    }

    pub fn missing() -> Self {
        Self {
            present: false,
            temperature: 0,
            humidity: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thresholds {
    pub min: i32,
    pub max: i32,
}

impl Thresholds {
    pub fn new(min: i32, max: i32) -> Self {
        Self { min, max }
    }

    pub fn violation(&self, temperature: i32) -> Option<AlarmStatus> {
        if temperature >= self.max {
            Some(AlarmStatus::High)
        } else if temperature <= self.min {
            Some(AlarmStatus::Low)
        } else {
            None
        }
    }
}

/// Edge-triggered button presses plus the joystick's current deflection for one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InputEvents {
    pub enter_pressed: bool,
    pub back_pressed: bool,
    pub joystick_up: bool,
    pub joystick_down: bool,
}

impl InputEvents {
    pub fn none() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MenuState {
    Monitoring,
    MainMenu,
    EditingMax,
    EditingMin,
}

impl MenuState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Monitoring => "MONITORING",
            Self::MainMenu => "MAIN_MENU",
            Self::EditingMax => "EDITING_MAX",
            Self::EditingMin => "EDITING_MIN",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MenuSelection {
    Max,
    Min,
}

impl MenuSelection {
    pub fn toggled(self) -> Self {
        match self {
            Self::Max => Self::Min,
            Self::Min => Self::Max,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlarmStatus {
    Normal,
    High,
    Low,
    SensorError,
}

impl AlarmStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "NORMAL",
            Self::High => "HIGH",
            Self::Low => "LOW",
            Self::SensorError => "SENSOR ERROR",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Color {
    Off,
    Red,
    Green,
    Yellow,
    Spring,
}

impl Color {
    pub fn rgb(self) -> (u8, u8, u8) {
        match self {
            Self::Off => (0, 0, 0),
            Self::Red => (255, 0, 0),
            Self::Green => (0, 255, 0),
            Self::Yellow => (255, 255, 0),
            Self::Spring => (0, 255, 127),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity(String);

impl DeviceIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Renders a factory MAC as `thermal-XXXXXXXXXXXX`.
    pub fn from_mac(mac: [u8; 6]) -> Self {
        let hex: String = mac.iter().map(|byte| format!("{byte:02X}")).collect();
        Self(format!("thermal-{hex}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertRequest {
    pub device_id: DeviceIdentity,
    pub temperature: i32,
    pub threshold_max: i32,
    pub threshold_min: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct AlertPayload<'a> {
    pub status: &'static str,
    #[serde(rename = "sensorIdentifier")]
    pub sensor_identifier: &'a str,
    #[serde(rename = "deviceId")]
    pub device_id: &'a str,
    pub temperature: i32,
    #[serde(rename = "thresholdMax")]
    pub threshold_max: i32,
    #[serde(rename = "thresholdMin")]
    pub threshold_min: i32,
}

impl<'a> AlertPayload<'a> {
    pub fn detected(request: &'a AlertRequest, sensor_identifier: &'a str) -> Self {
        Self {
            status: "DETECTED",
            sensor_identifier,
            device_id: request.device_id.as_str(),
            temperature: request.temperature,
            threshold_max: request.threshold_max,
            threshold_min: request.threshold_min,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StationStatus {
    #[serde(rename = "deviceId")]
    pub device_id: String,
    #[serde(rename = "menuState")]
    pub menu_state: &'static str,
    pub thresholds: Thresholds,
    #[serde(rename = "lastReading")]
    pub last_reading: Option<SensorReading>,
    #[serde(rename = "alarmStatus")]
    pub alarm_status: &'static str,
    #[serde(rename = "alarmActive")]
    pub alarm_active: bool,
    #[serde(rename = "alertsSent")]
    pub alerts_sent: u64,
    #[serde(rename = "alertsFailed")]
    pub alerts_failed: u64,
}
