use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmConfig {
    pub default_max_c: i32,
    pub default_min_c: i32,
    pub ceiling_c: i32,
    pub floor_c: i32,
    pub pulse_half_period_ms: u64,
    pub alert_cooldown_ms: u64,
}

impl Default for AlarmConfig {
    fn default() -> Self {
        Self {
            default_max_c: 40,
            default_min_c: 0,
            ceiling_c: 80,
            floor_c: -40,
            pulse_half_period_ms: 500,
            alert_cooldown_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputConfig {
    pub debounce_ms: u64,
    pub settle_ms: u64,
    pub joystick_high: u16,
    pub joystick_low: u16,
    /// One debounce clock for both buttons, as the first hardware revision did.
    #[serde(default)]
    pub shared_debounce: bool,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 200,
            settle_ms: 200,
            joystick_high: 3000,
            joystick_low: 1000,
            shared_debounce: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorConfig {
    pub start_low_ms: u32,
    pub wait_timeout_us: u64,
    pub bit_threshold_us: u64,
    pub read_interval_ms: u64,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            start_low_ms: 18,
            wait_timeout_us: 2_000_000,
            bit_threshold_us: 40,
            read_interval_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub alert_host: String,
    pub alert_port: u16,
    pub alert_path: String,
    pub sensor_identifier: String,
    pub join_timeout_ms: u64,
    pub rejoin_timeout_ms: u64,
    pub rejoin_attempts: u32,
    pub dispatch_deadline_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            alert_host: "192.168.1.100".to_string(),
            alert_port: 80,
            alert_path: "/alerts".to_string(),
            sensor_identifier: "S01".to_string(),
            join_timeout_ms: 10_000,
            rejoin_timeout_ms: 1_000,
            rejoin_attempts: 1,
            dispatch_deadline_ms: 15_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationConfig {
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    #[serde(default)]
    pub alarm: AlarmConfig,
    #[serde(default)]
    pub input: InputConfig,
    #[serde(default)]
    pub sensor: SensorConfig,
    #[serde(default)]
    pub network: NetworkConfig,
}

fn default_tick_ms() -> u64 {
    100
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            alarm: AlarmConfig::default(),
            input: InputConfig::default(),
            sensor: SensorConfig::default(),
            network: NetworkConfig::default(),
        }
    }
}

impl StationConfig {
    pub fn sanitize(&mut self) {
        self.tick_ms = self.tick_ms.clamp(10, 1_000);
        self.alarm.sanitize();
        self.input.sanitize();
        self.sensor.sanitize();
        self.network.sanitize();
    }
}

impl AlarmConfig {
    pub fn sanitize(&mut self) {
        if self.floor_c >= self.ceiling_c {
            let defaults = Self::default();
            self.floor_c = defaults.floor_c;
            self.ceiling_c = defaults.ceiling_c;
        }

        self.default_max_c = self.default_max_c.clamp(self.floor_c + 2, self.ceiling_c);
        self.default_min_c = self.default_min_c.clamp(self.floor_c, self.default_max_c - 2);

        if self.pulse_half_period_ms == 0 {
            self.pulse_half_period_ms = 500;
        }
    }
}

impl InputConfig {
    pub fn sanitize(&mut self) {
        if self.joystick_low >= self.joystick_high {
            self.joystick_low = 1000;
            self.joystick_high = 3000;
        }
    }
}

impl SensorConfig {
    pub fn sanitize(&mut self) {
        self.start_low_ms = self.start_low_ms.max(18);
        if self.wait_timeout_us == 0 {
            self.wait_timeout_us = 2_000_000;
        }
        self.bit_threshold_us = self.bit_threshold_us.clamp(10, 100);
    }
}

impl NetworkConfig {
    pub fn sanitize(&mut self) {
        if self.alert_port == 0 {
            self.alert_port = 80;
        }

        if !self.alert_path.starts_with('/') {
            self.alert_path.insert(0, '/');
        }

        self.rejoin_attempts = self.rejoin_attempts.max(1);
        if self.dispatch_deadline_ms == 0 {
            self.dispatch_deadline_ms = 15_000;
        }
    }
}
