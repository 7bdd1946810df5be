use std::{
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, Mutex, OnceLock, PoisonError},
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::{net::TcpListener, runtime::Handle, task::JoinHandle};
use tracing::{debug, info, warn};

use thermal_alarm_common::{
    pulse_tick, Board, Color, DeviceIdentity, DisplayError, Indicators, InputPins, LineFault,
    PulseSignal, PulseTimer, SensorError, SimulatedSensorLine, SingleWireBus, Station,
    StationConfig, StationIo, StationStatus, TextDisplay,
};

use crate::net::{LinkControl, StdNetStack};

const JOYSTICK_CENTER: u16 = 2048;

/// Simulated front panel: what the sensor reports and what the operator pressed.
#[derive(Debug)]
struct Panel {
    temperature: u8,
    humidity: u8,
    fault: Option<LineFault>,
    enter_pending: bool,
    back_pending: bool,
    joystick_y: Option<u16>,
    screen: Vec<String>,
}

impl Default for Panel {
    fn default() -> Self {
        Self {
            temperature: 24,
            humidity: 50,
            fault: None,
            enter_pending: false,
            back_pending: false,
            joystick_y: None,
            screen: Vec::new(),
        }
    }
}

type SharedPanel = Arc<Mutex<Panel>>;

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Sensor line whose next frame is taken from the panel at each start pulse.
struct PanelSensor {
    line: SimulatedSensorLine,
    panel: SharedPanel,
}

impl SingleWireBus for PanelSensor {
    fn drive_low(&mut self) -> Result<(), SensorError> {
        {
            let panel = lock(&self.panel);
            self.line.set_reading(panel.temperature, panel.humidity);
            self.line.set_fault(panel.fault);
        }
        self.line.drive_low()
    }

    fn release(&mut self) -> Result<(), SensorError> {
        self.line.release()
    }

    fn is_high(&mut self) -> bool {
        self.line.is_high()
    }

    fn now_us(&mut self) -> u64 {
        self.line.now_us()
    }

    fn delay_us(&mut self, us: u32) {
        self.line.delay_us(us);
    }

    fn delay_ms(&mut self, ms: u32) {
        self.line.delay_ms(ms);
    }
}

/// Button presses from the API are held for exactly one sample.
struct PanelPins {
    panel: SharedPanel,
}

impl InputPins for PanelPins {
    fn enter_active(&mut self) -> bool {
        std::mem::take(&mut lock(&self.panel).enter_pending)
    }

    fn back_active(&mut self) -> bool {
        std::mem::take(&mut lock(&self.panel).back_pending)
    }

    fn joystick_x(&mut self) -> u16 {
        JOYSTICK_CENTER
    }

    fn joystick_y(&mut self) -> u16 {
        lock(&self.panel)
            .joystick_y
            .take()
            .unwrap_or(JOYSTICK_CENTER)
    }
}

/// Logs every frame and mirrors it onto the panel for `/api/status`.
struct LogDisplay {
    panel: SharedPanel,
}

impl TextDisplay for LogDisplay {
    fn write_text(&mut self, text: &str, _x: u32, y: u32, clear: bool) -> Result<(), DisplayError> {
        let mut panel = lock(&self.panel);
        if clear {
            panel.screen.clear();
        }
        panel.screen.push(text.to_string());
        info!(target: "display", "[{y:>2}] {text}");
        Ok(())
    }
}

#[derive(Debug, Default)]
struct HostIndicators {
    color: Option<Color>,
    buzzer: bool,
}

impl Indicators for HostIndicators {
    fn set_color(&mut self, color: Color) {
        if self.color != Some(color) {
            debug!(target: "leds", "{color:?}");
        }
        self.color = Some(color);
    }

    fn set_buzzer(&mut self, on: bool) {
        if self.buzzer != on {
            debug!(target: "buzzer", "{}", if on { "on" } else { "off" });
        }
        self.buzzer = on;
    }
}

/// Pulse timer backed by a tokio interval task.
struct TokioPulseTimer {
    runtime: Handle,
    signal: Arc<PulseSignal>,
    indicators: Arc<Mutex<HostIndicators>>,
    task: Option<JoinHandle<()>>,
}

impl PulseTimer for TokioPulseTimer {
    fn start(&mut self, half_period: Duration) {
        self.stop();

        let signal = Arc::clone(&self.signal);
        let indicators = Arc::clone(&self.indicators);
        self.task = Some(self.runtime.spawn(async move {
            let mut interval = tokio::time::interval(half_period);
            loop {
                interval.tick().await;
                pulse_tick(&signal, &indicators);
            }
        }));
    }

    fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// The host is always "associated".
struct HostLink;

impl LinkControl for HostLink {
    fn is_up(&mut self) -> bool {
        true
    }

    fn join(&mut self, ssid: &str, _pass: &str, _timeout: Duration) -> bool {
        debug!("host link: pretending to join `{ssid}`");
        true
    }
}

struct HostBoard;

impl Board for HostBoard {
    type Bus = PanelSensor;
    type Pins = PanelPins;
    type Display = LogDisplay;
    type Indicators = HostIndicators;
    type Timer = TokioPulseTimer;
    type Net = StdNetStack<HostLink>;
}

#[derive(Clone)]
struct AppState {
    panel: SharedPanel,
    status: Arc<Mutex<StationStatus>>,
    indicators: Arc<Mutex<HostIndicators>>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct HostStatus {
    #[serde(flatten)]
    station: StationStatus,
    screen: Vec<String>,
    color: Option<Color>,
    buzzer: bool,
}

#[derive(Debug, Deserialize)]
struct SensorUpdate {
    temperature: Option<u8>,
    humidity: Option<u8>,
    #[serde(default)]
    fault: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JoystickUpdate {
    y: u16,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = load_config().await?;
    let device_id = DeviceIdentity::new(
        std::env::var("STATION_DEVICE_ID").unwrap_or_else(|_| "thermal-host".to_string()),
    );

    let panel: SharedPanel = Arc::new(Mutex::new(Panel::default()));
    let indicators = Arc::new(Mutex::new(HostIndicators::default()));
    let pulse = Arc::new(PulseSignal::new());

    let io = StationIo::<HostBoard> {
        bus: PanelSensor {
            line: SimulatedSensorLine::with_reading(24, 50),
            panel: Arc::clone(&panel),
        },
        pins: PanelPins {
            panel: Arc::clone(&panel),
        },
        display: LogDisplay {
            panel: Arc::clone(&panel),
        },
        indicators: Arc::clone(&indicators),
        timer: TokioPulseTimer {
            runtime: Handle::current(),
            signal: Arc::clone(&pulse),
            indicators: Arc::clone(&indicators),
            task: None,
        },
        net: StdNetStack::new(HostLink),
    };

    let mut station = Station::new(config, device_id, io, pulse);
    station.startup();
    let status = Arc::new(Mutex::new(station.status()));
    spawn_station_loop(station, Arc::clone(&status));

    let app_state = AppState {
        panel,
        status,
        indicators,
    };

    let app = Router::new()
        .route("/api/status", get(handle_get_status))
        .route("/api/sensor", post(handle_set_sensor))
        .route("/api/input/enter", post(handle_enter))
        .route("/api/input/back", post(handle_back))
        .route("/api/input/joystick", post(handle_joystick))
        .with_state(app_state);

    let port = std::env::var("STATION_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind station simulator at {addr}"))?;

    info!("station simulator listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

/// The loop blocks on the sensor and network, so it gets a thread of its own.
fn spawn_station_loop(mut station: Station<HostBoard>, status: Arc<Mutex<StationStatus>>) {
    let period = station.tick_period();
    tokio::task::spawn_blocking(move || loop {
        let started = Instant::now();
        station.tick(monotonic_ms());
        *lock(&status) = station.status();
        std::thread::sleep(period.saturating_sub(started.elapsed()));
    });
}

async fn load_config() -> anyhow::Result<StationConfig> {
    let mut config = match std::env::var("STATION_CONFIG").map(PathBuf::from) {
        Ok(path) => {
            let raw = tokio::fs::read(&path)
                .await
                .with_context(|| format!("failed to read {}", path.display()))?;
            serde_json::from_slice::<StationConfig>(&raw)
                .with_context(|| format!("invalid station config in {}", path.display()))?
        }
        Err(_) => StationConfig::default(),
    };

    if let Ok(host) = std::env::var("ALERT_HOST") {
        config.network.alert_host = host;
    }
    if let Some(port) = std::env::var("ALERT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
    {
        config.network.alert_port = port;
    }
    if let Ok(path) = std::env::var("ALERT_PATH") {
        config.network.alert_path = path;
    }

    config.sanitize();
    Ok(config)
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    let station = lock(&state.status).clone();
    let screen = lock(&state.panel).screen.clone();
    let (color, buzzer) = {
        let indicators = lock(&state.indicators);
        (indicators.color, indicators.buzzer)
    };

    Json(HostStatus {
        station,
        screen,
        color,
        buzzer,
    })
}

async fn handle_set_sensor(
    State(state): State<AppState>,
    Json(update): Json<SensorUpdate>,
) -> impl IntoResponse {
    let fault = match update.fault.as_deref() {
        None => None,
        Some("timeout") => Some(LineFault::Silent),
        Some("checksum") => Some(LineFault::CorruptChecksum),
        Some(_) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "fault must be \"timeout\", \"checksum\" or null",
            )
        }
    };

    {
        let mut panel = lock(&state.panel);
        if let Some(temperature) = update.temperature {
            panel.temperature = temperature;
        }
        if let Some(humidity) = update.humidity {
            panel.humidity = humidity;
        }
        panel.fault = fault;
    }

    handle_get_status(State(state)).await.into_response()
}

async fn handle_enter(State(state): State<AppState>) -> impl IntoResponse {
    lock(&state.panel).enter_pending = true;
    StatusCode::ACCEPTED
}

async fn handle_back(State(state): State<AppState>) -> impl IntoResponse {
    lock(&state.panel).back_pending = true;
    StatusCode::ACCEPTED
}

async fn handle_joystick(
    State(state): State<AppState>,
    Json(update): Json<JoystickUpdate>,
) -> impl IntoResponse {
    if update.y > 4095 {
        warn!("joystick y {} outside the 12-bit ADC range", update.y);
        return error_response(StatusCode::BAD_REQUEST, "y must be within 0..=4095");
    }
    lock(&state.panel).joystick_y = Some(update.y);
    StatusCode::ACCEPTED.into_response()
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
