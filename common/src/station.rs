use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use log::{debug, info, warn};

use crate::{
    alarm::{AlarmAction, AlarmEngine, PulseSignal},
    config::StationConfig,
    dispatch::AlertDispatcher,
    hal::{Board, Indicators, PulseTimer},
    input::InputSampler,
    menu::MenuController,
    screen::{draw, Frame},
    sensor::SensorLink,
    types::{Color, DeviceIdentity, MenuState, SensorReading, StationStatus, Thresholds},
};

/// Board drivers handed to the station at boot.
pub struct StationIo<B: Board> {
    pub bus: B::Bus,
    pub pins: B::Pins,
    pub display: B::Display,
    pub indicators: Arc<Mutex<B::Indicators>>,
    pub timer: B::Timer,
    pub net: B::Net,
}

/// The main control loop body. Call [`Station::tick`] once per `tick_ms`.
pub struct Station<B: Board> {
    config: StationConfig,
    device_id: DeviceIdentity,
    sensor: SensorLink<B::Bus>,
    pins: B::Pins,
    display: B::Display,
    indicators: Arc<Mutex<B::Indicators>>,
    timer: B::Timer,
    dispatcher: AlertDispatcher<B::Net>,
    pulse: Arc<PulseSignal>,
    sampler: InputSampler,
    menu: MenuController,
    alarm: AlarmEngine,
    thresholds: Thresholds,
    last_reading: Option<SensorReading>,
    last_read_ms: Option<u64>,
}

impl<B: Board> Station<B> {
    /// `pulse` must be the same signal the board's pulse timer callback was bound to.
    pub fn new(
        mut config: StationConfig,
        device_id: DeviceIdentity,
        io: StationIo<B>,
        pulse: Arc<PulseSignal>,
    ) -> Self {
        config.sanitize();
        let thresholds = Thresholds::new(config.alarm.default_min_c, config.alarm.default_max_c);

        Self {
            sensor: SensorLink::new(io.bus, config.sensor.clone()),
            pins: io.pins,
            display: io.display,
            indicators: io.indicators,
            timer: io.timer,
            dispatcher: AlertDispatcher::new(io.net, config.network.clone()),
            pulse,
            sampler: InputSampler::new(config.input.clone()),
            menu: MenuController::new(&config.input, &config.alarm, &thresholds),
            alarm: AlarmEngine::new(config.alarm.clone(), device_id.clone()),
            thresholds,
            last_reading: None,
            last_read_ms: None,
            device_id,
            config,
        }
    }

    /// Boot sequence after the display is up: idle outputs, splash, WiFi join.
    pub fn startup(&mut self) {
        {
            let mut indicators = self.lock_indicators();
            indicators.set_buzzer(false);
            indicators.set_color(Color::Spring);
        }

        self.show(&Frame::splash());
        info!(
            "station {} up, thresholds min {} / max {}",
            self.device_id.as_str(),
            self.thresholds.min,
            self.thresholds.max
        );

        self.dispatcher.join_link();
        self.redraw();
    }

    pub fn tick(&mut self, now_ms: u64) {
        let events = self.sampler.sample(&mut self.pins, now_ms);
        let mut redraw = self.menu.handle(events, now_ms, &mut self.thresholds);
        if redraw {
            debug!("menu -> {}", self.menu.state().as_str());
        }

        if self.menu.is_monitoring() && self.sensor_due(now_ms) {
            self.last_read_ms = Some(now_ms);
            let reading = self.sensor.read();
            self.last_reading = Some(reading);

            let actions = self.alarm.evaluate(&reading, &self.thresholds, now_ms);
            for action in actions {
                self.execute(action);
            }
            redraw = true;
        }

        if redraw {
            self.redraw();
        }
    }

    pub fn status(&self) -> StationStatus {
        StationStatus {
            device_id: self.device_id.as_str().to_string(),
            menu_state: self.menu.state().as_str(),
            thresholds: self.thresholds,
            last_reading: self.last_reading,
            alarm_status: self.alarm.status().as_str(),
            alarm_active: self.alarm.is_active(),
            alerts_sent: self.dispatcher.alerts_sent(),
            alerts_failed: self.dispatcher.alerts_failed(),
        }
    }

    pub fn thresholds(&self) -> Thresholds {
        self.thresholds
    }

    pub fn menu_state(&self) -> MenuState {
        self.menu.state()
    }

    pub fn alarm(&self) -> &AlarmEngine {
        &self.alarm
    }

    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(self.config.tick_ms)
    }

    pub fn sensor_bus_mut(&mut self) -> &mut B::Bus {
        self.sensor.bus_mut()
    }

    pub fn pins_mut(&mut self) -> &mut B::Pins {
        &mut self.pins
    }

    pub fn display_mut(&mut self) -> &mut B::Display {
        &mut self.display
    }

    pub fn timer_mut(&mut self) -> &mut B::Timer {
        &mut self.timer
    }

    pub fn net_mut(&mut self) -> &mut B::Net {
        self.dispatcher.net_mut()
    }

    fn sensor_due(&self, now_ms: u64) -> bool {
        self.last_read_ms.map_or(true, |last| {
            now_ms.saturating_sub(last) >= self.config.sensor.read_interval_ms
        })
    }

    fn execute(&mut self, action: AlarmAction) {
        match action {
            AlarmAction::StartPulse => {
                self.pulse.arm();
                self.timer
                    .start(Duration::from_millis(self.config.alarm.pulse_half_period_ms));
            }
            AlarmAction::StopPulse => {
                {
                    // Disarm under the lock so a callback already waiting on it sees the change.
                    let mut indicators = self.lock_indicators();
                    self.pulse.disarm();
                    indicators.set_color(Color::Off);
                    indicators.set_buzzer(false);
                }
                self.timer.stop();
            }
            AlarmAction::SteadyColor(color) => self.lock_indicators().set_color(color),
            AlarmAction::Buzzer(on) => self.lock_indicators().set_buzzer(on),
            AlarmAction::Dispatch(request) => {
                debug!(
                    "dispatching alert: {}°C outside {}..{}",
                    request.temperature, request.threshold_min, request.threshold_max
                );
                self.dispatcher.send(&request);
            }
        }
    }

    fn lock_indicators(&self) -> MutexGuard<'_, B::Indicators> {
        self.indicators
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn redraw(&mut self) {
        let staged = Thresholds::new(self.menu.staged_min(), self.menu.staged_max());
        let frame = Frame::for_state(
            self.menu.state(),
            self.menu.selection(),
            &staged,
            &self.thresholds,
            self.last_reading.as_ref(),
            self.alarm.status(),
        );
        self.show(&frame);
    }

    fn show(&mut self, frame: &Frame) {
        if let Err(err) = draw(&mut self.display, frame) {
            warn!("{err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::VecDeque, net::SocketAddr};

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        dispatch::{NetEvent, NetStack},
        hal::{DisplayError, InputPins, TextDisplay},
        sim::{LineFault, SimulatedSensorLine},
        types::AlarmStatus,
    };

    #[derive(Default)]
    struct Pins {
        enter: bool,
        back: bool,
        y: u16,
    }

    impl InputPins for Pins {
        fn enter_active(&mut self) -> bool {
            self.enter
        }

        fn back_active(&mut self) -> bool {
            self.back
        }

        fn joystick_x(&mut self) -> u16 {
            2048
        }

        fn joystick_y(&mut self) -> u16 {
            self.y
        }
    }

    #[derive(Default)]
    struct Screen {
        frames: Vec<Vec<String>>,
    }

    impl Screen {
        fn last(&self) -> Vec<String> {
            self.frames.last().cloned().unwrap_or_default()
        }
    }

    impl TextDisplay for Screen {
        fn write_text(&mut self, text: &str, _x: u32, _y: u32, clear: bool) -> Result<(), DisplayError> {
            if clear || self.frames.is_empty() {
                self.frames.push(Vec::new());
            }
            if let Some(frame) = self.frames.last_mut() {
                frame.push(text.to_string());
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct Lights {
        color: Option<Color>,
        buzzer: bool,
    }

    impl Indicators for Lights {
        fn set_color(&mut self, color: Color) {
            self.color = Some(color);
        }

        fn set_buzzer(&mut self, on: bool) {
            self.buzzer = on;
        }
    }

    #[derive(Default)]
    struct Timer {
        running: bool,
        starts: u32,
        stops: u32,
    }

    impl PulseTimer for Timer {
        fn start(&mut self, half_period: Duration) {
            assert_eq!(half_period, Duration::from_millis(500));
            self.running = true;
            self.starts += 1;
        }

        fn stop(&mut self) {
            self.running = false;
            self.stops += 1;
        }
    }

    /// Accepts every request with a 200.
    #[derive(Default)]
    struct Net {
        queue: VecDeque<NetEvent>,
        requests: u32,
        now: u64,
    }

    impl NetStack for Net {
        fn link_up(&mut self) -> bool {
            true
        }

        fn join(&mut self, _ssid: &str, _pass: &str, _timeout_ms: u64) -> bool {
            true
        }

        fn resolve(&mut self, _host: &str) {
            self.queue.push_back(NetEvent::ResolveFailed);
        }

        fn connect(&mut self, _addr: SocketAddr) {
            self.queue.push_back(NetEvent::Connected);
        }

        fn write(&mut self, _data: &[u8]) {
            self.requests += 1;
            self.queue.push_back(NetEvent::Sent);
            self.queue
                .push_back(NetEvent::Received(b"HTTP/1.1 200 OK\r\n".to_vec()));
        }

        fn close(&mut self) {}

        fn poll(&mut self) -> Option<NetEvent> {
            self.queue.pop_front()
        }

        fn sleep_ms(&mut self, ms: u32) {
            self.now += u64::from(ms);
        }

        fn now_ms(&mut self) -> u64 {
            self.now
        }
    }

    struct TestBoard;

    impl Board for TestBoard {
        type Bus = SimulatedSensorLine;
        type Pins = Pins;
        type Display = Screen;
        type Indicators = Lights;
        type Timer = Timer;
        type Net = Net;
    }

    struct Harness {
        station: Station<TestBoard>,
        lights: Arc<Mutex<Lights>>,
        now_ms: u64,
    }

    impl Harness {
        fn new(min: i32, max: i32) -> Self {
            let mut config = StationConfig::default();
            config.alarm.default_min_c = min;
            config.alarm.default_max_c = max;

            let lights = Arc::new(Mutex::new(Lights::default()));
            let io = StationIo {
                bus: SimulatedSensorLine::with_reading(20, 50),
                pins: Pins {
                    y: 2048,
                    ..Pins::default()
                },
                display: Screen::default(),
                indicators: Arc::clone(&lights),
                timer: Timer::default(),
                net: Net::default(),
            };
            let station = Station::new(
                config,
                DeviceIdentity::new("thermal-test"),
                io,
                Arc::new(PulseSignal::new()),
            );

            Self {
                station,
                lights,
                now_ms: 0,
            }
        }

        /// Feeds one reading and advances past the sensor read interval.
        fn read(&mut self, temperature: u8) {
            self.now_ms += 2_000;
            self.station.sensor_bus_mut().set_reading(temperature, 50);
            self.station.tick(self.now_ms);
        }

        fn press(&mut self, set: impl Fn(&mut Pins, bool)) {
            set(self.station.pins_mut(), true);
            self.station.tick(self.now_ms);
            self.now_ms += 100;
            set(self.station.pins_mut(), false);
            self.station.tick(self.now_ms);
            self.now_ms += 200;
        }

        fn enter(&mut self) {
            self.press(|pins, on| pins.enter = on);
        }

        fn back(&mut self) {
            self.press(|pins, on| pins.back = on);
        }

        fn color(&self) -> Option<Color> {
            self.lights.lock().unwrap().color
        }
    }

    #[test]
    fn violation_pulses_once_and_clears() {
        let mut harness = Harness::new(-8, 32);
        let mut active = Vec::new();

        for temperature in [28, 33, 33, 20] {
            harness.read(temperature);
            active.push(harness.station.alarm().is_active());
            if temperature == 33 {
                assert_eq!(harness.station.alarm().status(), AlarmStatus::High);
            }
        }

        assert_eq!(active, vec![false, true, true, false]);
        assert_eq!(harness.station.net_mut().requests, 1);
        assert_eq!(harness.station.timer_mut().starts, 1);
        assert_eq!(harness.station.timer_mut().stops, 1);
        assert!(!harness.station.timer_mut().running);
        assert_eq!(harness.color(), Some(Color::Green));
        assert_eq!(harness.station.status().alerts_sent, 1);
    }

    #[test]
    fn invalid_frames_never_raise_the_alarm() {
        let mut harness = Harness::new(-8, 32);
        harness
            .station
            .sensor_bus_mut()
            .set_fault(LineFault::CorruptChecksum);

        for _ in 0..3 {
            harness.station.tick(harness.now_ms);
            harness.now_ms += 2_000;
            assert!(!harness.station.alarm().is_active());
            assert_eq!(harness.station.status().last_reading.map(|r| r.present), Some(false));
        }

        assert_eq!(harness.station.sensor_bus_mut().transactions(), 3);
        assert_eq!(harness.station.net_mut().requests, 0);
        assert_eq!(harness.station.timer_mut().starts, 0);
        assert_eq!(harness.color(), Some(Color::Yellow));
        assert_eq!(
            harness.station.display_mut().last(),
            vec!["Sensor read error!", "Check connections!"]
        );
    }

    #[test]
    fn edit_screen_shows_live_max_and_back_keeps_selection() {
        let mut harness = Harness::new(-8, 32);

        harness.enter();
        assert_eq!(harness.station.menu_state(), MenuState::MainMenu);

        harness.enter();
        assert_eq!(harness.station.menu_state(), MenuState::EditingMax);
        assert_eq!(harness.station.display_mut().last()[1], "Value: 32 C");

        harness.back();
        assert_eq!(harness.station.menu_state(), MenuState::MainMenu);
        assert_eq!(harness.station.display_mut().last()[1], "> Max: 32 C");
        assert_eq!(harness.station.thresholds(), Thresholds::new(-8, 32));
        assert_eq!(harness.station.sensor_bus_mut().transactions(), 0);
    }

    #[test]
    fn committed_max_applies_on_return_to_monitoring() {
        let mut harness = Harness::new(-8, 32);
        harness.enter();
        harness.enter();

        for _ in 0..2 {
            harness.station.pins_mut().y = 0;
            harness.station.tick(harness.now_ms);
            harness.now_ms += 200;
        }
        harness.station.pins_mut().y = 2048;

        harness.enter();
        assert_eq!(harness.station.thresholds(), Thresholds::new(-8, 30));

        harness.back();
        assert_eq!(harness.station.menu_state(), MenuState::Monitoring);

        harness.read(31);
        assert!(harness.station.alarm().is_active());
    }

    #[test]
    fn alarm_keeps_pulsing_while_menu_is_open() {
        let mut harness = Harness::new(-8, 32);
        harness.read(40);
        assert!(harness.station.timer_mut().running);

        harness.enter();
        assert_eq!(harness.station.menu_state(), MenuState::MainMenu);
        assert!(harness.station.timer_mut().running);
        assert!(harness.station.alarm().is_active());
    }

    #[test]
    fn sensor_is_read_once_per_interval() {
        let mut harness = Harness::new(-8, 32);
        for tick in 0..25 {
            harness.station.tick(tick * 100);
        }
        assert_eq!(harness.station.sensor_bus_mut().transactions(), 2);
    }

    #[test]
    fn startup_shows_splash_then_idle_color() {
        let mut harness = Harness::new(-8, 32);
        harness.station.startup();

        let frames = &harness.station.display_mut().frames;
        assert_eq!(frames[0], vec!["Display ready!"]);
        assert_eq!(harness.color(), Some(Color::Spring));
        assert_eq!(harness.station.status().menu_state, "MONITORING");
    }
}
