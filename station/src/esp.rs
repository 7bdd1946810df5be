use core::convert::TryInto;
use std::{
    sync::{Arc, Mutex, OnceLock},
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use embedded_graphics::{
    mono_font::{ascii::FONT_6X10, MonoTextStyle},
    pixelcolor::BinaryColor,
    prelude::*,
    text::{Baseline, Text},
};
use embedded_svc::wifi::{AuthMethod, ClientConfiguration, Configuration};
use esp_idf_hal::{
    adc::{
        attenuation::DB_11,
        oneshot::{config::AdcChannelConfig, AdcChannelDriver, AdcDriver},
        ADC1,
    },
    delay::Ets,
    gpio::{
        AnyIOPin, AnyInputPin, Gpio34, Gpio35, IOPin, Input, InputOutput, InputPin, PinDriver,
        Pull,
    },
    i2c::{I2cConfig, I2cDriver},
    ledc::{config::TimerConfig, LedcDriver, LedcTimerDriver},
    modem::Modem,
    peripherals::Peripherals,
    prelude::*,
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    log::EspLogger,
    nvs::EspDefaultNvsPartition,
    timer::{EspTaskTimerService, EspTimer},
    wifi::EspWifi,
};
use log::{debug, info, warn};
use ssd1306::{mode::BufferedGraphicsMode, prelude::*, I2CDisplayInterface, Ssd1306};

use thermal_alarm_common::{
    pulse_tick, Board, DeviceIdentity, DisplayError, InputPins, NetworkConfig, PulseSignal,
    PulseTimer, SensorError, SingleWireBus, Station, StationConfig, StationIo, TextDisplay,
};

use crate::{
    leds::{AlarmOutputs, LedMatrix, Tone},
    net::{LinkControl, StdNetStack},
};

const BUZZER_FREQ_HZ: u32 = 2_000;
const DISPLAY_RETRY_MS: u64 = 1_000;
const JOIN_POLL_MS: u64 = 100;
const JOYSTICK_CENTER: u16 = 2048;

type Oled = Ssd1306<
    I2CInterface<I2cDriver<'static>>,
    DisplaySize128x64,
    BufferedGraphicsMode<DisplaySize128x64>,
>;
type SharedAdc = Arc<AdcDriver<'static, ADC1>>;

struct EspBoard;

impl Board for EspBoard {
    type Bus = DhtLine;
    type Pins = PanelInputs;
    type Display = OledDisplay;
    type Indicators = AlarmOutputs<LedcBuzzer>;
    type Timer = EspPulseTimer;
    type Net = StdNetStack<EspLink>;
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let mut config = StationConfig::default();
    ensure_network_defaults(&mut config.network);
    config.sanitize();

    info!(
        "config loaded: ssid=`{}`, alert=`{}:{}{}`",
        config.network.wifi_ssid,
        config.network.alert_host,
        config.network.alert_port,
        config.network.alert_path,
    );

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let timer_service = EspTaskTimerService::new()?;
    let peripherals = Peripherals::take()?;
    let pins = peripherals.pins;

    let device_id = factory_device_id();
    info!("device identity {}", device_id.as_str());

    let mut buzzer = LedcBuzzer::new(LedcDriver::new(
        peripherals.ledc.channel0,
        LedcTimerDriver::new(
            peripherals.ledc.timer0,
            &TimerConfig::default().frequency(BUZZER_FREQ_HZ.Hz()),
        )
        .context("failed to init buzzer timer")?,
        pins.gpio23,
    )?);
    buzzer.set_tone(false)?;

    let matrix = LedMatrix::new(peripherals.rmt.channel0, pins.gpio18)
        .context("failed to init LED matrix")?;
    info!("LED matrix initialized on RMT channel0 / GPIO18");
    let indicators = Arc::new(Mutex::new(AlarmOutputs { matrix, buzzer }));

    let i2c = I2cDriver::new(
        peripherals.i2c0,
        pins.gpio21,
        pins.gpio22,
        &I2cConfig::new().baudrate(400.kHz().into()),
    )
    .context("failed to init I2C bus")?;
    let display = OledDisplay::start(i2c);

    let mut data = PinDriver::input_output_od(pins.gpio4.downgrade())?;
    data.set_pull(Pull::Up)?;
    data.set_high()?;

    let mut enter = PinDriver::input(pins.gpio25.downgrade_input())?;
    enter.set_pull(Pull::Up)?;
    let mut back = PinDriver::input(pins.gpio26.downgrade_input())?;
    back.set_pull(Pull::Up)?;

    let adc: SharedAdc = Arc::new(AdcDriver::new(peripherals.adc1)?);
    let axis_config = AdcChannelConfig {
        attenuation: DB_11,
        ..Default::default()
    };
    let joystick_x = AdcChannelDriver::new(Arc::clone(&adc), pins.gpio34, &axis_config)?;
    let joystick_y = AdcChannelDriver::new(Arc::clone(&adc), pins.gpio35, &axis_config)?;

    let pulse = Arc::new(PulseSignal::new());
    let timer = EspPulseTimer::new(&timer_service, Arc::clone(&pulse), Arc::clone(&indicators))?;

    let link = EspLink::new(peripherals.modem, sys_loop, nvs_partition)?;

    let io = StationIo::<EspBoard> {
        bus: DhtLine { pin: data },
        pins: PanelInputs {
            enter,
            back,
            joystick_x,
            joystick_y,
        },
        display,
        indicators,
        timer,
        net: StdNetStack::new(link),
    };

    let mut station = Station::new(config, device_id, io, pulse);
    station.startup();

    let period = station.tick_period();
    loop {
        let started = monotonic_ms();
        station.tick(started);

        let spent = Duration::from_millis(monotonic_ms().saturating_sub(started));
        thread::sleep(period.saturating_sub(spent));
    }
}

fn ensure_network_defaults(network: &mut NetworkConfig) {
    if network.wifi_ssid.is_empty() {
        network.wifi_ssid = option_env!("WIFI_SSID").unwrap_or("CHANGE_ME").to_string();
    }
    if network.wifi_pass.is_empty() {
        network.wifi_pass = option_env!("WIFI_PASS").unwrap_or_default().to_string();
    }
    if let Some(host) = option_env!("ALERT_HOST") {
        network.alert_host = host.to_string();
    }
    if let Some(port) = option_env!("ALERT_PORT").and_then(|value| value.parse().ok()) {
        network.alert_port = port;
    }
    if let Some(path) = option_env!("ALERT_PATH") {
        network.alert_path = path.to_string();
    }

    if !has_station_credentials(network) {
        warn!("wifi credentials missing; alerts stay local");
        network.wifi_ssid.clear();
    }
}

fn has_station_credentials(network: &NetworkConfig) -> bool {
    let ssid = network.wifi_ssid.trim();
    !ssid.is_empty() && ssid != "CHANGE_ME"
}

fn factory_device_id() -> DeviceIdentity {
    let mut mac = [0_u8; 6];
    let rc = unsafe { esp_idf_svc::sys::esp_efuse_mac_get_default(mac.as_mut_ptr()) };
    if rc != esp_idf_svc::sys::ESP_OK {
        warn!("failed to read factory MAC: esp_err_t={rc}");
    }
    DeviceIdentity::from_mac(mac)
}

/// DHT data line on an open-drain GPIO with the internal pull-up enabled.
struct DhtLine {
    pin: PinDriver<'static, AnyIOPin, InputOutput>,
}

impl SingleWireBus for DhtLine {
    fn drive_low(&mut self) -> Result<(), SensorError> {
        self.pin
            .set_low()
            .map_err(|err| SensorError::Line(err.code()))
    }

    fn release(&mut self) -> Result<(), SensorError> {
        self.pin
            .set_high()
            .map_err(|err| SensorError::Line(err.code()))
    }

    fn is_high(&mut self) -> bool {
        self.pin.is_high()
    }

    fn now_us(&mut self) -> u64 {
        let now = unsafe { esp_idf_svc::sys::esp_timer_get_time() };
        now.try_into().unwrap_or_default()
    }

    fn delay_us(&mut self, us: u32) {
        Ets::delay_us(us);
    }

    /// Busy-waits: a FreeRTOS delay can return up to one tick early.
    fn delay_ms(&mut self, ms: u32) {
        Ets::delay_ms(ms);
    }

    fn with_interrupts_masked<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        esp_idf_hal::interrupt::free(|| f(self))
    }
}

/// Enter/Back are active-low with pull-ups; the joystick axes are 12-bit ADC reads.
struct PanelInputs {
    enter: PinDriver<'static, AnyInputPin, Input>,
    back: PinDriver<'static, AnyInputPin, Input>,
    joystick_x: AdcChannelDriver<'static, Gpio34, SharedAdc>,
    joystick_y: AdcChannelDriver<'static, Gpio35, SharedAdc>,
}

impl InputPins for PanelInputs {
    fn enter_active(&mut self) -> bool {
        self.enter.is_low()
    }

    fn back_active(&mut self) -> bool {
        self.back.is_low()
    }

    fn joystick_x(&mut self) -> u16 {
        read_axis(&mut self.joystick_x, "x")
    }

    fn joystick_y(&mut self) -> u16 {
        read_axis(&mut self.joystick_y, "y")
    }
}

fn read_axis<P>(channel: &mut AdcChannelDriver<'static, P, SharedAdc>, axis: &str) -> u16
where
    P: esp_idf_hal::gpio::ADCPin<Adc = ADC1>,
{
    match channel.read_raw() {
        Ok(value) => value,
        Err(err) => {
            warn!("joystick {axis} read failed: {err}");
            JOYSTICK_CENTER
        }
    }
}

struct OledDisplay {
    oled: Oled,
}

impl OledDisplay {
    /// Blocks until the panel answers; the station has no headless mode.
    fn start(i2c: I2cDriver<'static>) -> Self {
        let interface = I2CDisplayInterface::new(i2c);
        let mut oled = Ssd1306::new(interface, DisplaySize128x64, DisplayRotation::Rotate0)
            .into_buffered_graphics_mode();

        let mut attempt: u32 = 0;
        while let Err(err) = oled.init() {
            attempt = attempt.saturating_add(1);
            warn!("display init failed (attempt {attempt}): {err:?}");
            thread::sleep(Duration::from_millis(DISPLAY_RETRY_MS));
        }
        info!("display initialized");

        Self { oled }
    }
}

impl TextDisplay for OledDisplay {
    fn write_text(&mut self, text: &str, x: u32, y: u32, clear: bool) -> Result<(), DisplayError> {
        if clear {
            self.oled.clear_buffer();
        }

        let style = MonoTextStyle::new(&FONT_6X10, BinaryColor::On);
        let origin = Point::new(
            x.try_into().unwrap_or(i32::MAX),
            y.try_into().unwrap_or(i32::MAX),
        );
        Text::with_baseline(text, origin, style, Baseline::Top)
            .draw(&mut self.oled)
            .map_err(|err| DisplayError(format!("{err:?}")))?;

        self.oled
            .flush()
            .map_err(|err| DisplayError(format!("{err:?}")))
    }
}

struct LedcBuzzer {
    driver: LedcDriver<'static>,
}

impl LedcBuzzer {
    fn new(driver: LedcDriver<'static>) -> Self {
        Self { driver }
    }
}

impl Tone for LedcBuzzer {
    fn set_tone(&mut self, on: bool) -> anyhow::Result<()> {
        let duty = if on { self.driver.get_max_duty() / 2 } else { 0 };
        self.driver
            .set_duty(duty)
            .context("failed to set buzzer duty")
    }
}

/// Periodic esp_timer task whose callback is the shared pulse step.
struct EspPulseTimer {
    timer: EspTimer<'static>,
    running: bool,
}

impl EspPulseTimer {
    fn new(
        service: &EspTaskTimerService,
        signal: Arc<PulseSignal>,
        indicators: Arc<Mutex<AlarmOutputs<LedcBuzzer>>>,
    ) -> anyhow::Result<Self> {
        let timer = service
            .timer(move || pulse_tick(&signal, &indicators))
            .context("failed to create pulse timer")?;
        Ok(Self {
            timer,
            running: false,
        })
    }
}

impl PulseTimer for EspPulseTimer {
    fn start(&mut self, half_period: Duration) {
        match self.timer.every(half_period) {
            Ok(()) => self.running = true,
            Err(err) => warn!("failed to start pulse timer: {err}"),
        }
    }

    fn stop(&mut self) {
        if !self.running {
            return;
        }
        if let Err(err) = self.timer.cancel() {
            warn!("failed to cancel pulse timer: {err}");
        }
        self.running = false;
    }
}

/// Station-mode WiFi association. The radio is started once; joins only
/// swap the client configuration and wait for the netif.
struct EspLink {
    wifi: EspWifi<'static>,
}

impl EspLink {
    fn new(
        modem: Modem,
        sys_loop: EspSystemEventLoop,
        nvs_partition: EspDefaultNvsPartition,
    ) -> anyhow::Result<Self> {
        let mut wifi = EspWifi::new(modem, sys_loop, Some(nvs_partition))?;
        wifi.set_configuration(&Configuration::Client(ClientConfiguration::default()))?;
        wifi.start().context("failed to start wifi")?;
        disable_wifi_power_save();
        Ok(Self { wifi })
    }

    fn configure(&mut self, ssid: &str, pass: &str) -> anyhow::Result<()> {
        let auth_method = if pass.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        };

        self.wifi
            .set_configuration(&Configuration::Client(ClientConfiguration {
                ssid: ssid.try_into().map_err(|_| anyhow!("wifi ssid too long"))?,
                password: pass
                    .try_into()
                    .map_err(|_| anyhow!("wifi password too long"))?,
                auth_method,
                ..Default::default()
            }))?;
        Ok(())
    }
}

impl LinkControl for EspLink {
    fn is_up(&mut self) -> bool {
        is_wifi_station_connected() && self.wifi.is_up().unwrap_or(false)
    }

    fn join(&mut self, ssid: &str, pass: &str, timeout: Duration) -> bool {
        if let Err(err) = self.configure(ssid, pass) {
            warn!("wifi configuration rejected: {err:#}");
            return false;
        }

        info!("wifi connecting to `{ssid}`");
        if let Err(err) = self.wifi.connect() {
            warn!("wifi connect request failed: {err}");
            return false;
        }

        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.is_up() {
                info!("wifi connected and netif up");
                return true;
            }
            thread::sleep(Duration::from_millis(JOIN_POLL_MS));
        }

        warn!("wifi join timed out after {}ms", timeout.as_millis());
        if let Err(err) = self.wifi.disconnect() {
            debug!("wifi disconnect after timeout failed: {err}");
        }
        false
    }
}

fn disable_wifi_power_save() {
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_set_ps(0) };
    if rc == esp_idf_svc::sys::ESP_OK {
        info!("wifi power save disabled");
    } else {
        warn!("failed to disable wifi power save: esp_err_t={rc}");
    }
}

fn is_wifi_station_connected() -> bool {
    let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
    rc == esp_idf_svc::sys::ESP_OK
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
