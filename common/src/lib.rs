pub mod alarm;
pub mod config;
pub mod dispatch;
pub mod hal;
pub mod input;
pub mod menu;
pub mod screen;
pub mod sensor;
pub mod sim;
pub mod station;
pub mod types;

pub use alarm::{pulse_tick, AlarmAction, AlarmEngine, PulseFrame, PulseSignal};
pub use config::{AlarmConfig, InputConfig, NetworkConfig, SensorConfig, StationConfig};
pub use dispatch::{AlertDispatcher, DispatchError, DispatchPhase, NetEvent, NetStack};
pub use hal::{Board, DisplayError, Indicators, InputPins, PulseTimer, SingleWireBus, TextDisplay};
pub use input::InputSampler;
pub use menu::MenuController;
pub use screen::Frame;
pub use sensor::{SensorError, SensorLink, WaitStage};
pub use sim::{LineFault, SimulatedSensorLine};
pub use station::{Station, StationIo};
pub use types::{
    AlarmStatus, AlertPayload, AlertRequest, Color, DeviceIdentity, InputEvents, MenuSelection,
    MenuState, SensorReading, StationStatus, Thresholds,
};
