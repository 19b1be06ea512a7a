//! Controller for Hello Fairy BLE LED curtain lights
//!
//! Turns intents such as "show red" or "play an effect" into the light's
//! checksummed frames and writes them over BLE one at a time. The BLE stack
//! itself is supplied by the host through [`Transport`].

pub mod controller;
pub mod domain;
pub mod error;
pub mod infrastructure;

pub use controller::{ControllerConfig, DeviceController};
pub use domain::models::{
    Color, CommandTicket, ConnectionStatus, ControllerEvent, DeviceState, IntentStatus, LightMode,
    MessageSeverity, MusicSettings, PixelUpdate, StatusMessage,
};
pub use error::{ControllerError, Result};
pub use infrastructure::bluetooth::{
    DeviceHandle, DryRunTransport, SharedTransport, Transport, TransportError, TransportEvent,
};
