use crate::error::{ensure_range, ControllerError, Result};
use crate::infrastructure::bluetooth::protocol::InboundFrame;
use serde::{Deserialize, Serialize};

/// One RGB color, 8 bits per channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    pub const BLACK: Color = Color::new(0, 0, 0);
    pub const WHITE: Color = Color::new(255, 255, 255);
    pub const RED: Color = Color::new(255, 0, 0);

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Build a color from wider integers, rejecting channels outside 0..=255
    pub fn try_from_channels(r: i64, g: i64, b: i64) -> Result<Self> {
        ensure_range("red", r, 0, 255)?;
        ensure_range("green", g, 0, 255)?;
        ensure_range("blue", b, 0, 255)?;
        Ok(Self::new(r as u8, g as u8, b as u8))
    }

    /// Scale every channel by `brightness / 255`, truncating
    pub fn scaled(self, brightness: u8) -> Self {
        let scale = |c: u8| ((c as u16 * brightness as u16) / 255) as u8;
        Self::new(scale(self.r), scale(self.g), scale(self.b))
    }

    /// HSV to RGB, hue in degrees (any value, taken modulo 360), s/v in 0.0..=1.0
    pub fn from_hsv(hue: f32, saturation: f32, value: f32) -> Self {
        let h = hue.rem_euclid(360.0) / 60.0;
        let c = value * saturation;
        let x = c * (1.0 - (h % 2.0 - 1.0).abs());
        let m = value - c;
        let (r, g, b) = match h as u32 {
            0 => (c, x, 0.0),
            1 => (x, c, 0.0),
            2 => (0.0, c, x),
            3 => (0.0, x, c),
            4 => (x, 0.0, c),
            _ => (c, 0.0, x),
        };
        let to_u8 = |v: f32| ((v + m) * 255.0).round().clamp(0.0, 255.0) as u8;
        Self::new(to_u8(r), to_u8(g), to_u8(b))
    }
}

impl TryFrom<(i64, i64, i64)> for Color {
    type Error = ControllerError;

    fn try_from((r, g, b): (i64, i64, i64)) -> Result<Self> {
        Self::try_from_channels(r, g, b)
    }
}

impl std::fmt::Display for Color {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{:02X}{:02X}{:02X}", self.r, self.g, self.b)
    }
}

/// One addressed pixel: (index, color)
pub type PixelUpdate = (u16, Color);

/// Music-reactive mode parameters
///
/// Hue (0-360) and saturation (0-100) are kept at full resolution here even
/// though the wire format carries a single byte for each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MusicSettings {
    pub mode: u8,
    pub auto: bool,
    pub sensitivity: u8,
    pub brightness: u8,
    pub hue: u16,
    pub saturation: u8,
}

impl Default for MusicSettings {
    fn default() -> Self {
        Self {
            mode: 0,
            auto: true,
            sensitivity: 50,
            brightness: 255,
            hue: 0,
            saturation: 100,
        }
    }
}

impl MusicSettings {
    pub fn validate(&self) -> Result<()> {
        ensure_range("sensitivity", self.sensitivity as i64, 0, 100)?;
        ensure_range("hue", self.hue as i64, 0, 360)?;
        ensure_range("saturation", self.saturation as i64, 0, 100)?;
        Ok(())
    }
}

/// What the light is currently showing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LightMode {
    Off,
    /// Every pixel the same color
    Static { color: Color },
    /// Individually addressed pixels
    Dynamic,
    /// A catalog effect, either a device scene or a played-back animation
    Effect { effect_id: u8 },
    Music(MusicSettings),
}

impl LightMode {
    pub fn is_on(&self) -> bool {
        !matches!(self, LightMode::Off)
    }

    pub fn name(&self) -> &'static str {
        match self {
            LightMode::Off => "off",
            LightMode::Static { .. } => "static",
            LightMode::Dynamic => "dynamic",
            LightMode::Effect { .. } => "effect",
            LightMode::Music(_) => "music",
        }
    }
}

/// Believed state of one physical device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceState {
    pub mode: LightMode,
    pub brightness: u8,
    /// Last solid color requested, reused when the light is switched back on
    pub color: Color,
    pub pixel_count: u16,
    /// Frame number of the most recent pixel batch (0 before the first one)
    pub frame_number: u8,
}

impl DeviceState {
    pub fn new(pixel_count: u16) -> Self {
        Self {
            mode: LightMode::Off,
            brightness: 255,
            color: Color::WHITE,
            pixel_count,
            frame_number: 0,
        }
    }

    pub fn is_on(&self) -> bool {
        self.mode.is_on()
    }
}

/// Identifier of one scheduler queue entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandId(pub u64);

impl std::fmt::Display for CommandId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cmd#{}", self.0)
    }
}

/// Groups the entries produced by one intent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BatchId(pub u64);

/// Lifecycle of a single queue entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandStatus {
    Pending,
    Sent,
    Acknowledged,
    Failed(ControllerError),
    Cancelled,
}

impl CommandStatus {
    pub fn is_finished(&self) -> bool {
        !matches!(self, CommandStatus::Pending | CommandStatus::Sent)
    }
}

/// Aggregate status of everything an intent enqueued
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntentStatus {
    /// At least one frame is still waiting or in flight
    Queued,
    /// Every frame was written
    Applied,
    /// At least one frame exhausted its retries
    Failed(ControllerError),
    /// Superseded before it was fully sent
    Cancelled,
}

/// Handle returned for each accepted intent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTicket {
    pub batch: BatchId,
    pub commands: Vec<CommandId>,
}

impl CommandTicket {
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    /// Link is up, device variant not resolved yet
    Connected,
    Ready,
}

#[derive(Debug, Clone)]
pub enum ControllerEvent {
    ConnectionStatus(ConnectionStatus),
    StateChanged(DeviceState),
    CommandFailed {
        id: CommandId,
        error: ControllerError,
    },
    Notification(InboundFrame),
    LogMessage(StatusMessage),
}

#[derive(Debug, Clone)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_color_rejects_out_of_range_channels() {
        assert!(matches!(
            Color::try_from_channels(256, 0, 0),
            Err(ControllerError::InvalidParameter { name: "red", .. })
        ));
        assert!(Color::try_from((0, -1, 0)).is_err());
        assert_eq!(Color::try_from((1, 2, 3)).unwrap(), Color::new(1, 2, 3));
    }

    #[test]
    fn test_color_scaling() {
        assert_eq!(Color::RED.scaled(255), Color::RED);
        assert_eq!(Color::RED.scaled(0), Color::BLACK);
        assert_eq!(Color::new(200, 100, 50).scaled(128), Color::new(100, 50, 25));
    }

    #[test]
    fn test_hsv_primaries() {
        assert_eq!(Color::from_hsv(0.0, 1.0, 1.0), Color::RED);
        assert_eq!(Color::from_hsv(120.0, 1.0, 1.0), Color::new(0, 255, 0));
        assert_eq!(Color::from_hsv(240.0, 1.0, 1.0), Color::new(0, 0, 255));
        assert_eq!(Color::from_hsv(360.0, 1.0, 1.0), Color::RED);
    }

    #[test]
    fn test_music_settings_validation() {
        assert!(MusicSettings::default().validate().is_ok());
        let bad_hue = MusicSettings {
            hue: 361,
            ..Default::default()
        };
        assert!(bad_hue.validate().is_err());
        let bad_sat = MusicSettings {
            saturation: 101,
            ..Default::default()
        };
        assert!(bad_sat.validate().is_err());
    }
}
