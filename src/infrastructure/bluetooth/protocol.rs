//! Hello Fairy Curtain Light Protocol
//!
//! This module contains the GATT identifiers, the frame checksum and the
//! byte-exact command layouts understood by the light.

use crate::domain::models::{Color, MusicSettings, PixelUpdate};
use crate::error::{ensure_range, ControllerError, Result};
use tracing::{debug, warn};

/// Curtain light BLE Service UUID
pub const SERVICE_UUID: &str = "49535343-fe7d-4ae5-8fa9-9fafd205e455";

/// Write Characteristic UUID - every outbound frame goes here
pub const WRITE_CHAR_UUID: &str = "49535343-8841-43f4-a8d4-ecbe34729bb3";

/// Notify Characteristic UUID - device reports arrive here
pub const NOTIFY_CHAR_UUID: &str = "49535343-1e4d-4bd9-ba61-23c647249616";

/// Client Characteristic Configuration Descriptor
pub const CCCD_UUID: &str = "00002902-0000-1000-8000-00805f9b34fb";

/// Advertised name prefixes of supported lights
pub const DEVICE_NAME_PREFIXES: &[&str] = &["CN_The_Curtain_Light", "Hello Fairy", "BMSL"];

/// Short-form frame marker
pub const HEADER_A: u8 = 0xAA;
/// Length-prefixed frame marker
pub const HEADER_B: u8 = 0xBB;

/// Command type bytes (second byte of a header A frame)
pub mod cmd {
    /// Light mode selection, used for built-in scenes
    pub const SET_LIGHT: u8 = 0x03;
    /// DIY settings: brightness, speed, changing mode
    pub const DIY_SETTINGS: u8 = 0x0E;
    /// DIY picture control: direction, speed, mode
    pub const DIY_CONTROL: u8 = 0xD0;
    /// Dynamic picture frame start/end
    pub const DYNAMIC_FRAME: u8 = 0xD7;
    /// Pixel colors
    pub const PIXEL_DATA: u8 = 0xDA;
}

/// Sub-mode of [`cmd::SET_LIGHT`] selecting a built-in scene
pub const LIGHT_MODE_SCENE: u8 = 0x02;

/// Scene brightness is carried as 0..=2550 on the wire
pub const SCENE_BRIGHTNESS_MAX: u16 = 2550;

/// Default animation speed used by the vendor app
pub const DEFAULT_SPEED: u8 = 100;

/// Bytes per pixel entry in a pixel frame: index (2) + RGB (3)
pub const BYTES_PER_PIXEL: usize = 5;

/// Fixed bytes around the pixel entries: header, type, frame number, checksum
pub const PIXEL_FRAME_OVERHEAD: usize = 4;

/// ATT header bytes taken out of the negotiated MTU on every write
pub const ATT_WRITE_OVERHEAD: usize = 3;

/// Pixels per chunk when no MTU has been negotiated
pub const DEFAULT_CHUNK_PIXELS: usize = 85;

/// Device variants
pub const PIXEL_COUNT_BLE256: u16 = 256;
pub const PIXEL_COUNT_BLE900: u16 = 900;
pub const DEFAULT_PIXEL_COUNT: u16 = PIXEL_COUNT_BLE256;

/// Post-send delays in milliseconds
pub const MODE_DELAY_MS: u64 = 50;
pub const PIXEL_DELAY_MS: u64 = 80;

// ============================================================================
// Checksum codec
// ============================================================================

/// Sum of all bytes modulo 256
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Append the checksum to a frame body
pub fn frame(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 1);
    out.extend_from_slice(body);
    out.push(checksum(body));
    out
}

/// True iff the last byte is the checksum of everything before it
pub fn verify(bytes: &[u8]) -> bool {
    match bytes.split_last() {
        Some((last, body)) => checksum(body) == *last,
        None => false,
    }
}

// ============================================================================
// Commands
// ============================================================================

/// DIY picture control modes carried by [`cmd::DIY_CONTROL`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DiyMode {
    StaticOff = 0,
    ShowStatic = 1,
    DynamicRun = 2,
    StaticType = 3,
    Save = 4,
    Prepare = 6,
    DynamicPicture = 7,
}

impl DiyMode {
    pub fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            0 => Self::StaticOff,
            1 => Self::ShowStatic,
            2 => Self::DynamicRun,
            3 => Self::StaticType,
            4 => Self::Save,
            6 => Self::Prepare,
            7 => Self::DynamicPicture,
            _ => return None,
        })
    }
}

/// State byte of a [`cmd::DYNAMIC_FRAME`] command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameState {
    Start = 0,
    End = 2,
}

/// Parameters of the DIY settings command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiySettings {
    pub number: u8,
    pub speed: u8,
    pub brightness: u8,
    pub changing_mode: u8,
    pub enabled: bool,
}

impl DiySettings {
    pub fn brightness(brightness: u8) -> Self {
        Self {
            number: 0,
            speed: DEFAULT_SPEED,
            brightness,
            changing_mode: 0,
            enabled: true,
        }
    }
}

/// One semantic operation, encoded into exactly one frame by [`Command::encode`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    SetMode {
        direction: u8,
        speed: u8,
        mode: DiyMode,
    },
    DiySettings(DiySettings),
    SetPixels {
        frame_number: u8,
        pixels: Vec<PixelUpdate>,
    },
    FrameBoundary {
        frame_number: u8,
        state: FrameState,
    },
    SetScene {
        scene_id: u8,
        brightness: u16,
    },
    SetMusicMode(MusicSettings),
}

impl Command {
    /// Static/mode command with the vendor defaults for direction and speed
    pub fn mode(mode: DiyMode) -> Self {
        Command::SetMode {
            direction: 0,
            speed: DEFAULT_SPEED,
            mode,
        }
    }

    /// Whether the scheduler should treat this as a (slow) pixel batch
    pub fn is_pixel_batch(&self) -> bool {
        matches!(self, Command::SetPixels { .. })
    }

    /// Validate parameters without building a frame
    pub fn validate(&self) -> Result<()> {
        match self {
            Command::SetMode { speed, .. } => ensure_range("speed", *speed as i64, 0, 100),
            Command::DiySettings(s) => ensure_range("speed", s.speed as i64, 0, 100),
            Command::SetPixels {
                frame_number,
                pixels,
            } => {
                ensure_range("frame_number", *frame_number as i64, 1, 255)?;
                if pixels.is_empty() {
                    return Err(ControllerError::out_of_range("pixels", 0, 1, u16::MAX as i64));
                }
                Ok(())
            }
            Command::FrameBoundary { frame_number, .. } => {
                ensure_range("frame_number", *frame_number as i64, 1, 255)
            }
            Command::SetScene { brightness, .. } => ensure_range(
                "scene_brightness",
                *brightness as i64,
                0,
                SCENE_BRIGHTNESS_MAX as i64,
            ),
            Command::SetMusicMode(settings) => settings.validate(),
        }
    }

    /// Encode into a checksummed frame
    pub fn encode(&self) -> Result<Vec<u8>> {
        self.validate()?;

        let body = match self {
            Command::SetMode {
                direction,
                speed,
                mode,
            } => vec![HEADER_A, cmd::DIY_CONTROL, *direction, *speed, 0x00, *mode as u8],
            Command::DiySettings(s) => vec![
                HEADER_A,
                cmd::DIY_SETTINGS,
                s.number,
                0x01,
                s.speed,
                s.brightness,
                s.changing_mode,
                s.enabled as u8,
            ],
            Command::SetPixels {
                frame_number,
                pixels,
            } => {
                let mut body = Vec::with_capacity(3 + pixels.len() * BYTES_PER_PIXEL);
                body.extend_from_slice(&[HEADER_A, cmd::PIXEL_DATA, *frame_number]);
                for (index, color) in pixels {
                    body.extend_from_slice(&index.to_le_bytes());
                    body.extend_from_slice(&[color.r, color.g, color.b]);
                }
                body
            }
            Command::FrameBoundary {
                frame_number,
                state,
            } => vec![HEADER_A, cmd::DYNAMIC_FRAME, *frame_number, *state as u8],
            Command::SetScene {
                scene_id,
                brightness,
            } => {
                let [hi, lo] = brightness.to_be_bytes();
                vec![HEADER_A, cmd::SET_LIGHT, LIGHT_MODE_SCENE, *scene_id, hi, lo]
            }
            Command::SetMusicMode(m) => {
                // Single-byte hue keeps only the low 8 bits; the device expects that.
                let payload = [
                    m.mode,
                    m.auto as u8,
                    m.sensitivity,
                    m.brightness,
                    (m.hue & 0xFF) as u8,
                    m.saturation,
                ];
                let mut body = vec![HEADER_B, payload.len() as u8];
                body.extend_from_slice(&payload);
                body
            }
        };

        Ok(frame(&body))
    }
}

/// Pixel frame with every index checked against the device size
pub fn build_pixel_frame(frame_number: u8, pixels: &[PixelUpdate], pixel_count: u16) -> Result<Vec<u8>> {
    check_indices(pixels, pixel_count)?;
    Command::SetPixels {
        frame_number,
        pixels: pixels.to_vec(),
    }
    .encode()
}

/// Reject any index outside `0..pixel_count`
pub fn check_indices(pixels: &[PixelUpdate], pixel_count: u16) -> Result<()> {
    match pixels.iter().find(|(index, _)| *index >= pixel_count) {
        Some((index, _)) => Err(ControllerError::out_of_range(
            "pixel_index",
            *index,
            0,
            pixel_count as i64 - 1,
        )),
        None => Ok(()),
    }
}

/// Map a 0-255 brightness onto the 0-2550 scene range
pub fn scene_brightness(brightness: u8) -> u16 {
    (brightness as u32 * SCENE_BRIGHTNESS_MAX as u32 / 255) as u16
}

// ============================================================================
// Inbound frames
// ============================================================================

/// A checksum-verified notification from the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFrame {
    pub header: u8,
    pub command: u8,
    pub payload: Vec<u8>,
}

impl InboundFrame {
    /// DIY mode reported by a [`cmd::DIY_CONTROL`] echo
    pub fn reported_mode(&self) -> Option<DiyMode> {
        if self.header == HEADER_A && self.command == cmd::DIY_CONTROL {
            self.payload.get(3).copied().and_then(DiyMode::from_byte)
        } else {
            None
        }
    }

    /// Brightness reported by a [`cmd::DIY_SETTINGS`] echo
    pub fn reported_brightness(&self) -> Option<u8> {
        if self.header == HEADER_A && self.command == cmd::DIY_SETTINGS {
            self.payload.get(3).copied()
        } else {
            None
        }
    }
}

/// Parse a notification, verifying its checksum
///
/// # Frame Structure
///
/// ```text
/// [0]     : Header (0xAA short form, 0xBB length prefixed)
/// [1]     : Command type (0xAA) or payload length (0xBB)
/// [2..n-1]: Payload
/// [n-1]   : Checksum (sum of all previous bytes mod 256)
/// ```
pub fn parse_notification(bytes: &[u8]) -> Result<InboundFrame> {
    if bytes.len() < 3 {
        debug!("Short notification: {:02X?}", bytes);
        return Err(ControllerError::out_of_range("frame_length", bytes.len() as i64, 3, i64::MAX));
    }

    let (last, body) = match bytes.split_last() {
        Some(split) => split,
        None => return Err(ControllerError::out_of_range("frame_length", 0, 3, i64::MAX)),
    };
    let expected = checksum(body);
    if expected != *last {
        return Err(ControllerError::ChecksumMismatch {
            expected,
            actual: *last,
        });
    }

    let header = body[0];
    match header {
        HEADER_A => Ok(InboundFrame {
            header,
            command: body[1],
            payload: body[2..].to_vec(),
        }),
        HEADER_B => {
            let len = body[1] as usize;
            if body.len() != len + 2 {
                return Err(ControllerError::out_of_range(
                    "payload_length",
                    body.len() as i64 - 2,
                    len as i64,
                    len as i64,
                ));
            }
            Ok(InboundFrame {
                header,
                command: body[1],
                payload: body[2..].to_vec(),
            })
        }
        other => Err(ControllerError::out_of_range(
            "header",
            other,
            HEADER_A as i64,
            HEADER_B as i64,
        )),
    }
}

// ============================================================================
// Device variants
// ============================================================================

/// Whether an advertised name belongs to this family of lights
pub fn is_supported_device_name(name: &str) -> bool {
    DEVICE_NAME_PREFIXES.iter().any(|p| name.starts_with(p))
}

/// Pixel count from the advertised name
///
/// Names carry a `BLE256` / `BLE900` marker. Anything else is reported as
/// [`ControllerError::UnsupportedVariant`] alongside the default size.
pub fn detect_pixel_count(name: Option<&str>) -> (u16, Option<ControllerError>) {
    match name {
        Some(n) if n.contains("BLE900") => (PIXEL_COUNT_BLE900, None),
        Some(n) if n.contains("BLE256") => (PIXEL_COUNT_BLE256, None),
        other => {
            let shown = other.unwrap_or("<unnamed>").to_string();
            warn!(
                "No pixel-count marker in device name {:?}, assuming {}",
                shown, DEFAULT_PIXEL_COUNT
            );
            (
                DEFAULT_PIXEL_COUNT,
                Some(ControllerError::UnsupportedVariant(shown)),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_wraps() {
        assert_eq!(checksum(&[]), 0);
        assert_eq!(checksum(&[0xFF, 0x02]), 0x01);
        assert_eq!(checksum(&[HEADER_A, cmd::DIY_CONTROL]), 0x7A);
    }

    #[test]
    fn test_verify_framed_bytes() {
        let samples: [&[u8]; 4] = [&[], &[0x00], &[0xFF; 40], &[0xAA, 0xD0, 0x01, 0x02]];
        for body in samples {
            assert!(verify(&frame(body)));
        }
        assert!(!verify(&[]));
        assert!(!verify(&[0xAA, 0xD0, 0x00]));
    }

    #[test]
    fn test_mode_frame_bytes() {
        let bytes = Command::mode(DiyMode::ShowStatic).encode().unwrap();
        assert_eq!(bytes, vec![0xAA, 0xD0, 0x00, 0x64, 0x00, 0x01, 0xDF]);

        let off = Command::mode(DiyMode::StaticOff).encode().unwrap();
        assert_eq!(off, vec![0xAA, 0xD0, 0x00, 0x64, 0x00, 0x00, 0xDE]);
    }

    #[test]
    fn test_diy_settings_frame() {
        let bytes = Command::DiySettings(DiySettings::brightness(200)).encode().unwrap();
        assert_eq!(&bytes[..8], &[0xAA, 0x0E, 0x00, 0x01, 0x64, 0xC8, 0x00, 0x01]);
        assert!(verify(&bytes));
    }

    #[test]
    fn test_pixel_frame_layout() {
        let bytes = build_pixel_frame(3, &[(0x0102, Color::new(10, 20, 30))], 900).unwrap();
        assert_eq!(&bytes[..8], &[0xAA, 0xDA, 0x03, 0x02, 0x01, 10, 20, 30]);
        assert_eq!(bytes.len(), PIXEL_FRAME_OVERHEAD + BYTES_PER_PIXEL);
        assert!(verify(&bytes));
    }

    #[test]
    fn test_pixel_index_out_of_range() {
        let err = build_pixel_frame(1, &[(256, Color::RED)], 256).unwrap_err();
        assert!(matches!(
            err,
            ControllerError::InvalidParameter {
                name: "pixel_index",
                value: 256,
                ..
            }
        ));
    }

    #[test]
    fn test_frame_number_zero_rejected() {
        let cmd = Command::FrameBoundary {
            frame_number: 0,
            state: FrameState::Start,
        };
        assert!(cmd.encode().is_err());
    }

    #[test]
    fn test_frame_boundary_layout() {
        let bytes = Command::FrameBoundary {
            frame_number: 5,
            state: FrameState::End,
        }
        .encode()
        .unwrap();
        assert_eq!(&bytes[..4], &[0xAA, 0xD7, 0x05, 0x02]);
    }

    #[test]
    fn test_speed_out_of_range() {
        let cmd = Command::SetMode {
            direction: 0,
            speed: 101,
            mode: DiyMode::DynamicRun,
        };
        assert!(matches!(
            cmd.encode(),
            Err(ControllerError::InvalidParameter { name: "speed", .. })
        ));
    }

    #[test]
    fn test_scene_frame() {
        let bytes = Command::SetScene {
            scene_id: 7,
            brightness: scene_brightness(255),
        }
        .encode()
        .unwrap();
        assert_eq!(&bytes[..6], &[0xAA, 0x03, 0x02, 0x07, 0x09, 0xF6]);
        assert_eq!(scene_brightness(128), 1280);
    }

    #[test]
    fn test_music_frame_truncates_hue() {
        let settings = MusicSettings {
            mode: 1,
            auto: false,
            sensitivity: 80,
            brightness: 255,
            hue: 300,
            saturation: 100,
        };
        let bytes = Command::SetMusicMode(settings).encode().unwrap();
        assert_eq!(&bytes[..8], &[0xBB, 0x06, 0x01, 0x00, 80, 255, 44, 100]);
        assert!(verify(&bytes));
    }

    #[test]
    fn test_parse_notification() {
        let bytes = Command::mode(DiyMode::StaticOff).encode().unwrap();
        let frame = parse_notification(&bytes).unwrap();
        assert_eq!(frame.command, cmd::DIY_CONTROL);
        assert_eq!(frame.reported_mode(), Some(DiyMode::StaticOff));

        let mut corrupt = bytes.clone();
        corrupt[3] ^= 0x01;
        assert!(matches!(
            parse_notification(&corrupt),
            Err(ControllerError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_parse_length_prefixed_notification() {
        let bytes = Command::SetMusicMode(MusicSettings::default()).encode().unwrap();
        let frame = parse_notification(&bytes).unwrap();
        assert_eq!(frame.header, HEADER_B);
        assert_eq!(frame.payload.len(), 6);

        let short = super::frame(&[HEADER_B, 0x04, 0x01]);
        assert!(parse_notification(&short).is_err());
    }

    #[test]
    fn test_detect_pixel_count() {
        assert_eq!(detect_pixel_count(Some("CN_The_Curtain_Light_BLE900")).0, 900);
        assert_eq!(detect_pixel_count(Some("Hello Fairy BLE256")).0, 256);
        let (count, warning) = detect_pixel_count(Some("BMSL-1234"));
        assert_eq!(count, 256);
        assert!(matches!(warning, Some(ControllerError::UnsupportedVariant(_))));
        assert!(detect_pixel_count(None).1.is_some());
    }

    #[test]
    fn test_supported_names() {
        assert!(is_supported_device_name("Hello Fairy-ABCD"));
        assert!(!is_supported_device_name("Some Speaker"));
    }
}
