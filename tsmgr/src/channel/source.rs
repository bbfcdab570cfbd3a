//! Pipeline descriptors: what an encoder should capture and overlay.
//!
//! The `[source]` section of a channel file is turned into a typed
//! [`PipelineDescriptor`] here. Source types form a closed set; adding one
//! means adding a [`SourceType`] variant and handling it in every match.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::{Bitrate, ChannelConfig};
use crate::{Error, Result};

/// Known `source.type` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum SourceType {
    #[strum(to_string = "test", serialize = "testsrc")]
    Test,
    #[strum(to_string = "capture", serialize = "device")]
    Capture,
}

/// Test pattern resolution presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum VideoPreset {
    #[serde(alias = "sd")]
    SD,
    #[default]
    #[serde(alias = "hd")]
    HD,
}

impl VideoPreset {
    pub fn format(self) -> VideoFormat {
        match self {
            Self::SD => VideoFormat::new(720, 576, 25),
            Self::HD => VideoFormat::new(1920, 1080, 25),
        }
    }
}

/// Frame size and rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VideoFormat {
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
}

impl VideoFormat {
    pub const fn new(width: u32, height: u32, framerate: u32) -> Self {
        Self {
            width,
            height,
            framerate,
        }
    }

    /// `WxH`, as understood by ffmpeg's `-s` / `video_size`.
    pub fn size(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }
}

/// A `WxH` frame size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String")]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for Resolution {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::config(format!("invalid resolution '{}', expected WxH", s));
        let (w, h) = s.trim().split_once(['x', 'X']).ok_or_else(invalid)?;
        let width: u32 = w.trim().parse().map_err(|_| invalid())?;
        let height: u32 = h.trim().parse().map_err(|_| invalid())?;
        if width == 0 || height == 0 {
            return Err(invalid());
        }
        Ok(Self { width, height })
    }
}

impl TryFrom<String> for Resolution {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

/// Capture backend (ffmpeg input format).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum CaptureBackend {
    Dshow,
    V4l2,
    Avfoundation,
}

impl Default for CaptureBackend {
    fn default() -> Self {
        if cfg!(target_os = "windows") {
            Self::Dshow
        } else if cfg!(target_os = "macos") {
            Self::Avfoundation
        } else {
            Self::V4l2
        }
    }
}

/// Options accepted by the `test` source.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct TestSourceOptions {
    #[serde(default)]
    preset: VideoPreset,
    #[serde(default)]
    timecode: bool,
    image: Option<PathBuf>,
    text: Option<String>,
    banner: Option<String>,
    #[serde(default = "default_tone_hz")]
    tone_hz: u32,
}

fn default_tone_hz() -> u32 {
    1000
}

/// Options accepted by the `capture` source.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct CaptureSourceOptions {
    video_device: String,
    audio_device: Option<String>,
    resolution: Option<Resolution>,
    framerate: Option<u32>,
    pixel_format: Option<String>,
    #[serde(default)]
    format: CaptureBackend,
}

/// A capture device input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaptureInput {
    pub backend: CaptureBackend,
    pub video_device: String,
    pub audio_device: Option<String>,
    pub resolution: Option<Resolution>,
    pub framerate: Option<u32>,
    pub pixel_format: Option<String>,
}

/// Where the encoder's pictures and sound come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SourceKind {
    /// Synthetic test card plus a sine tone.
    TestPattern { format: VideoFormat, tone_hz: u32 },
    CaptureDevice(CaptureInput),
}

/// Something drawn on top of the picture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Overlay {
    /// Burnt-in wall-clock timecode.
    Timecode,
    /// Centered caption.
    Text(String),
    /// Strip along the bottom edge.
    Banner(String),
    /// Still image composited over the picture.
    Image(PathBuf),
}

/// Everything the encoder needs to know about a channel's content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineDescriptor {
    pub source: SourceKind,
    pub overlays: Vec<Overlay>,
    pub muxrate: Bitrate,
    pub quiet: bool,
    pub service_name: String,
    pub provider: String,
}

/// Build the pipeline descriptor for a channel.
///
/// Fails with `UnknownSource` for an unrecognized `source.type` and with
/// `Configuration` for bad options of a known type.
pub fn build_descriptor(config: &ChannelConfig) -> Result<PipelineDescriptor> {
    let kind = config.source.kind.trim();
    let source_type = SourceType::from_str(kind).map_err(|_| Error::UnknownSource {
        id: config.id,
        kind: kind.to_string(),
    })?;

    let options = toml::Value::Table(config.source.options.clone());
    let invalid = |e: toml::de::Error| {
        Error::config(format!(
            "channel {}: invalid {} source options: {}",
            config.id, source_type, e
        ))
    };

    let (source, overlays) = match source_type {
        SourceType::Test => {
            let opts: TestSourceOptions = options.try_into().map_err(invalid)?;
            if opts.tone_hz == 0 {
                return Err(Error::config(format!(
                    "channel {}: tone_hz must be positive",
                    config.id
                )));
            }

            let mut overlays = Vec::new();
            if let Some(image) = opts.image {
                overlays.push(Overlay::Image(image));
            }
            if opts.timecode {
                overlays.push(Overlay::Timecode);
            }
            if let Some(text) = opts.text.filter(|t| !t.is_empty()) {
                overlays.push(Overlay::Text(text));
            }
            if let Some(banner) = opts.banner.filter(|b| !b.is_empty()) {
                overlays.push(Overlay::Banner(banner));
            }

            let source = SourceKind::TestPattern {
                format: opts.preset.format(),
                tone_hz: opts.tone_hz,
            };
            (source, overlays)
        }
        SourceType::Capture => {
            let opts: CaptureSourceOptions = options.try_into().map_err(invalid)?;
            if opts.video_device.trim().is_empty() {
                return Err(Error::config(format!(
                    "channel {}: video_device must not be empty",
                    config.id
                )));
            }
            if opts.framerate == Some(0) {
                return Err(Error::config(format!(
                    "channel {}: framerate must be positive",
                    config.id
                )));
            }

            let source = SourceKind::CaptureDevice(CaptureInput {
                backend: opts.format,
                video_device: opts.video_device,
                audio_device: opts.audio_device,
                resolution: opts.resolution,
                framerate: opts.framerate,
                pixel_format: opts.pixel_format,
            });
            (source, Vec::new())
        }
    };

    Ok(PipelineDescriptor {
        source,
        overlays,
        muxrate: config.muxrate,
        quiet: config.quiet,
        service_name: config.name.clone(),
        provider: config.provider.clone(),
    })
}
