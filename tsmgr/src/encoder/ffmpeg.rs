//! FFmpeg encoder launcher.

use process_utils::NoWindowExt;
use tokio::process::Command;

use super::traits::ProcessLauncher;
use crate::channel::{
    CaptureBackend, CaptureInput, ChannelUnit, MuxParams, Overlay, PipelineDescriptor, SourceKind,
};
use crate::config::EncoderSettings;
use crate::{Error, Result};

const AUDIO_SAMPLE_RATE: u32 = 48_000;

/// Launches one ffmpeg process per channel.
#[derive(Debug, Clone)]
pub struct FfmpegEncoder {
    settings: EncoderSettings,
}

impl FfmpegEncoder {
    pub fn new(settings: EncoderSettings) -> Self {
        Self { settings }
    }

    /// Detect ffmpeg version.
    pub fn detect_version(&self) -> Option<String> {
        let mut cmd = std::process::Command::new(&self.settings.binary_path);
        cmd.no_window();
        cmd.arg("-version")
            .output()
            .ok()
            .and_then(|output| {
                String::from_utf8(output.stdout)
                    .ok()
                    .and_then(|s| s.lines().next().map(|l| l.to_string()))
            })
    }

    /// Build ffmpeg command arguments.
    pub fn build_args(&self, descriptor: &PipelineDescriptor, params: &MuxParams) -> Vec<String> {
        // Progress reports end in '\r' and would never complete a log line.
        let mut args: Vec<String> = vec![
            "-hide_banner".into(),
            "-nostdin".into(),
            "-nostats".into(),
            "-loglevel".into(),
            self.settings.log_level.clone(),
        ];

        // 1. Extra input arguments from config
        args.extend(self.settings.input_args.iter().cloned());

        // 2. Inputs
        let inputs = push_inputs(&mut args, &descriptor.source);
        let image_input = descriptor.overlays.iter().find_map(|o| match o {
            Overlay::Image(path) => Some(path),
            _ => None,
        });
        let image_index = image_input.map(|path| {
            args.extend([
                "-loop".into(),
                "1".into(),
                "-i".into(),
                path.to_string_lossy().into_owned(),
            ]);
            inputs.next_index
        });

        // 3. Picture overlays and stream mapping
        match overlay_graph(&inputs.video, image_index, &descriptor.overlays) {
            Some(graph) => {
                args.extend(["-filter_complex".into(), graph, "-map".into(), "[v]".into()]);
            }
            None => args.extend(["-map".into(), inputs.video.clone()]),
        }
        args.extend(["-map".into(), inputs.audio]);

        // 4. Codecs
        args.extend([
            "-c:v".into(),
            self.settings.video_codec.clone(),
            "-pix_fmt".into(),
            "yuv420p".into(),
        ]);
        if let Some(bitrate) = self.settings.video_bitrate {
            args.extend(["-b:v".into(), bitrate.to_string()]);
        }
        args.extend(["-c:a".into(), self.settings.audio_codec.clone()]);
        if let Some(bitrate) = self.settings.audio_bitrate {
            args.extend(["-b:a".into(), bitrate.to_string()]);
        }

        // 5. Multiplex parameters
        args.extend([
            "-muxrate".into(),
            descriptor.muxrate.to_string(),
            "-mpegts_transport_stream_id".into(),
            params.transport_stream_id.to_string(),
            "-mpegts_original_network_id".into(),
            params.original_network_id.to_string(),
            "-mpegts_service_id".into(),
            params.service_id.to_string(),
            "-mpegts_pmt_start_pid".into(),
            params.pmt_pid.to_string(),
            "-mpegts_start_pid".into(),
            params.start_pid.to_string(),
            "-tables_version".into(),
            params.table_version.to_string(),
            "-mpegts_service_type".into(),
            "digital_tv".into(),
            "-metadata".into(),
            format!("service_name={}", descriptor.service_name),
            "-metadata".into(),
            format!("service_provider={}", descriptor.provider),
        ]);

        // 6. Extra output arguments from config
        args.extend(self.settings.output_args.iter().cloned());

        // 7. Output
        args.extend(["-f".into(), "mpegts".into(), params.udp_url()]);

        args
    }
}

impl ProcessLauncher<ChannelUnit> for FfmpegEncoder {
    fn program(&self) -> &str {
        &self.settings.binary_path
    }

    fn build_command(&self, unit: &ChannelUnit) -> Result<Command> {
        let descriptor = unit.descriptor().ok_or_else(|| {
            Error::config(format!(
                "channel {} ({}) has no pipeline descriptor",
                unit.id(),
                unit.name()
            ))
        })?;

        let mut command = process_utils::tokio_command(&self.settings.binary_path);
        command
            .args(self.build_args(descriptor, unit.params()))
            .env("LC_ALL", "C");
        Ok(command)
    }
}

/// Stream specifiers of the inputs pushed by [`push_inputs`].
struct Inputs {
    video: String,
    audio: String,
    next_index: usize,
}

fn push_inputs(args: &mut Vec<String>, source: &SourceKind) -> Inputs {
    match source {
        SourceKind::TestPattern { format, tone_hz } => {
            args.extend([
                "-re".into(),
                "-f".into(),
                "lavfi".into(),
                "-i".into(),
                format!(
                    "testsrc2=size={}:rate={}",
                    format.size(),
                    format.framerate
                ),
                "-re".into(),
                "-f".into(),
                "lavfi".into(),
                "-i".into(),
                format!(
                    "sine=frequency={}:sample_rate={}",
                    tone_hz, AUDIO_SAMPLE_RATE
                ),
            ]);
            Inputs {
                video: "0:v".into(),
                audio: "1:a".into(),
                next_index: 2,
            }
        }
        SourceKind::CaptureDevice(input) => push_capture_inputs(args, input),
    }
}

fn push_capture_inputs(args: &mut Vec<String>, input: &CaptureInput) -> Inputs {
    args.extend(["-f".into(), input.backend.to_string()]);
    if let Some(resolution) = input.resolution {
        args.extend(["-video_size".into(), resolution.to_string()]);
    }
    if let Some(framerate) = input.framerate {
        args.extend(["-framerate".into(), framerate.to_string()]);
    }
    if let Some(pixel_format) = &input.pixel_format {
        let option = match input.backend {
            CaptureBackend::V4l2 => "-input_format",
            CaptureBackend::Dshow | CaptureBackend::Avfoundation => "-pixel_format",
        };
        args.extend([option.into(), pixel_format.clone()]);
    }

    // dshow and avfoundation open video and audio as one input
    let combined = match (input.backend, &input.audio_device) {
        (CaptureBackend::Dshow, Some(audio)) => {
            Some(format!("video={}:audio={}", input.video_device, audio))
        }
        (CaptureBackend::Avfoundation, Some(audio)) => {
            Some(format!("{}:{}", input.video_device, audio))
        }
        _ => None,
    };

    if let Some(device) = combined {
        args.extend(["-i".into(), device]);
        return Inputs {
            video: "0:v".into(),
            audio: "0:a".into(),
            next_index: 1,
        };
    }

    let video_device = match input.backend {
        CaptureBackend::Dshow => format!("video={}", input.video_device),
        CaptureBackend::V4l2 | CaptureBackend::Avfoundation => input.video_device.clone(),
    };
    args.extend(["-i".into(), video_device]);

    match &input.audio_device {
        Some(audio) => args.extend([
            "-f".into(),
            "alsa".into(),
            "-i".into(),
            audio.clone(),
        ]),
        // Keep two elementary streams per channel
        None => args.extend([
            "-f".into(),
            "lavfi".into(),
            "-i".into(),
            format!(
                "anullsrc=channel_layout=stereo:sample_rate={}",
                AUDIO_SAMPLE_RATE
            ),
        ]),
    }

    Inputs {
        video: "0:v".into(),
        audio: "1:a".into(),
        next_index: 2,
    }
}

/// Build the `-filter_complex` graph for the overlays, labelled `[v]`.
fn overlay_graph(video: &str, image_index: Option<usize>, overlays: &[Overlay]) -> Option<String> {
    let mut filters = Vec::new();

    if let Some(index) = image_index {
        filters.push(format!("[{}:v]overlay=(W-w)/2:(H-h)/2", index));
    }

    for overlay in overlays {
        match overlay {
            Overlay::Image(_) => {}
            Overlay::Timecode => filters.push(
                "drawtext=text='%{localtime\\:%T}':x=(w-text_w)/2:y=h/10:fontsize=h/12:\
                 fontcolor=white:box=1:boxcolor=black@0.6:boxborderw=8"
                    .to_string(),
            ),
            Overlay::Text(text) => filters.push(format!(
                "drawtext=text='{}':x=(w-text_w)/2:y=(h-text_h)/2:fontsize=h/10:\
                 fontcolor=white:box=1:boxcolor=black@0.6:boxborderw=8",
                escape_text(text)
            )),
            Overlay::Banner(text) => {
                filters.push("drawbox=x=0:y=ih*0.85:w=iw:h=ih*0.15:color=black@0.7:t=fill".into());
                filters.push(format!(
                    "drawtext=text='{}':x=(w-text_w)/2:y=h*0.85+(h*0.15-text_h)/2:\
                     fontsize=h/16:fontcolor=white",
                    escape_text(text)
                ));
            }
        }
    }

    if filters.is_empty() {
        return None;
    }

    Some(format!("[{}]{}[v]", video, filters.join(",")))
}

/// Escape text for a quoted drawtext value.
fn escape_text(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\'' => escaped.push_str("'\\''"),
            '\\' | ':' | '%' => {
                escaped.push('\\');
                escaped.push(c);
            }
            _ => escaped.push(c),
        }
    }
    escaped
}
