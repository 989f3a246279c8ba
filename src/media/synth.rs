//! Deterministic in-memory media backend.
//!
//! `synth:` URLs describe a clip; the demuxer emits timestamped packets in
//! decode order and the codecs turn them into sine audio, flat-shaded
//! pictures and numbered text cues. Exists so the player core can run and
//! be tested end to end without a container or codec library.
//!
//! URL grammar: `synth:dur=5,fps=30,w=320,h=240,pix=yuv420p,rate=48000,`
//! `ch=2,tone=440,subs=1,art=0,realtime=0,vbytes=4096` (all keys optional).

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Instant;

use super::{
    AudioData, DecodePoll, DecodedFrame, Demuxer, MediaError, MediaOpener, MediaOptions, Packet,
    Picture, PixelFormat, SeekTarget, SendStatus, StreamDecoder, StreamInfo, StreamKind,
    StreamParams, SubtitleData, TIME_BASE_MICROS, TimeBase, VideoData,
};

const VIDEO_TIME_BASE: TimeBase = TimeBase::new(1, 90000);
const AUDIO_FRAME_SAMPLES: usize = 1024;
const SUBTITLE_PERIOD_SECS: f64 = 1.0;
const SUBTITLE_DISPLAY_MS: u32 = 800;

/// Parsed description of a synthetic clip.
#[derive(Clone, Debug)]
pub struct SynthSpec {
    pub duration_secs: f64,
    pub video: bool,
    pub audio: bool,
    pub subtitles: bool,
    pub fps: f64,
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub sample_rate: u32,
    pub channels: u16,
    pub tone_hz: f64,
    /// Embed the first video frame as an attached picture instead of a
    /// regular video stream.
    pub attached_art: bool,
    pub realtime: bool,
    /// Padded payload size of video packets, to exercise queue limits.
    pub video_packet_bytes: usize,
}

impl Default for SynthSpec {
    fn default() -> Self {
        Self {
            duration_secs: 5.0,
            video: true,
            audio: true,
            subtitles: false,
            fps: 30.0,
            width: 320,
            height: 240,
            pixel_format: PixelFormat::Yuv420p,
            sample_rate: 48000,
            channels: 2,
            tone_hz: 440.0,
            attached_art: false,
            realtime: false,
            video_packet_bytes: 4096,
        }
    }
}

impl SynthSpec {
    /// Parse a `synth:` URL. Unknown keys are rejected, values are lenient.
    pub fn parse(url: &str) -> Result<Self, MediaError> {
        let rest = url
            .strip_prefix("synth:")
            .ok_or_else(|| MediaError::Open(format!("not a synth url: {url}")))?;

        let mut spec = Self::default();
        for pair in rest.split(',').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| MediaError::Open(format!("bad option: {pair}")))?;
            let flag = || value != "0" && value != "false";
            match key {
                "dur" => {
                    spec.duration_secs = value
                        .parse()
                        .map_err(|_| MediaError::Open(format!("bad duration: {value}")))?;
                }
                "fps" => spec.fps = value.parse().unwrap_or(spec.fps),
                "w" => spec.width = value.parse().unwrap_or(spec.width),
                "h" => spec.height = value.parse().unwrap_or(spec.height),
                "pix" => {
                    spec.pixel_format = match value {
                        "bgra" => PixelFormat::Bgra,
                        "yuv420p" => PixelFormat::Yuv420p,
                        "rgb24" => PixelFormat::Rgb24,
                        other => {
                            return Err(MediaError::Open(format!("bad pixel format: {other}")));
                        }
                    };
                }
                "rate" => spec.sample_rate = value.parse().unwrap_or(spec.sample_rate),
                "ch" => spec.channels = value.parse().unwrap_or(spec.channels),
                "tone" => spec.tone_hz = value.parse().unwrap_or(spec.tone_hz),
                "video" => spec.video = flag(),
                "audio" => spec.audio = flag(),
                "subs" => spec.subtitles = flag(),
                "art" => spec.attached_art = flag(),
                "realtime" => spec.realtime = flag(),
                "vbytes" => {
                    spec.video_packet_bytes = value.parse().unwrap_or(spec.video_packet_bytes);
                }
                other => return Err(MediaError::Open(format!("unknown option: {other}"))),
            }
        }
        Ok(spec)
    }

    fn video_frames(&self) -> u64 {
        (self.duration_secs * self.fps).ceil() as u64
    }

    fn audio_frames(&self) -> u64 {
        let total_samples = (self.duration_secs * self.sample_rate as f64).ceil() as u64;
        total_samples.div_ceil(AUDIO_FRAME_SAMPLES as u64)
    }

    fn subtitle_cues(&self) -> u64 {
        (self.duration_secs / SUBTITLE_PERIOD_SECS).ceil() as u64
    }
}

fn video_packet(spec: &SynthSpec, stream_index: usize, frame: u64, pos: i64) -> Packet {
    let pts = (frame as f64 * VIDEO_TIME_BASE.den as f64 / spec.fps) as i64;
    let duration = (VIDEO_TIME_BASE.den as f64 / spec.fps) as i64;
    let mut data = vec![0u8; spec.video_packet_bytes.max(8)];
    data[..8].copy_from_slice(&frame.to_le_bytes());
    Packet {
        stream_index,
        data: Arc::new(data),
        pts: Some(pts),
        dts: Some(pts),
        duration,
        pos,
    }
}

fn audio_packet(spec: &SynthSpec, stream_index: usize, frame: u64, pos: i64) -> Packet {
    let start_sample = frame * AUDIO_FRAME_SAMPLES as u64;
    let total = (spec.duration_secs * spec.sample_rate as f64).ceil() as u64;
    let nb = AUDIO_FRAME_SAMPLES.min((total - start_sample) as usize) as u32;

    let mut data = vec![0u8; 12];
    data[..8].copy_from_slice(&start_sample.to_le_bytes());
    data[8..12].copy_from_slice(&nb.to_le_bytes());
    Packet {
        stream_index,
        data: Arc::new(data),
        pts: Some(start_sample as i64),
        dts: Some(start_sample as i64),
        duration: nb as i64,
        pos,
    }
}

fn subtitle_packet(stream_index: usize, cue: u64, pos: i64) -> Packet {
    let pts = (cue as f64 * SUBTITLE_PERIOD_SECS * TIME_BASE_MICROS as f64) as i64;
    let text = format!("cue {cue}");
    Packet {
        stream_index,
        data: Arc::new(text.into_bytes()),
        pts: Some(pts),
        dts: Some(pts),
        duration: (SUBTITLE_DISPLAY_MS as i64) * 1000,
        pos,
    }
}

/// Demuxer over a [`SynthSpec`]: packets come out interleaved in timestamp
/// order, exactly once per playthrough, until a seek rewinds the cursors.
pub struct SynthDemuxer {
    spec: SynthSpec,
    streams: Vec<StreamInfo>,
    video_stream: Option<usize>,
    audio_stream: Option<usize>,
    subtitle_stream: Option<usize>,
    next_video: u64,
    next_audio: u64,
    next_subtitle: u64,
    bytes_emitted: i64,
    started_at: Option<Instant>,
}

impl SynthDemuxer {
    pub fn new(spec: SynthSpec) -> Self {
        let mut streams = Vec::new();
        let mut video_stream = None;
        let mut audio_stream = None;
        let mut subtitle_stream = None;

        if spec.video || spec.attached_art {
            let index = streams.len();
            let attached_picture = spec
                .attached_art
                .then(|| video_packet(&spec, index, 0, -1));
            streams.push(StreamInfo {
                index,
                kind: StreamKind::Video,
                time_base: VIDEO_TIME_BASE,
                start_time: Some(0),
                params: StreamParams::Video {
                    width: spec.width,
                    height: spec.height,
                    frame_rate: spec.fps,
                    pixel_format: spec.pixel_format,
                    attached_picture,
                },
            });
            video_stream = Some(index);
        }
        if spec.audio {
            let index = streams.len();
            streams.push(StreamInfo {
                index,
                kind: StreamKind::Audio,
                time_base: TimeBase::new(1, spec.sample_rate as i32),
                start_time: Some(0),
                params: StreamParams::Audio {
                    sample_rate: spec.sample_rate,
                    channels: spec.channels,
                },
            });
            audio_stream = Some(index);
        }
        if spec.subtitles {
            let index = streams.len();
            streams.push(StreamInfo {
                index,
                kind: StreamKind::Subtitle,
                time_base: TimeBase::MICROS,
                start_time: Some(0),
                params: StreamParams::Subtitle,
            });
            subtitle_stream = Some(index);
        }

        Self {
            spec,
            streams,
            video_stream,
            audio_stream,
            subtitle_stream,
            next_video: 0,
            next_audio: 0,
            next_subtitle: 0,
            bytes_emitted: 0,
            started_at: None,
        }
    }

    fn next_video_time(&self) -> Option<f64> {
        let emit_video = self.spec.video && !self.spec.attached_art;
        (emit_video && self.next_video < self.spec.video_frames())
            .then(|| self.next_video as f64 / self.spec.fps)
    }

    fn next_audio_time(&self) -> Option<f64> {
        (self.spec.audio && self.next_audio < self.spec.audio_frames()).then(|| {
            self.next_audio as f64 * AUDIO_FRAME_SAMPLES as f64 / self.spec.sample_rate as f64
        })
    }

    fn next_subtitle_time(&self) -> Option<f64> {
        (self.spec.subtitles && self.next_subtitle < self.spec.subtitle_cues())
            .then(|| self.next_subtitle as f64 * SUBTITLE_PERIOD_SECS)
    }

    /// Rough stream size in bytes, for byte-domain seeks.
    fn total_bytes(&self) -> i64 {
        let video = if self.spec.video && !self.spec.attached_art {
            self.spec.video_frames() as i64 * self.spec.video_packet_bytes.max(8) as i64
        } else {
            0
        };
        let audio = self.spec.audio_frames() as i64 * 12;
        video + audio
    }
}

impl Demuxer for SynthDemuxer {
    fn streams(&self) -> &[StreamInfo] {
        &self.streams
    }

    fn duration(&self) -> Option<i64> {
        Some((self.spec.duration_secs * TIME_BASE_MICROS as f64) as i64)
    }

    fn start_time(&self) -> Option<i64> {
        Some(0)
    }

    fn bit_rate(&self) -> Option<i64> {
        let secs = self.spec.duration_secs.max(f64::MIN_POSITIVE);
        Some((self.total_bytes() as f64 * 8.0 / secs) as i64)
    }

    fn read_packet(&mut self) -> Result<Option<Packet>, MediaError> {
        let candidates = [
            (StreamKind::Video, self.next_video_time()),
            (StreamKind::Audio, self.next_audio_time()),
            (StreamKind::Subtitle, self.next_subtitle_time()),
        ];
        let Some((kind, time)) = candidates
            .into_iter()
            .filter_map(|(kind, t)| t.map(|t| (kind, t)))
            .min_by(|a, b| a.1.total_cmp(&b.1))
        else {
            return Ok(None);
        };

        if self.spec.realtime {
            // Pace a live source: never hand out packets from the future.
            let started = *self.started_at.get_or_insert_with(Instant::now);
            let due = started.elapsed().as_secs_f64();
            if time > due {
                std::thread::sleep(std::time::Duration::from_secs_f64(
                    (time - due).min(0.05),
                ));
            }
        }

        let pos = self.bytes_emitted;
        let packet = match kind {
            StreamKind::Video => {
                let p = video_packet(
                    &self.spec,
                    self.video_stream.expect("video stream present"),
                    self.next_video,
                    pos,
                );
                self.next_video += 1;
                p
            }
            StreamKind::Audio => {
                let p = audio_packet(
                    &self.spec,
                    self.audio_stream.expect("audio stream present"),
                    self.next_audio,
                    pos,
                );
                self.next_audio += 1;
                p
            }
            StreamKind::Subtitle => {
                let p = subtitle_packet(
                    self.subtitle_stream.expect("subtitle stream present"),
                    self.next_subtitle,
                    pos,
                );
                self.next_subtitle += 1;
                p
            }
        };
        self.bytes_emitted += packet.data.len() as i64;
        Ok(Some(packet))
    }

    fn seek(&mut self, target: &SeekTarget) -> Result<(), MediaError> {
        let secs = if target.by_bytes {
            let total = self.total_bytes().max(1);
            self.spec.duration_secs * target.target.clamp(0, total) as f64 / total as f64
        } else {
            (target.target as f64 / TIME_BASE_MICROS as f64).clamp(0.0, self.spec.duration_secs)
        };

        self.next_video = (secs * self.spec.fps).floor() as u64;
        self.next_audio =
            (secs * self.spec.sample_rate as f64 / AUDIO_FRAME_SAMPLES as f64).floor() as u64;
        self.next_subtitle = (secs / SUBTITLE_PERIOD_SECS).floor() as u64;
        Ok(())
    }

    fn is_realtime(&self) -> bool {
        self.spec.realtime
    }
}

fn synth_picture(spec: &SynthSpec, frame_index: u64) -> Picture {
    let w = spec.width as usize;
    let h = spec.height as usize;
    let shade = ((frame_index * 8) % 256) as u8;
    let data = match spec.pixel_format {
        PixelFormat::Bgra => vec![shade; w * h * 4],
        PixelFormat::Rgb24 => vec![shade; w * h * 3],
        PixelFormat::Yuv420p => {
            let cw = w.div_ceil(2);
            let ch = h.div_ceil(2);
            let mut buf = vec![shade; w * h];
            buf.resize(w * h + 2 * cw * ch, 128);
            buf
        }
    };
    Picture {
        format: spec.pixel_format,
        width: spec.width,
        height: spec.height,
        data: Arc::new(data),
    }
}

/// One-in, one-out video "codec".
pub struct SynthVideoDecoder {
    spec: SynthSpec,
    pending: Option<VideoData>,
    draining: bool,
}

impl SynthVideoDecoder {
    pub fn new(spec: SynthSpec) -> Self {
        Self {
            spec,
            pending: None,
            draining: false,
        }
    }
}

impl StreamDecoder for SynthVideoDecoder {
    fn send(&mut self, packet: Option<&Packet>) -> Result<SendStatus, MediaError> {
        let Some(packet) = packet else {
            self.draining = true;
            return Ok(SendStatus::Accepted);
        };
        if self.pending.is_some() {
            return Ok(SendStatus::Full);
        }
        if packet.data.len() < 8 {
            return Err(MediaError::Decode("truncated video packet".into()));
        }
        let frame_index = u64::from_le_bytes(packet.data[..8].try_into().expect("8 bytes"));
        self.pending = Some(VideoData {
            picture: synth_picture(&self.spec, frame_index),
            pts: packet.pts,
            best_effort_ts: packet.pts.or(packet.dts),
            pkt_dts: packet.dts,
            pos: packet.pos,
        });
        Ok(SendStatus::Accepted)
    }

    fn receive(&mut self) -> Result<DecodePoll, MediaError> {
        if let Some(video) = self.pending.take() {
            return Ok(DecodePoll::Frame(DecodedFrame::Video(video)));
        }
        if self.draining {
            self.draining = false;
            Ok(DecodePoll::Drained)
        } else {
            Ok(DecodePoll::Pending)
        }
    }

    fn reset(&mut self) {
        self.pending = None;
        self.draining = false;
    }
}

/// Sine-tone audio "codec"; phase is carried in the packet payload so
/// decode is stateless across seeks.
pub struct SynthAudioDecoder {
    spec: SynthSpec,
    pending: Option<AudioData>,
    draining: bool,
}

impl SynthAudioDecoder {
    pub fn new(spec: SynthSpec) -> Self {
        Self {
            spec,
            pending: None,
            draining: false,
        }
    }
}

impl StreamDecoder for SynthAudioDecoder {
    fn send(&mut self, packet: Option<&Packet>) -> Result<SendStatus, MediaError> {
        let Some(packet) = packet else {
            self.draining = true;
            return Ok(SendStatus::Accepted);
        };
        if self.pending.is_some() {
            return Ok(SendStatus::Full);
        }
        if packet.data.len() < 12 {
            return Err(MediaError::Decode("truncated audio packet".into()));
        }
        let start = u64::from_le_bytes(packet.data[..8].try_into().expect("8 bytes"));
        let nb = u32::from_le_bytes(packet.data[8..12].try_into().expect("4 bytes")) as usize;

        let rate = self.spec.sample_rate as f64;
        let omega = 2.0 * std::f64::consts::PI * self.spec.tone_hz / rate;
        let channels = self.spec.channels as usize;
        let mut samples = Vec::with_capacity(nb * channels);
        for i in 0..nb {
            let value = (omega * (start + i as u64) as f64).sin() as f32 * 0.5;
            for _ in 0..channels {
                samples.push(value);
            }
        }

        self.pending = Some(AudioData {
            samples: Arc::new(samples),
            channels: self.spec.channels,
            sample_rate: self.spec.sample_rate,
            pts: packet.pts,
            pos: packet.pos,
        });
        Ok(SendStatus::Accepted)
    }

    fn receive(&mut self) -> Result<DecodePoll, MediaError> {
        if let Some(audio) = self.pending.take() {
            return Ok(DecodePoll::Frame(DecodedFrame::Audio(audio)));
        }
        if self.draining {
            self.draining = false;
            Ok(DecodePoll::Drained)
        } else {
            Ok(DecodePoll::Pending)
        }
    }

    fn reset(&mut self) {
        self.pending = None;
        self.draining = false;
    }
}

/// Text-cue subtitle "codec".
pub struct SynthSubtitleDecoder {
    pending: Option<SubtitleData>,
    draining: bool,
}

impl SynthSubtitleDecoder {
    pub fn new() -> Self {
        Self {
            pending: None,
            draining: false,
        }
    }
}

impl Default for SynthSubtitleDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamDecoder for SynthSubtitleDecoder {
    fn send(&mut self, packet: Option<&Packet>) -> Result<SendStatus, MediaError> {
        let Some(packet) = packet else {
            self.draining = true;
            return Ok(SendStatus::Accepted);
        };
        if self.pending.is_some() {
            return Ok(SendStatus::Full);
        }
        let text = String::from_utf8_lossy(&packet.data).into_owned();
        self.pending = Some(SubtitleData {
            text,
            pts: packet.pts,
            start_display_ms: 0,
            end_display_ms: (packet.duration / 1000) as u32,
        });
        Ok(SendStatus::Accepted)
    }

    fn receive(&mut self) -> Result<DecodePoll, MediaError> {
        if let Some(sub) = self.pending.take() {
            return Ok(DecodePoll::Frame(DecodedFrame::Subtitle(sub)));
        }
        if self.draining {
            self.draining = false;
            Ok(DecodePoll::Drained)
        } else {
            Ok(DecodePoll::Pending)
        }
    }

    fn reset(&mut self) {
        self.pending = None;
        self.draining = false;
    }
}

/// Opener for `synth:` URLs.
pub struct SynthOpener;

impl MediaOpener for SynthOpener {
    fn open(
        &self,
        url: &str,
        _options: &MediaOptions,
        _interrupt: Arc<AtomicBool>,
    ) -> Result<Box<dyn Demuxer>, MediaError> {
        let spec = SynthSpec::parse(url)?;
        Ok(Box::new(SynthDemuxer::new(spec)))
    }

    fn new_decoder(
        &self,
        stream: &StreamInfo,
        _options: &MediaOptions,
    ) -> Result<Box<dyn StreamDecoder>, MediaError> {
        match &stream.params {
            StreamParams::Video {
                width,
                height,
                frame_rate,
                pixel_format,
                ..
            } => Ok(Box::new(SynthVideoDecoder::new(SynthSpec {
                width: *width,
                height: *height,
                fps: *frame_rate,
                pixel_format: *pixel_format,
                ..SynthSpec::default()
            }))),
            StreamParams::Audio {
                sample_rate,
                channels,
            } => Ok(Box::new(SynthAudioDecoder::new(SynthSpec {
                sample_rate: *sample_rate,
                channels: *channels,
                ..SynthSpec::default()
            }))),
            StreamParams::Subtitle => Ok(Box::new(SynthSubtitleDecoder::new())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_urls() {
        let spec = SynthSpec::parse("synth:dur=2.5,fps=25,subs=1,pix=bgra").unwrap();
        assert_eq!(spec.duration_secs, 2.5);
        assert_eq!(spec.fps, 25.0);
        assert!(spec.subtitles);
        assert_eq!(spec.pixel_format, PixelFormat::Bgra);

        assert!(SynthSpec::parse("file:whatever").is_err());
        assert!(SynthSpec::parse("synth:bogus=1").is_err());
    }

    #[test]
    fn packets_come_out_in_timestamp_order() {
        let spec = SynthSpec {
            duration_secs: 0.5,
            subtitles: true,
            ..SynthSpec::default()
        };
        let mut demux = SynthDemuxer::new(spec);

        let mut last = f64::MIN;
        let mut count = 0;
        while let Some(packet) = demux.read_packet().unwrap() {
            let stream = &demux.streams()[packet.stream_index];
            let secs = packet.pts.unwrap() as f64 * stream.time_base.as_f64();
            assert!(secs >= last - 1e-9, "timestamps regressed");
            last = secs;
            count += 1;
        }
        assert!(count > 30);
        // EOF is sticky.
        assert!(demux.read_packet().unwrap().is_none());
    }

    #[test]
    fn seek_rewinds_cursors() {
        let mut demux = SynthDemuxer::new(SynthSpec::default());
        while demux.read_packet().unwrap().is_some() {}

        demux
            .seek(&SeekTarget {
                min: 0,
                target: 1_000_000,
                max: 2_000_000,
                by_bytes: false,
            })
            .unwrap();
        let packet = demux.read_packet().unwrap().expect("packets after seek");
        let stream = &demux.streams()[packet.stream_index];
        let secs = packet.pts.unwrap() as f64 * stream.time_base.as_f64();
        assert!((secs - 1.0).abs() < 0.1);
    }

    #[test]
    fn audio_decode_round_trip() {
        let spec = SynthSpec::default();
        let mut demux = SynthDemuxer::new(SynthSpec {
            video: false,
            ..spec.clone()
        });
        let mut dec = SynthAudioDecoder::new(spec);

        let packet = demux.read_packet().unwrap().unwrap();
        assert_eq!(dec.send(Some(&packet)).unwrap(), SendStatus::Accepted);
        match dec.receive().unwrap() {
            DecodePoll::Frame(DecodedFrame::Audio(audio)) => {
                assert_eq!(audio.nb_samples(), AUDIO_FRAME_SAMPLES);
                assert_eq!(audio.pts, Some(0));
                // Starts at sin(0).
                assert_eq!(audio.samples[0], 0.0);
            }
            _ => panic!("expected an audio frame"),
        }
        assert!(matches!(dec.receive().unwrap(), DecodePoll::Pending));

        dec.send(None).unwrap();
        assert!(matches!(dec.receive().unwrap(), DecodePoll::Drained));
    }

    #[test]
    fn video_decoder_reports_full_with_pending_output() {
        let spec = SynthSpec::default();
        let mut demux = SynthDemuxer::new(SynthSpec {
            audio: false,
            ..spec.clone()
        });
        let mut dec = SynthVideoDecoder::new(spec);

        let first = demux.read_packet().unwrap().unwrap();
        let second = demux.read_packet().unwrap().unwrap();
        assert_eq!(dec.send(Some(&first)).unwrap(), SendStatus::Accepted);
        assert_eq!(dec.send(Some(&second)).unwrap(), SendStatus::Full);
        assert!(matches!(dec.receive().unwrap(), DecodePoll::Frame(_)));
        assert_eq!(dec.send(Some(&second)).unwrap(), SendStatus::Accepted);
    }

    #[test]
    fn attached_art_replaces_video_packets() {
        let demux = SynthDemuxer::new(SynthSpec {
            attached_art: true,
            ..SynthSpec::default()
        });
        let video = &demux.streams()[0];
        assert!(video.is_attached_picture());
        assert!(demux.next_video_time().is_none());
    }
}
