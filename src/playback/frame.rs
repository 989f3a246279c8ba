use crate::media::{AudioData, Picture, SubtitleData};

/// A decoded frame staged for presentation.
///
/// Bulk payloads are reference counted so peeking clones are cheap.
#[derive(Clone, Debug)]
pub enum FramePayload {
    Audio(AudioData),
    Video(Picture),
    Subtitle(SubtitleData),
}

#[derive(Clone, Debug)]
pub struct Frame {
    pub payload: FramePayload,
    /// Presentation time in seconds; NaN when the source had no timestamp.
    pub pts: f64,
    /// Estimated duration in seconds.
    pub duration: f64,
    /// Byte position of the originating packet, -1 if unknown.
    pub pos: i64,
    /// Serial of the originating packet.
    pub serial: i32,
}

impl Frame {
    pub fn audio(data: AudioData, pts: f64, duration: f64, pos: i64, serial: i32) -> Self {
        Self {
            payload: FramePayload::Audio(data),
            pts,
            duration,
            pos,
            serial,
        }
    }

    pub fn video(picture: Picture, pts: f64, duration: f64, pos: i64, serial: i32) -> Self {
        Self {
            payload: FramePayload::Video(picture),
            pts,
            duration,
            pos,
            serial,
        }
    }

    pub fn subtitle(data: SubtitleData, pts: f64, serial: i32) -> Self {
        let duration = (data.end_display_ms - data.start_display_ms) as f64 / 1000.0;
        Self {
            payload: FramePayload::Subtitle(data),
            pts,
            duration,
            pos: -1,
            serial,
        }
    }

    pub fn as_audio(&self) -> Option<&AudioData> {
        match &self.payload {
            FramePayload::Audio(data) => Some(data),
            _ => None,
        }
    }

    pub fn as_picture(&self) -> Option<&Picture> {
        match &self.payload {
            FramePayload::Video(picture) => Some(picture),
            _ => None,
        }
    }

    pub fn as_subtitle(&self) -> Option<&SubtitleData> {
        match &self.payload {
            FramePayload::Subtitle(data) => Some(data),
            _ => None,
        }
    }

    /// Seconds at which a subtitle stops being shown.
    pub fn subtitle_end(&self) -> f64 {
        match &self.payload {
            FramePayload::Subtitle(data) => self.pts + data.end_display_ms as f64 / 1000.0,
            _ => f64::NAN,
        }
    }

    /// Seconds at which a subtitle starts being shown.
    pub fn subtitle_start(&self) -> f64 {
        match &self.payload {
            FramePayload::Subtitle(data) => self.pts + data.start_display_ms as f64 / 1000.0,
            _ => f64::NAN,
        }
    }
}
