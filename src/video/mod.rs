//! The abstract video sink and its built-in implementations.
//!
//! Windowing and texture upload stay behind [`VideoSink`]; the core only
//! needs create/update/render. Sinks must be callable from the scheduler
//! thread and handle their own internal locking.

pub mod renderer;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use thiserror::Error;

use crate::media::{Picture, PixelFormat};

#[derive(Debug, Error)]
pub enum VideoSinkError {
    #[error("texture allocation failed: {0}")]
    Alloc(String),

    #[error("upload failed: {0}")]
    Upload(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlendMode {
    Opaque,
    Blend,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

pub type TextureId = u64;

/// Display collaborator. Textures are opaque handles owned by the sink.
pub trait VideoSink: Send + Sync {
    fn create_texture(
        &self,
        format: PixelFormat,
        width: u32,
        height: u32,
        blend: BlendMode,
    ) -> Result<TextureId, VideoSinkError>;

    fn update_texture(&self, id: TextureId, picture: &Picture) -> Result<(), VideoSinkError>;

    fn destroy_texture(&self, id: TextureId);

    fn render(&self, id: TextureId, src: Rect, dst: Rect);

    fn clear(&self);

    fn present(&self);

    /// Current output dimensions in pixels.
    fn output_size(&self) -> (u32, u32);
}

/// Fit `width x height` into the output, centered, preserving aspect.
pub fn calculate_display_rect(
    out_width: u32,
    out_height: u32,
    pic_width: u32,
    pic_height: u32,
) -> Rect {
    if pic_width == 0 || pic_height == 0 {
        return Rect::default();
    }
    let aspect = pic_width as f64 / pic_height as f64;

    let mut height = out_height as i64;
    let mut width = (height as f64 * aspect).round() as i64 & !1;
    if width > out_width as i64 {
        width = out_width as i64;
        height = (width as f64 / aspect).round() as i64 & !1;
    }
    let x = (out_width as i64 - width) / 2;
    let y = (out_height as i64 - height) / 2;
    Rect {
        x: x as i32,
        y: y as i32,
        w: width.max(1) as i32,
        h: height.max(1) as i32,
    }
}

/// Headless sink: accepts everything, draws nothing.
pub struct NullVideoSink {
    width: u32,
    height: u32,
    next_id: AtomicU64,
}

impl NullVideoSink {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            next_id: AtomicU64::new(1),
        }
    }
}

impl VideoSink for NullVideoSink {
    fn create_texture(
        &self,
        _format: PixelFormat,
        _width: u32,
        _height: u32,
        _blend: BlendMode,
    ) -> Result<TextureId, VideoSinkError> {
        Ok(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn update_texture(&self, _id: TextureId, _picture: &Picture) -> Result<(), VideoSinkError> {
        Ok(())
    }

    fn destroy_texture(&self, _id: TextureId) {}

    fn render(&self, _id: TextureId, _src: Rect, _dst: Rect) {}

    fn clear(&self) {}

    fn present(&self) {}

    fn output_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

/// What a recording sink saw, for assertions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SinkEvent {
    Create {
        format: PixelFormat,
        width: u32,
        height: u32,
    },
    Upload {
        id: TextureId,
        format: PixelFormat,
    },
    Render {
        id: TextureId,
        dst: Rect,
    },
    Destroy {
        id: TextureId,
    },
    Present,
}

/// Test sink that records every call.
pub struct RecordingVideoSink {
    width: u32,
    height: u32,
    next_id: AtomicU64,
    events: Mutex<Vec<SinkEvent>>,
}

impl RecordingVideoSink {
    pub fn new(width: u32, height: u32) -> Arc<Self> {
        Arc::new(Self {
            width,
            height,
            next_id: AtomicU64::new(1),
            events: Mutex::new(Vec::new()),
        })
    }

    pub fn events(&self) -> Vec<SinkEvent> {
        self.events.lock().clone()
    }

    pub fn presents(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, SinkEvent::Present))
            .count()
    }
}

impl VideoSink for RecordingVideoSink {
    fn create_texture(
        &self,
        format: PixelFormat,
        width: u32,
        height: u32,
        _blend: BlendMode,
    ) -> Result<TextureId, VideoSinkError> {
        self.events.lock().push(SinkEvent::Create {
            format,
            width,
            height,
        });
        Ok(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn update_texture(&self, id: TextureId, picture: &Picture) -> Result<(), VideoSinkError> {
        self.events.lock().push(SinkEvent::Upload {
            id,
            format: picture.format,
        });
        Ok(())
    }

    fn destroy_texture(&self, id: TextureId) {
        self.events.lock().push(SinkEvent::Destroy { id });
    }

    fn render(&self, id: TextureId, _src: Rect, dst: Rect) {
        self.events.lock().push(SinkEvent::Render { id, dst });
    }

    fn clear(&self) {}

    fn present(&self) {
        self.events.lock().push(SinkEvent::Present);
    }

    fn output_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}
