use std::sync::Arc;

use tracing::warn;

use crate::media::{Picture, PixelFormat};
use crate::playback::frame::Frame;

use super::{BlendMode, Rect, TextureId, VideoSink, calculate_display_rect};

/// Uploads decoded pictures into sink textures and composes the frame.
///
/// Formats the sink takes natively (YUV420P, BGRA) upload directly;
/// everything else is converted to BGRA through a cached scaling context
/// that reconfigures when the source format changes.
pub struct VideoRenderer {
    sink: Arc<dyn VideoSink>,
    vid_texture: Option<TextureSlot>,
    /// Rasterized subtitle overlay, present only for bitmap subtitles.
    sub_texture: Option<TextureId>,
    /// Text of the subtitle currently inside its display window.
    subtitle_text: Option<String>,
    scaler: Option<ScalerContext>,
}

struct TextureSlot {
    id: TextureId,
    format: PixelFormat,
    width: u32,
    height: u32,
}

impl VideoRenderer {
    pub fn new(sink: Arc<dyn VideoSink>) -> Self {
        Self {
            sink,
            vid_texture: None,
            sub_texture: None,
            subtitle_text: None,
            scaler: None,
        }
    }

    /// Text of the subtitle currently on screen, for frontends that draw
    /// their own captions.
    pub fn active_subtitle(&self) -> Option<&str> {
        self.subtitle_text.as_deref()
    }

    pub fn sink(&self) -> &Arc<dyn VideoSink> {
        &self.sink
    }

    /// Show `frame`, optionally overlaying `subtitle`.
    pub fn display(&mut self, frame: &Frame, subtitle: Option<&Frame>) {
        let Some(picture) = frame.as_picture() else {
            return;
        };

        let uploaded;
        let (width, height);
        match picture.format {
            PixelFormat::Yuv420p | PixelFormat::Bgra => {
                uploaded = self.upload(picture.format, picture);
                width = picture.width;
                height = picture.height;
            }
            other => {
                let converted = match &mut self.scaler {
                    Some(ctx) if ctx.matches(picture) => ctx.convert(picture),
                    _ => {
                        let mut ctx = ScalerContext::new(other, picture.width, picture.height);
                        let converted = ctx.convert(picture);
                        self.scaler = Some(ctx);
                        converted
                    }
                };
                uploaded = self.upload(PixelFormat::Bgra, &converted);
                width = converted.width;
                height = converted.height;
            }
        }

        let Some(texture) = uploaded else { return };

        let (out_w, out_h) = self.sink.output_size();
        let dst = calculate_display_rect(out_w, out_h, width, height);
        let src = Rect {
            x: 0,
            y: 0,
            w: width as i32,
            h: height as i32,
        };

        self.sink.clear();
        self.sink.render(texture, src, dst);
        if let Some(sub) = subtitle {
            self.subtitle_text = sub.as_subtitle().map(|s| s.text.clone());
            if let Some(sub_texture) = self.sub_texture {
                self.sink.render(sub_texture, src, dst);
            }
        }
        self.sink.present();
    }

    /// Drop the subtitle overlay, if any.
    pub fn clear_subtitle(&mut self) {
        self.subtitle_text = None;
        if let Some(id) = self.sub_texture.take() {
            self.sink.destroy_texture(id);
        }
    }

    /// Window resized: textures for the old surface are stale.
    pub fn invalidate(&mut self) {
        if let Some(slot) = self.vid_texture.take() {
            self.sink.destroy_texture(slot.id);
        }
        self.clear_subtitle();
    }

    fn upload(&mut self, format: PixelFormat, picture: &Picture) -> Option<TextureId> {
        let needs_realloc = !matches!(
            &self.vid_texture,
            Some(slot)
                if slot.format == format
                    && slot.width == picture.width
                    && slot.height == picture.height
        );
        if needs_realloc {
            if let Some(slot) = self.vid_texture.take() {
                self.sink.destroy_texture(slot.id);
            }
            match self
                .sink
                .create_texture(format, picture.width, picture.height, BlendMode::Opaque)
            {
                Ok(id) => {
                    self.vid_texture = Some(TextureSlot {
                        id,
                        format,
                        width: picture.width,
                        height: picture.height,
                    });
                }
                Err(err) => {
                    warn!(%err, "video texture allocation failed");
                    return None;
                }
            }
        }

        let slot = self.vid_texture.as_ref()?;
        if let Err(err) = self.sink.update_texture(slot.id, picture) {
            warn!(%err, "video texture upload failed");
            return None;
        }
        Some(slot.id)
    }
}

/// Cached conversion context for formats the sink cannot take directly.
struct ScalerContext {
    src_format: PixelFormat,
    width: u32,
    height: u32,
}

impl ScalerContext {
    fn new(src_format: PixelFormat, width: u32, height: u32) -> Self {
        Self {
            src_format,
            width,
            height,
        }
    }

    fn matches(&self, picture: &Picture) -> bool {
        self.src_format == picture.format
            && self.width == picture.width
            && self.height == picture.height
    }

    fn convert(&mut self, picture: &Picture) -> Picture {
        let bgra = match picture.format {
            PixelFormat::Rgb24 => rgb24_to_bgra(picture),
            PixelFormat::Yuv420p => yuv420p_to_bgra(picture),
            PixelFormat::Bgra => picture.data.as_ref().clone(),
        };
        Picture {
            format: PixelFormat::Bgra,
            width: picture.width,
            height: picture.height,
            data: Arc::new(bgra),
        }
    }
}

fn rgb24_to_bgra(picture: &Picture) -> Vec<u8> {
    let pixels = (picture.width * picture.height) as usize;
    let mut out = vec![255u8; pixels * 4];
    for (dst, src) in out.chunks_exact_mut(4).zip(picture.data.chunks_exact(3)) {
        dst[0] = src[2];
        dst[1] = src[1];
        dst[2] = src[0];
    }
    out
}

fn yuv420p_to_bgra(picture: &Picture) -> Vec<u8> {
    let w = picture.width as usize;
    let h = picture.height as usize;
    let cw = w.div_ceil(2);
    let y_plane = &picture.data[..w * h];
    let u_plane = &picture.data[w * h..w * h + cw * h.div_ceil(2)];
    let v_plane = &picture.data[w * h + cw * h.div_ceil(2)..];

    let mut out = vec![255u8; w * h * 4];
    for row in 0..h {
        for col in 0..w {
            let y = y_plane[row * w + col] as f32;
            let u = u_plane[(row / 2) * cw + col / 2] as f32 - 128.0;
            let v = v_plane[(row / 2) * cw + col / 2] as f32 - 128.0;

            let r = y + 1.402 * v;
            let g = y - 0.344 * u - 0.714 * v;
            let b = y + 1.772 * u;

            let px = (row * w + col) * 4;
            out[px] = b.clamp(0.0, 255.0) as u8;
            out[px + 1] = g.clamp(0.0, 255.0) as u8;
            out[px + 2] = r.clamp(0.0, 255.0) as u8;
        }
    }
    out
}
