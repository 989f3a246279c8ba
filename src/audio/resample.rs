use super::AudioParams;

/// Linear-interpolation resampler from decoded f32 frames to the device's
/// S16 layout.
///
/// The caller picks the output frame count per call, which is how sync
/// compensation stretches or squeezes a frame by a few samples; the ratio
/// between input and requested output implicitly covers the rate change.
pub struct LinearResampler {
    src: AudioParams,
    tgt: AudioParams,
}

impl LinearResampler {
    pub fn new(src: AudioParams, tgt: AudioParams) -> Self {
        Self { src, tgt }
    }

    pub fn src(&self) -> AudioParams {
        self.src
    }

    /// Produce exactly `out_frames` frames from `input` (interleaved,
    /// `src.channels` wide).
    pub fn convert(&self, input: &[f32], out_frames: usize) -> Vec<i16> {
        let src_ch = self.src.channels as usize;
        let tgt_ch = self.tgt.channels as usize;
        let in_frames = if src_ch == 0 { 0 } else { input.len() / src_ch };

        let mut out = Vec::with_capacity(out_frames * tgt_ch);
        if in_frames == 0 || out_frames == 0 {
            out.resize(out_frames * tgt_ch, 0);
            return out;
        }

        let step = in_frames as f64 / out_frames as f64;
        for i in 0..out_frames {
            let pos = i as f64 * step;
            let i0 = (pos as usize).min(in_frames - 1);
            let i1 = (i0 + 1).min(in_frames - 1);
            let t = (pos - i0 as f64) as f32;

            for ch in 0..tgt_ch {
                let a = channel_sample(input, src_ch, i0, ch);
                let b = channel_sample(input, src_ch, i1, ch);
                let sample = a + (b - a) * t;
                out.push((sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16);
            }
        }
        out
    }
}

/// Map output channel `ch` onto the source layout: duplicate mono upward,
/// average stereo down to mono, truncate anything wider.
fn channel_sample(input: &[f32], src_ch: usize, frame: usize, ch: usize) -> f32 {
    let base = frame * src_ch;
    if ch < src_ch {
        input[base + ch]
    } else if src_ch == 1 {
        input[base]
    } else {
        // Downmix the extra output channel from the fronts.
        (input[base] + input[base + 1]) / 2.0
    }
}
