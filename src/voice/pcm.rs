//! PCM16LE codec and small sample-processing helpers.
//!
//! Capture frames travel as little-endian signed 16-bit PCM inside base64
//! strings; playback fragments come back the same way. Conversion is
//! asymmetric on the way out (negatives scale by 32768, positives by 32767)
//! and symmetric on the way in (everything divides by 32768).

use base64::Engine;

use super::error::{VoiceError, VoiceResult};

/// Convert one normalized sample to PCM16, clamping to the ±1.0 boundary.
pub fn sample_to_pcm16(sample: f32) -> i16 {
    let s = sample.clamp(-1.0, 1.0);
    let scaled = if s < 0.0 { s * 32768.0 } else { s * 32767.0 };
    // NaN falls through clamp and casts to 0.
    scaled.round() as i16
}

/// Encode normalized f32 samples as PCM16LE bytes.
pub fn encode_pcm16le(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        bytes.extend_from_slice(&sample_to_pcm16(s).to_le_bytes());
    }
    bytes
}

/// Decode PCM16LE bytes to normalized f32 samples. A trailing odd byte is ignored.
pub fn decode_pcm16le(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|pair| f32::from(i16::from_le_bytes([pair[0], pair[1]])) / 32768.0)
        .collect()
}

/// PCM16LE-encode a capture frame and wrap it in standard base64.
pub fn encode_frame(samples: &[f32]) -> String {
    base64::engine::general_purpose::STANDARD.encode(encode_pcm16le(samples))
}

/// Decode a base64 PCM16LE fragment received from the service.
pub fn decode_fragment(data: &str) -> VoiceResult<Vec<f32>> {
    let bytes = base64::engine::general_purpose::STANDARD.decode(data.trim())?;
    if bytes.len() < 2 {
        return Err(VoiceError::Decode(format!(
            "audio fragment too short ({} bytes)",
            bytes.len()
        )));
    }
    Ok(decode_pcm16le(&bytes))
}

/// Root-mean-square amplitude of a frame, for the UI volume meter.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt()
}

/// Average interleaved multi-channel samples down to mono.
pub fn downmix(interleaved: &[f32], channels: u16) -> Vec<f32> {
    let channels = usize::from(channels.max(1));
    if channels == 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Streaming linear-interpolation resampler for the capture path.
///
/// Devices rarely run at 16 kHz natively; this converts whatever the
/// default input config delivers. State carries across calls so chunk
/// boundaries don't click.
#[derive(Debug, Clone)]
pub struct LinearResampler {
    step: f64,
    pos: f64,
    carry: Option<f32>,
}

impl LinearResampler {
    pub fn new(from_rate: u32, to_rate: u32) -> Self {
        Self {
            step: f64::from(from_rate.max(1)) / f64::from(to_rate.max(1)),
            pos: 0.0,
            carry: None,
        }
    }

    pub fn is_passthrough(&self) -> bool {
        (self.step - 1.0).abs() < f64::EPSILON
    }

    pub fn process(&mut self, input: &[f32]) -> Vec<f32> {
        if self.is_passthrough() {
            return input.to_vec();
        }

        let mut buf = Vec::with_capacity(input.len() + 1);
        if let Some(c) = self.carry {
            buf.push(c);
        }
        buf.extend_from_slice(input);
        if buf.len() < 2 {
            self.carry = buf.last().copied();
            return Vec::new();
        }

        let last = (buf.len() - 1) as f64;
        let mut out = Vec::with_capacity((last / self.step) as usize + 1);
        while self.pos < last {
            let i = self.pos.floor() as usize;
            let frac = (self.pos - i as f64) as f32;
            out.push(buf[i] + (buf[i + 1] - buf[i]) * frac);
            self.pos += self.step;
        }
        // Re-base onto the sample that becomes the next carry.
        self.pos -= last;
        self.carry = buf.last().copied();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expected_pcm16(s: f32) -> i16 {
        let c = s.clamp(-1.0, 1.0);
        let scale = if c < 0.0 { 32768.0 } else { 32767.0 };
        (c * scale).round() as i16
    }

    #[test]
    fn pcm16_matches_asymmetric_scaling() {
        let samples = [-1.0f32, -0.5, -0.25, 0.0, 0.25, 0.5, 0.999, 1.0, 0.123_456];
        for &s in &samples {
            assert_eq!(sample_to_pcm16(s), expected_pcm16(s), "sample {s}");
        }
        assert_eq!(sample_to_pcm16(-1.0), i16::MIN);
        assert_eq!(sample_to_pcm16(1.0), i16::MAX);
    }

    #[test]
    fn out_of_range_samples_clamp_to_boundary() {
        assert_eq!(sample_to_pcm16(-3.5), i16::MIN);
        assert_eq!(sample_to_pcm16(7.0), i16::MAX);
        assert_eq!(sample_to_pcm16(f32::NAN), 0);
    }

    #[test]
    fn encode_is_little_endian() {
        let bytes = encode_pcm16le(&[1.0, -1.0]);
        assert_eq!(bytes, vec![0xFF, 0x7F, 0x00, 0x80]);
    }

    #[test]
    fn frame_round_trip_within_one_step() {
        let original: Vec<f32> = (0..512)
            .map(|i| ((i as f32) * 0.05).sin() * 0.4)
            .collect();
        let b64 = encode_frame(&original);
        let decoded = decode_fragment(&b64).unwrap();
        assert_eq!(decoded.len(), original.len());
        for (a, b) in original.iter().zip(decoded.iter()) {
            assert!((a - b).abs() <= 1.0 / 32768.0, "{a} vs {b}");
        }
    }

    #[test]
    fn full_scale_positive_drifts_by_scale_mismatch_only() {
        // 32767 out, 32768 back: near +1.0 the error grows to about 1.5 steps.
        let decoded = decode_fragment(&encode_frame(&[0.99, -0.99])).unwrap();
        assert!((decoded[0] - 0.99).abs() <= 1.5 / 32768.0);
        assert!((decoded[1] + 0.99).abs() <= 0.5 / 32768.0 + f32::EPSILON);
    }

    #[test]
    fn decode_ignores_trailing_odd_byte() {
        let samples = decode_pcm16le(&[0x00, 0x40, 0x7F]);
        assert_eq!(samples, vec![0.5]);
    }

    #[test]
    fn decode_rejects_garbage_and_empty() {
        assert!(matches!(
            decode_fragment("***not base64***"),
            Err(VoiceError::Decode(_))
        ));
        assert!(matches!(decode_fragment(""), Err(VoiceError::Decode(_))));
    }

    #[test]
    fn rms_of_constant_and_empty() {
        assert_eq!(rms(&[]), 0.0);
        assert!((rms(&[0.5; 64]) - 0.5).abs() < 1e-6);
        assert!((rms(&[1.0, -1.0]) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn downmix_averages_channels() {
        assert_eq!(downmix(&[0.2, 0.4, -1.0, 1.0], 2), vec![0.3, 0.0]);
        assert_eq!(downmix(&[0.1, 0.2], 1), vec![0.1, 0.2]);
    }

    #[test]
    fn resampler_downsamples_across_chunks() {
        let mut r = LinearResampler::new(48_000, 16_000);
        let mut total = 0;
        for _ in 0..10 {
            total += r.process(&[0.25; 480]).len();
        }
        // 4800 input samples at a 3:1 ratio
        assert!((1598..=1601).contains(&total), "got {total}");
    }

    #[test]
    fn resampler_interpolates_ramp() {
        let mut r = LinearResampler::new(2, 4);
        let out = r.process(&[0.0, 1.0, 2.0]);
        assert_eq!(out, vec![0.0, 0.5, 1.0, 1.5]);
    }

    #[test]
    fn resampler_passthrough_at_equal_rates() {
        let mut r = LinearResampler::new(16_000, 16_000);
        assert!(r.is_passthrough());
        assert_eq!(r.process(&[0.1, 0.2]), vec![0.1, 0.2]);
    }
}
