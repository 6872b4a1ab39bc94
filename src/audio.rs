//! PCM decoding, WAV synthesis, and the audio sink seam.
//!
//! The backend streams raw 16-bit PCM as base64 inside `data-pcm` chunks.
//! The receiver decodes those for live playback and accumulates them so the
//! whole turn can be re-synthesized into a single WAV file when the `finish`
//! chunk signals an audio turn. Hardware playback itself lives behind
//! [`AudioSink`].

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use thiserror::Error;

use crate::protocol::PcmPayload;

/// Default format when the backend omits one: 24 kHz mono 16-bit.
pub const DEFAULT_SAMPLE_RATE: u32 = 24_000;

/// Size of the RIFF/WAVE header produced by [`synthesize_wav`].
pub const WAV_HEADER_LEN: usize = 44;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AudioError {
    /// WAV synthesis was invoked with nothing buffered. This is a caller
    /// bug, not a degraded stream, so it fails loudly.
    #[error("cannot synthesize WAV from an empty sample buffer")]
    EmptyBuffer,

    #[error("invalid PCM payload: {0}")]
    InvalidPcm(String),
}

/// Live playback seam exposed by the host audio layer.
pub trait AudioSink: Send + Sync {
    /// Drop any queued audio; called at each turn terminal.
    fn reset(&self);
    /// Play decoded 16-bit samples immediately.
    fn play_pcm(&self, samples: &[i16]);
}

/// Format descriptor captured from the first PCM chunk of a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bit_depth: u16,
}

impl Default for PcmFormat {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: 1,
            bit_depth: 16,
        }
    }
}

impl PcmFormat {
    /// Build a format from a chunk payload, falling back to defaults for
    /// any omitted field.
    pub fn from_payload(payload: &PcmPayload) -> Self {
        let default = Self::default();
        Self {
            sample_rate: payload.sample_rate.unwrap_or(default.sample_rate),
            channels: payload.channels.unwrap_or(default.channels),
            bit_depth: payload.bit_depth.unwrap_or(default.bit_depth),
        }
    }
}

/// Decode a base64 PCM payload into little-endian 16-bit samples.
pub fn decode_pcm_base64(content: &str) -> Result<Vec<i16>, AudioError> {
    let bytes = BASE64
        .decode(content)
        .map_err(|e| AudioError::InvalidPcm(format!("base64 decode failed: {e}")))?;
    if bytes.len() % 2 != 0 {
        return Err(AudioError::InvalidPcm(format!(
            "odd byte count {} for 16-bit samples",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

/// Build a complete WAV container from buffered samples.
///
/// Output is exactly `44 + 2N` bytes for `N` samples: a standard RIFF/WAVE
/// header (`ChunkSize = 36 + 2N`, `Subchunk2Size = 2N`) followed by raw
/// little-endian sample bytes.
pub fn synthesize_wav(samples: &[i16], format: PcmFormat) -> Result<Vec<u8>, AudioError> {
    if samples.is_empty() {
        return Err(AudioError::EmptyBuffer);
    }
    let data_len = (samples.len() * 2) as u32;
    let block_align = format.channels * 2;
    let byte_rate = format.sample_rate * block_align as u32;

    let mut out = Vec::with_capacity(WAV_HEADER_LEN + data_len as usize);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_len).to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes()); // PCM
    out.extend_from_slice(&format.channels.to_le_bytes());
    out.extend_from_slice(&format.sample_rate.to_le_bytes());
    out.extend_from_slice(&byte_rate.to_le_bytes());
    out.extend_from_slice(&block_align.to_le_bytes());
    out.extend_from_slice(&format.bit_depth.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());
    for sample in samples {
        out.extend_from_slice(&sample.to_le_bytes());
    }
    Ok(out)
}

/// Synthesize a WAV container and wrap it into a `data:audio/wav;base64,...`
/// URI suitable for a `file` chunk.
pub fn synthesize_wav_data_uri(samples: &[i16], format: PcmFormat) -> Result<String, AudioError> {
    let wav = synthesize_wav(samples, format)?;
    Ok(format!("data:audio/wav;base64,{}", BASE64.encode(wav)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn u16_at(bytes: &[u8], offset: usize) -> u16 {
        u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
    }

    fn u32_at(bytes: &[u8], offset: usize) -> u32 {
        u32::from_le_bytes([
            bytes[offset],
            bytes[offset + 1],
            bytes[offset + 2],
            bytes[offset + 3],
        ])
    }

    #[test]
    fn wav_length_is_44_plus_2n() {
        let samples = vec![0i16; 480];
        let wav = synthesize_wav(&samples, PcmFormat::default()).unwrap();
        assert_eq!(wav.len(), 44 + 2 * 480);
    }

    #[test]
    fn wav_header_round_trips_format() {
        let format = PcmFormat {
            sample_rate: 16_000,
            channels: 2,
            bit_depth: 16,
        };
        let samples = vec![1i16, -1, 2, -2];
        let wav = synthesize_wav(&samples, format).unwrap();

        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(u32_at(&wav, 4), 36 + 2 * samples.len() as u32);
        assert_eq!(&wav[8..12], b"WAVE");
        assert_eq!(u16_at(&wav, 22), 2); // channels
        assert_eq!(u32_at(&wav, 24), 16_000); // sample rate
        assert_eq!(u32_at(&wav, 28), 16_000 * 4); // byte rate
        assert_eq!(u16_at(&wav, 34), 16); // bits per sample
        assert_eq!(&wav[36..40], b"data");
        assert_eq!(u32_at(&wav, 40), 2 * samples.len() as u32);
        // sample bytes follow, little-endian
        assert_eq!(i16::from_le_bytes([wav[44], wav[45]]), 1);
        assert_eq!(i16::from_le_bytes([wav[46], wav[47]]), -1);
    }

    #[test]
    fn empty_buffer_fails_loudly() {
        assert_eq!(
            synthesize_wav(&[], PcmFormat::default()).unwrap_err(),
            AudioError::EmptyBuffer
        );
    }

    #[test]
    fn data_uri_has_wav_prefix() {
        let uri = synthesize_wav_data_uri(&[0, 1, 2], PcmFormat::default()).unwrap();
        assert!(uri.starts_with("data:audio/wav;base64,"));
    }

    #[test]
    fn pcm_decode_round_trip() {
        let samples: Vec<i16> = vec![0, 1, -1, i16::MAX, i16::MIN];
        let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        let encoded = BASE64.encode(&bytes);
        assert_eq!(decode_pcm_base64(&encoded).unwrap(), samples);
    }

    #[test]
    fn odd_byte_count_is_invalid() {
        let encoded = BASE64.encode([0u8, 1, 2]);
        assert!(matches!(
            decode_pcm_base64(&encoded),
            Err(AudioError::InvalidPcm(_))
        ));
    }

    #[test]
    fn format_from_payload_fills_defaults() {
        let payload = PcmPayload {
            content: None,
            sample_rate: Some(48_000),
            channels: None,
            bit_depth: None,
        };
        let format = PcmFormat::from_payload(&payload);
        assert_eq!(format.sample_rate, 48_000);
        assert_eq!(format.channels, 1);
        assert_eq!(format.bit_depth, 16);
    }
}
