//! RIFF/WAVE container codec for PCM audio.
//!
//! Audio crosses two boundaries in a container: the recorder hands finished
//! chunks over as a header-prefixed buffer, and the output device is fed a
//! container built from the backend's raw PCM16 stream.  Both directions go
//! through `hound`; [`unwrap`] hands back the payload as a borrowed slice.
//!
//! ```rust
//! use voice_session::audio::container::{unwrap, wrap_pcm};
//!
//! let pcm = vec![0x01, 0x00, 0xFF, 0x7F];
//! let bytes = wrap_pcm(&pcm, 24_000, 1, 16).unwrap();
//! let (header, payload) = unwrap(&bytes).unwrap();
//! assert_eq!(header.sample_rate, 24_000);
//! assert_eq!(payload, &pcm[..]);
//! ```

use std::io::Cursor;

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use thiserror::Error;

use super::resample::{downmix, resample};

/// Size of the canonical header written by [`wrap_pcm`].
pub const HEADER_LEN: usize = 44;

/// `fmt ` format tag for integer PCM.
pub const PCM_FORMAT_TAG: u16 = 1;
const FLOAT_FORMAT_TAG: u16 = 3;

/// Sample rate of the backend's PCM16 streams, both directions.
pub const WIRE_SAMPLE_RATE: u32 = 24_000;
pub const WIRE_CHANNELS: u16 = 1;
pub const WIRE_BITS_PER_SAMPLE: u16 = 16;

// ---------------------------------------------------------------------------
// CodecError
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The leading `RIFF`/`WAVE` magic is missing.
    #[error("buffer is not a RIFF/WAVE container")]
    NotAContainer,

    /// The `data` chunk declares more bytes than the buffer holds.
    #[error("declared payload of {declared} bytes exceeds the {available} bytes available")]
    TruncatedPayload { declared: usize, available: usize },

    /// Header chunks are missing, out of order or cut short.
    #[error("malformed container: {0}")]
    Malformed(String),

    #[error("could not encode container: {0}")]
    Encode(String),

    /// The payload is not 16-bit integer PCM.
    #[error("unsupported sample format (tag {format_tag}, {bits_per_sample} bits)")]
    UnsupportedFormat {
        format_tag: u16,
        bits_per_sample: u16,
    },
}

// ---------------------------------------------------------------------------
// ContainerHeader
// ---------------------------------------------------------------------------

/// Format description of a container's PCM payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerHeader {
    pub format_tag: u16,
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    /// Length of the `data` payload in bytes.
    pub data_len: u32,
}

impl ContainerHeader {
    pub fn block_align(&self) -> u16 {
        self.channels * self.bits_per_sample.div_ceil(8)
    }

    pub fn byte_rate(&self) -> u32 {
        self.sample_rate * u32::from(self.block_align())
    }

    /// Playback duration of the payload.
    pub fn duration(&self) -> std::time::Duration {
        let byte_rate = self.byte_rate();
        if byte_rate == 0 {
            return std::time::Duration::ZERO;
        }
        std::time::Duration::from_nanos(u64::from(self.data_len) * 1_000_000_000 / u64::from(byte_rate))
    }

    fn is_pcm16(&self) -> bool {
        self.format_tag == PCM_FORMAT_TAG && self.bits_per_sample == 16
    }
}

// ---------------------------------------------------------------------------
// wrap / unwrap
// ---------------------------------------------------------------------------

/// Prefix little-endian `samples` with a canonical PCM header.
///
/// Only 8- and 16-bit integer PCM is written.  A trailing partial sample is
/// dropped.
pub fn wrap_pcm(
    samples: &[u8],
    sample_rate: u32,
    channels: u16,
    bit_depth: u16,
) -> Result<Vec<u8>, CodecError> {
    let spec = WavSpec {
        channels,
        sample_rate,
        bits_per_sample: bit_depth,
        sample_format: SampleFormat::Int,
    };
    let encode = |e: hound::Error| CodecError::Encode(e.to_string());

    let mut cursor = Cursor::new(Vec::with_capacity(HEADER_LEN + samples.len()));
    {
        let mut writer = WavWriter::new(&mut cursor, spec).map_err(encode)?;
        match bit_depth {
            16 => {
                for sample in pcm16_to_samples(samples) {
                    writer.write_sample(sample).map_err(encode)?;
                }
            }
            // 8-bit WAV is unsigned on disk; hound takes signed samples.
            8 => {
                for &byte in samples {
                    writer
                        .write_sample((i16::from(byte) - 128) as i8)
                        .map_err(encode)?;
                }
            }
            _ => {
                return Err(CodecError::UnsupportedFormat {
                    format_tag: PCM_FORMAT_TAG,
                    bits_per_sample: bit_depth,
                })
            }
        }
        writer.finalize().map_err(encode)?;
    }
    Ok(cursor.into_inner())
}

/// Split a container into its header and PCM payload.
///
/// `hound` walks the sub-chunks up to `data`, so extended `fmt ` blocks and
/// leading `LIST`/`fact` chunks are accepted.
///
/// # Errors
///
/// - [`CodecError::NotAContainer`]: the `RIFF`…`WAVE` magic is absent.
/// - [`CodecError::TruncatedPayload`]: the `data` chunk overruns the buffer.
pub fn unwrap(container: &[u8]) -> Result<(ContainerHeader, &[u8]), CodecError> {
    if container.len() < 12 || &container[0..4] != b"RIFF" || &container[8..12] != b"WAVE" {
        return Err(CodecError::NotAContainer);
    }

    let reader =
        WavReader::new(Cursor::new(container)).map_err(|e| CodecError::Malformed(e.to_string()))?;
    let spec = reader.spec();
    let bytes_per_sample = usize::from(spec.bits_per_sample.div_ceil(8));
    let declared = reader.len() as usize * bytes_per_sample;
    let body = reader.into_inner().position() as usize;

    let available = container.len().saturating_sub(body);
    if declared > available {
        return Err(CodecError::TruncatedPayload {
            declared,
            available,
        });
    }

    let header = ContainerHeader {
        format_tag: match spec.sample_format {
            SampleFormat::Int => PCM_FORMAT_TAG,
            SampleFormat::Float => FLOAT_FORMAT_TAG,
        },
        sample_rate: spec.sample_rate,
        channels: spec.channels,
        bits_per_sample: spec.bits_per_sample,
        data_len: declared as u32,
    };
    Ok((header, &container[body..body + declared]))
}

// ---------------------------------------------------------------------------
// ExtractedAudio
// ---------------------------------------------------------------------------

/// Outcome of reading a finished recorder buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractedAudio {
    /// A well-formed container.
    Container {
        header: ContainerHeader,
        payload: Vec<u8>,
    },
    /// Not a container at all.  Some capture backends emit already-encoded
    /// audio; it is forwarded opaque, byte for byte.
    Raw(Vec<u8>),
}

/// Read a recorder buffer, falling back to [`ExtractedAudio::Raw`] when the
/// container magic is missing.  Malformed containers are still errors.
pub fn extract(bytes: Vec<u8>) -> Result<ExtractedAudio, CodecError> {
    match unwrap(&bytes) {
        Ok((header, payload)) => Ok(ExtractedAudio::Container {
            header,
            payload: payload.to_vec(),
        }),
        Err(CodecError::NotAContainer) => Ok(ExtractedAudio::Raw(bytes)),
        Err(e) => Err(e),
    }
}

/// Convert a device-format PCM16 payload into the wire format
/// (mono, [`WIRE_SAMPLE_RATE`], 16-bit little-endian).
pub fn to_wire_pcm(header: &ContainerHeader, payload: &[u8]) -> Result<Vec<u8>, CodecError> {
    if !header.is_pcm16() {
        return Err(CodecError::UnsupportedFormat {
            format_tag: header.format_tag,
            bits_per_sample: header.bits_per_sample,
        });
    }
    if header.channels == WIRE_CHANNELS && header.sample_rate == WIRE_SAMPLE_RATE {
        return Ok(payload.to_vec());
    }

    let samples = pcm16_to_samples(payload);
    let mono = downmix(&samples, header.channels);
    let resampled = resample(&mono, header.sample_rate, WIRE_SAMPLE_RATE);
    Ok(samples_to_pcm16(&resampled))
}

// ---------------------------------------------------------------------------
// PCM16 helpers
// ---------------------------------------------------------------------------

/// Decode little-endian PCM16 bytes.  A trailing odd byte is ignored.
pub fn pcm16_to_samples(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect()
}

/// Encode samples as little-endian PCM16 bytes.
pub fn samples_to_pcm16(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
