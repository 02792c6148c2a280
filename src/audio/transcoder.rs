//! # Audio Transcoder
//!
//! Converts between raw PCM and WAV containers and builds the single
//! recording file for a call.
//!
//! ## Recording format:
//! Mono, 16kHz, 16-bit little-endian PCM. Each accumulated segment is wrapped
//! in its own WAV header first; the concatenation step then strips the
//! headers, checks that every segment agrees on the format, and writes one
//! WAV file with the joined samples.

use crate::config::StreamConfig;
use crate::error::{AppError, AppResult};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Format of a raw PCM stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bit_depth: u16,
}

impl Default for PcmFormat {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            channels: 1,
            bit_depth: 16,
        }
    }
}

impl From<&StreamConfig> for PcmFormat {
    fn from(config: &StreamConfig) -> Self {
        Self {
            sample_rate: config.sample_rate,
            channels: config.channels,
            bit_depth: config.bit_depth,
        }
    }
}

impl PcmFormat {
    pub fn bytes_per_second(&self) -> u64 {
        self.sample_rate as u64 * self.channels as u64 * (self.bit_depth as u64 / 8)
    }

    /// Playback duration of `byte_len` bytes of PCM in this format.
    ///
    /// ## Example:
    /// 32,000 bytes of 16kHz mono 16-bit audio = 1 second.
    pub fn estimate_duration(&self, byte_len: usize) -> Duration {
        let bps = self.bytes_per_second();
        if bps == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(byte_len as u64 * 1_000_000 / bps)
    }
}

/// Decode little-endian 16-bit PCM bytes into samples.
pub fn pcm_to_samples(data: &[u8]) -> AppResult<Vec<i16>> {
    if data.len() % 2 != 0 {
        return Err(AppError::Audio(
            "Audio data length must be even for 16-bit samples".to_string(),
        ));
    }

    let mut cursor = Cursor::new(data);
    let mut samples = Vec::with_capacity(data.len() / 2);
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(sample);
    }
    Ok(samples)
}

/// Encode samples back into little-endian 16-bit PCM bytes.
pub fn samples_to_pcm(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        // Writing into a Vec cannot fail.
        let _ = out.write_i16::<LittleEndian>(sample);
    }
    out
}

/// Wrap raw PCM in a minimal WAV container.
pub fn pcm_to_wav(pcm: &[u8], format: PcmFormat) -> AppResult<Vec<u8>> {
    if format.bit_depth != 16 {
        return Err(AppError::Audio(format!(
            "Unsupported bit depth: {}",
            format.bit_depth
        )));
    }

    let samples = pcm_to_samples(pcm)?;
    let header = wav::Header::new(
        wav::WAV_FORMAT_PCM,
        format.channels,
        format.sample_rate,
        format.bit_depth,
    );

    let mut cursor = Cursor::new(Vec::with_capacity(pcm.len() + 44));
    wav::write(header, &wav::BitDepth::Sixteen(samples), &mut cursor)?;
    Ok(cursor.into_inner())
}

/// Strip the WAV container and return the format plus raw PCM bytes.
pub fn wav_to_pcm(bytes: &[u8]) -> AppResult<(PcmFormat, Vec<u8>)> {
    let mut cursor = Cursor::new(bytes);
    let (header, data) = wav::read(&mut cursor)
        .map_err(|e| AppError::Audio(format!("Invalid WAV data: {}", e)))?;

    let samples = match data {
        wav::BitDepth::Sixteen(samples) => samples,
        wav::BitDepth::Empty => Vec::new(),
        _ => {
            return Err(AppError::Audio(format!(
                "Unsupported WAV bit depth: {}",
                header.bits_per_sample
            )))
        }
    };

    let format = PcmFormat {
        sample_rate: header.sampling_rate,
        channels: header.channel_count,
        bit_depth: header.bits_per_sample,
    };
    Ok((format, samples_to_pcm(&samples)))
}

/// Concatenate WAV segments into one WAV.
///
/// Every segment must share the same format; an empty slice yields `None`.
pub fn concat_segments(segments: &[Vec<u8>]) -> AppResult<Option<Vec<u8>>> {
    let mut joined = Vec::new();
    let mut format: Option<PcmFormat> = None;

    for (index, segment) in segments.iter().enumerate() {
        let (segment_format, pcm) = wav_to_pcm(segment)?;
        match format {
            None => format = Some(segment_format),
            Some(expected) if expected != segment_format => {
                return Err(AppError::Audio(format!(
                    "Segment {} format {:?} does not match {:?}",
                    index, segment_format, expected
                )));
            }
            Some(_) => {}
        }
        joined.extend_from_slice(&pcm);
    }

    match format {
        Some(format) => Ok(Some(pcm_to_wav(&joined, format)?)),
        None => Ok(None),
    }
}

/// A finalized recording on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingFile {
    pub path: PathBuf,
    pub duration: Duration,
    pub bytes: usize,
}

/// Wrap each PCM segment, concatenate, and write the result to `path`.
///
/// Returns `None` without touching the filesystem when there are no segments.
pub async fn write_recording(
    path: &Path,
    pcm_segments: &[Vec<u8>],
    format: PcmFormat,
) -> AppResult<Option<RecordingFile>> {
    let wrapped = pcm_segments
        .iter()
        .filter(|segment| !segment.is_empty())
        .map(|segment| pcm_to_wav(segment, format))
        .collect::<AppResult<Vec<_>>>()?;

    let Some(wav_bytes) = concat_segments(&wrapped)? else {
        return Ok(None);
    };

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, &wav_bytes).await?;

    let pcm_len: usize = pcm_segments.iter().map(|s| s.len()).sum();
    Ok(Some(RecordingFile {
        path: path.to_path_buf(),
        duration: format.estimate_duration(pcm_len),
        bytes: wav_bytes.len(),
    }))
}
