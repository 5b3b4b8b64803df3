//! # Audio Normalization
//!
//! Brings staged input audio into the shape speech recognizers prefer:
//! 16 kHz, mono, 32-bit float samples in `[-1.0, 1.0]`.
//!
//! ## Supported inputs:
//! - **WAV**: any channel count and sample rate; 8/16/24-bit PCM or 32-bit float
//! - **Raw PCM**: headerless 16-bit little-endian mono at a configured rate
//!
//! Browser containers (WebM/Opus) are not decoded here; callers that can pass
//! them through unchanged (remote STT) do so.

use crate::config::InputFormat;
use anyhow::{anyhow, bail, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use rubato::{FftFixedIn, Resampler};
use std::io::Cursor;
use wav::BitDepth;

/// Sample rate expected by Whisper-family recognizers.
pub const TARGET_SAMPLE_RATE: u32 = 16000;

/// Decode `bytes` of the given container into 16 kHz mono samples.
pub fn decode_to_mono_16k(bytes: &[u8], format: InputFormat, pcm_sample_rate: u32) -> Result<Vec<f32>> {
    let (samples, rate) = match format {
        InputFormat::Wav => decode_wav(bytes)?,
        InputFormat::PcmS16le => (decode_pcm_s16le(bytes)?, pcm_sample_rate),
        InputFormat::Webm => bail!("webm audio cannot be decoded locally"),
    };
    if samples.is_empty() {
        bail!("audio contains no samples");
    }
    resample_to_16khz(&samples, rate)
}

/// Re-encode the input as a 16 kHz mono 16-bit WAV file.
pub fn normalize_to_wav(bytes: &[u8], format: InputFormat, pcm_sample_rate: u32) -> Result<Vec<u8>> {
    let samples = decode_to_mono_16k(bytes, format, pcm_sample_rate)?;
    encode_wav(&samples, TARGET_SAMPLE_RATE)
}

/// Parse a WAV file, returning mono samples and their sample rate.
fn decode_wav(bytes: &[u8]) -> Result<(Vec<f32>, u32)> {
    let (header, data) = wav::read(&mut Cursor::new(bytes))?;

    let interleaved: Vec<f32> = match data {
        BitDepth::Eight(samples) => samples.iter().map(|&s| (s as f32 - 128.0) / 128.0).collect(),
        BitDepth::Sixteen(samples) => samples.iter().map(|&s| s as f32 / 32768.0).collect(),
        BitDepth::TwentyFour(samples) => samples.iter().map(|&s| s as f32 / 8_388_608.0).collect(),
        BitDepth::ThirtyTwoFloat(samples) => samples,
        BitDepth::Empty => bail!("wav file has no sample data"),
    };

    let channels = header.channel_count as usize;
    if channels == 0 {
        bail!("wav header declares zero channels");
    }

    Ok((mix_to_mono(&interleaved, channels), header.sampling_rate))
}

fn decode_pcm_s16le(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 2 != 0 {
        bail!("PCM payload length must be even for 16-bit samples");
    }

    let mut cursor = Cursor::new(bytes);
    let mut samples = Vec::with_capacity(bytes.len() / 2);
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(sample as f32 / 32768.0);
    }
    Ok(samples)
}

/// Average interleaved frames down to a single channel.
pub fn mix_to_mono(samples: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Resample mono audio to 16 kHz.
pub fn resample_to_16khz(samples: &[f32], input_sample_rate: u32) -> Result<Vec<f32>> {
    if input_sample_rate == TARGET_SAMPLE_RATE {
        return Ok(samples.to_vec());
    }
    if input_sample_rate == 0 {
        bail!("input sample rate is 0");
    }

    tracing::debug!(from = input_sample_rate, to = TARGET_SAMPLE_RATE, "Resampling audio");

    let mut resampler = FftFixedIn::<f32>::new(
        input_sample_rate as usize,
        TARGET_SAMPLE_RATE as usize,
        1024,
        1,
        1,
    )
    .map_err(|e| anyhow!("failed to build resampler: {}", e))?;

    let input_frames = resampler.input_frames_next();
    let mut output = Vec::with_capacity(
        samples.len() * TARGET_SAMPLE_RATE as usize / input_sample_rate as usize + input_frames,
    );

    for chunk in samples.chunks(input_frames) {
        let input = if chunk.len() < input_frames {
            let mut padded = chunk.to_vec();
            padded.resize(input_frames, 0.0);
            vec![padded]
        } else {
            vec![chunk.to_vec()]
        };

        let resampled = resampler
            .process(&input, None)
            .map_err(|e| anyhow!("resampling failed: {}", e))?;
        if let Some(channel) = resampled.first() {
            output.extend_from_slice(channel);
        }
    }

    Ok(output)
}

/// Encode mono float samples as a 16-bit PCM WAV file.
pub fn encode_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let header = wav::Header::new(wav::header::WAV_FORMAT_PCM, 1, sample_rate, 16);
    let pcm: Vec<i16> = samples
        .iter()
        .map(|&s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
        .collect();

    let mut out = Cursor::new(Vec::new());
    wav::write(header, &BitDepth::Sixteen(pcm), &mut out)?;
    Ok(out.into_inner())
}
