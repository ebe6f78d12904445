//! Audio duration probing
//!
//! Reads container headers only; no samples are decoded.

use std::path::Path;

use hound::WavReader;
use symphonia::core::codecs::CODEC_TYPE_NULL;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::debug;

use crate::error::{EngineError, Result};

/// Resolves the playback length of an audio file
pub trait AudioDurationProbe: Send + Sync {
    fn duration_secs(&self, path: &Path) -> Result<f64>;
}

/// Header-based probe: WAV via hound, MP3/FLAC/OGG via Symphonia
#[derive(Debug, Default, Clone, Copy)]
pub struct FileDurationProbe;

impl AudioDurationProbe for FileDurationProbe {
    fn duration_secs(&self, path: &Path) -> Result<f64> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .ok_or_else(|| EngineError::audio_load("Could not determine file extension"))?;

        match extension.to_lowercase().as_str() {
            "wav" => wav_duration(path),
            "mp3" | "flac" | "ogg" => symphonia_duration(path),
            other => Err(EngineError::audio_load(format!(
                "Unsupported audio format: {}",
                other
            ))),
        }
    }
}

fn wav_duration(path: &Path) -> Result<f64> {
    let reader = WavReader::open(path)
        .map_err(|e| EngineError::audio_load(format!("Failed to open WAV: {}", e)))?;

    let spec = reader.spec();
    if spec.sample_rate == 0 {
        return Err(EngineError::audio_load("WAV header reports 0 Hz"));
    }

    // hound reports frames (samples per channel)
    let frames = reader.duration();
    debug!(
        "WAV {}: {} frames at {} Hz",
        path.display(),
        frames,
        spec.sample_rate
    );
    Ok(frames as f64 / spec.sample_rate as f64)
}

fn symphonia_duration(path: &Path) -> Result<f64> {
    let file = std::fs::File::open(path)?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| EngineError::audio_load(format!("Failed to probe format: {}", e)))?;

    let mut format = probed.format;
    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| EngineError::audio_load("No audio tracks found"))?;

    let track_id = track.id;
    let params = track.codec_params.clone();

    if let (Some(frames), Some(rate)) = (params.n_frames, params.sample_rate) {
        if rate > 0 {
            return Ok(frames as f64 / rate as f64);
        }
    }

    // Header has no frame count (common for VBR MP3): sum packet durations
    let time_base = params
        .time_base
        .ok_or_else(|| EngineError::audio_load("Could not determine time base"))?;

    let mut total_ts: u64 = 0;
    loop {
        match format.next_packet() {
            Ok(packet) if packet.track_id() == track_id => total_ts += packet.dur(),
            Ok(_) => continue,
            Err(symphonia::core::errors::Error::IoError(e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(e) => {
                return Err(EngineError::audio_load(format!(
                    "Failed to read packet: {}",
                    e
                )))
            }
        }
    }

    let time = time_base.calc_time(total_ts);
    Ok(time.seconds as f64 + time.frac)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use tempfile::tempdir;

    fn write_wav(path: &Path, sample_rate: u32, channels: u16, frames: u32) {
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for _ in 0..frames * channels as u32 {
            writer.write_sample(0i16).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn test_wav_duration_mono() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("one_and_half.wav");
        write_wav(&path, 16000, 1, 24000);

        let secs = FileDurationProbe.duration_secs(&path).unwrap();
        assert_relative_eq!(secs, 1.5, epsilon = 1e-9);
    }

    #[test]
    fn test_wav_duration_stereo_counts_frames() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stereo.WAV");
        write_wav(&path, 8000, 2, 8000);

        let secs = FileDurationProbe.duration_secs(&path).unwrap();
        assert_relative_eq!(secs, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_unsupported_and_missing() {
        let dir = tempdir().unwrap();
        let webm = dir.path().join("clip.webm");
        std::fs::write(&webm, b"not audio").unwrap();
        assert!(FileDurationProbe.duration_secs(&webm).is_err());

        assert!(FileDurationProbe
            .duration_secs(&dir.path().join("missing.wav"))
            .is_err());
        assert!(FileDurationProbe
            .duration_secs(&dir.path().join("noext"))
            .is_err());
    }
}
