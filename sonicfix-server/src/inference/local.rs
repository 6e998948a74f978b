//! Local synthesis engine
//!
//! CPU-only stand-in for the external enhancement and music-generation
//! models, matching their interface contract: it consumes the same
//! requests, reports progress, and produces real WAV bytes. Generation
//! renders a harmonic tone with a decay envelope; enhancement decodes
//! 16-bit WAV input and applies per-type gain shaping. Non-WAV audio
//! passes through unchanged (the store is a byte-stream, not a codec).

use std::io::Cursor;

use async_trait::async_trait;
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};

use sonicfix_common::api::{EnhancementType, JobKind};

use crate::models::JobParameters;

use super::{EngineError, EngineOutput, InferenceEngine, InferenceRequest, ProgressSink};

const SAMPLE_RATE: u32 = 44_100;
const FUNDAMENTAL_HZ: f64 = 440.0;

/// Local CPU engine
#[derive(Debug, Default, Clone)]
pub struct LocalEngine;

impl LocalEngine {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl InferenceEngine for LocalEngine {
    async fn invoke(
        &self,
        request: &InferenceRequest,
        progress: ProgressSink,
    ) -> Result<EngineOutput, EngineError> {
        match (&request.kind, &request.parameters) {
            (JobKind::Generate, JobParameters::Generate { duration, .. }) => {
                let duration = *duration;
                if duration <= 0.0 {
                    return Err(EngineError::InvalidInput(
                        "duration must be positive".to_string(),
                    ));
                }

                let bytes = tokio::task::spawn_blocking(move || render_tone(duration, &progress))
                    .await
                    .map_err(|e| EngineError::Model {
                        message: format!("render task failed: {}", e),
                        transient: false,
                    })??;

                Ok(EngineOutput {
                    bytes,
                    content_type: "audio/wav".to_string(),
                })
            }
            (JobKind::Enhance, JobParameters::Enhance { enhancement_type }) => {
                let input = request
                    .input
                    .clone()
                    .ok_or_else(|| {
                        EngineError::InvalidInput(
                            "enhancement requires an input artifact".to_string(),
                        )
                    })?;
                if input.is_empty() {
                    return Err(EngineError::InvalidInput("input audio is empty".to_string()));
                }

                let enhancement = *enhancement_type;
                let bytes =
                    tokio::task::spawn_blocking(move || enhance(&input, enhancement, &progress))
                        .await
                        .map_err(|e| EngineError::Model {
                            message: format!("enhance task failed: {}", e),
                            transient: false,
                        })??;

                Ok(EngineOutput {
                    bytes,
                    content_type: "audio/wav".to_string(),
                })
            }
            _ => Err(EngineError::InvalidInput(
                "job kind does not match its parameters".to_string(),
            )),
        }
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

fn wav_spec() -> WavSpec {
    WavSpec {
        channels: 2,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    }
}

/// Render a stereo tone of the requested duration
///
/// Fundamental plus octave and fifth harmonics under an exponential decay
/// envelope. Progress is reported once per rendered second of audio.
fn render_tone(duration: f64, progress: &ProgressSink) -> Result<Vec<u8>, EngineError> {
    let total_frames = (duration * SAMPLE_RATE as f64) as usize;
    let mut cursor = Cursor::new(Vec::new());

    {
        let mut writer = WavWriter::new(&mut cursor, wav_spec()).map_err(|e| {
            EngineError::Model {
                message: format!("failed to open WAV writer: {}", e),
                transient: false,
            }
        })?;

        for frame in 0..total_frames {
            let t = frame as f64 / SAMPLE_RATE as f64;
            let mut sample = 0.3 * (2.0 * std::f64::consts::PI * FUNDAMENTAL_HZ * t).sin();
            sample += 0.2 * (2.0 * std::f64::consts::PI * FUNDAMENTAL_HZ * 2.0 * t).sin();
            sample += 0.1 * (2.0 * std::f64::consts::PI * FUNDAMENTAL_HZ * 1.5 * t).sin();
            sample *= (-0.5 * t).exp();

            let value = (sample * i16::MAX as f64) as i16;
            for _ in 0..2 {
                writer.write_sample(value).map_err(|e| EngineError::Model {
                    message: format!("failed to write sample: {}", e),
                    transient: false,
                })?;
            }

            if frame % SAMPLE_RATE as usize == 0 && total_frames > 0 {
                let _ = progress.try_send(frame as f64 / total_frames as f64);
            }
        }

        writer.finalize().map_err(|e| EngineError::Model {
            message: format!("failed to finalize WAV: {}", e),
            transient: false,
        })?;
    }

    Ok(cursor.into_inner())
}

/// Apply per-type gain shaping to 16-bit WAV input
///
/// Audio the local engine cannot decode (compressed formats, other bit
/// depths) passes through unchanged.
fn enhance(
    input: &[u8],
    enhancement: EnhancementType,
    progress: &ProgressSink,
) -> Result<Vec<u8>, EngineError> {
    let reader = match WavReader::new(Cursor::new(input)) {
        Ok(reader) => reader,
        Err(_) => {
            // Not WAV; pass the byte stream through untouched
            let _ = progress.try_send(0.5);
            let _ = progress.try_send(1.0);
            return Ok(input.to_vec());
        }
    };

    let spec = reader.spec();
    if spec.bits_per_sample != 16 || spec.sample_format != SampleFormat::Int {
        let _ = progress.try_send(1.0);
        return Ok(input.to_vec());
    }

    let raw: Vec<i16> = reader
        .into_samples::<i16>()
        .collect::<Result<_, _>>()
        .map_err(|e| EngineError::InvalidInput(format!("corrupt WAV data: {}", e)))?;

    let mut samples: Vec<f32> = raw.iter().map(|&s| s as f32 / i16::MAX as f32).collect();
    let _ = progress.try_send(0.3);

    shape(&mut samples, enhancement);
    let _ = progress.try_send(0.7);

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = WavWriter::new(&mut cursor, spec).map_err(|e| EngineError::Model {
            message: format!("failed to open WAV writer: {}", e),
            transient: false,
        })?;
        for sample in &samples {
            let value = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
            writer.write_sample(value).map_err(|e| EngineError::Model {
                message: format!("failed to write sample: {}", e),
                transient: false,
            })?;
        }
        writer.finalize().map_err(|e| EngineError::Model {
            message: format!("failed to finalize WAV: {}", e),
            transient: false,
        })?;
    }

    let _ = progress.try_send(1.0);
    Ok(cursor.into_inner())
}

/// Peak-normalize to the given ceiling; silence stays silent
fn normalize(samples: &mut [f32], ceiling: f32) {
    let peak = samples.iter().fold(0.0f32, |acc, s| acc.max(s.abs()));
    if peak > 0.0 {
        let gain = ceiling / peak;
        for s in samples.iter_mut() {
            *s *= gain;
        }
    }
}

/// One-pole low-pass of the signal
fn low_pass(samples: &[f32], alpha: f32) -> Vec<f32> {
    let mut out = Vec::with_capacity(samples.len());
    let mut state = 0.0f32;
    for &s in samples {
        state += alpha * (s - state);
        out.push(state);
    }
    out
}

fn shape(samples: &mut [f32], enhancement: EnhancementType) {
    match enhancement {
        EnhancementType::FixQuality => {
            normalize(samples, 0.9);
        }
        EnhancementType::RemoveNoise => {
            // Gate: attenuate everything below the noise floor
            for s in samples.iter_mut() {
                if s.abs() < 0.02 {
                    *s = 0.0;
                }
            }
        }
        EnhancementType::StudioMaster => {
            normalize(samples, 0.95);
            // Soft knee to tame residual clipping
            for s in samples.iter_mut() {
                *s = *s - (*s * *s * *s) / 3.0;
            }
        }
        EnhancementType::VocalEnhance => {
            let lp = low_pass(samples, 0.2);
            for (s, l) in samples.iter_mut().zip(lp) {
                *s += 0.35 * (*s - l);
            }
        }
        EnhancementType::BassBoost => {
            let lp = low_pass(samples, 0.1);
            for (s, l) in samples.iter_mut().zip(lp) {
                *s += 0.5 * l;
            }
        }
        EnhancementType::ClarityBoost => {
            let lp = low_pass(samples, 0.25);
            for (s, l) in samples.iter_mut().zip(lp) {
                *s += 0.4 * (*s - l);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn generate_request(duration: f64) -> InferenceRequest {
        InferenceRequest {
            kind: JobKind::Generate,
            input: None,
            parameters: JobParameters::Generate {
                prompt: "gentle arpeggio".to_string(),
                duration,
                style_prompt: None,
                genre_tags: Vec::new(),
            },
        }
    }

    fn enhance_request(input: Vec<u8>, enhancement_type: EnhancementType) -> InferenceRequest {
        InferenceRequest {
            kind: JobKind::Enhance,
            input: Some(input),
            parameters: JobParameters::Enhance { enhancement_type },
        }
    }

    fn quiet_wav(frames: usize) -> Vec<u8> {
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = WavWriter::new(&mut cursor, wav_spec()).unwrap();
            for i in 0..frames {
                let t = i as f32 / SAMPLE_RATE as f32;
                let sample = (0.2 * (2.0 * std::f32::consts::PI * 220.0 * t).sin()
                    * i16::MAX as f32) as i16;
                writer.write_sample(sample).unwrap();
                writer.write_sample(sample).unwrap();
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    #[tokio::test]
    async fn generate_produces_wav_of_requested_duration() {
        let engine = LocalEngine::new();
        let (tx, mut rx) = mpsc::channel(64);

        let output = engine.invoke(&generate_request(2.0), tx).await.unwrap();
        assert_eq!(output.content_type, "audio/wav");

        let reader = WavReader::new(Cursor::new(&output.bytes[..])).unwrap();
        let frames = reader.duration();
        assert_eq!(frames, 2 * SAMPLE_RATE);

        // Progress was reported and never decreased
        let mut last = -1.0f64;
        while let Ok(p) = rx.try_recv() {
            assert!(p >= last);
            last = p;
        }
        assert!(last >= 0.0);
    }

    #[tokio::test]
    async fn generate_rejects_non_positive_duration() {
        let engine = LocalEngine::new();
        let (tx, _rx) = mpsc::channel(8);
        let err = engine.invoke(&generate_request(0.0), tx).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn enhance_normalizes_quiet_audio() {
        let engine = LocalEngine::new();
        let (tx, _rx) = mpsc::channel(64);

        let input = quiet_wav(SAMPLE_RATE as usize / 4);
        let output = engine
            .invoke(
                &enhance_request(input, EnhancementType::FixQuality),
                tx,
            )
            .await
            .unwrap();

        let reader = WavReader::new(Cursor::new(&output.bytes[..])).unwrap();
        let peak = reader
            .into_samples::<i16>()
            .map(|s| (s.unwrap() as f32 / i16::MAX as f32).abs())
            .fold(0.0f32, f32::max);
        assert!(peak > 0.85, "peak after normalization was {}", peak);
    }

    #[tokio::test]
    async fn enhance_passes_non_wav_bytes_through() {
        let engine = LocalEngine::new();
        let (tx, _rx) = mpsc::channel(8);

        let input = b"ID3\x03not really audio".to_vec();
        let output = engine
            .invoke(
                &enhance_request(input.clone(), EnhancementType::RemoveNoise),
                tx,
            )
            .await
            .unwrap();
        assert_eq!(output.bytes, input);
    }

    #[tokio::test]
    async fn enhance_rejects_empty_input() {
        let engine = LocalEngine::new();
        let (tx, _rx) = mpsc::channel(8);
        let err = engine
            .invoke(&enhance_request(Vec::new(), EnhancementType::BassBoost), tx)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }
}
