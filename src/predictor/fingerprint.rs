//! Audio fingerprints: the summary that drives parameter prediction.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cache::{CacheKey, CacheManager, CacheTier};
use crate::error::{PipelineError, PipelineResult};
use crate::fsio;

const WINDOW_MS: u32 = 50;
const QUIET_FRACTION: f64 = 0.10;
const PROBE_VERSION: &str = "wav-probe-1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioFingerprint {
    pub duration_secs: f64,
    pub sample_rate: u32,
    /// RMS of the quietest windows, 0.0 (silent floor) to 1.0 (full scale).
    pub noise_level: f64,
    pub speaker_count: Option<u32>,
    pub language: Option<String>,
}

pub trait FingerprintProbe: Send + Sync {
    fn probe(&self, media: &Path) -> PipelineResult<AudioFingerprint>;
}

/// Optional hints written next to the media file as `<name>.probe.json`.
#[derive(Debug, Default, Deserialize)]
struct ProbeSidecar {
    speakers: Option<u32>,
    language: Option<String>,
}

pub fn sidecar_path(media: &Path) -> PathBuf {
    let name = media
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    media.with_file_name(format!("{name}.probe.json"))
}

#[derive(Debug, Default, Clone, Copy)]
pub struct WavProbe;

impl FingerprintProbe for WavProbe {
    fn probe(&self, media: &Path) -> PipelineResult<AudioFingerprint> {
        let mut reader = hound::WavReader::open(media).map_err(|e| {
            PipelineError::PredictorFailure(format!("cannot read {}: {e}", media.display()))
        })?;
        let spec = reader.spec();
        if spec.sample_rate == 0 || spec.channels == 0 {
            return Err(PipelineError::PredictorFailure(format!(
                "{}: invalid WAV header",
                media.display()
            )));
        }

        let samples: Vec<f64> = match spec.sample_format {
            hound::SampleFormat::Float => reader
                .samples::<f32>()
                .map(|s| s.map(f64::from))
                .collect::<Result<_, _>>(),
            hound::SampleFormat::Int => {
                let full_scale = f64::from(1u32 << (spec.bits_per_sample.clamp(1, 32) - 1));
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| f64::from(v) / full_scale))
                    .collect::<Result<_, _>>()
            }
        }
        .map_err(|e| PipelineError::PredictorFailure(format!("{}: {e}", media.display())))?;

        let frames = reader.duration();
        let window = (spec.sample_rate * WINDOW_MS / 1000).max(1) as usize * spec.channels as usize;
        let sidecar = read_sidecar(media)?;

        Ok(AudioFingerprint {
            duration_secs: f64::from(frames) / f64::from(spec.sample_rate),
            sample_rate: spec.sample_rate,
            noise_level: noise_floor(&samples, window),
            speaker_count: sidecar.speakers,
            language: sidecar.language,
        })
    }
}

fn read_sidecar(media: &Path) -> PipelineResult<ProbeSidecar> {
    let path = sidecar_path(media);
    if !path.is_file() {
        return Ok(ProbeSidecar::default());
    }
    serde_json::from_slice(&fs::read(&path)?)
        .map_err(|e| PipelineError::PredictorFailure(format!("{}: {e}", path.display())))
}

/// Mean RMS of the quietest tenth of fixed-size windows.
fn noise_floor(samples: &[f64], window: usize) -> f64 {
    let mut levels: Vec<f64> = samples
        .chunks(window.max(1))
        .map(|chunk| (chunk.iter().map(|s| s * s).sum::<f64>() / chunk.len() as f64).sqrt())
        .collect();
    if levels.is_empty() {
        return 0.0;
    }
    levels.sort_by(|a, b| a.total_cmp(b));
    let take = ((levels.len() as f64 * QUIET_FRACTION).ceil() as usize).max(1);
    let mean = levels[..take].iter().sum::<f64>() / take as f64;
    mean.clamp(0.0, 1.0)
}

/// Probes `media` once per distinct content; later calls hit the
/// fingerprint tier keyed by the file's SHA-256.
pub async fn cached_fingerprint(
    cache: &CacheManager,
    probe: &dyn FingerprintProbe,
    media: &Path,
    ttl: Duration,
) -> PipelineResult<AudioFingerprint> {
    let content = fsio::sha256_file(media)
        .map_err(|e| PipelineError::input_not_found(media, e))?;
    // Sidecar hints are part of the identity.
    let mut hints = std::collections::BTreeMap::new();
    let sidecar = sidecar_path(media);
    if sidecar.is_file() {
        hints.insert("sidecar".to_string(), fsio::sha256_file(&sidecar)?);
    }
    let key = CacheKey::derive(content, PROBE_VERSION, &hints)?;
    cache
        .get_or_fetch_json(CacheTier::Fingerprint, &key, ttl, || async {
            debug!(media = %media.display(), "probing audio");
            probe.probe(media)
        })
        .await
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// 16 kHz mono: `quiet_secs` of ±`floor` followed by `loud_secs` of a
    /// 440 Hz tone at half scale.
    pub(crate) fn write_wav(path: &Path, quiet_secs: u32, loud_secs: u32, floor: i16) {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 16_000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for i in 0..16_000 * quiet_secs {
            writer
                .write_sample(if i % 2 == 0 { floor } else { -floor })
                .unwrap();
        }
        for i in 0..16_000 * loud_secs {
            let t = f64::from(i) / 16_000.0;
            let v = (t * 440.0 * std::f64::consts::TAU).sin() * 16_384.0;
            writer.write_sample(v as i16).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn wav_probe_measures_duration_and_noise_floor() {
        let dir = tempfile::tempdir().unwrap();
        let media = dir.path().join("audio.wav");
        write_wav(&media, 1, 1, 328);

        let fp = WavProbe.probe(&media).unwrap();
        assert!((fp.duration_secs - 2.0).abs() < 1e-9);
        assert_eq!(fp.sample_rate, 16_000);
        assert!((fp.noise_level - 0.01).abs() < 0.001, "{}", fp.noise_level);
        assert_eq!(fp.speaker_count, None);
        assert_eq!(fp.language, None);
    }

    #[test]
    fn sidecar_supplies_speakers_and_language() {
        let dir = tempfile::tempdir().unwrap();
        let media = dir.path().join("talk.wav");
        write_wav(&media, 1, 0, 10);
        fs::write(
            sidecar_path(&media),
            r#"{"speakers": 3, "language": "pt"}"#,
        )
        .unwrap();

        let fp = WavProbe.probe(&media).unwrap();
        assert_eq!(fp.speaker_count, Some(3));
        assert_eq!(fp.language.as_deref(), Some("pt"));
    }

    #[test]
    fn non_wav_input_is_a_predictor_failure() {
        let dir = tempfile::tempdir().unwrap();
        let media = dir.path().join("notes.txt");
        fs::write(&media, "not audio").unwrap();
        assert!(matches!(
            WavProbe.probe(&media),
            Err(PipelineError::PredictorFailure(_))
        ));
    }

    #[test]
    fn noise_floor_of_silence_is_zero() {
        assert_eq!(noise_floor(&[0.0; 1600], 800), 0.0);
        assert_eq!(noise_floor(&[], 800), 0.0);
    }

    struct CountingProbe(AtomicUsize);

    impl FingerprintProbe for CountingProbe {
        fn probe(&self, media: &Path) -> PipelineResult<AudioFingerprint> {
            self.0.fetch_add(1, Ordering::SeqCst);
            WavProbe.probe(media)
        }
    }

    #[tokio::test]
    async fn fingerprint_is_cached_by_content() {
        let dir = tempfile::tempdir().unwrap();
        let media = dir.path().join("a.wav");
        let copy = dir.path().join("b.wav");
        write_wav(&media, 1, 1, 100);
        fs::copy(&media, &copy).unwrap();

        let cache = CacheManager::new(dir.path().join("cache"), 8, None);
        let probe = CountingProbe(AtomicUsize::new(0));
        let ttl = Duration::from_secs(60);
        let first = cached_fingerprint(&cache, &probe, &media, ttl).await.unwrap();
        let second = cached_fingerprint(&cache, &probe, &copy, ttl).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(probe.0.load(Ordering::SeqCst), 1);
    }
}
