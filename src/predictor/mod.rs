//! Confidence-scored parameter prediction for adaptive stages.
//!
//! [`AdaptivePredictor`] starts from [`rules::RuleBook`] and, once the
//! history tier holds enough outcomes for a stage and fingerprint bucket,
//! may swap in the best-performing parameter set seen there. The orchestrator decides
//! whether to apply a prediction; nothing here knows the threshold.

pub mod fingerprint;
pub mod rules;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cache::{CacheKey, CacheManager, CacheTier};
use crate::error::{PipelineError, PipelineResult};
use crate::state_machine::StageKind;

pub use fingerprint::{AudioFingerprint, FingerprintProbe, WavProbe, cached_fingerprint};
pub use rules::RuleBook;

const HISTORY_MODEL: &str = "predictor-history-2";
/// Oldest records are dropped past this many per bucket.
const HISTORY_LIMIT: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageParams {
    pub model_size: String,
    pub batch_size: u32,
    pub beam_size: u32,
}

impl StageParams {
    pub const NAMES: [&'static str; 3] = ["model_size", "batch_size", "beam_size"];

    pub fn as_pairs(&self) -> Vec<(&'static str, String)> {
        vec![
            ("model_size", self.model_size.clone()),
            ("batch_size", self.batch_size.to_string()),
            ("beam_size", self.beam_size.to_string()),
        ]
    }

    pub fn to_map(&self) -> BTreeMap<String, String> {
        self.as_pairs()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect()
    }
}

/// A suggestion for one dispatch. Recorded in the manifest, never
/// authoritative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionConfig {
    pub params: StageParams,
    pub confidence: f64,
    pub reasoning: String,
}

impl PredictionConfig {
    /// Stand-in for a prediction that could not be made at all.
    pub fn failed(defaults: &StageParams, err: &PipelineError) -> Self {
        let reason = match err {
            PipelineError::PredictorFailure(reason) => reason.clone(),
            other => other.to_string(),
        };
        Self {
            params: defaults.clone(),
            confidence: 0.0,
            reasoning: format!("predictor failure: {reason}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Outcome {
    pub success: bool,
    pub elapsed_ms: u64,
}

pub trait ParameterPredictor: Send + Sync {
    fn predict(&self, stage: StageKind, fingerprint: &AudioFingerprint) -> PipelineResult<PredictionConfig>;

    /// Feeds one observed outcome of `stage` back into the predictor.
    fn learn(
        &self,
        stage: StageKind,
        fingerprint: &AudioFingerprint,
        params: &StageParams,
        outcome: Outcome,
    ) -> PipelineResult<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryRecord {
    params: StageParams,
    success: bool,
    elapsed_ms: u64,
    recorded_at: DateTime<Utc>,
}

pub struct AdaptivePredictor {
    cache: Arc<CacheManager>,
    min_samples: u32,
    history_ttl: Duration,
}

impl AdaptivePredictor {
    pub fn new(cache: Arc<CacheManager>, min_samples: u32, history_ttl: Duration) -> Self {
        Self {
            cache,
            min_samples: min_samples.max(1),
            history_ttl,
        }
    }

    // Stages never share history: a parameter set that works for voice
    // detection says nothing about transcription.
    fn history_key(stage: StageKind, fp: &AudioFingerprint) -> PipelineResult<CacheKey> {
        CacheKey::derive(format!("{}/{}", stage.name(), bucket(fp)), HISTORY_MODEL, &BTreeMap::new())
    }

    // Other jobs append to the same entry, so always read the disk tier.
    fn load_history(&self, key: &CacheKey) -> PipelineResult<Vec<HistoryRecord>> {
        match self.cache.get_persistent(CacheTier::History, key, self.history_ttl)? {
            Some(payload) => Ok(serde_json::from_slice(&payload)?),
            None => Ok(Vec::new()),
        }
    }

    fn learned(&self, history: &[HistoryRecord]) -> Option<PredictionConfig> {
        let mut tallies: BTreeMap<(String, u32, u32), (u32, u32)> = BTreeMap::new();
        for record in history {
            let p = &record.params;
            let tally = tallies
                .entry((p.model_size.clone(), p.batch_size, p.beam_size))
                .or_default();
            tally.0 += 1;
            if record.success {
                tally.1 += 1;
            }
        }

        tallies
            .into_iter()
            .filter(|(_, (n, _))| *n >= self.min_samples)
            .map(|((model_size, batch_size, beam_size), (n, ok))| {
                let n = f64::from(n);
                let rate = f64::from(ok) / n;
                PredictionConfig {
                    params: StageParams {
                        model_size,
                        batch_size,
                        beam_size,
                    },
                    confidence: rate * n / (n + 1.0),
                    reasoning: format!("history: {ok}/{n} successful runs in bucket"),
                }
            })
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
    }
}

impl ParameterPredictor for AdaptivePredictor {
    fn predict(&self, stage: StageKind, fp: &AudioFingerprint) -> PipelineResult<PredictionConfig> {
        let rule = RuleBook::predict(fp);
        let history = self.load_history(&Self::history_key(stage, fp)?)?;
        match self.learned(&history) {
            Some(learned) if learned.confidence > rule.confidence => {
                debug!(
                    learned = learned.confidence,
                    rule = rule.confidence,
                    "learned prediction wins"
                );
                Ok(learned)
            }
            _ => Ok(rule),
        }
    }

    fn learn(
        &self,
        stage: StageKind,
        fp: &AudioFingerprint,
        params: &StageParams,
        outcome: Outcome,
    ) -> PipelineResult<()> {
        let key = Self::history_key(stage, fp)?;
        let record = HistoryRecord {
            params: params.clone(),
            success: outcome.success,
            elapsed_ms: outcome.elapsed_ms,
            recorded_at: Utc::now(),
        };
        self.cache
            .update(CacheTier::History, &key, self.history_ttl, move |current| {
                let mut history: Vec<HistoryRecord> = match current {
                    Some(payload) => serde_json::from_slice(&payload)?,
                    None => Vec::new(),
                };
                history.push(record);
                if history.len() > HISTORY_LIMIT {
                    let excess = history.len() - HISTORY_LIMIT;
                    history.drain(..excess);
                }
                Ok(serde_json::to_vec(&history)?)
            })
    }
}

/// Coarse grouping so similar media share history.
fn bucket(fp: &AudioFingerprint) -> String {
    let duration = match fp.duration_secs {
        d if d <= 60.0 => "d0",
        d if d <= 600.0 => "d1",
        d if d <= 3600.0 => "d2",
        _ => "d3",
    };
    let noise = (fp.noise_level.clamp(0.0, 1.0) * 10.0).floor() as u32;
    let speakers = fp
        .speaker_count
        .map(|s| s.min(6).to_string())
        .unwrap_or_else(|| "?".into());
    let language = fp.language.as_deref().unwrap_or("?");
    format!("{duration}/n{noise}/s{speakers}/{language}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fingerprint() -> AudioFingerprint {
        AudioFingerprint {
            duration_secs: 120.0,
            sample_rate: 16_000,
            noise_level: 0.02,
            speaker_count: None,
            language: None,
        }
    }

    fn predictor(dir: &std::path::Path, min_samples: u32) -> AdaptivePredictor {
        let cache = Arc::new(CacheManager::new(dir, 16, None));
        AdaptivePredictor::new(cache, min_samples, Duration::from_secs(3600))
    }

    fn params(size: &str) -> StageParams {
        StageParams {
            model_size: size.into(),
            batch_size: 16,
            beam_size: 5,
        }
    }

    #[test]
    fn cold_start_uses_rules() {
        let dir = tempfile::tempdir().unwrap();
        let p = predictor(dir.path(), 3).predict(StageKind::Transcribe, &fingerprint()).unwrap();
        assert_eq!(p.params.model_size, "small");
        assert!(p.reasoning.starts_with("rules:"));
    }

    #[test]
    fn learned_result_replaces_rules_only_when_more_confident() {
        let dir = tempfile::tempdir().unwrap();
        let predictor = predictor(dir.path(), 3);
        let fp = fingerprint();
        let ok = Outcome {
            success: true,
            elapsed_ms: 10,
        };

        // 3/3 successes: 1.0 * 3/4 = 0.75 > rule confidence 0.6.
        for _ in 0..3 {
            predictor.learn(StageKind::Transcribe, &fp, &params("medium"), ok).unwrap();
        }
        let p = predictor.predict(StageKind::Transcribe, &fp).unwrap();
        assert_eq!(p.params.model_size, "medium");
        assert!((p.confidence - 0.75).abs() < 1e-9);
        assert!(p.reasoning.starts_with("history:"));
    }

    #[test]
    fn failures_keep_rules_in_charge() {
        let dir = tempfile::tempdir().unwrap();
        let predictor = predictor(dir.path(), 2);
        let fp = fingerprint();
        for success in [true, false, false] {
            predictor
                .learn(StageKind::Transcribe, &fp, &params("large"), Outcome { success, elapsed_ms: 1 })
                .unwrap();
        }
        let p = predictor.predict(StageKind::Transcribe, &fp).unwrap();
        assert_eq!(p.params.model_size, "small");
    }

    #[test]
    fn too_few_samples_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let predictor = predictor(dir.path(), 5);
        let fp = fingerprint();
        for _ in 0..4 {
            predictor
                .learn(StageKind::Transcribe, &fp, &params("medium"), Outcome { success: true, elapsed_ms: 1 })
                .unwrap();
        }
        assert!(predictor.predict(StageKind::Transcribe, &fp).unwrap().reasoning.starts_with("rules:"));
    }

    #[test]
    fn stages_keep_separate_histories() {
        let dir = tempfile::tempdir().unwrap();
        let predictor = predictor(dir.path(), 3);
        let fp = fingerprint();
        let ok = Outcome {
            success: true,
            elapsed_ms: 10,
        };
        for _ in 0..3 {
            predictor
                .learn(StageKind::DetectVoice, &fp, &params("tiny"), ok)
                .unwrap();
        }
        assert_eq!(
            predictor.predict(StageKind::DetectVoice, &fp).unwrap().params.model_size,
            "tiny"
        );
        let transcribe = predictor.predict(StageKind::Transcribe, &fp).unwrap();
        assert!(transcribe.reasoning.starts_with("rules:"));
    }

    #[test]
    fn concurrent_jobs_do_not_lose_outcomes() {
        let dir = tempfile::tempdir().unwrap();
        let fp = fingerprint();
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let predictor = predictor(dir.path(), 1);
                let fp = fp.clone();
                std::thread::spawn(move || {
                    for _ in 0..5 {
                        predictor
                            .learn(
                                StageKind::Transcribe,
                                &fp,
                                &params("medium"),
                                Outcome { success: true, elapsed_ms: 1 },
                            )
                            .unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        let p = predictor(dir.path(), 1).predict(StageKind::Transcribe, &fp).unwrap();
        assert_eq!(p.reasoning, "history: 20/20 successful runs in bucket");
    }

    #[test]
    fn failure_reasoning_has_a_single_prefix() {
        let defaults = params("medium");
        let own = PredictionConfig::failed(
            &defaults,
            &PipelineError::PredictorFailure("no WAV input to fingerprint".into()),
        );
        assert_eq!(own.reasoning, "predictor failure: no WAV input to fingerprint");
        let io = PredictionConfig::failed(&defaults, &PipelineError::Config("bad threshold".into()));
        assert_eq!(io.reasoning, "predictor failure: config error: bad threshold");
        assert_eq!(own.params, defaults);
        assert_eq!(own.confidence, 0.0);
    }

    #[test]
    fn buckets_separate_dissimilar_media() {
        let mut long = fingerprint();
        long.duration_secs = 5000.0;
        assert_ne!(bucket(&fingerprint()), bucket(&long));
        let mut slightly_longer = fingerprint();
        slightly_longer.duration_secs = 130.0;
        assert_eq!(bucket(&fingerprint()), bucket(&slightly_longer));
    }

    #[test]
    fn params_render_as_named_pairs() {
        let map = params("small").to_map();
        assert_eq!(map["model_size"], "small");
        assert_eq!(map["batch_size"], "16");
        assert_eq!(map.len(), StageParams::NAMES.len());
    }
}
