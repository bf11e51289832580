use super::fingerprint::AudioFingerprint;
use super::{PredictionConfig, StageParams};

const BASE_CONFIDENCE: f64 = 0.8;
const PENALTY: f64 = 0.1;
/// A value within this fraction of a threshold counts as borderline.
const MARGIN: f64 = 0.10;

/// Threshold table: (duration secs, noise level, speakers) above which a
/// tier applies. Checked largest first.
const TIERS: &[(&str, u32, u32, f64, f64, u32)] = &[
    // name, batch, beam, duration, noise, speakers
    ("large", 8, 5, 3600.0, 0.30, 4),
    ("medium", 16, 5, 600.0, 0.10, 1),
];

const SMALL: (&str, u32, u32) = ("small", 24, 3);

/// Deterministic tiering over duration, noise and speaker count.
/// Always yields a usable configuration, even with no history.
pub struct RuleBook;

impl RuleBook {
    pub fn predict(fp: &AudioFingerprint) -> PredictionConfig {
        let speakers = fp.speaker_count.unwrap_or(0);
        let mut reasons = Vec::new();

        let mut chosen = None;
        for &(name, batch, beam, max_dur, max_noise, max_speakers) in TIERS {
            let mut triggers = Vec::new();
            if fp.duration_secs > max_dur {
                triggers.push(format!("duration {:.0}s > {max_dur:.0}s", fp.duration_secs));
            }
            if fp.noise_level > max_noise {
                triggers.push(format!("noise {:.2} > {max_noise:.2}", fp.noise_level));
            }
            if speakers > max_speakers {
                triggers.push(format!("{speakers} speakers > {max_speakers}"));
            }
            if !triggers.is_empty() {
                reasons.push(format!("{name}: {}", triggers.join(", ")));
                chosen = Some((name, batch, beam));
                break;
            }
        }
        let (name, batch, beam) = chosen.unwrap_or_else(|| {
            reasons.push("small: short, clean, single speaker".to_string());
            SMALL
        });

        let mut confidence = BASE_CONFIDENCE;
        if fp.speaker_count.is_none() {
            confidence -= PENALTY;
            reasons.push("speaker count unknown".into());
        }
        if fp.language.is_none() {
            confidence -= PENALTY;
            reasons.push("language unknown".into());
        }
        if is_borderline(fp) {
            confidence -= PENALTY;
            reasons.push("near a tier threshold".into());
        }

        PredictionConfig {
            params: StageParams {
                model_size: name.to_string(),
                batch_size: batch,
                beam_size: beam,
            },
            confidence: confidence.clamp(0.0, 1.0),
            reasoning: format!("rules: {}", reasons.join("; ")),
        }
    }
}

fn near(value: f64, threshold: f64) -> bool {
    (value - threshold).abs() <= threshold * MARGIN
}

// Speaker count is discrete, so only the continuous measures can sit near
// a threshold.
fn is_borderline(fp: &AudioFingerprint) -> bool {
    TIERS
        .iter()
        .any(|&(_, _, _, dur, noise, _)| near(fp.duration_secs, dur) || near(fp.noise_level, noise))
}
