//! Score-level and decision-level fusion of per-modality results.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::BiometricError;
use crate::types::{FusedResult, Modality, ModalityResult};

/// Score-level fusion rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreRule {
    #[default]
    WeightedSum,
    Product,
    Mean,
    Max,
    Min,
}

impl FromStr for ScoreRule {
    type Err = BiometricError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "weighted_sum" => Ok(ScoreRule::WeightedSum),
            "product" => Ok(ScoreRule::Product),
            "mean" => Ok(ScoreRule::Mean),
            "max" => Ok(ScoreRule::Max),
            "min" => Ok(ScoreRule::Min),
            other => Err(BiometricError::UnknownStrategy(other.to_string())),
        }
    }
}

/// Decision-level fusion rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionRule {
    /// Every modality must accept. Default for multi-factor authentication.
    #[default]
    And,
    Or,
    /// Strictly more than half accept.
    Majority,
}

impl FromStr for DecisionRule {
    type Err = BiometricError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "and" => Ok(DecisionRule::And),
            "or" => Ok(DecisionRule::Or),
            "majority" => Ok(DecisionRule::Majority),
            other => Err(BiometricError::UnknownStrategy(other.to_string())),
        }
    }
}

/// Per-modality weights for the multi-factor weighted sum.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FusionWeights {
    pub keystroke: f64,
    pub face: f64,
}

impl Default for FusionWeights {
    fn default() -> Self {
        Self {
            keystroke: 0.4,
            face: 0.6,
        }
    }
}

impl FusionWeights {
    pub fn weight(&self, modality: Modality) -> f64 {
        match modality {
            Modality::Keystroke => self.keystroke,
            Modality::Face => self.face,
        }
    }
}

/// Weighted sum with weights normalized to sum to one (uniform by default).
pub fn weighted_sum(scores: &[f64], weights: Option<&[f64]>) -> Result<f64, BiometricError> {
    if scores.is_empty() {
        return Err(BiometricError::EmptyInput);
    }
    let uniform;
    let weights = match weights {
        Some(w) => w,
        None => {
            uniform = vec![1.0; scores.len()];
            &uniform
        }
    };
    if weights.len() != scores.len() {
        return Err(BiometricError::LengthMismatch {
            left: scores.len(),
            right: weights.len(),
        });
    }

    let total: f64 = weights.iter().sum();
    if !(total > 0.0) {
        return Err(BiometricError::InvalidWeights);
    }
    Ok(scores
        .iter()
        .zip(weights)
        .map(|(s, w)| s * (w / total))
        .sum())
}

pub fn product(scores: &[f64]) -> Result<f64, BiometricError> {
    non_empty(scores)?;
    Ok(scores.iter().product())
}

pub fn mean(scores: &[f64]) -> Result<f64, BiometricError> {
    non_empty(scores)?;
    Ok(scores.iter().sum::<f64>() / scores.len() as f64)
}

pub fn max(scores: &[f64]) -> Result<f64, BiometricError> {
    non_empty(scores)?;
    Ok(scores.iter().copied().fold(f64::NEG_INFINITY, f64::max))
}

pub fn min(scores: &[f64]) -> Result<f64, BiometricError> {
    non_empty(scores)?;
    Ok(scores.iter().copied().fold(f64::INFINITY, f64::min))
}

fn non_empty(scores: &[f64]) -> Result<(), BiometricError> {
    if scores.is_empty() {
        Err(BiometricError::EmptyInput)
    } else {
        Ok(())
    }
}

/// Apply a score rule; `weights` only affects [`ScoreRule::WeightedSum`].
pub fn fuse_scores(
    scores: &[f64],
    rule: ScoreRule,
    weights: Option<&[f64]>,
) -> Result<f64, BiometricError> {
    match rule {
        ScoreRule::WeightedSum => weighted_sum(scores, weights),
        ScoreRule::Product => product(scores),
        ScoreRule::Mean => mean(scores),
        ScoreRule::Max => max(scores),
        ScoreRule::Min => min(scores),
    }
}

pub fn fuse_decisions(decisions: &[bool], rule: DecisionRule) -> Result<bool, BiometricError> {
    if decisions.is_empty() {
        return Err(BiometricError::EmptyInput);
    }
    let accepted = decisions.iter().filter(|&&d| d).count();
    Ok(match rule {
        DecisionRule::And => accepted == decisions.len(),
        DecisionRule::Or => accepted > 0,
        DecisionRule::Majority => 2 * accepted > decisions.len(),
    })
}

/// Decision fusion by strategy name (`and`, `or`, `majority`).
pub fn decision_level_fusion(decisions: &[bool], strategy: &str) -> Result<bool, BiometricError> {
    fuse_decisions(decisions, strategy.parse()?)
}

/// Multi-factor policy: fuse scores for reporting, decide by AND.
///
/// With the weighted-sum rule and several modalities, each score is
/// weighted by its modality; a lone modality passes through unweighted.
pub fn fuse_modalities(
    results: Vec<ModalityResult>,
    rule: ScoreRule,
    weights: &FusionWeights,
) -> Result<FusedResult, BiometricError> {
    let scores: Vec<f64> = results.iter().map(|r| r.score).collect();
    let decisions: Vec<bool> = results.iter().map(|r| r.accepted).collect();

    let fused_score = match (rule, results.as_slice()) {
        (ScoreRule::WeightedSum, [single]) => single.score,
        (ScoreRule::WeightedSum, _) => {
            let w: Vec<f64> = results.iter().map(|r| weights.weight(r.modality)).collect();
            weighted_sum(&scores, Some(w.as_slice()))?
        }
        (other, _) => fuse_scores(&scores, other, None)?,
    };
    let accepted = fuse_decisions(&decisions, DecisionRule::And)?;

    Ok(FusedResult {
        accepted,
        fused_score,
        method: rule,
        per_modality: results,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-12
    }

    #[test]
    fn test_decision_rules() {
        assert!(decision_level_fusion(&[true, true], "and").unwrap());
        assert!(!decision_level_fusion(&[true, false], "and").unwrap());
        assert!(decision_level_fusion(&[true, false], "or").unwrap());
        assert!(!decision_level_fusion(&[true, false, false], "majority").unwrap());
        assert!(decision_level_fusion(&[true, true, false], "majority").unwrap());
        // exactly half is not a majority
        assert!(!decision_level_fusion(&[true, false], "majority").unwrap());
    }

    #[test]
    fn test_unknown_strategy() {
        let err = decision_level_fusion(&[true], "xor").unwrap_err();
        assert_eq!(err, BiometricError::UnknownStrategy("xor".into()));
        assert!("median".parse::<ScoreRule>().is_err());
    }

    #[test]
    fn test_empty_inputs() {
        assert_eq!(product(&[]).unwrap_err(), BiometricError::EmptyInput);
        assert_eq!(mean(&[]).unwrap_err(), BiometricError::EmptyInput);
        assert_eq!(max(&[]).unwrap_err(), BiometricError::EmptyInput);
        assert_eq!(min(&[]).unwrap_err(), BiometricError::EmptyInput);
        assert_eq!(weighted_sum(&[], None).unwrap_err(), BiometricError::EmptyInput);
        assert_eq!(
            fuse_decisions(&[], DecisionRule::And).unwrap_err(),
            BiometricError::EmptyInput
        );
    }

    #[test]
    fn test_weighted_sum_defaults_to_mean() {
        let scores = [0.2, 0.4, 0.9];
        assert!(close(weighted_sum(&scores, None).unwrap(), mean(&scores).unwrap()));
    }

    #[test]
    fn test_weighted_sum_length_mismatch() {
        let err = weighted_sum(&[0.5, 0.5], Some(&[1.0][..])).unwrap_err();
        assert_eq!(err, BiometricError::LengthMismatch { left: 2, right: 1 });
    }

    #[test]
    fn test_weighted_sum_scale_invariant() {
        let scores = [0.3, 0.8, 0.55];
        let weights = [0.2, 0.5, 0.3];
        let base = weighted_sum(&scores, Some(&weights[..])).unwrap();
        for k in [0.001, 0.5, 3.0, 1000.0] {
            let scaled: Vec<f64> = weights.iter().map(|w| w * k).collect();
            assert!(close(weighted_sum(&scores, Some(scaled.as_slice())).unwrap(), base));
        }
    }

    #[test]
    fn test_weighted_sum_rejects_zero_weights() {
        let err = weighted_sum(&[0.5], Some(&[0.0][..])).unwrap_err();
        assert_eq!(err, BiometricError::InvalidWeights);
    }

    #[test]
    fn test_reductions() {
        let scores = [0.5, 0.8];
        assert!(close(product(&scores).unwrap(), 0.4));
        assert!(close(mean(&scores).unwrap(), 0.65));
        assert!(close(max(&scores).unwrap(), 0.8));
        assert!(close(min(&scores).unwrap(), 0.5));
    }

    #[test]
    fn test_mfa_weights_face_more_heavily() {
        let results = vec![
            ModalityResult::new(Modality::Keystroke, true, 0.5),
            ModalityResult::new(Modality::Face, true, 1.0),
        ];
        let fused =
            fuse_modalities(results, ScoreRule::WeightedSum, &FusionWeights::default()).unwrap();
        assert!(close(fused.fused_score, 0.4 * 0.5 + 0.6 * 1.0));
        assert!(fused.accepted);
        assert_eq!(fused.per_modality.len(), 2);
    }

    #[test]
    fn test_mfa_single_modality_passes_through() {
        let results = vec![ModalityResult::new(Modality::Face, true, 0.77)];
        let fused =
            fuse_modalities(results, ScoreRule::WeightedSum, &FusionWeights::default()).unwrap();
        assert_eq!(fused.fused_score, 0.77);
    }

    #[test]
    fn test_mfa_decision_ignores_fused_score() {
        // High fused score, but one modality rejects.
        let results = vec![
            ModalityResult::new(Modality::Keystroke, false, 0.95),
            ModalityResult::new(Modality::Face, true, 0.99),
        ];
        let fused = fuse_modalities(results, ScoreRule::Max, &FusionWeights::default()).unwrap();
        assert!(close(fused.fused_score, 0.99));
        assert!(!fused.accepted);
        assert_eq!(fused.method, ScoreRule::Max);
    }

    #[test]
    fn test_mfa_empty_is_error() {
        let err = fuse_modalities(vec![], ScoreRule::Mean, &FusionWeights::default()).unwrap_err();
        assert_eq!(err, BiometricError::EmptyInput);
    }

    #[test]
    fn test_rule_names_roundtrip_through_serde() {
        let rule: ScoreRule = serde_json::from_str("\"weighted_sum\"").unwrap();
        assert_eq!(rule, ScoreRule::WeightedSum);
        assert_eq!("product".parse::<ScoreRule>().unwrap(), ScoreRule::Product);
        assert_eq!("majority".parse::<DecisionRule>().unwrap(), DecisionRule::Majority);
    }
}
