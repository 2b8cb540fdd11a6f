//! Biometric matcher seam.
//!
//! The engine never interprets template bytes itself; it hands the captured
//! sample and each decrypted template to a [`BiometricMatcher`] and expects a
//! similarity score in `[0, 1]`.

use async_trait::async_trait;

use shared::{
    error::{IdentityError, IdentityResult},
    types::BiometricModality,
};

#[async_trait]
pub trait BiometricMatcher: Send + Sync {
    /// Similarity between a live sample and an enrolled template, in `[0, 1]`
    async fn match_template(
        &self,
        sample: &[u8],
        template: &[u8],
        modality: BiometricModality,
    ) -> IdentityResult<f64>;
}

/// Cosine similarity over little-endian `f32` feature vectors, remapped to `[0, 1]`
#[derive(Debug, Default, Clone, Copy)]
pub struct FeatureVectorMatcher;

impl FeatureVectorMatcher {
    fn decode(bytes: &[u8]) -> IdentityResult<Vec<f32>> {
        if bytes.is_empty() || bytes.len() % 4 != 0 {
            return Err(IdentityError::InvalidArgument(format!(
                "feature vector of {} bytes is not a whole number of f32 values",
                bytes.len()
            )));
        }
        Ok(bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect())
    }

    pub fn encode(features: &[f32]) -> Vec<u8> {
        features.iter().flat_map(|f| f.to_le_bytes()).collect()
    }

    pub fn similarity(sample: &[f32], template: &[f32]) -> IdentityResult<f64> {
        if sample.len() != template.len() {
            return Err(IdentityError::InvalidArgument(format!(
                "dimension mismatch: sample {} vs template {}",
                sample.len(),
                template.len()
            )));
        }

        let (mut dot, mut norm_a, mut norm_b) = (0.0f64, 0.0f64, 0.0f64);
        for (a, b) in sample.iter().zip(template) {
            let (a, b) = (*a as f64, *b as f64);
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }
        if norm_a == 0.0 || norm_b == 0.0 {
            return Ok(0.0);
        }

        let cosine = dot / (norm_a.sqrt() * norm_b.sqrt());
        Ok(((cosine + 1.0) / 2.0).clamp(0.0, 1.0))
    }
}

#[async_trait]
impl BiometricMatcher for FeatureVectorMatcher {
    async fn match_template(
        &self,
        sample: &[u8],
        template: &[u8],
        _modality: BiometricModality,
    ) -> IdentityResult<f64> {
        Self::similarity(&Self::decode(sample)?, &Self::decode(template)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_identical_vectors_score_one() {
        let features = FeatureVectorMatcher::encode(&[0.3, -1.2, 4.0, 0.5]);
        let score = FeatureVectorMatcher
            .match_template(&features, &features, BiometricModality::Face)
            .await
            .unwrap();
        assert!((score - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_opposite_vectors_score_zero() {
        let a = FeatureVectorMatcher::encode(&[1.0, 2.0]);
        let b = FeatureVectorMatcher::encode(&[-1.0, -2.0]);
        let score = FeatureVectorMatcher
            .match_template(&a, &b, BiometricModality::Face)
            .await
            .unwrap();
        assert!(score.abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_malformed_input_rejected() {
        let a = FeatureVectorMatcher::encode(&[1.0, 2.0]);
        let b = FeatureVectorMatcher::encode(&[1.0, 2.0, 3.0]);
        assert!(FeatureVectorMatcher
            .match_template(&a, &b, BiometricModality::Iris)
            .await
            .is_err());
        assert!(FeatureVectorMatcher
            .match_template(&a, &[1, 2, 3], BiometricModality::Iris)
            .await
            .is_err());
    }

    #[test]
    fn test_zero_vector_scores_zero() {
        assert_eq!(FeatureVectorMatcher::similarity(&[0.0, 0.0], &[1.0, 1.0]).unwrap(), 0.0);
    }
}
