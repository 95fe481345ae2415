//! Deterministic experiment bucketing.
//!
//! A device lands in a variant by hashing `device_id || experiment_id` with
//! SHA-256, reading the top 64 bits as a fraction in `[0, 1)`, and walking the
//! cumulative weights of the variants in declaration order.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::Error;

/// Tolerance when checking that weights sum to 1.
const WEIGHT_EPSILON: f64 = 1e-6;

/// One arm of an experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Variant {
    pub id: String,
    pub name: String,
    pub weight: f64,
}

/// An experiment on one string key, with its weighted variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentConfig {
    pub experiment_id: String,
    pub string_key: String,
    pub variants: Vec<Variant>,
}

impl ExperimentConfig {
    /// Validate the variant list.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` if:
    /// - the experiment id is empty or there are no variants
    /// - a weight is negative or not finite
    /// - variant ids repeat
    /// - weights do not sum to 1
    pub fn validate(&self) -> Result<(), Error> {
        if self.experiment_id.is_empty() {
            return Err(Error::InvalidInput("experiment id must not be empty".into()));
        }
        if self.variants.is_empty() {
            return Err(Error::InvalidInput(format!("experiment {} has no variants", self.experiment_id)));
        }

        let mut seen = std::collections::HashSet::new();
        for variant in &self.variants {
            if !variant.weight.is_finite() || variant.weight < 0.0 {
                return Err(Error::InvalidInput(format!("variant {} has invalid weight {}", variant.id, variant.weight)));
            }
            if !seen.insert(variant.id.as_str()) {
                return Err(Error::InvalidInput(format!("duplicate variant id: {}", variant.id)));
            }
        }

        let total: f64 = self.variants.iter().map(|v| v.weight).sum();
        if (total - 1.0).abs() > WEIGHT_EPSILON {
            return Err(Error::InvalidInput(format!(
                "variant weights of {} sum to {total}, expected 1",
                self.experiment_id
            )));
        }

        Ok(())
    }

    pub fn variant(&self, id: &str) -> Option<&Variant> {
        self.variants.iter().find(|v| v.id == id)
    }
}

/// Map `device_id || experiment_id` to a point in `[0, 1)`.
pub fn bucket(device_id: &str, experiment_id: &str) -> f64 {
    let mut hasher = Sha256::new();
    hasher.update(device_id.as_bytes());
    hasher.update(experiment_id.as_bytes());
    let digest = hasher.finalize();

    let mut top = [0u8; 8];
    top.copy_from_slice(&digest[..8]);
    // 53 significant bits keep the division exact and strictly below 1.0.
    (u64::from_be_bytes(top) >> 11) as f64 / (1u64 << 53) as f64
}

/// Pick the variant for a device. Pure: same inputs, same variant.
///
/// Boundaries are compared with `<`, so a point landing exactly on a boundary
/// belongs to the later variant; zero-weight variants are never chosen.
///
/// # Errors
///
/// Returns `Error::InvalidInput` if the config does not validate.
pub fn resolve_variant<'a>(device_id: &str, config: &'a ExperimentConfig) -> Result<&'a Variant, Error> {
    config.validate()?;

    let point = bucket(device_id, &config.experiment_id);
    let mut cumulative = 0.0;
    for variant in &config.variants {
        cumulative += variant.weight;
        if point < cumulative {
            return Ok(variant);
        }
    }

    // Rounding can leave the final boundary a hair under 1.0.
    config
        .variants
        .iter()
        .rev()
        .find(|v| v.weight > 0.0)
        .ok_or_else(|| Error::InvalidInput(format!("experiment {} has no weighted variant", config.experiment_id)))
}
