//! Sticky experiment assignment.
//!
//! The first resolution for an experiment is persisted and wins from then on,
//! even if the experiment's weights are later changed.

use chrono::Utc;
use stringboot_core::{ChangeReason, Error, ExperimentAssignment, ExperimentConfig, resolve_variant};

use crate::tiers::Tiers;

#[derive(Debug, Clone)]
pub struct AssignmentResolver {
    tiers: Tiers,
}

impl AssignmentResolver {
    pub fn new(tiers: Tiers) -> Self {
        Self { tiers }
    }

    /// Return the device's variant for `config`, assigning one on first use.
    ///
    /// # Errors
    ///
    /// `Error::InvalidInput` if the config does not validate.
    pub async fn assign(&self, device_id: &str, config: &ExperimentConfig) -> Result<ExperimentAssignment, Error> {
        config.validate()?;

        if let Some(existing) = self.tiers.store.get_assignment(&config.experiment_id).await? {
            return Ok(existing);
        }

        let variant = resolve_variant(device_id, config)?;
        let candidate = ExperimentAssignment {
            experiment_id: config.experiment_id.clone(),
            string_key: config.string_key.clone(),
            variant_id: variant.id.clone(),
            variant_name: variant.name.clone(),
            assigned_at: Utc::now(),
        };

        // A concurrent caller may have stored one first; theirs is kept.
        let (assignment, inserted) = self.tiers.store.insert_assignment(&candidate).await?;
        if inserted {
            tracing::info!(
                experiment = %assignment.experiment_id,
                key = %assignment.string_key,
                variant = %assignment.variant_id,
                "experiment assigned"
            );
            self.tiers.refresh_key(&assignment.string_key, ChangeReason::AssignmentChanged).await?;
        }

        Ok(assignment)
    }

    /// Forget the assignment for an ended experiment.
    pub async fn retire(&self, experiment_id: &str) -> Result<Option<ExperimentAssignment>, Error> {
        let removed = self.tiers.store.delete_assignment(experiment_id).await?;
        if let Some(assignment) = &removed {
            tracing::info!(experiment = %experiment_id, key = %assignment.string_key, "experiment retired");
            self.tiers.refresh_key(&assignment.string_key, ChangeReason::AssignmentChanged).await?;
        }
        Ok(removed)
    }

    pub async fn assignments(&self) -> Result<Vec<ExperimentAssignment>, Error> {
        self.tiers.store.list_assignments().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};
    use stringboot_core::{Entry, MemoryCache, StoreDb, Variant, WatchHub};

    async fn resolver() -> AssignmentResolver {
        let store = StoreDb::open_in_memory().await.unwrap();
        AssignmentResolver::new(Tiers::new(store, Arc::new(MemoryCache::new(16)), Arc::new(WatchHub::new())))
    }

    fn checkout(control: f64, variant_a: f64) -> ExperimentConfig {
        ExperimentConfig {
            experiment_id: "exp-checkout".into(),
            string_key: "checkout_cta".into(),
            variants: vec![
                Variant { id: "control".into(), name: "Control".into(), weight: control },
                Variant { id: "variantA".into(), name: "Variant A".into(), weight: variant_a },
            ],
        }
    }

    #[tokio::test]
    async fn test_assignment_is_deterministic_and_persisted() {
        let resolver = resolver().await;
        let config = checkout(0.5, 0.5);

        let first = resolver.assign("abc123", &config).await.unwrap();
        let expected = resolve_variant("abc123", &config).unwrap();
        assert_eq!(first.variant_id, expected.id);

        let again = resolver.assign("abc123", &config).await.unwrap();
        assert_eq!(again, first);
        assert_eq!(resolver.assignments().await.unwrap(), vec![first]);
    }

    #[tokio::test]
    async fn test_reweighting_keeps_existing_assignment() {
        let resolver = resolver().await;
        let first = resolver.assign("abc123", &checkout(0.5, 0.5)).await.unwrap();

        let flipped = if first.variant_id == "control" { checkout(0.0, 1.0) } else { checkout(1.0, 0.0) };
        let second = resolver.assign("abc123", &flipped).await.unwrap();
        assert_eq!(second.variant_id, first.variant_id);
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let resolver = resolver().await;
        let err = resolver.assign("abc123", &checkout(0.5, 0.2)).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert!(resolver.assignments().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_assign_and_retire_refresh_watchers() {
        let resolver = resolver().await;
        let tiers = &resolver.tiers;
        let mut entry = Entry {
            key: "checkout_cta".into(),
            language: "en".into(),
            value: "Checkout".into(),
            version: 1,
            updated_at: Utc::now(),
            deleted: false,
            variants: BTreeMap::new(),
        };
        entry.variants.insert("control".into(), "Checkout".into());
        entry.variants.insert("variantA".into(), "Buy now".into());
        tiers.store.write_batch(&[entry]).await.unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = tiers.hub.subscribe("checkout_cta", "en", move |e| sink.lock().unwrap().push(e.clone()));

        let assignment = resolver.assign("abc123", &checkout(0.5, 0.5)).await.unwrap();
        let expected = if assignment.variant_id == "variantA" { "Buy now" } else { "Checkout" };

        let retired = resolver.retire("exp-checkout").await.unwrap();
        assert_eq!(retired.map(|a| a.variant_id), Some(assignment.variant_id));
        assert!(resolver.retire("exp-checkout").await.unwrap().is_none());

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|e| e.reason == ChangeReason::AssignmentChanged));
        assert_eq!(seen[0].value.as_deref(), Some(expected));
        assert_eq!(seen[1].value.as_deref(), Some("Checkout"));
    }
}
