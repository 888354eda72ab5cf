//! Plan definitions and price → plan mapping.
//!
//! A subscription's plan is resolved from its price: an explicit
//! `price_id → slug` table is checked first, then (unless disabled) the
//! amount tiers.
//!
//! ```rust,ignore
//! use plansync::billing::PlanCatalog;
//! use plansync::config::PlanConfig;
//!
//! let catalog = PlanCatalog::from_config(&PlanConfig::default());
//! assert_eq!(catalog.resolve_plan_from_price("price_x", 6900)?, "gestao");
//! assert_eq!(catalog.resolve_plan_from_price("price_y", 24900)?, "psi_regular");
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

use crate::config::PlanConfig;
use crate::error::{EntitlementError, Result};

/// Feature flags and limits attached to a plan slug.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanDefinition {
    pub slug: String,
    pub features: BTreeSet<String>,
    /// Maximum number of tracked records (patients); `None` means unlimited.
    pub usage_limit: Option<u32>,
}

impl PlanDefinition {
    pub fn new(slug: impl Into<String>) -> Self {
        Self {
            slug: slug.into(),
            features: BTreeSet::new(),
            usage_limit: None,
        }
    }

    #[must_use]
    pub fn with_features<I, S>(mut self, features: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.features.extend(features.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn with_usage_limit(mut self, limit: u32) -> Self {
        self.usage_limit = Some(limit);
        self
    }

    #[must_use]
    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.contains(feature)
    }
}

/// Known plans plus the mapping from provider prices to plan slugs.
#[derive(Debug, Clone)]
pub struct PlanCatalog {
    free_plan: String,
    plans: HashMap<String, PlanDefinition>,
    price_plans: HashMap<String, String>,
    amount_tiers: Option<AmountTiers>,
}

#[derive(Debug, Clone)]
struct AmountTiers {
    tier_one_max: i64,
    tier_one_plan: String,
    tier_two_max: i64,
    tier_two_plan: String,
    highest_plan: String,
}

impl AmountTiers {
    fn resolve(&self, amount: i64) -> &str {
        if amount <= self.tier_one_max {
            &self.tier_one_plan
        } else if amount <= self.tier_two_max {
            &self.tier_two_plan
        } else {
            &self.highest_plan
        }
    }
}

impl PlanCatalog {
    /// Build a catalog with the default plan definitions.
    pub fn from_config(config: &PlanConfig) -> Self {
        let mut catalog = Self {
            free_plan: config.free_plan.clone(),
            plans: HashMap::new(),
            price_plans: config.price_plans.clone(),
            amount_tiers: config.amount_tiers.then(|| AmountTiers {
                tier_one_max: config.tier_one_max_amount,
                tier_one_plan: config.tier_one_plan.clone(),
                tier_two_max: config.tier_two_max_amount,
                tier_two_plan: config.tier_two_plan.clone(),
                highest_plan: config.highest_plan.clone(),
            }),
        };

        catalog.add(PlanDefinition::new(config.free_plan.clone()).with_usage_limit(10));
        catalog.add(
            PlanDefinition::new(config.tier_one_plan.clone())
                .with_features(["financial_reports", "unlimited_patients"]),
        );
        catalog.add(
            PlanDefinition::new(config.tier_two_plan.clone()).with_features([
                "financial_reports",
                "unlimited_patients",
                "documents",
                "ocr",
            ]),
        );
        if !catalog.contains(&config.highest_plan) {
            catalog.add(
                PlanDefinition::new(config.highest_plan.clone()).with_features([
                    "financial_reports",
                    "unlimited_patients",
                    "documents",
                    "ocr",
                ]),
            );
        }
        catalog
    }

    /// Add or replace a plan definition.
    pub fn add(&mut self, plan: PlanDefinition) {
        self.plans.insert(plan.slug.clone(), plan);
    }

    #[must_use]
    pub fn free_plan(&self) -> &str {
        &self.free_plan
    }

    #[must_use]
    pub fn is_free(&self, slug: &str) -> bool {
        slug == self.free_plan
    }

    #[must_use]
    pub fn get(&self, slug: &str) -> Option<&PlanDefinition> {
        self.plans.get(slug)
    }

    #[must_use]
    pub fn contains(&self, slug: &str) -> bool {
        self.plans.contains_key(slug)
    }

    /// Definition for `slug`, or the free plan's definition if `slug` is unknown.
    pub fn definition_or_free(&self, slug: &str) -> Result<&PlanDefinition> {
        self.plans
            .get(slug)
            .or_else(|| self.plans.get(&self.free_plan))
            .ok_or_else(|| EntitlementError::configuration("free plan not found"))
    }

    /// Map a provider price to a plan slug.
    ///
    /// Deterministic: the same `(price_id, amount)` always yields the same slug.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the price is not listed and amount
    /// tiers are disabled, or when the mapped slug has no plan definition.
    pub fn resolve_plan_from_price(&self, price_id: &str, amount: i64) -> Result<String> {
        let slug = match self.price_plans.get(price_id) {
            Some(slug) => slug.as_str(),
            None => match &self.amount_tiers {
                Some(tiers) => tiers.resolve(amount),
                None => {
                    return Err(EntitlementError::configuration(format!(
                        "no plan mapped to price '{}'",
                        price_id
                    )))
                }
            },
        };

        if !self.plans.contains_key(slug) {
            return Err(EntitlementError::configuration(format!(
                "price '{}' maps to unknown plan '{}'",
                price_id, slug
            )));
        }
        Ok(slug.to_string())
    }
}

impl Default for PlanCatalog {
    fn default() -> Self {
        Self::from_config(&PlanConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_amount_tiers() {
        let catalog = PlanCatalog::default();
        assert_eq!(catalog.resolve_plan_from_price("p", 4900).unwrap(), "gestao");
        assert_eq!(catalog.resolve_plan_from_price("p", 6900).unwrap(), "gestao");
        assert_eq!(catalog.resolve_plan_from_price("p", 6901).unwrap(), "psi_regular");
        assert_eq!(catalog.resolve_plan_from_price("p", 24900).unwrap(), "psi_regular");
        assert_eq!(catalog.resolve_plan_from_price("p", 99900).unwrap(), "psi_regular");
    }

    #[test]
    fn test_price_table_takes_precedence() {
        let mut config = PlanConfig::default();
        config
            .price_plans
            .insert("price_annual_gestao".to_string(), "gestao".to_string());
        let catalog = PlanCatalog::from_config(&config);

        // Annual price is well above tier two but is listed explicitly
        assert_eq!(
            catalog.resolve_plan_from_price("price_annual_gestao", 69000).unwrap(),
            "gestao"
        );
    }

    #[test]
    fn test_unlisted_price_without_tiers_is_configuration_error() {
        let config = PlanConfig {
            amount_tiers: false,
            ..PlanConfig::default()
        };
        let catalog = PlanCatalog::from_config(&config);
        let err = catalog.resolve_plan_from_price("price_unknown", 6900).unwrap_err();
        assert!(matches!(err, EntitlementError::Configuration(_)));
    }

    #[test]
    fn test_price_mapped_to_unknown_plan_is_configuration_error() {
        let mut config = PlanConfig::default();
        config
            .price_plans
            .insert("price_legacy".to_string(), "legacy".to_string());
        let catalog = PlanCatalog::from_config(&config);
        assert!(matches!(
            catalog.resolve_plan_from_price("price_legacy", 100),
            Err(EntitlementError::Configuration(_))
        ));
    }

    #[test]
    fn test_definitions() {
        let catalog = PlanCatalog::default();
        let free = catalog.get("free").unwrap();
        assert_eq!(free.usage_limit, Some(10));
        assert!(!free.has_feature("ocr"));

        let regular = catalog.get("psi_regular").unwrap();
        assert!(regular.has_feature("ocr"));
        assert_eq!(regular.usage_limit, None);

        assert_eq!(catalog.definition_or_free("unknown").unwrap().slug, "free");
    }
}
