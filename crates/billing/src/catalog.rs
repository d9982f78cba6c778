//! Static subscription plan catalog.
//!
//! Plans are immutable at runtime and live in memory; lookups never fail
//! with an error, they return `Option`/filtered lists. Retired plans stay in
//! the table so existing subscribers keep resolving, but they are closed to
//! new subscriptions.

use serde::Serialize;

use crate::model::{BillingCycle, MembershipTier};

/// One entry in the plan table.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionPlan {
    pub plan_id: &'static str,
    pub name: &'static str,
    pub monthly_price_cents: i64,
    pub yearly_price_cents: i64,
    /// Provider price references, resolved by the processor implementation.
    pub monthly_price_ref: &'static str,
    pub yearly_price_ref: &'static str,
    /// Marketplace tier granted while the subscription is in good standing.
    pub tier: MembershipTier,
    pub features: &'static [&'static str],
    pub active: bool,
}

impl SubscriptionPlan {
    pub fn price_cents(&self, cycle: BillingCycle) -> i64 {
        match cycle {
            BillingCycle::Monthly => self.monthly_price_cents,
            BillingCycle::Yearly => self.yearly_price_cents,
        }
    }

    pub fn price_ref(&self, cycle: BillingCycle) -> &'static str {
        match cycle {
            BillingCycle::Monthly => self.monthly_price_ref,
            BillingCycle::Yearly => self.yearly_price_ref,
        }
    }

    /// Private sellers: featured listings and richer listing tooling.
    pub fn premium_individual() -> Self {
        Self {
            plan_id: "premium_individual",
            name: "Premium Individual",
            monthly_price_cents: 2999,
            yearly_price_cents: 29999,
            monthly_price_ref: "price_premium_individual_monthly",
            yearly_price_ref: "price_premium_individual_yearly",
            tier: MembershipTier::PremiumIndividual,
            features: &[
                "featured_listings",
                "unlimited_photos",
                "listing_analytics",
                "priority_support",
            ],
            active: true,
        }
    }

    /// Dealers: bulk inventory tooling on top of the individual features.
    pub fn premium_dealer() -> Self {
        Self {
            plan_id: "premium_dealer",
            name: "Premium Dealer",
            monthly_price_cents: 9999,
            yearly_price_cents: 99999,
            monthly_price_ref: "price_premium_dealer_monthly",
            yearly_price_ref: "price_premium_dealer_yearly",
            tier: MembershipTier::PremiumDealer,
            features: &[
                "featured_listings",
                "unlimited_photos",
                "listing_analytics",
                "dealer_dashboard",
                "bulk_listing_import",
                "lead_export",
            ],
            active: true,
        }
    }

    /// Brokerages: multi-office accounts and API access.
    pub fn brokerage() -> Self {
        Self {
            plan_id: "brokerage",
            name: "Brokerage",
            monthly_price_cents: 24999,
            yearly_price_cents: 249999,
            monthly_price_ref: "price_brokerage_monthly",
            yearly_price_ref: "price_brokerage_yearly",
            tier: MembershipTier::Brokerage,
            features: &[
                "featured_listings",
                "unlimited_photos",
                "listing_analytics",
                "dealer_dashboard",
                "bulk_listing_import",
                "lead_export",
                "multi_office_accounts",
                "api_access",
            ],
            active: true,
        }
    }

    /// Pre-2024 individual plan. Closed to new subscriptions; grandfathered
    /// subscribers renew at the old price.
    pub fn premium_individual_legacy() -> Self {
        Self {
            plan_id: "premium_individual_legacy",
            name: "Premium Individual (Legacy)",
            monthly_price_cents: 1999,
            yearly_price_cents: 19999,
            monthly_price_ref: "price_premium_individual_legacy_monthly",
            yearly_price_ref: "price_premium_individual_legacy_yearly",
            tier: MembershipTier::PremiumIndividual,
            features: &["featured_listings", "unlimited_photos"],
            active: false,
        }
    }
}

/// In-memory plan table. Built once at startup, shared via `Arc`.
#[derive(Debug, Clone)]
pub struct SubscriptionCatalog {
    plans: Vec<SubscriptionPlan>,
}

impl SubscriptionCatalog {
    /// The production plan table.
    pub fn standard() -> Self {
        Self {
            plans: vec![
                SubscriptionPlan::premium_individual(),
                SubscriptionPlan::premium_dealer(),
                SubscriptionPlan::brokerage(),
                SubscriptionPlan::premium_individual_legacy(),
            ],
        }
    }

    pub fn new(plans: Vec<SubscriptionPlan>) -> Self {
        Self { plans }
    }

    /// Pure lookup; resolves retired plans too.
    pub fn plan(&self, plan_id: &str) -> Option<&SubscriptionPlan> {
        self.plans.iter().find(|plan| plan.plan_id == plan_id)
    }

    /// Plans currently open to new subscriptions.
    pub fn active_plans(&self) -> Vec<&SubscriptionPlan> {
        self.plans.iter().filter(|plan| plan.active).collect()
    }
}

impl Default for SubscriptionCatalog {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_resolves_known_plans() {
        let catalog = SubscriptionCatalog::standard();
        let plan = catalog.plan("premium_individual").unwrap();
        assert_eq!(plan.monthly_price_cents, 2999);
        assert_eq!(plan.price_ref(BillingCycle::Yearly), "price_premium_individual_yearly");
        assert!(catalog.plan("platinum_yacht").is_none());
    }

    #[test]
    fn active_plans_exclude_retired() {
        let catalog = SubscriptionCatalog::standard();
        let active = catalog.active_plans();
        assert!(active.iter().all(|plan| plan.active));
        assert!(active.iter().any(|plan| plan.plan_id == "premium_dealer"));
        assert!(!active.iter().any(|plan| plan.plan_id == "premium_individual_legacy"));

        // Retired plans still resolve for existing subscribers.
        assert!(catalog.plan("premium_individual_legacy").is_some());
    }

    #[test]
    fn price_selection_follows_cycle() {
        let plan = SubscriptionPlan::premium_dealer();
        assert_eq!(plan.price_cents(BillingCycle::Monthly), 9999);
        assert_eq!(plan.price_cents(BillingCycle::Yearly), 99999);
    }
}
