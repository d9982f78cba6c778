// Billing crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::result_large_err)] // BillingError carries processor error detail
#![allow(clippy::too_many_arguments)] // Some lifecycle operations take many knobs
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Boatyard Billing Engine
//!
//! Subscription lifecycle for the boat marketplace: paid plans for private
//! sellers, dealers, and brokerages.
//!
//! ## Features
//!
//! - **Subscription Management**: Create, change plan (with proration),
//!   cancel immediately or at period end
//! - **Automatic Renewals**: Scheduled sweep charges due accounts and
//!   advances their billing dates
//! - **Dunning**: Failed renewals open recovery threads retried on a
//!   backing-off schedule; recovery reactivates, exhaustion escalates
//! - **Webhooks**: Signature-verified processor events with an idempotency
//!   ledger for at-least-once delivery
//! - **Disputes & Refunds**: Chargeback case tracking and full/partial
//!   refunds against settled charges
//! - **Audit Trail**: Every lifecycle transition leaves an event row
//!
//! The engine talks to gateways only through the [`PaymentProcessor`]
//! capability and persists only through [`BillingStore`]; swap either
//! without touching lifecycle logic.

pub mod catalog;
pub mod dunning;
pub mod error;
pub mod events;
pub mod memory;
pub mod model;
pub mod postgres;
pub mod processor;
pub mod sandbox;
pub mod store;
pub mod subscriptions;
pub mod webhooks;


// Catalog
pub use catalog::{SubscriptionCatalog, SubscriptionPlan};

// Dunning
pub use dunning::{DunningConfig, PaymentFailureHandler, RetrySweepSummary};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{
    ActorType, BillingEvent, BillingEventBuilder, BillingEventLogger, BillingEventType,
};

// Model
pub use model::{
    AccountStatus, BillingAccount, BillingCycle, DisputeCase, DisputeStatus, DisputeType,
    FailureReason, MembershipTier, MembershipUpdate, PaymentFailure, ProcessedWebhookEvent,
    ProcessorType, Transaction, TransactionStatus, TransactionType, UserProfile,
};

// Processor capability
pub use processor::{
    call_with_timeout, ChargeOutcome, ChargeRequest, CustomerHandle, NewSubscription,
    PaymentMethodDetails, PaymentMethodHandle, PaymentProcessor, ProcessorError, ProcessorEvent,
    ProcessorSubscription, ProcessorSubscriptionStatus, SubscriptionPatch, WebhookAction,
    PROCESSOR_CALL_TIMEOUT,
};

// Store capability and adapters
pub use memory::MemoryBillingStore;
pub use postgres::PgBillingStore;
pub use sandbox::SandboxProcessor;
pub use store::{BillingStore, WebhookClaim};

// Subscriptions
pub use subscriptions::{
    prorated_amount_cents, CreateSubscriptionParams, CreatedSubscription, RenewalSweepSummary,
    SubscriptionManager, SubscriptionUpdate, UpdateSubscriptionParams,
};

// Webhooks
pub use webhooks::{WebhookDisposition, WebhookHandler};

use std::sync::Arc;

/// Main billing service that combines the lifecycle components over one
/// processor and one store.
pub struct BillingService {
    pub subscriptions: SubscriptionManager,
    pub failures: PaymentFailureHandler,
    pub webhooks: WebhookHandler,
}

impl BillingService {
    /// Wire the components with the default dunning schedule.
    pub fn new(
        processor: Arc<dyn PaymentProcessor>,
        store: Arc<dyn BillingStore>,
        catalog: Arc<SubscriptionCatalog>,
    ) -> Self {
        Self::with_dunning_config(processor, store, catalog, DunningConfig::default())
    }

    pub fn with_dunning_config(
        processor: Arc<dyn PaymentProcessor>,
        store: Arc<dyn BillingStore>,
        catalog: Arc<SubscriptionCatalog>,
        dunning: DunningConfig,
    ) -> Self {
        let failures = PaymentFailureHandler::new(processor.clone(), store.clone(), dunning);
        let subscriptions = SubscriptionManager::new(
            processor.clone(),
            store.clone(),
            catalog,
            failures.clone(),
        );
        let webhooks = WebhookHandler::new(processor, store, failures.clone());
        Self {
            subscriptions,
            failures,
            webhooks,
        }
    }
}
