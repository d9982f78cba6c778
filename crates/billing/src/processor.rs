//! Payment processor capability.
//!
//! The engine never talks to a concrete gateway SDK; it consumes this trait.
//! One implementation per provider (Stripe, PayPal, the local sandbox), each
//! owning its own wire formats and webhook signature scheme. Components hold
//! an `Arc<dyn PaymentProcessor>`, so the trait must stay object-safe.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use time::OffsetDateTime;

use crate::model::{DisputeType, ProcessorType};

/// Upper bound on any single processor call. A call that exceeds this is
/// treated as a failure, never as an implicit success.
pub const PROCESSOR_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Failure surface of a processor call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProcessorError {
    #[error("Processor call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Payment declined ({code}): {message}")]
    Declined { code: String, message: String },

    #[error("Webhook signature verification failed")]
    InvalidSignature,

    #[error("Malformed webhook payload: {0}")]
    MalformedEvent(String),

    #[error("Processor API error: {0}")]
    Api(String),
}

impl ProcessorError {
    /// Whether a later identical call could plausibly succeed. Declines and
    /// signature failures are terminal; timeouts and API errors are not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProcessorError::Timeout(_) | ProcessorError::Api(_))
    }
}

#[derive(Debug, Clone)]
pub struct CustomerHandle {
    pub customer_id: String,
}

#[derive(Debug, Clone)]
pub struct PaymentMethodHandle {
    pub payment_method_id: String,
}

/// Tokenized payment method reference. The raw instrument never reaches this
/// system; providers exchange a client-side token for a method handle.
#[derive(Debug, Clone)]
pub struct PaymentMethodDetails {
    pub kind: String,
    pub token: String,
}

/// Processor-side subscription creation request.
#[derive(Debug, Clone)]
pub struct NewSubscription {
    pub customer_id: String,
    /// Provider price reference from the plan catalog.
    pub price_ref: String,
    pub payment_method_id: String,
    pub trial_days: Option<u32>,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorSubscriptionStatus {
    Trialing,
    Active,
    Incomplete,
}

#[derive(Debug, Clone)]
pub struct ProcessorSubscription {
    pub subscription_id: String,
    pub status: ProcessorSubscriptionStatus,
    pub trial_end: Option<OffsetDateTime>,
}

/// Partial update applied to a processor-side subscription.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionPatch {
    pub price_ref: Option<String>,
    /// Prorated charge (positive) or credit (negative) for the remainder of
    /// the current cycle, in minor units. Collected by the provider.
    pub proration_amount_cents: Option<i64>,
    pub cancel_at_period_end: Option<bool>,
}

/// An off-session charge (renewal, dunning retry).
#[derive(Debug, Clone)]
pub struct ChargeRequest {
    pub amount_cents: i64,
    pub currency: String,
    pub payment_method_id: String,
    pub metadata: HashMap<String, String>,
}

impl ChargeRequest {
    /// Metadata shape used by renewal and retry charges.
    pub fn for_subscription(
        amount_cents: i64,
        currency: &str,
        payment_method_id: &str,
        charge_type: &str,
        subscription_id: &str,
    ) -> Self {
        let mut metadata = HashMap::new();
        metadata.insert("type".to_string(), charge_type.to_string());
        metadata.insert("subscriptionId".to_string(), subscription_id.to_string());
        Self {
            amount_cents,
            currency: currency.to_string(),
            payment_method_id: payment_method_id.to_string(),
            metadata,
        }
    }
}

/// Outcome of a charge the processor accepted for processing. A decline is
/// an outcome, not an error: the call worked, the payment did not.
#[derive(Debug, Clone)]
pub enum ChargeOutcome {
    Succeeded {
        processor_transaction_id: String,
        fee_cents: i64,
    },
    Failed {
        processor_transaction_id: String,
        code: String,
        message: String,
    },
}

/// A webhook payload that passed signature verification.
#[derive(Debug, Clone)]
pub struct ProcessorEvent {
    /// Provider event id; unique per provider, the idempotency key.
    pub event_id: String,
    /// Raw provider event type ("payment_intent.succeeded", ...).
    pub event_type: String,
    pub data: serde_json::Value,
    pub created_at: OffsetDateTime,
}

/// Normalized interpretation of a processor event.
///
/// Dispatch is an exhaustive match over this enum; new provider event types
/// land in `Unhandled` until a variant is added, so unknown events are
/// accepted without state changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookAction {
    PaymentSucceeded {
        processor_transaction_id: String,
    },
    PaymentFailed {
        processor_transaction_id: String,
        code: String,
        message: String,
    },
    DisputeOpened {
        processor_transaction_id: String,
        dispute_type: DisputeType,
        amount_cents: i64,
        evidence_due_by: Option<OffsetDateTime>,
    },
    Unhandled {
        event_type: String,
    },
}

/// External payment gateway capability consumed by the billing engine.
#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    /// Which provider this is; keys the webhook idempotency ledger.
    fn processor_type(&self) -> ProcessorType;

    async fn create_customer(
        &self,
        email: &str,
        name: &str,
    ) -> Result<CustomerHandle, ProcessorError>;

    async fn create_payment_method(
        &self,
        customer_id: &str,
        details: &PaymentMethodDetails,
    ) -> Result<PaymentMethodHandle, ProcessorError>;

    async fn create_subscription(
        &self,
        request: &NewSubscription,
    ) -> Result<ProcessorSubscription, ProcessorError>;

    async fn update_subscription(
        &self,
        subscription_id: &str,
        patch: &SubscriptionPatch,
    ) -> Result<(), ProcessorError>;

    /// Hard stop; the provider stops billing immediately.
    async fn cancel_subscription(&self, subscription_id: &str) -> Result<(), ProcessorError>;

    async fn process_payment(
        &self,
        request: &ChargeRequest,
    ) -> Result<ChargeOutcome, ProcessorError>;

    async fn process_refund(
        &self,
        processor_transaction_id: &str,
        amount_cents: i64,
        reason: &str,
    ) -> Result<(), ProcessorError>;

    /// Verify a webhook delivery's signature and parse the payload.
    /// `Err(InvalidSignature)` is terminal for the request.
    async fn construct_webhook_event(
        &self,
        payload: &[u8],
        signature: &str,
    ) -> Result<ProcessorEvent, ProcessorError>;

    /// Map a verified event onto the normalized action set.
    fn interpret_event(&self, event: &ProcessorEvent) -> WebhookAction;
}

/// Bound a processor call; elapsed time maps to `ProcessorError::Timeout`.
pub async fn call_with_timeout<T, F>(limit: Duration, call: F) -> Result<T, ProcessorError>
where
    F: Future<Output = Result<T, ProcessorError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(ProcessorError::Timeout(limit)),
    }
}
