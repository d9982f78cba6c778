//! Shared billing data model.
//!
//! Records here are storage-agnostic: the [`crate::store::BillingStore`]
//! capability persists them, the lifecycle components mutate them. Money is
//! always in minor units (`amount_cents`) with an ISO currency code.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Lifecycle status of a [`BillingAccount`].
///
/// Accounts are never deleted; cancellation is a terminal status transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Trialing,
    Active,
    PastDue,
    Canceled,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Trialing => "trialing",
            AccountStatus::Active => "active",
            AccountStatus::PastDue => "past_due",
            AccountStatus::Canceled => "canceled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "trialing" => Some(AccountStatus::Trialing),
            "active" => Some(AccountStatus::Active),
            "past_due" => Some(AccountStatus::PastDue),
            "canceled" => Some(AccountStatus::Canceled),
            _ => None,
        }
    }

    /// Whether moving to `next` is a legal lifecycle transition.
    ///
    /// Same-status writes are allowed (renewals re-assert `active`).
    pub fn can_transition_to(&self, next: AccountStatus) -> bool {
        if *self == next {
            return true;
        }
        match self {
            AccountStatus::Trialing => true, // converts, lapses, or cancels
            AccountStatus::Active => {
                matches!(next, AccountStatus::PastDue | AccountStatus::Canceled)
            }
            AccountStatus::PastDue => {
                matches!(next, AccountStatus::Active | AccountStatus::Canceled)
            }
            AccountStatus::Canceled => false,
        }
    }
}

impl std::fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Billing interval for a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingCycle {
    Monthly,
    Yearly,
}

impl BillingCycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingCycle::Monthly => "monthly",
            BillingCycle::Yearly => "yearly",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "monthly" => Some(BillingCycle::Monthly),
            "yearly" => Some(BillingCycle::Yearly),
            _ => None,
        }
    }

    /// Cycle length in whole days; also the proration denominator.
    pub fn days_in_cycle(&self) -> i64 {
        match self {
            BillingCycle::Monthly => 30,
            BillingCycle::Yearly => 365,
        }
    }

    /// One billing-cycle unit, used to advance `next_billing_date`.
    pub fn period(&self) -> time::Duration {
        time::Duration::days(self.days_in_cycle())
    }
}

impl std::fmt::Display for BillingCycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Membership tier a plan grants on the marketplace side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipTier {
    Free,
    PremiumIndividual,
    PremiumDealer,
    Brokerage,
}

impl MembershipTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            MembershipTier::Free => "free",
            MembershipTier::PremiumIndividual => "premium_individual",
            MembershipTier::PremiumDealer => "premium_dealer",
            MembershipTier::Brokerage => "brokerage",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "free" => Some(MembershipTier::Free),
            "premium_individual" => Some(MembershipTier::PremiumIndividual),
            "premium_dealer" => Some(MembershipTier::PremiumDealer),
            "brokerage" => Some(MembershipTier::Brokerage),
            _ => None,
        }
    }
}

impl std::fmt::Display for MembershipTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// External payment provider behind the [`crate::processor::PaymentProcessor`]
/// capability. Webhook event ids are unique *per provider*, so the
/// idempotency ledger keys on this too.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessorType {
    Stripe,
    Paypal,
    Sandbox,
}

impl ProcessorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessorType::Stripe => "stripe",
            ProcessorType::Paypal => "paypal",
            ProcessorType::Sandbox => "sandbox",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "stripe" => Some(ProcessorType::Stripe),
            "paypal" => Some(ProcessorType::Paypal),
            "sandbox" => Some(ProcessorType::Sandbox),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProcessorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One billing relationship per user. Owns the processor customer, the
/// default payment method, and the current subscription terms.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingAccount {
    pub billing_id: Uuid,
    pub user_id: Uuid,
    /// Processor-side customer id.
    pub customer_id: String,
    /// Default payment method charged by renewals and retries.
    pub payment_method_id: String,
    pub plan_id: String,
    pub amount_cents: i64,
    pub currency: String,
    pub status: AccountStatus,
    /// Processor-side subscription id.
    pub subscription_id: String,
    pub billing_cycle: BillingCycle,
    #[serde(with = "time::serde::rfc3339")]
    pub next_billing_date: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub trial_ends_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub canceled_at: Option<OffsetDateTime>,
    /// Ordered transaction ids, oldest first.
    pub payment_history: Vec<Uuid>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl BillingAccount {
    /// Whether the account still grants service access at `now`.
    ///
    /// A canceled account keeps access until `next_billing_date`
    /// (end-of-period cancellation keeps the paid-for remainder; immediate
    /// cancellation moves the cutoff to the cancellation instant). Callers
    /// must use this rather than the status string alone.
    pub fn has_access(&self, now: OffsetDateTime) -> bool {
        match self.status {
            AccountStatus::Trialing | AccountStatus::Active | AccountStatus::PastDue => true,
            AccountStatus::Canceled => self.next_billing_date > now,
        }
    }
}

/// Kind of payment attempt a [`Transaction`] records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Payment,
    Refund,
    SubscriptionRenewal,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Payment => "payment",
            TransactionType::Refund => "refund",
            TransactionType::SubscriptionRenewal => "subscription_renewal",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "payment" => Some(TransactionType::Payment),
            "refund" => Some(TransactionType::Refund),
            "subscription_renewal" => Some(TransactionType::SubscriptionRenewal),
            _ => None,
        }
    }
}

/// Settlement state of a [`Transaction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
    Refunded,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Completed => "completed",
            TransactionStatus::Failed => "failed",
            TransactionStatus::Refunded => "refunded",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TransactionStatus::Pending),
            "completed" => Some(TransactionStatus::Completed),
            "failed" => Some(TransactionStatus::Failed),
            "refunded" => Some(TransactionStatus::Refunded),
            _ => None,
        }
    }

    /// Legal settlement transitions: pending settles exactly once, and only
    /// a completed charge can be refunded. Nothing reverses.
    pub fn can_transition_to(&self, next: TransactionStatus) -> bool {
        match self {
            TransactionStatus::Pending => {
                matches!(next, TransactionStatus::Completed | TransactionStatus::Failed)
            }
            TransactionStatus::Completed => matches!(next, TransactionStatus::Refunded),
            TransactionStatus::Failed | TransactionStatus::Refunded => false,
        }
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One payment attempt (charge, renewal, or refund).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub transaction_id: Uuid,
    pub billing_account_id: Uuid,
    pub user_id: Uuid,
    pub transaction_type: TransactionType,
    pub amount_cents: i64,
    pub currency: String,
    pub status: TransactionStatus,
    /// Processor-side transaction id, set once the processor has seen the
    /// charge. Webhook events resolve transactions through this.
    pub processor_transaction_id: Option<String>,
    pub fee_cents: i64,
    pub net_cents: i64,
    pub description: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Why a payment attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    CardDeclined,
    InsufficientFunds,
    CardExpired,
    ProcessorTimeout,
    Other,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::CardDeclined => "card_declined",
            FailureReason::InsufficientFunds => "insufficient_funds",
            FailureReason::CardExpired => "card_expired",
            FailureReason::ProcessorTimeout => "processor_timeout",
            FailureReason::Other => "other",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "card_declined" => Some(FailureReason::CardDeclined),
            "insufficient_funds" => Some(FailureReason::InsufficientFunds),
            "card_expired" => Some(FailureReason::CardExpired),
            "processor_timeout" => Some(FailureReason::ProcessorTimeout),
            "other" => Some(FailureReason::Other),
            _ => None,
        }
    }

    /// Map a processor decline code onto the local taxonomy. Codes vary per
    /// provider; anything unrecognized lands in `Other` with the raw code
    /// kept in the failure message.
    pub fn from_processor_code(code: &str) -> Self {
        match code {
            "card_declined" | "do_not_honor" | "generic_decline" => FailureReason::CardDeclined,
            "insufficient_funds" => FailureReason::InsufficientFunds,
            "expired_card" | "card_expired" => FailureReason::CardExpired,
            "timeout" | "processing_error_timeout" => FailureReason::ProcessorTimeout,
            _ => FailureReason::Other,
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One failed-payment recovery thread, driven by the dunning retry sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentFailure {
    pub failure_id: Uuid,
    pub transaction_id: Uuid,
    pub billing_account_id: Uuid,
    pub user_id: Uuid,
    pub amount_cents: i64,
    pub currency: String,
    pub reason: FailureReason,
    pub message: String,
    /// Payment attempts made so far, counting the original failed charge.
    pub attempt_number: u32,
    pub max_attempts: u32,
    /// When the next retry is due. `None` means no retry is scheduled:
    /// either resolved, or exhausted and awaiting escalation.
    #[serde(with = "time::serde::rfc3339::option")]
    pub next_retry_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub grace_period_ends: OffsetDateTime,
    pub resolved: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl PaymentFailure {
    /// Exhausted threads stay unresolved but schedule nothing further.
    pub fn is_exhausted(&self) -> bool {
        !self.resolved && self.attempt_number >= self.max_attempts
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisputeType {
    Chargeback,
    Inquiry,
    Fraud,
}

impl DisputeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisputeType::Chargeback => "chargeback",
            DisputeType::Inquiry => "inquiry",
            DisputeType::Fraud => "fraud",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "chargeback" => Some(DisputeType::Chargeback),
            "inquiry" => Some(DisputeType::Inquiry),
            "fraud" => Some(DisputeType::Fraud),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisputeStatus {
    NeedsResponse,
    UnderReview,
    Won,
    Lost,
}

impl DisputeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisputeStatus::NeedsResponse => "needs_response",
            DisputeStatus::UnderReview => "under_review",
            DisputeStatus::Won => "won",
            DisputeStatus::Lost => "lost",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "needs_response" => Some(DisputeStatus::NeedsResponse),
            "under_review" => Some(DisputeStatus::UnderReview),
            "won" => Some(DisputeStatus::Won),
            "lost" => Some(DisputeStatus::Lost),
            _ => None,
        }
    }
}

/// A chargeback or dispute opened against a settled transaction.
/// Progressed externally; the engine only opens and tracks it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisputeCase {
    pub dispute_id: Uuid,
    pub transaction_id: Uuid,
    pub dispute_type: DisputeType,
    pub dispute_amount_cents: i64,
    pub currency: String,
    /// Evidence tags ops will respond with ("receipt", "service_log", ...).
    pub evidence: Vec<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub evidence_due_by: OffsetDateTime,
    pub status: DisputeStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Idempotency ledger row for processor webhook deliveries.
///
/// Delivery is at-least-once: once a row exists with `processed = true`, any
/// redelivery of the same (processor, event id) pair must short-circuit. A
/// row claimed but never marked processed (crash mid-dispatch) may be
/// re-claimed until `retry_count` reaches `max_retries`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedWebhookEvent {
    pub event_id: String,
    pub processor_type: ProcessorType,
    pub event_type: String,
    pub processed: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub processed_at: Option<OffsetDateTime>,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Dispatch failure details, recorded so redelivery is a no-op instead
    /// of an infinite reprocessing loop.
    pub last_error: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl ProcessedWebhookEvent {
    pub const DEFAULT_MAX_RETRIES: u32 = 3;

    pub fn new(processor_type: ProcessorType, event_id: &str, event_type: &str) -> Self {
        Self {
            event_id: event_id.to_string(),
            processor_type,
            event_type: event_type.to_string(),
            processed: false,
            processed_at: None,
            retry_count: 0,
            max_retries: Self::DEFAULT_MAX_RETRIES,
            last_error: None,
            created_at: OffsetDateTime::now_utc(),
        }
    }
}

/// The slice of the marketplace user record billing reads and writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: Uuid,
    pub email: String,
    pub name: String,
    pub membership_tier: MembershipTier,
    #[serde(with = "time::serde::rfc3339::option")]
    pub premium_expires_at: Option<OffsetDateTime>,
}

/// Tier/capability flags written back to the user record on subscription
/// creation, renewal, and cancellation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembershipUpdate {
    pub membership_tier: MembershipTier,
    #[serde(with = "time::serde::rfc3339::option")]
    pub premium_expires_at: Option<OffsetDateTime>,
}
