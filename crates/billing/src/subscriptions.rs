//! Subscription lifecycle management.
//!
//! [`SubscriptionManager`] owns every [`crate::model::AccountStatus`]
//! transition except dunning recovery: creation, plan changes with
//! proration, cancellation (immediate and end-of-period), the automatic
//! renewal sweep, and refunds. It talks to the gateway exclusively through
//! the [`PaymentProcessor`] capability and persists through
//! [`BillingStore`]; nothing is written locally until the processor call
//! has succeeded.

use std::sync::Arc;

use time::OffsetDateTime;
use uuid::Uuid;

use crate::catalog::{SubscriptionCatalog, SubscriptionPlan};
use crate::dunning::PaymentFailureHandler;
use crate::error::{BillingError, BillingResult};
use crate::events::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::model::{
    AccountStatus, BillingAccount, BillingCycle, FailureReason, MembershipTier, MembershipUpdate,
    Transaction, TransactionStatus, TransactionType,
};
use crate::processor::{
    call_with_timeout, ChargeOutcome, ChargeRequest, NewSubscription, PaymentProcessor,
    ProcessorSubscriptionStatus, SubscriptionPatch, PROCESSOR_CALL_TIMEOUT,
};
use crate::store::BillingStore;

/// Prorated charge (positive) or credit (negative) for switching prices
/// mid-cycle: `days_remaining / days_in_cycle * (new - old)`, rounded to
/// the nearest cent.
pub fn prorated_amount_cents(
    days_remaining: i64,
    days_in_cycle: i64,
    new_price_cents: i64,
    old_price_cents: i64,
) -> i64 {
    if days_in_cycle <= 0 {
        return 0;
    }
    let days_remaining = days_remaining.clamp(0, days_in_cycle);
    let fraction = days_remaining as f64 / days_in_cycle as f64;
    #[allow(clippy::cast_possible_truncation)]
    {
        (fraction * (new_price_cents - old_price_cents) as f64).round() as i64
    }
}

/// Request to open a subscription for a user.
#[derive(Debug, Clone)]
pub struct CreateSubscriptionParams {
    pub plan_id: String,
    pub billing_cycle: BillingCycle,
    pub trial_days: Option<u32>,
    /// Tokenized payment method. Optional when the user has a previous
    /// billing account whose method can be reused.
    pub payment_method_id: Option<String>,
}

/// What `create_subscription` persisted.
#[derive(Debug, Clone)]
pub struct CreatedSubscription {
    pub billing_id: Uuid,
    pub subscription_id: String,
    pub plan_id: String,
    pub amount_cents: i64,
    pub status: AccountStatus,
    pub trial_ends_at: Option<OffsetDateTime>,
    pub next_billing_date: OffsetDateTime,
}

/// Partial update against an existing subscription.
#[derive(Debug, Clone, Default)]
pub struct UpdateSubscriptionParams {
    pub plan_id: Option<String>,
    pub billing_cycle: Option<BillingCycle>,
    pub cancel_at_period_end: Option<bool>,
}

/// Result of `update_subscription` / `cancel_subscription`.
#[derive(Debug, Clone)]
pub struct SubscriptionUpdate {
    pub plan_id: String,
    pub amount_cents: i64,
    pub status: AccountStatus,
    /// Set when a plan or cycle change produced a prorated charge/credit.
    pub prorated_amount_cents: Option<i64>,
}

/// Counters reported by one renewal sweep run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenewalSweepSummary {
    /// Accounts the sweep looked at.
    pub processed: usize,
    /// Charges that went through; `next_billing_date` advanced.
    pub renewed: usize,
    /// Declines handed to the dunning handler.
    pub failures: usize,
    /// Per-account errors (timeouts, storage, conflicts); retried next sweep.
    pub errors: usize,
}

enum RenewalOutcome {
    Renewed,
    Declined,
}

#[derive(Clone)]
pub struct SubscriptionManager {
    processor: Arc<dyn PaymentProcessor>,
    store: Arc<dyn BillingStore>,
    catalog: Arc<SubscriptionCatalog>,
    failures: PaymentFailureHandler,
    event_logger: BillingEventLogger,
}

impl SubscriptionManager {
    pub fn new(
        processor: Arc<dyn PaymentProcessor>,
        store: Arc<dyn BillingStore>,
        catalog: Arc<SubscriptionCatalog>,
        failures: PaymentFailureHandler,
    ) -> Self {
        let event_logger = BillingEventLogger::new(store.clone());
        Self {
            processor,
            store,
            catalog,
            failures,
            event_logger,
        }
    }

    /// Pure catalog lookup; resolves retired plans for existing subscribers.
    pub fn get_subscription_plan(&self, plan_id: &str) -> Option<&SubscriptionPlan> {
        self.catalog.plan(plan_id)
    }

    /// Plans currently open to new subscriptions.
    pub fn get_active_subscription_plans(&self) -> Vec<&SubscriptionPlan> {
        self.catalog.active_plans()
    }

    /// The user's billing account; a live one if present, otherwise the most
    /// recently canceled.
    pub async fn get_subscription_for_user(
        &self,
        user_id: Uuid,
    ) -> BillingResult<Option<BillingAccount>> {
        self.store.get_billing_account_by_user(user_id).await
    }

    pub async fn get_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Option<BillingAccount>> {
        self.store
            .get_billing_account_by_subscription(subscription_id)
            .await
    }

    /// Open a subscription for `user_id`.
    ///
    /// The processor-side subscription is created first; the billing account
    /// and membership flags are persisted only after the processor call
    /// succeeds, so a gateway failure leaves no partial local state.
    pub async fn create_subscription(
        &self,
        user_id: Uuid,
        params: CreateSubscriptionParams,
    ) -> BillingResult<CreatedSubscription> {
        let plan = self
            .catalog
            .plan(&params.plan_id)
            .ok_or_else(|| BillingError::PlanNotFound(params.plan_id.clone()))?;
        if !plan.active {
            return Err(BillingError::Validation(format!(
                "plan {} is closed to new subscriptions",
                plan.plan_id
            )));
        }

        let profile = self
            .store
            .get_user_profile(user_id)
            .await?
            .ok_or_else(|| BillingError::UserNotFound(user_id.to_string()))?;

        // One live billing relationship per user. A previous canceled
        // account is fine and lets us reuse its processor customer.
        let previous = self.store.get_billing_account_by_user(user_id).await?;
        if let Some(ref existing) = previous {
            if existing.status != AccountStatus::Canceled {
                return Err(BillingError::Validation(format!(
                    "user {user_id} already has a {} subscription",
                    existing.status
                )));
            }
        }

        let payment_method_id = params
            .payment_method_id
            .clone()
            .or_else(|| previous.as_ref().map(|a| a.payment_method_id.clone()))
            .ok_or_else(|| BillingError::Validation("no payment method on file".to_string()))?;

        let customer_id = match previous.as_ref() {
            Some(account) => account.customer_id.clone(),
            None => {
                call_with_timeout(
                    PROCESSOR_CALL_TIMEOUT,
                    self.processor.create_customer(&profile.email, &profile.name),
                )
                .await?
                .customer_id
            }
        };

        let request = NewSubscription {
            customer_id: customer_id.clone(),
            price_ref: plan.price_ref(params.billing_cycle).to_string(),
            payment_method_id: payment_method_id.clone(),
            trial_days: params.trial_days,
            metadata: [("userId".to_string(), user_id.to_string())]
                .into_iter()
                .collect(),
        };
        let subscription = call_with_timeout(
            PROCESSOR_CALL_TIMEOUT,
            self.processor.create_subscription(&request),
        )
        .await?;

        let now = OffsetDateTime::now_utc();
        let (status, trial_ends_at, next_billing_date) = match subscription.status {
            ProcessorSubscriptionStatus::Trialing => {
                let trial_end = subscription.trial_end.unwrap_or(
                    now + time::Duration::days(i64::from(params.trial_days.unwrap_or(0))),
                );
                // The first real charge lands when the trial converts.
                (AccountStatus::Trialing, Some(trial_end), trial_end)
            }
            ProcessorSubscriptionStatus::Active | ProcessorSubscriptionStatus::Incomplete => {
                (AccountStatus::Active, None, now + params.billing_cycle.period())
            }
        };

        let account = BillingAccount {
            billing_id: Uuid::new_v4(),
            user_id,
            customer_id,
            payment_method_id,
            plan_id: plan.plan_id.to_string(),
            amount_cents: plan.price_cents(params.billing_cycle),
            currency: "usd".to_string(),
            status,
            subscription_id: subscription.subscription_id.clone(),
            billing_cycle: params.billing_cycle,
            next_billing_date,
            trial_ends_at,
            canceled_at: None,
            payment_history: vec![],
            created_at: now,
            updated_at: now,
        };
        self.store.create_billing_account(&account).await?;

        self.store
            .update_user_membership(
                user_id,
                &MembershipUpdate {
                    membership_tier: plan.tier,
                    premium_expires_at: Some(next_billing_date),
                },
            )
            .await?;

        self.log_event(
            BillingEventBuilder::new(user_id, BillingEventType::SubscriptionCreated)
                .billing_account(account.billing_id)
                .actor_type(ActorType::User)
                .data(serde_json::json!({
                    "planId": account.plan_id,
                    "billingCycle": params.billing_cycle.as_str(),
                    "amountCents": account.amount_cents,
                    "trialDays": params.trial_days,
                })),
        )
        .await;

        tracing::info!(
            billing_id = %account.billing_id,
            user_id = %user_id,
            plan_id = %account.plan_id,
            subscription_id = %account.subscription_id,
            status = %account.status,
            "Subscription created"
        );

        Ok(CreatedSubscription {
            billing_id: account.billing_id,
            subscription_id: account.subscription_id,
            plan_id: account.plan_id,
            amount_cents: account.amount_cents,
            status: account.status,
            trial_ends_at: account.trial_ends_at,
            next_billing_date: account.next_billing_date,
        })
    }

    /// Change plan/cycle (with proration) or flag end-of-period cancellation.
    pub async fn update_subscription(
        &self,
        subscription_id: &str,
        params: UpdateSubscriptionParams,
    ) -> BillingResult<SubscriptionUpdate> {
        let account = self
            .store
            .get_billing_account_by_subscription(subscription_id)
            .await?
            .ok_or_else(|| BillingError::BillingAccountNotFound(subscription_id.to_string()))?;

        if account.status == AccountStatus::Canceled {
            return Err(BillingError::Validation(format!(
                "subscription {subscription_id} is canceled"
            )));
        }

        if params.cancel_at_period_end == Some(true) {
            return self.cancel_subscription(subscription_id, false).await;
        }

        if params.plan_id.is_none() && params.billing_cycle.is_none() {
            return Err(BillingError::Validation("no changes requested".to_string()));
        }

        let new_plan_id = params.plan_id.as_deref().unwrap_or(&account.plan_id);
        let new_plan = self
            .catalog
            .plan(new_plan_id)
            .ok_or_else(|| BillingError::PlanNotFound(new_plan_id.to_string()))?;
        if !new_plan.active && new_plan.plan_id != account.plan_id {
            return Err(BillingError::Validation(format!(
                "plan {} is closed to new subscriptions",
                new_plan.plan_id
            )));
        }
        let new_cycle = params.billing_cycle.unwrap_or(account.billing_cycle);

        let old_price = account.amount_cents;
        let new_price = new_plan.price_cents(new_cycle);

        let now = OffsetDateTime::now_utc();
        let days_in_cycle = account.billing_cycle.days_in_cycle();
        let days_remaining = (account.next_billing_date - now).whole_days();
        let prorated = prorated_amount_cents(days_remaining, days_in_cycle, new_price, old_price);

        call_with_timeout(
            PROCESSOR_CALL_TIMEOUT,
            self.processor.update_subscription(
                subscription_id,
                &SubscriptionPatch {
                    price_ref: Some(new_plan.price_ref(new_cycle).to_string()),
                    proration_amount_cents: Some(prorated),
                    cancel_at_period_end: None,
                },
            ),
        )
        .await?;

        let expected = account.status;
        let mut updated = account.clone();
        updated.plan_id = new_plan.plan_id.to_string();
        updated.amount_cents = new_price;
        updated.billing_cycle = new_cycle;
        updated.updated_at = now;
        if !self
            .store
            .update_billing_account_if_status(&updated, expected)
            .await?
        {
            return Err(BillingError::ConcurrentModification(format!(
                "billing account {} changed during plan update",
                account.billing_id
            )));
        }

        self.store
            .update_user_membership(
                account.user_id,
                &MembershipUpdate {
                    membership_tier: new_plan.tier,
                    premium_expires_at: Some(updated.next_billing_date),
                },
            )
            .await?;

        self.log_event(
            BillingEventBuilder::new(account.user_id, BillingEventType::PlanChanged)
                .billing_account(account.billing_id)
                .actor_type(ActorType::User)
                .data(serde_json::json!({
                    "fromPlan": account.plan_id,
                    "toPlan": updated.plan_id,
                    "proratedAmountCents": prorated,
                    "daysRemaining": days_remaining.clamp(0, days_in_cycle),
                })),
        )
        .await;

        tracing::info!(
            billing_id = %account.billing_id,
            from_plan = %account.plan_id,
            to_plan = %updated.plan_id,
            prorated_amount_cents = prorated,
            "Subscription plan changed"
        );

        Ok(SubscriptionUpdate {
            plan_id: updated.plan_id,
            amount_cents: updated.amount_cents,
            status: updated.status,
            prorated_amount_cents: Some(prorated),
        })
    }

    /// Cancel a subscription.
    ///
    /// `immediate = true` hard-stops the processor subscription, moves the
    /// access cutoff to now, and revokes the membership tier. `immediate =
    /// false` flags end-of-period cancellation at the processor and keeps
    /// `next_billing_date` as the access cutoff; the local status still
    /// flips to `canceled` right away, so access checks must go through
    /// [`BillingAccount::has_access`], not the status string.
    pub async fn cancel_subscription(
        &self,
        subscription_id: &str,
        immediate: bool,
    ) -> BillingResult<SubscriptionUpdate> {
        let account = self
            .store
            .get_billing_account_by_subscription(subscription_id)
            .await?
            .ok_or_else(|| BillingError::BillingAccountNotFound(subscription_id.to_string()))?;

        if account.status == AccountStatus::Canceled {
            return Err(BillingError::Validation(format!(
                "subscription {subscription_id} is already canceled"
            )));
        }

        if immediate {
            call_with_timeout(
                PROCESSOR_CALL_TIMEOUT,
                self.processor.cancel_subscription(subscription_id),
            )
            .await?;
        } else {
            call_with_timeout(
                PROCESSOR_CALL_TIMEOUT,
                self.processor.update_subscription(
                    subscription_id,
                    &SubscriptionPatch {
                        cancel_at_period_end: Some(true),
                        ..SubscriptionPatch::default()
                    },
                ),
            )
            .await?;
        }

        let now = OffsetDateTime::now_utc();
        let expected = account.status;
        let mut updated = account.clone();
        updated.status = AccountStatus::Canceled;
        updated.canceled_at = Some(now);
        updated.updated_at = now;
        if immediate {
            updated.next_billing_date = now;
        }
        if !self
            .store
            .update_billing_account_if_status(&updated, expected)
            .await?
        {
            return Err(BillingError::ConcurrentModification(format!(
                "billing account {} changed during cancellation",
                account.billing_id
            )));
        }

        if immediate {
            self.store
                .update_user_membership(
                    account.user_id,
                    &MembershipUpdate {
                        membership_tier: MembershipTier::Free,
                        premium_expires_at: Some(now),
                    },
                )
                .await?;
        }

        self.log_event(
            BillingEventBuilder::new(account.user_id, BillingEventType::SubscriptionCanceled)
                .billing_account(account.billing_id)
                .actor_type(ActorType::User)
                .data(serde_json::json!({
                    "immediate": immediate,
                    "accessUntil": updated.next_billing_date.unix_timestamp(),
                })),
        )
        .await;

        tracing::info!(
            billing_id = %account.billing_id,
            subscription_id = %subscription_id,
            immediate,
            "Subscription canceled"
        );

        Ok(SubscriptionUpdate {
            plan_id: updated.plan_id,
            amount_cents: updated.amount_cents,
            status: AccountStatus::Canceled,
            prorated_amount_cents: None,
        })
    }

    /// Renewal sweep: charge every account whose `next_billing_date` has
    /// passed. Accounts are processed independently; one account's error is
    /// logged and counted, never fatal to the sweep. State advances only
    /// after a successful processor call, so a crashed sweep is safe to
    /// re-run.
    pub async fn process_automatic_renewals(&self) -> BillingResult<RenewalSweepSummary> {
        let now = OffsetDateTime::now_utc();
        let due = self.store.accounts_due_for_renewal(now).await?;

        let mut summary = RenewalSweepSummary {
            processed: due.len(),
            ..RenewalSweepSummary::default()
        };
        for account in due {
            let billing_id = account.billing_id;
            match self.renew_account(account, now).await {
                Ok(RenewalOutcome::Renewed) => summary.renewed += 1,
                Ok(RenewalOutcome::Declined) => summary.failures += 1,
                Err(error) => {
                    summary.errors += 1;
                    tracing::error!(
                        billing_id = %billing_id,
                        error = %error,
                        "Renewal attempt failed; will retry next sweep"
                    );
                }
            }
        }

        tracing::info!(
            processed = summary.processed,
            renewed = summary.renewed,
            failures = summary.failures,
            errors = summary.errors,
            "Renewal sweep complete"
        );
        Ok(summary)
    }

    async fn renew_account(
        &self,
        account: BillingAccount,
        now: OffsetDateTime,
    ) -> BillingResult<RenewalOutcome> {
        let mut transaction = Transaction {
            transaction_id: Uuid::new_v4(),
            billing_account_id: account.billing_id,
            user_id: account.user_id,
            transaction_type: TransactionType::SubscriptionRenewal,
            amount_cents: account.amount_cents,
            currency: account.currency.clone(),
            status: TransactionStatus::Pending,
            processor_transaction_id: None,
            fee_cents: 0,
            net_cents: account.amount_cents,
            description: format!("Renewal for plan {}", account.plan_id),
            created_at: now,
            updated_at: now,
        };
        self.store.create_transaction(&transaction).await?;

        let request = ChargeRequest::for_subscription(
            account.amount_cents,
            &account.currency,
            &account.payment_method_id,
            "subscription_renewal",
            &account.subscription_id,
        );
        // A timeout or API error propagates with the transaction still
        // pending: nothing is assumed about the charge, and the account
        // stays due so the next sweep retries it.
        let outcome = call_with_timeout(
            PROCESSOR_CALL_TIMEOUT,
            self.processor.process_payment(&request),
        )
        .await?;

        match outcome {
            ChargeOutcome::Succeeded {
                processor_transaction_id,
                fee_cents,
            } => {
                transaction.status = TransactionStatus::Completed;
                transaction.processor_transaction_id = Some(processor_transaction_id);
                transaction.fee_cents = fee_cents;
                transaction.net_cents = transaction.amount_cents - fee_cents;
                transaction.updated_at = now;
                self.store.update_transaction(&transaction).await?;

                let expected = account.status;
                let mut renewed = account.clone();
                renewed.status = AccountStatus::Active;
                renewed.trial_ends_at = None;
                renewed.next_billing_date =
                    account.next_billing_date + account.billing_cycle.period();
                renewed.payment_history.push(transaction.transaction_id);
                renewed.updated_at = now;
                if !self
                    .store
                    .update_billing_account_if_status(&renewed, expected)
                    .await?
                {
                    return Err(BillingError::ConcurrentModification(format!(
                        "billing account {} changed during renewal",
                        account.billing_id
                    )));
                }

                if let Some(plan) = self.catalog.plan(&account.plan_id) {
                    self.store
                        .update_user_membership(
                            account.user_id,
                            &MembershipUpdate {
                                membership_tier: plan.tier,
                                premium_expires_at: Some(renewed.next_billing_date),
                            },
                        )
                        .await?;
                }

                // A past_due account recovering through the renewal path
                // closes its dunning thread here.
                self.failures.resolve_open_failure(account.billing_id).await?;

                self.log_event(
                    BillingEventBuilder::new(account.user_id, BillingEventType::RenewalSucceeded)
                        .billing_account(account.billing_id)
                        .data(serde_json::json!({
                            "transactionId": transaction.transaction_id,
                            "amountCents": transaction.amount_cents,
                            "nextBillingDate": renewed.next_billing_date.unix_timestamp(),
                        })),
                )
                .await;

                Ok(RenewalOutcome::Renewed)
            }
            ChargeOutcome::Failed {
                processor_transaction_id,
                code,
                message,
            } => {
                transaction.status = TransactionStatus::Failed;
                transaction.processor_transaction_id = Some(processor_transaction_id);
                transaction.updated_at = now;
                self.store.update_transaction(&transaction).await?;

                tracing::warn!(
                    billing_id = %account.billing_id,
                    code = %code,
                    "Renewal charge declined; opening dunning thread"
                );

                self.log_event(
                    BillingEventBuilder::new(account.user_id, BillingEventType::RenewalFailed)
                        .billing_account(account.billing_id)
                        .data(serde_json::json!({
                            "transactionId": transaction.transaction_id,
                            "code": code,
                        })),
                )
                .await;

                // The dunning handler owns the past_due transition and the
                // retry schedule.
                self.failures
                    .handle_payment_failure(
                        transaction.transaction_id,
                        account.billing_id,
                        FailureReason::from_processor_code(&code),
                        &message,
                    )
                    .await?;

                Ok(RenewalOutcome::Declined)
            }
        }
    }

    /// Refund a completed charge, in full by default.
    pub async fn refund_transaction(
        &self,
        transaction_id: Uuid,
        amount_cents: Option<i64>,
        reason: &str,
    ) -> BillingResult<Transaction> {
        let mut original = self
            .store
            .get_transaction(transaction_id)
            .await?
            .ok_or_else(|| BillingError::TransactionNotFound(transaction_id.to_string()))?;

        if !original.status.can_transition_to(TransactionStatus::Refunded) {
            return Err(BillingError::Validation(format!(
                "transaction {transaction_id} is {}, only completed charges can be refunded",
                original.status
            )));
        }
        let processor_transaction_id =
            original.processor_transaction_id.clone().ok_or_else(|| {
                BillingError::Validation(format!(
                    "transaction {transaction_id} has no processor reference"
                ))
            })?;

        let amount = amount_cents.unwrap_or(original.amount_cents);
        if amount <= 0 || amount > original.amount_cents {
            return Err(BillingError::Validation(format!(
                "refund amount {amount} out of range for transaction of {}",
                original.amount_cents
            )));
        }

        call_with_timeout(
            PROCESSOR_CALL_TIMEOUT,
            self.processor
                .process_refund(&processor_transaction_id, amount, reason),
        )
        .await?;

        let now = OffsetDateTime::now_utc();
        original.status = TransactionStatus::Refunded;
        original.updated_at = now;
        self.store.update_transaction(&original).await?;

        let refund = Transaction {
            transaction_id: Uuid::new_v4(),
            billing_account_id: original.billing_account_id,
            user_id: original.user_id,
            transaction_type: TransactionType::Refund,
            amount_cents: amount,
            currency: original.currency.clone(),
            status: TransactionStatus::Completed,
            processor_transaction_id: Some(processor_transaction_id),
            fee_cents: 0,
            net_cents: -amount,
            description: format!("Refund of {transaction_id}: {reason}"),
            created_at: now,
            updated_at: now,
        };
        self.store.create_transaction(&refund).await?;

        self.log_event(
            BillingEventBuilder::new(original.user_id, BillingEventType::RefundIssued)
                .billing_account(original.billing_account_id)
                .data(serde_json::json!({
                    "originalTransactionId": transaction_id,
                    "refundTransactionId": refund.transaction_id,
                    "amountCents": amount,
                    "reason": reason,
                })),
        )
        .await;

        tracing::info!(
            transaction_id = %transaction_id,
            refund_id = %refund.transaction_id,
            amount_cents = amount,
            "Refund issued"
        );

        Ok(refund)
    }

    async fn log_event(&self, builder: BillingEventBuilder) {
        if let Err(error) = self.event_logger.log_event(builder).await {
            tracing::warn!(error = %error, "Failed to record billing audit event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dunning::DunningConfig;
    use crate::memory::MemoryBillingStore;
    use crate::model::UserProfile;
    use crate::processor::ProcessorError;
    use crate::sandbox::{SandboxCall, SandboxProcessor};

    fn test_profile(user_id: Uuid) -> UserProfile {
        UserProfile {
            user_id,
            email: "skipper@example.com".into(),
            name: "Skipper".into(),
            membership_tier: MembershipTier::Free,
            premium_expires_at: None,
        }
    }

    struct Harness {
        manager: SubscriptionManager,
        store: Arc<MemoryBillingStore>,
        sandbox: Arc<SandboxProcessor>,
        user_id: Uuid,
    }

    fn harness() -> Harness {
        let user_id = Uuid::new_v4();
        let store = Arc::new(MemoryBillingStore::new().with_user(test_profile(user_id)));
        let sandbox = Arc::new(SandboxProcessor::new("whsec_test"));
        let catalog = Arc::new(SubscriptionCatalog::standard());
        let failures =
            PaymentFailureHandler::new(sandbox.clone(), store.clone(), DunningConfig::default());
        let manager = SubscriptionManager::new(sandbox.clone(), store.clone(), catalog, failures);
        Harness {
            manager,
            store,
            sandbox,
            user_id,
        }
    }

    fn monthly_params(plan_id: &str) -> CreateSubscriptionParams {
        CreateSubscriptionParams {
            plan_id: plan_id.into(),
            billing_cycle: BillingCycle::Monthly,
            trial_days: None,
            payment_method_id: Some("pm_test123".into()),
        }
    }

    #[test]
    fn proration_formula() {
        // Upgrade: 15 of 30 days left, $29.99 -> $99.99, half the delta.
        assert_eq!(prorated_amount_cents(15, 30, 9999, 2999), 3500);
        // Downgrade yields a credit.
        assert_eq!(prorated_amount_cents(15, 30, 2999, 9999), -3500);
        // Rounds to the nearest cent: 10/30 * 500 = 166.67.
        assert_eq!(prorated_amount_cents(10, 30, 1500, 1000), 167);
        // Days are clamped to the cycle.
        assert_eq!(prorated_amount_cents(-3, 30, 9999, 2999), 0);
        assert_eq!(prorated_amount_cents(45, 30, 9999, 2999), 7000);
    }

    #[tokio::test]
    async fn create_subscription_persists_account_and_tier() {
        let h = harness();
        let created = h
            .manager
            .create_subscription(h.user_id, monthly_params("premium_individual"))
            .await
            .unwrap();

        assert_eq!(created.plan_id, "premium_individual");
        assert_eq!(created.amount_cents, 2999);
        assert_eq!(created.status, AccountStatus::Active);

        let account = h
            .store
            .get_billing_account_by_user(h.user_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(account.plan_id, "premium_individual");
        assert_eq!(account.amount_cents, 2999);
        assert_eq!(account.payment_method_id, "pm_test123");

        let profile = h.store.get_user_profile(h.user_id).await.unwrap().unwrap();
        assert_eq!(profile.membership_tier, MembershipTier::PremiumIndividual);
        assert!(profile.premium_expires_at.is_some());
    }

    #[tokio::test]
    async fn create_subscription_with_trial_is_trialing() {
        let h = harness();
        let created = h
            .manager
            .create_subscription(
                h.user_id,
                CreateSubscriptionParams {
                    trial_days: Some(14),
                    ..monthly_params("premium_dealer")
                },
            )
            .await
            .unwrap();

        assert_eq!(created.status, AccountStatus::Trialing);
        let trial_end = created.trial_ends_at.unwrap();
        // The first charge lands at trial conversion.
        assert_eq!(created.next_billing_date, trial_end);
    }

    #[tokio::test]
    async fn create_subscription_rejects_unknown_and_retired_plans() {
        let h = harness();
        let err = h
            .manager
            .create_subscription(h.user_id, monthly_params("platinum_yacht"))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::PlanNotFound(_)));

        let err = h
            .manager
            .create_subscription(h.user_id, monthly_params("premium_individual_legacy"))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));
    }

    #[tokio::test]
    async fn create_subscription_requires_known_user_and_payment_method() {
        let h = harness();
        let err = h
            .manager
            .create_subscription(Uuid::new_v4(), monthly_params("premium_individual"))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::UserNotFound(_)));

        let err = h
            .manager
            .create_subscription(
                h.user_id,
                CreateSubscriptionParams {
                    payment_method_id: None,
                    ..monthly_params("premium_individual")
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));
    }

    #[tokio::test]
    async fn create_subscription_rejects_duplicate_live_subscription() {
        let h = harness();
        h.manager
            .create_subscription(h.user_id, monthly_params("premium_individual"))
            .await
            .unwrap();

        let err = h
            .manager
            .create_subscription(h.user_id, monthly_params("premium_dealer"))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));
    }

    #[tokio::test]
    async fn processor_failure_leaves_no_partial_state() {
        let h = harness();
        h.sandbox
            .fail_next_subscription_create(ProcessorError::Api("gateway down".into()));

        let err = h
            .manager
            .create_subscription(h.user_id, monthly_params("premium_individual"))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Processor(_)));

        assert!(h
            .store
            .get_billing_account_by_user(h.user_id)
            .await
            .unwrap()
            .is_none());
        let profile = h.store.get_user_profile(h.user_id).await.unwrap().unwrap();
        assert_eq!(profile.membership_tier, MembershipTier::Free);
    }

    #[tokio::test]
    async fn plan_upgrade_prorates_and_persists() {
        let h = harness();
        let created = h
            .manager
            .create_subscription(h.user_id, monthly_params("premium_individual"))
            .await
            .unwrap();

        let update = h
            .manager
            .update_subscription(
                &created.subscription_id,
                UpdateSubscriptionParams {
                    plan_id: Some("premium_dealer".into()),
                    ..UpdateSubscriptionParams::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(update.plan_id, "premium_dealer");
        assert_eq!(update.amount_cents, 9999);
        // A full cycle remains, so the entire price delta is owed.
        assert_eq!(update.prorated_amount_cents, Some(9999 - 2999));

        let account = h
            .store
            .get_billing_account_by_user(h.user_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(account.plan_id, "premium_dealer");
        assert_eq!(account.amount_cents, 9999);

        // The processor saw the new price reference.
        assert!(h.sandbox.recorded_calls().iter().any(|call| matches!(
            call,
            SandboxCall::UpdateSubscription { price_ref: Some(p), .. }
                if p == "price_premium_dealer_monthly"
        )));
    }

    #[tokio::test]
    async fn update_unknown_subscription_fails() {
        let h = harness();
        let err = h
            .manager
            .update_subscription("sub_missing", UpdateSubscriptionParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::BillingAccountNotFound(_)));
    }

    #[tokio::test]
    async fn immediate_cancel_hard_stops_and_revokes_tier() {
        let h = harness();
        let created = h
            .manager
            .create_subscription(h.user_id, monthly_params("premium_individual"))
            .await
            .unwrap();

        let update = h
            .manager
            .cancel_subscription(&created.subscription_id, true)
            .await
            .unwrap();
        assert_eq!(update.status, AccountStatus::Canceled);

        let account = h
            .store
            .get_billing_account_by_user(h.user_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(account.status, AccountStatus::Canceled);
        assert!(account.canceled_at.is_some());
        assert!(!account.has_access(OffsetDateTime::now_utc() + time::Duration::minutes(1)));

        let profile = h.store.get_user_profile(h.user_id).await.unwrap().unwrap();
        assert_eq!(profile.membership_tier, MembershipTier::Free);

        assert!(h.sandbox.recorded_calls().iter().any(|call| matches!(
            call,
            SandboxCall::CancelSubscription { subscription_id }
                if *subscription_id == created.subscription_id
        )));
    }

    #[tokio::test]
    async fn end_of_period_cancel_keeps_access_until_cutoff() {
        let h = harness();
        let created = h
            .manager
            .create_subscription(h.user_id, monthly_params("premium_individual"))
            .await
            .unwrap();

        h.manager
            .cancel_subscription(&created.subscription_id, false)
            .await
            .unwrap();

        let account = h
            .store
            .get_billing_account_by_user(h.user_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(account.status, AccountStatus::Canceled);
        // The paid-for remainder is still honored.
        assert_eq!(account.next_billing_date, created.next_billing_date);
        assert!(account.has_access(OffsetDateTime::now_utc()));

        // Processor was flagged, not hard-stopped.
        assert!(h.sandbox.recorded_calls().iter().any(|call| matches!(
            call,
            SandboxCall::UpdateSubscription { cancel_at_period_end: Some(true), .. }
        )));
        assert!(!h
            .sandbox
            .recorded_calls()
            .iter()
            .any(|call| matches!(call, SandboxCall::CancelSubscription { .. })));
    }

    #[tokio::test]
    async fn cancel_twice_is_rejected() {
        let h = harness();
        let created = h
            .manager
            .create_subscription(h.user_id, monthly_params("premium_individual"))
            .await
            .unwrap();
        h.manager
            .cancel_subscription(&created.subscription_id, true)
            .await
            .unwrap();

        let err = h
            .manager
            .cancel_subscription(&created.subscription_id, true)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));
    }

    async fn make_due(store: &MemoryBillingStore, user_id: Uuid) -> BillingAccount {
        let mut account = store
            .get_billing_account_by_user(user_id)
            .await
            .unwrap()
            .unwrap();
        account.next_billing_date = OffsetDateTime::now_utc() - time::Duration::days(1);
        store.update_billing_account(&account).await.unwrap();
        account
    }

    #[tokio::test]
    async fn renewal_sweep_advances_due_accounts() {
        let h = harness();
        h.manager
            .create_subscription(h.user_id, monthly_params("premium_individual"))
            .await
            .unwrap();
        let before = make_due(&h.store, h.user_id).await;

        let summary = h.manager.process_automatic_renewals().await.unwrap();
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.renewed, 1);
        assert_eq!(summary.errors, 0);

        let account = h
            .store
            .get_billing_account_by_user(h.user_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(account.status, AccountStatus::Active);
        assert_eq!(
            account.next_billing_date,
            before.next_billing_date + time::Duration::days(30)
        );
        assert_eq!(account.payment_history.len(), 1);

        let transactions = h.store.transactions();
        assert_eq!(transactions.len(), 1);
        assert_eq!(transactions[0].status, TransactionStatus::Completed);
        assert_eq!(
            transactions[0].transaction_type,
            TransactionType::SubscriptionRenewal
        );
        assert!(transactions[0].processor_transaction_id.is_some());
    }

    #[tokio::test]
    async fn declined_renewal_goes_past_due_with_one_failure_thread() {
        let h = harness();
        h.manager
            .create_subscription(h.user_id, monthly_params("premium_individual"))
            .await
            .unwrap();
        make_due(&h.store, h.user_id).await;
        h.sandbox
            .decline_payments_for("pm_test123", "card_declined", "Card was declined");

        let summary = h.manager.process_automatic_renewals().await.unwrap();
        assert_eq!(summary.failures, 1);
        assert_eq!(summary.renewed, 0);

        let account = h
            .store
            .get_billing_account_by_user(h.user_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(account.status, AccountStatus::PastDue);

        let failures = h.store.payment_failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].attempt_number, 1);
        assert_eq!(failures[0].reason, FailureReason::CardDeclined);

        // A second sweep must not fork a second dunning thread.
        let summary = h.manager.process_automatic_renewals().await.unwrap();
        assert_eq!(summary.failures, 1);
        assert_eq!(h.store.payment_failures().len(), 1);
    }

    #[tokio::test]
    async fn sweep_isolates_per_account_errors() {
        // Three users: one renews fine, one hits a gateway error, one
        // declines. The sweep must handle all three in one pass.
        let ok_user = Uuid::new_v4();
        let err_user = Uuid::new_v4();
        let declined_user = Uuid::new_v4();
        let store = Arc::new(
            MemoryBillingStore::new()
                .with_user(test_profile(ok_user))
                .with_user(UserProfile {
                    email: "e@example.com".into(),
                    ..test_profile(err_user)
                })
                .with_user(UserProfile {
                    email: "d@example.com".into(),
                    ..test_profile(declined_user)
                }),
        );
        let sandbox = Arc::new(SandboxProcessor::new("whsec_test"));
        let failures =
            PaymentFailureHandler::new(sandbox.clone(), store.clone(), DunningConfig::default());
        let manager = SubscriptionManager::new(
            sandbox.clone(),
            store.clone(),
            Arc::new(SubscriptionCatalog::standard()),
            failures,
        );

        for (user, pm) in [
            (ok_user, "pm_ok"),
            (err_user, "pm_err"),
            (declined_user, "pm_declined"),
        ] {
            manager
                .create_subscription(
                    user,
                    CreateSubscriptionParams {
                        payment_method_id: Some(pm.into()),
                        ..monthly_params("premium_individual")
                    },
                )
                .await
                .unwrap();
            make_due(&store, user).await;
        }
        sandbox.error_payments_for("pm_err", ProcessorError::Api("gateway 503".into()));
        sandbox.decline_payments_for("pm_declined", "insufficient_funds", "No funds");

        let summary = manager.process_automatic_renewals().await.unwrap();
        assert_eq!(summary.processed, 3);
        assert_eq!(summary.renewed, 1);
        assert_eq!(summary.failures, 1);
        assert_eq!(summary.errors, 1);

        // The healthy account advanced despite its neighbors.
        let ok_account = store
            .get_billing_account_by_user(ok_user)
            .await
            .unwrap()
            .unwrap();
        assert!(ok_account.next_billing_date > OffsetDateTime::now_utc());

        // The errored account is untouched and still due for the next sweep.
        let err_account = store
            .get_billing_account_by_user(err_user)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(err_account.status, AccountStatus::Active);
        assert!(err_account.next_billing_date < OffsetDateTime::now_utc());
    }

    #[tokio::test]
    async fn refund_flips_transaction_and_records_refund_row() {
        let h = harness();
        h.manager
            .create_subscription(h.user_id, monthly_params("premium_individual"))
            .await
            .unwrap();
        make_due(&h.store, h.user_id).await;
        h.manager.process_automatic_renewals().await.unwrap();

        let charge = h.store.transactions().remove(0);
        let refund = h
            .manager
            .refund_transaction(charge.transaction_id, None, "requested_by_customer")
            .await
            .unwrap();

        assert_eq!(refund.transaction_type, TransactionType::Refund);
        assert_eq!(refund.amount_cents, charge.amount_cents);
        assert_eq!(refund.net_cents, -charge.amount_cents);

        let original = h
            .store
            .get_transaction(charge.transaction_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(original.status, TransactionStatus::Refunded);

        // Refunded transactions cannot be refunded again.
        let err = h
            .manager
            .refund_transaction(charge.transaction_id, None, "again")
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));
    }

    #[tokio::test]
    async fn refund_validates_amount_and_existence() {
        let h = harness();
        let err = h
            .manager
            .refund_transaction(Uuid::new_v4(), None, "x")
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::TransactionNotFound(_)));

        h.manager
            .create_subscription(h.user_id, monthly_params("premium_individual"))
            .await
            .unwrap();
        make_due(&h.store, h.user_id).await;
        h.manager.process_automatic_renewals().await.unwrap();
        let charge = h.store.transactions().remove(0);

        let err = h
            .manager
            .refund_transaction(charge.transaction_id, Some(charge.amount_cents + 1), "x")
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));
    }

    #[tokio::test]
    async fn catalog_lookups_never_fail() {
        let h = harness();
        assert!(h.manager.get_subscription_plan("premium_individual").is_some());
        assert!(h.manager.get_subscription_plan("nope").is_none());
        assert!(!h.manager.get_active_subscription_plans().is_empty());
    }
}
