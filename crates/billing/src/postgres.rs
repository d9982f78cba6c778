//! Postgres-backed [`BillingStore`].
//!
//! Statuses and enums persist as their snake_case strings; timestamps as
//! TIMESTAMPTZ. The two concurrency-sensitive operations map onto single
//! statements: the conditional account write guards on `status` in the
//! UPDATE's WHERE clause, and the webhook claim is an
//! `INSERT .. ON CONFLICT .. RETURNING` so two concurrent deliveries of the
//! same event can never both claim it.

use async_trait::async_trait;
use sqlx::{FromRow, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::events::BillingEvent;
use crate::model::{
    AccountStatus, BillingAccount, BillingCycle, DisputeCase, DisputeStatus, DisputeType,
    FailureReason, MembershipTier, MembershipUpdate, PaymentFailure, ProcessedWebhookEvent,
    ProcessorType, Transaction, TransactionStatus, TransactionType, UserProfile,
};
use crate::store::{BillingStore, WebhookClaim};

pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn bad_column(column: &str, value: &str) -> BillingError {
    BillingError::Storage(format!("unrecognized {column} value in row: {value}"))
}

#[derive(Debug, FromRow)]
struct BillingAccountRow {
    billing_id: Uuid,
    user_id: Uuid,
    customer_id: String,
    payment_method_id: String,
    plan_id: String,
    amount_cents: i64,
    currency: String,
    status: String,
    subscription_id: String,
    billing_cycle: String,
    next_billing_date: OffsetDateTime,
    trial_ends_at: Option<OffsetDateTime>,
    canceled_at: Option<OffsetDateTime>,
    payment_history: Vec<Uuid>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl BillingAccountRow {
    fn into_model(self) -> BillingResult<BillingAccount> {
        Ok(BillingAccount {
            billing_id: self.billing_id,
            user_id: self.user_id,
            customer_id: self.customer_id,
            payment_method_id: self.payment_method_id,
            plan_id: self.plan_id,
            amount_cents: self.amount_cents,
            currency: self.currency,
            status: AccountStatus::from_str(&self.status)
                .ok_or_else(|| bad_column("status", &self.status))?,
            subscription_id: self.subscription_id,
            billing_cycle: BillingCycle::from_str(&self.billing_cycle)
                .ok_or_else(|| bad_column("billing_cycle", &self.billing_cycle))?,
            next_billing_date: self.next_billing_date,
            trial_ends_at: self.trial_ends_at,
            canceled_at: self.canceled_at,
            payment_history: self.payment_history,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

const SELECT_BILLING_ACCOUNT: &str = r#"
    SELECT billing_id, user_id, customer_id, payment_method_id, plan_id,
           amount_cents, currency, status, subscription_id, billing_cycle,
           next_billing_date, trial_ends_at, canceled_at, payment_history,
           created_at, updated_at
    FROM billing_accounts
"#;

#[derive(Debug, FromRow)]
struct TransactionRow {
    transaction_id: Uuid,
    billing_account_id: Uuid,
    user_id: Uuid,
    transaction_type: String,
    amount_cents: i64,
    currency: String,
    status: String,
    processor_transaction_id: Option<String>,
    fee_cents: i64,
    net_cents: i64,
    description: String,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TransactionRow {
    fn into_model(self) -> BillingResult<Transaction> {
        Ok(Transaction {
            transaction_id: self.transaction_id,
            billing_account_id: self.billing_account_id,
            user_id: self.user_id,
            transaction_type: TransactionType::from_str(&self.transaction_type)
                .ok_or_else(|| bad_column("transaction_type", &self.transaction_type))?,
            amount_cents: self.amount_cents,
            currency: self.currency,
            status: TransactionStatus::from_str(&self.status)
                .ok_or_else(|| bad_column("status", &self.status))?,
            processor_transaction_id: self.processor_transaction_id,
            fee_cents: self.fee_cents,
            net_cents: self.net_cents,
            description: self.description,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

const SELECT_TRANSACTION: &str = r#"
    SELECT transaction_id, billing_account_id, user_id, transaction_type,
           amount_cents, currency, status, processor_transaction_id,
           fee_cents, net_cents, description, created_at, updated_at
    FROM transactions
"#;

#[derive(Debug, FromRow)]
struct PaymentFailureRow {
    failure_id: Uuid,
    transaction_id: Uuid,
    billing_account_id: Uuid,
    user_id: Uuid,
    amount_cents: i64,
    currency: String,
    reason: String,
    message: String,
    attempt_number: i32,
    max_attempts: i32,
    next_retry_at: Option<OffsetDateTime>,
    grace_period_ends: OffsetDateTime,
    resolved: bool,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl PaymentFailureRow {
    fn into_model(self) -> BillingResult<PaymentFailure> {
        Ok(PaymentFailure {
            failure_id: self.failure_id,
            transaction_id: self.transaction_id,
            billing_account_id: self.billing_account_id,
            user_id: self.user_id,
            amount_cents: self.amount_cents,
            currency: self.currency,
            reason: FailureReason::from_str(&self.reason)
                .ok_or_else(|| bad_column("reason", &self.reason))?,
            message: self.message,
            attempt_number: u32::try_from(self.attempt_number)
                .map_err(|_| bad_column("attempt_number", &self.attempt_number.to_string()))?,
            max_attempts: u32::try_from(self.max_attempts)
                .map_err(|_| bad_column("max_attempts", &self.max_attempts.to_string()))?,
            next_retry_at: self.next_retry_at,
            grace_period_ends: self.grace_period_ends,
            resolved: self.resolved,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

const SELECT_PAYMENT_FAILURE: &str = r#"
    SELECT failure_id, transaction_id, billing_account_id, user_id,
           amount_cents, currency, reason, message, attempt_number,
           max_attempts, next_retry_at, grace_period_ends, resolved,
           created_at, updated_at
    FROM payment_failures
"#;

#[derive(Debug, FromRow)]
struct DisputeCaseRow {
    dispute_id: Uuid,
    transaction_id: Uuid,
    dispute_type: String,
    dispute_amount_cents: i64,
    currency: String,
    evidence: Vec<String>,
    evidence_due_by: OffsetDateTime,
    status: String,
    created_at: OffsetDateTime,
}

impl DisputeCaseRow {
    fn into_model(self) -> BillingResult<DisputeCase> {
        Ok(DisputeCase {
            dispute_id: self.dispute_id,
            transaction_id: self.transaction_id,
            dispute_type: DisputeType::from_str(&self.dispute_type)
                .ok_or_else(|| bad_column("dispute_type", &self.dispute_type))?,
            dispute_amount_cents: self.dispute_amount_cents,
            currency: self.currency,
            evidence: self.evidence,
            evidence_due_by: self.evidence_due_by,
            status: DisputeStatus::from_str(&self.status)
                .ok_or_else(|| bad_column("status", &self.status))?,
            created_at: self.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct WebhookEventRow {
    event_id: String,
    processor_type: String,
    event_type: String,
    processed: bool,
    processed_at: Option<OffsetDateTime>,
    retry_count: i32,
    max_retries: i32,
    last_error: Option<String>,
    created_at: OffsetDateTime,
}

impl WebhookEventRow {
    fn into_model(self) -> BillingResult<ProcessedWebhookEvent> {
        Ok(ProcessedWebhookEvent {
            event_id: self.event_id,
            processor_type: ProcessorType::from_str(&self.processor_type)
                .ok_or_else(|| bad_column("processor_type", &self.processor_type))?,
            event_type: self.event_type,
            processed: self.processed,
            processed_at: self.processed_at,
            retry_count: u32::try_from(self.retry_count)
                .map_err(|_| bad_column("retry_count", &self.retry_count.to_string()))?,
            max_retries: u32::try_from(self.max_retries)
                .map_err(|_| bad_column("max_retries", &self.max_retries.to_string()))?,
            last_error: self.last_error,
            created_at: self.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct UserProfileRow {
    user_id: Uuid,
    email: String,
    name: String,
    membership_tier: String,
    premium_expires_at: Option<OffsetDateTime>,
}

impl UserProfileRow {
    fn into_model(self) -> BillingResult<UserProfile> {
        Ok(UserProfile {
            user_id: self.user_id,
            email: self.email,
            name: self.name,
            membership_tier: MembershipTier::from_str(&self.membership_tier)
                .ok_or_else(|| bad_column("membership_tier", &self.membership_tier))?,
            premium_expires_at: self.premium_expires_at,
        })
    }
}

#[async_trait]
impl BillingStore for PgBillingStore {
    async fn create_billing_account(&self, account: &BillingAccount) -> BillingResult<()> {
        // A partial unique index on (user_id) WHERE status != 'canceled'
        // rejects a second live account per user.
        sqlx::query(
            r#"
            INSERT INTO billing_accounts
                (billing_id, user_id, customer_id, payment_method_id, plan_id,
                 amount_cents, currency, status, subscription_id, billing_cycle,
                 next_billing_date, trial_ends_at, canceled_at, payment_history,
                 created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(account.billing_id)
        .bind(account.user_id)
        .bind(&account.customer_id)
        .bind(&account.payment_method_id)
        .bind(&account.plan_id)
        .bind(account.amount_cents)
        .bind(&account.currency)
        .bind(account.status.as_str())
        .bind(&account.subscription_id)
        .bind(account.billing_cycle.as_str())
        .bind(account.next_billing_date)
        .bind(account.trial_ends_at)
        .bind(account.canceled_at)
        .bind(&account.payment_history)
        .bind(account.created_at)
        .bind(account.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_billing_account(
        &self,
        billing_id: Uuid,
    ) -> BillingResult<Option<BillingAccount>> {
        let row: Option<BillingAccountRow> =
            sqlx::query_as(&format!("{SELECT_BILLING_ACCOUNT} WHERE billing_id = $1"))
                .bind(billing_id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(BillingAccountRow::into_model).transpose()
    }

    async fn get_billing_account_by_user(
        &self,
        user_id: Uuid,
    ) -> BillingResult<Option<BillingAccount>> {
        // Prefer the live account; fall back to the most recently canceled
        // one so post-cancellation reads still see the access cutoff.
        let row: Option<BillingAccountRow> = sqlx::query_as(&format!(
            r#"{SELECT_BILLING_ACCOUNT}
            WHERE user_id = $1
            ORDER BY (status != 'canceled') DESC, created_at DESC
            LIMIT 1"#
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(BillingAccountRow::into_model).transpose()
    }

    async fn get_billing_account_by_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Option<BillingAccount>> {
        let row: Option<BillingAccountRow> = sqlx::query_as(&format!(
            "{SELECT_BILLING_ACCOUNT} WHERE subscription_id = $1"
        ))
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(BillingAccountRow::into_model).transpose()
    }

    async fn update_billing_account(&self, account: &BillingAccount) -> BillingResult<()> {
        let rows_affected = sqlx::query(
            r#"
            UPDATE billing_accounts SET
                payment_method_id = $1,
                plan_id = $2,
                amount_cents = $3,
                currency = $4,
                status = $5,
                subscription_id = $6,
                billing_cycle = $7,
                next_billing_date = $8,
                trial_ends_at = $9,
                canceled_at = $10,
                payment_history = $11,
                updated_at = $12
            WHERE billing_id = $13
            "#,
        )
        .bind(&account.payment_method_id)
        .bind(&account.plan_id)
        .bind(account.amount_cents)
        .bind(&account.currency)
        .bind(account.status.as_str())
        .bind(&account.subscription_id)
        .bind(account.billing_cycle.as_str())
        .bind(account.next_billing_date)
        .bind(account.trial_ends_at)
        .bind(account.canceled_at)
        .bind(&account.payment_history)
        .bind(account.updated_at)
        .bind(account.billing_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Err(BillingError::BillingAccountNotFound(
                account.billing_id.to_string(),
            ));
        }
        Ok(())
    }

    async fn update_billing_account_if_status(
        &self,
        account: &BillingAccount,
        expected: AccountStatus,
    ) -> BillingResult<bool> {
        let rows_affected = sqlx::query(
            r#"
            UPDATE billing_accounts SET
                payment_method_id = $1,
                plan_id = $2,
                amount_cents = $3,
                currency = $4,
                status = $5,
                subscription_id = $6,
                billing_cycle = $7,
                next_billing_date = $8,
                trial_ends_at = $9,
                canceled_at = $10,
                payment_history = $11,
                updated_at = $12
            WHERE billing_id = $13 AND status = $14
            "#,
        )
        .bind(&account.payment_method_id)
        .bind(&account.plan_id)
        .bind(account.amount_cents)
        .bind(&account.currency)
        .bind(account.status.as_str())
        .bind(&account.subscription_id)
        .bind(account.billing_cycle.as_str())
        .bind(account.next_billing_date)
        .bind(account.trial_ends_at)
        .bind(account.canceled_at)
        .bind(&account.payment_history)
        .bind(account.updated_at)
        .bind(account.billing_id)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows_affected > 0)
    }

    async fn accounts_due_for_renewal(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<BillingAccount>> {
        let rows: Vec<BillingAccountRow> = sqlx::query_as(&format!(
            r#"{SELECT_BILLING_ACCOUNT}
            WHERE next_billing_date <= $1 AND status != 'canceled'
            ORDER BY next_billing_date"#
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(BillingAccountRow::into_model)
            .collect()
    }

    async fn create_transaction(&self, transaction: &Transaction) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO transactions
                (transaction_id, billing_account_id, user_id, transaction_type,
                 amount_cents, currency, status, processor_transaction_id,
                 fee_cents, net_cents, description, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(transaction.transaction_id)
        .bind(transaction.billing_account_id)
        .bind(transaction.user_id)
        .bind(transaction.transaction_type.as_str())
        .bind(transaction.amount_cents)
        .bind(&transaction.currency)
        .bind(transaction.status.as_str())
        .bind(&transaction.processor_transaction_id)
        .bind(transaction.fee_cents)
        .bind(transaction.net_cents)
        .bind(&transaction.description)
        .bind(transaction.created_at)
        .bind(transaction.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_transaction(&self, transaction_id: Uuid) -> BillingResult<Option<Transaction>> {
        let row: Option<TransactionRow> =
            sqlx::query_as(&format!("{SELECT_TRANSACTION} WHERE transaction_id = $1"))
                .bind(transaction_id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(TransactionRow::into_model).transpose()
    }

    async fn get_transaction_by_processor_id(
        &self,
        processor_transaction_id: &str,
    ) -> BillingResult<Option<Transaction>> {
        let row: Option<TransactionRow> = sqlx::query_as(&format!(
            r#"{SELECT_TRANSACTION}
            WHERE processor_transaction_id = $1
            ORDER BY created_at DESC
            LIMIT 1"#
        ))
        .bind(processor_transaction_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(TransactionRow::into_model).transpose()
    }

    async fn update_transaction(&self, transaction: &Transaction) -> BillingResult<()> {
        let rows_affected = sqlx::query(
            r#"
            UPDATE transactions SET
                status = $1,
                processor_transaction_id = $2,
                fee_cents = $3,
                net_cents = $4,
                description = $5,
                updated_at = $6
            WHERE transaction_id = $7
            "#,
        )
        .bind(transaction.status.as_str())
        .bind(&transaction.processor_transaction_id)
        .bind(transaction.fee_cents)
        .bind(transaction.net_cents)
        .bind(&transaction.description)
        .bind(transaction.updated_at)
        .bind(transaction.transaction_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Err(BillingError::TransactionNotFound(
                transaction.transaction_id.to_string(),
            ));
        }
        Ok(())
    }

    async fn create_payment_failure(&self, failure: &PaymentFailure) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO payment_failures
                (failure_id, transaction_id, billing_account_id, user_id,
                 amount_cents, currency, reason, message, attempt_number,
                 max_attempts, next_retry_at, grace_period_ends, resolved,
                 created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(failure.failure_id)
        .bind(failure.transaction_id)
        .bind(failure.billing_account_id)
        .bind(failure.user_id)
        .bind(failure.amount_cents)
        .bind(&failure.currency)
        .bind(failure.reason.as_str())
        .bind(&failure.message)
        .bind(failure.attempt_number as i32)
        .bind(failure.max_attempts as i32)
        .bind(failure.next_retry_at)
        .bind(failure.grace_period_ends)
        .bind(failure.resolved)
        .bind(failure.created_at)
        .bind(failure.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_payment_failure(
        &self,
        failure_id: Uuid,
    ) -> BillingResult<Option<PaymentFailure>> {
        let row: Option<PaymentFailureRow> =
            sqlx::query_as(&format!("{SELECT_PAYMENT_FAILURE} WHERE failure_id = $1"))
                .bind(failure_id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(PaymentFailureRow::into_model).transpose()
    }

    async fn get_open_payment_failure_for_account(
        &self,
        billing_account_id: Uuid,
    ) -> BillingResult<Option<PaymentFailure>> {
        let row: Option<PaymentFailureRow> = sqlx::query_as(&format!(
            r#"{SELECT_PAYMENT_FAILURE}
            WHERE billing_account_id = $1 AND resolved = false
            ORDER BY created_at DESC
            LIMIT 1"#
        ))
        .bind(billing_account_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(PaymentFailureRow::into_model).transpose()
    }

    async fn update_payment_failure(&self, failure: &PaymentFailure) -> BillingResult<()> {
        let rows_affected = sqlx::query(
            r#"
            UPDATE payment_failures SET
                attempt_number = $1,
                next_retry_at = $2,
                resolved = $3,
                updated_at = $4
            WHERE failure_id = $5
            "#,
        )
        .bind(failure.attempt_number as i32)
        .bind(failure.next_retry_at)
        .bind(failure.resolved)
        .bind(failure.updated_at)
        .bind(failure.failure_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Err(BillingError::Storage(format!(
                "payment failure {} not found",
                failure.failure_id
            )));
        }
        Ok(())
    }

    async fn failures_due_for_retry(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<PaymentFailure>> {
        // Exhausted threads have next_retry_at = NULL and never match.
        let rows: Vec<PaymentFailureRow> = sqlx::query_as(&format!(
            r#"{SELECT_PAYMENT_FAILURE}
            WHERE resolved = false AND next_retry_at IS NOT NULL AND next_retry_at <= $1
            ORDER BY next_retry_at"#
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(PaymentFailureRow::into_model)
            .collect()
    }

    async fn create_dispute_case(&self, case: &DisputeCase) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO dispute_cases
                (dispute_id, transaction_id, dispute_type, dispute_amount_cents,
                 currency, evidence, evidence_due_by, status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(case.dispute_id)
        .bind(case.transaction_id)
        .bind(case.dispute_type.as_str())
        .bind(case.dispute_amount_cents)
        .bind(&case.currency)
        .bind(&case.evidence)
        .bind(case.evidence_due_by)
        .bind(case.status.as_str())
        .bind(case.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_dispute_case(&self, dispute_id: Uuid) -> BillingResult<Option<DisputeCase>> {
        let row: Option<DisputeCaseRow> = sqlx::query_as(
            r#"
            SELECT dispute_id, transaction_id, dispute_type, dispute_amount_cents,
                   currency, evidence, evidence_due_by, status, created_at
            FROM dispute_cases
            WHERE dispute_id = $1
            "#,
        )
        .bind(dispute_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(DisputeCaseRow::into_model).transpose()
    }

    async fn claim_webhook_event(
        &self,
        record: &ProcessedWebhookEvent,
    ) -> BillingResult<WebhookClaim> {
        // One statement decides the claim: a fresh row inserts with
        // retry_count 0; an unfinished row under its retry budget bumps the
        // count; a processed or exhausted row updates nothing and returns no
        // row. Concurrent deliveries serialize on the primary key.
        let claimed: Option<(bool, i32)> = sqlx::query_as(
            r#"
            INSERT INTO processed_webhook_events
                (processor_type, event_id, event_type, processed, processed_at,
                 retry_count, max_retries, last_error, created_at)
            VALUES ($1, $2, $3, false, NULL, 0, $4, NULL, $5)
            ON CONFLICT (processor_type, event_id) DO UPDATE SET
                retry_count = processed_webhook_events.retry_count + 1
            WHERE processed_webhook_events.processed = false
              AND processed_webhook_events.retry_count < processed_webhook_events.max_retries
            RETURNING processed, retry_count
            "#,
        )
        .bind(record.processor_type.as_str())
        .bind(&record.event_id)
        .bind(&record.event_type)
        .bind(record.max_retries as i32)
        .bind(record.created_at)
        .fetch_optional(&self.pool)
        .await?;

        match claimed {
            Some((_, 0)) => Ok(WebhookClaim::Claimed),
            Some((_, retry_count)) => Ok(WebhookClaim::RetryClaimed {
                retry_count: u32::try_from(retry_count)
                    .map_err(|_| bad_column("retry_count", &retry_count.to_string()))?,
            }),
            None => {
                let processed: Option<bool> = sqlx::query_scalar(
                    r#"
                    SELECT processed FROM processed_webhook_events
                    WHERE processor_type = $1 AND event_id = $2
                    "#,
                )
                .bind(record.processor_type.as_str())
                .bind(&record.event_id)
                .fetch_optional(&self.pool)
                .await?;
                match processed {
                    Some(true) => Ok(WebhookClaim::AlreadyProcessed),
                    Some(false) => Ok(WebhookClaim::Exhausted),
                    None => Err(BillingError::Storage(format!(
                        "webhook event {}:{} vanished between claim and lookup",
                        record.processor_type, record.event_id
                    ))),
                }
            }
        }
    }

    async fn mark_webhook_event_processed(
        &self,
        processor_type: ProcessorType,
        event_id: &str,
        error: Option<&str>,
    ) -> BillingResult<()> {
        let rows_affected = sqlx::query(
            r#"
            UPDATE processed_webhook_events SET
                processed = true,
                processed_at = $3,
                last_error = $4
            WHERE processor_type = $1 AND event_id = $2
            "#,
        )
        .bind(processor_type.as_str())
        .bind(event_id)
        .bind(OffsetDateTime::now_utc())
        .bind(error)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Err(BillingError::Storage(format!(
                "webhook event {processor_type}:{event_id} was never claimed"
            )));
        }
        Ok(())
    }

    async fn get_processed_webhook_event(
        &self,
        processor_type: ProcessorType,
        event_id: &str,
    ) -> BillingResult<Option<ProcessedWebhookEvent>> {
        let row: Option<WebhookEventRow> = sqlx::query_as(
            r#"
            SELECT event_id, processor_type, event_type, processed, processed_at,
                   retry_count, max_retries, last_error, created_at
            FROM processed_webhook_events
            WHERE processor_type = $1 AND event_id = $2
            "#,
        )
        .bind(processor_type.as_str())
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(WebhookEventRow::into_model).transpose()
    }

    async fn prune_webhook_events(&self, older_than: OffsetDateTime) -> BillingResult<u64> {
        // Unprocessed rows are kept regardless of age; they are evidence of
        // dispatch that never finished.
        let rows_affected = sqlx::query(
            "DELETE FROM processed_webhook_events WHERE processed = true AND created_at < $1",
        )
        .bind(older_than)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(rows_affected)
    }

    async fn get_user_profile(&self, user_id: Uuid) -> BillingResult<Option<UserProfile>> {
        let row: Option<UserProfileRow> = sqlx::query_as(
            r#"
            SELECT user_id, email, name, membership_tier, premium_expires_at
            FROM users
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(UserProfileRow::into_model).transpose()
    }

    async fn update_user_membership(
        &self,
        user_id: Uuid,
        update: &MembershipUpdate,
    ) -> BillingResult<()> {
        let rows_affected = sqlx::query(
            r#"
            UPDATE users SET
                membership_tier = $2,
                premium_expires_at = $3,
                updated_at = NOW()
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .bind(update.membership_tier.as_str())
        .bind(update.premium_expires_at)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Err(BillingError::UserNotFound(user_id.to_string()));
        }
        Ok(())
    }

    async fn record_billing_event(&self, event: &BillingEvent) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO billing_events
                (id, user_id, billing_account_id, event_type, actor_type,
                 data, processor_event_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(event.id)
        .bind(event.user_id)
        .bind(event.billing_account_id)
        .bind(event.event_type.as_str())
        .bind(event.actor_type.as_str())
        .bind(&event.data)
        .bind(&event.processor_event_id)
        .bind(event.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
