//! Subscription and account endpoints

use axum::{
    extract::{Extension, Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use boatyard_billing::{
    BillingAccount, BillingCycle, CreateSubscriptionParams, SubscriptionPlan,
    UpdateSubscriptionParams,
};

use crate::{
    error::{ApiError, ApiResult},
    identity::AuthUser,
    state::AppState,
};

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Serialize)]
pub struct PlanListResponse {
    pub plans: Vec<PlanResponse>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanResponse {
    pub plan_id: &'static str,
    pub name: &'static str,
    pub monthly_price_cents: i64,
    pub yearly_price_cents: i64,
    pub tier: &'static str,
    pub features: Vec<&'static str>,
}

impl From<&SubscriptionPlan> for PlanResponse {
    fn from(plan: &SubscriptionPlan) -> Self {
        Self {
            plan_id: plan.plan_id,
            name: plan.name,
            monthly_price_cents: plan.monthly_price_cents,
            yearly_price_cents: plan.yearly_price_cents,
            tier: plan.tier.as_str(),
            features: plan.features.to_vec(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSubscriptionRequest {
    pub plan_id: String,
    pub billing_cycle: String,
    pub trial_days: Option<u32>,
    pub payment_method_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedSubscriptionResponse {
    pub billing_id: Uuid,
    pub subscription_id: String,
    pub plan_id: String,
    pub amount_cents: i64,
    pub status: &'static str,
    #[serde(with = "time::serde::rfc3339::option")]
    pub trial_ends_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub next_billing_date: OffsetDateTime,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSubscriptionRequest {
    pub plan_id: Option<String>,
    pub billing_cycle: Option<String>,
    pub cancel_at_period_end: Option<bool>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionUpdateResponse {
    pub plan_id: String,
    pub amount_cents: i64,
    pub status: &'static str,
    pub prorated_amount_cents: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct CancelQuery {
    /// `?immediate=true` revokes access now; the default cancels at the end
    /// of the paid period.
    pub immediate: Option<bool>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountResponse {
    pub billing_id: Uuid,
    pub subscription_id: String,
    pub plan_id: String,
    pub status: &'static str,
    pub billing_cycle: &'static str,
    pub amount_cents: i64,
    pub currency: String,
    #[serde(with = "time::serde::rfc3339")]
    pub next_billing_date: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub trial_ends_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub canceled_at: Option<OffsetDateTime>,
    pub has_access: bool,
}

impl From<BillingAccount> for AccountResponse {
    fn from(account: BillingAccount) -> Self {
        let has_access = account.has_access(OffsetDateTime::now_utc());
        Self {
            billing_id: account.billing_id,
            subscription_id: account.subscription_id,
            plan_id: account.plan_id,
            status: account.status.as_str(),
            billing_cycle: account.billing_cycle.as_str(),
            amount_cents: account.amount_cents,
            currency: account.currency,
            next_billing_date: account.next_billing_date,
            trial_ends_at: account.trial_ends_at,
            canceled_at: account.canceled_at,
            has_access,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundRequest {
    /// Omitted for a full refund.
    pub amount_cents: Option<i64>,
    pub reason: Option<String>,
}

// =============================================================================
// Handlers
// =============================================================================

pub async fn list_plans(State(state): State<AppState>) -> Json<PlanListResponse> {
    let plans = state
        .billing
        .subscriptions
        .get_active_subscription_plans()
        .into_iter()
        .map(PlanResponse::from)
        .collect();
    Json(PlanListResponse { plans })
}

pub async fn get_account(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Json<AccountResponse>> {
    let account = state
        .billing
        .subscriptions
        .get_subscription_for_user(user.user_id)
        .await?
        .ok_or_else(|| ApiError::not_found("no billing account for this user"))?;
    Ok(Json(account.into()))
}

pub async fn create_subscription(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(request): Json<CreateSubscriptionRequest>,
) -> ApiResult<(StatusCode, Json<CreatedSubscriptionResponse>)> {
    let billing_cycle = BillingCycle::from_str(&request.billing_cycle).ok_or_else(|| {
        ApiError::bad_request(format!("unknown billing cycle: {}", request.billing_cycle))
    })?;

    let created = state
        .billing
        .subscriptions
        .create_subscription(
            user.user_id,
            CreateSubscriptionParams {
                plan_id: request.plan_id,
                billing_cycle,
                trial_days: request.trial_days,
                payment_method_id: request.payment_method_id,
            },
        )
        .await?;

    tracing::info!(
        user_id = %user.user_id,
        plan_id = %created.plan_id,
        subscription_id = %created.subscription_id,
        "Subscription created"
    );

    Ok((
        StatusCode::CREATED,
        Json(CreatedSubscriptionResponse {
            billing_id: created.billing_id,
            subscription_id: created.subscription_id,
            plan_id: created.plan_id,
            amount_cents: created.amount_cents,
            status: created.status.as_str(),
            trial_ends_at: created.trial_ends_at,
            next_billing_date: created.next_billing_date,
        }),
    ))
}

pub async fn update_subscription(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(subscription_id): Path<String>,
    Json(request): Json<UpdateSubscriptionRequest>,
) -> ApiResult<Json<SubscriptionUpdateResponse>> {
    ensure_owner(&state, &user, &subscription_id).await?;

    let billing_cycle = match request.billing_cycle {
        Some(raw) => Some(
            BillingCycle::from_str(&raw)
                .ok_or_else(|| ApiError::bad_request(format!("unknown billing cycle: {raw}")))?,
        ),
        None => None,
    };

    let update = state
        .billing
        .subscriptions
        .update_subscription(
            &subscription_id,
            UpdateSubscriptionParams {
                plan_id: request.plan_id,
                billing_cycle,
                cancel_at_period_end: request.cancel_at_period_end,
            },
        )
        .await?;

    Ok(Json(SubscriptionUpdateResponse {
        plan_id: update.plan_id,
        amount_cents: update.amount_cents,
        status: update.status.as_str(),
        prorated_amount_cents: update.prorated_amount_cents,
    }))
}

pub async fn cancel_subscription(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(subscription_id): Path<String>,
    Query(query): Query<CancelQuery>,
) -> ApiResult<Json<SubscriptionUpdateResponse>> {
    ensure_owner(&state, &user, &subscription_id).await?;

    let immediate = query.immediate.unwrap_or(false);
    let update = state
        .billing
        .subscriptions
        .cancel_subscription(&subscription_id, immediate)
        .await?;

    tracing::info!(
        user_id = %user.user_id,
        subscription_id = %subscription_id,
        immediate,
        "Subscription canceled"
    );

    Ok(Json(SubscriptionUpdateResponse {
        plan_id: update.plan_id,
        amount_cents: update.amount_cents,
        status: update.status.as_str(),
        prorated_amount_cents: update.prorated_amount_cents,
    }))
}

pub async fn refund_transaction(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(transaction_id): Path<Uuid>,
    Json(request): Json<RefundRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    if !user.is_admin() {
        return Err(ApiError {
            status: StatusCode::FORBIDDEN,
            code: "FORBIDDEN",
            message: "refunds require the admin role".into(),
        });
    }

    let reason = request
        .reason
        .unwrap_or_else(|| "requested_by_customer".to_string());
    let refund = state
        .billing
        .subscriptions
        .refund_transaction(transaction_id, request.amount_cents, &reason)
        .await?;

    tracing::info!(
        admin_id = %user.user_id,
        transaction_id = %transaction_id,
        amount_cents = refund.amount_cents,
        "Refund issued"
    );

    Ok(Json(serde_json::json!({
        "refundTransactionId": refund.transaction_id,
        "amountCents": refund.amount_cents,
        "status": refund.status.as_str(),
    })))
}

/// Subscriptions are addressed by processor id; non-owners get the same 404
/// as a missing subscription so ids cannot be probed.
async fn ensure_owner(
    state: &AppState,
    user: &AuthUser,
    subscription_id: &str,
) -> ApiResult<()> {
    let account = state
        .billing
        .subscriptions
        .get_subscription(subscription_id)
        .await?;
    match account {
        Some(account) if account.user_id == user.user_id || user.is_admin() => Ok(()),
        _ => Err(ApiError::not_found(format!(
            "subscription not found: {subscription_id}"
        ))),
    }
}
