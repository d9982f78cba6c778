//! HTTP routes

pub mod subscriptions;
pub mod webhooks;

use axum::{
    middleware,
    routing::{get, post, put},
    Json, Router,
};
use serde_json::json;

use crate::identity::require_user;
use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    // Account and subscription endpoints require the gateway identity
    // headers; plan listing, webhooks, and health do not.
    let protected = Router::new()
        .route("/billing/account", get(subscriptions::get_account))
        .route(
            "/billing/subscriptions",
            post(subscriptions::create_subscription),
        )
        .route(
            "/billing/subscriptions/{subscription_id}",
            put(subscriptions::update_subscription)
                .delete(subscriptions::cancel_subscription),
        )
        .route(
            "/billing/transactions/{transaction_id}/refund",
            post(subscriptions::refund_transaction),
        )
        .route_layer(middleware::from_fn(require_user));

    Router::new()
        .route("/health", get(health))
        .route("/billing/plans", get(subscriptions::list_plans))
        .route(
            "/billing/webhooks/{processor}",
            post(webhooks::receive_webhook),
        )
        .merge(protected)
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use tower::ServiceExt;
    use uuid::Uuid;

    use boatyard_billing::{
        BillingService, MemoryBillingStore, MembershipTier, SandboxProcessor, SubscriptionCatalog,
        UserProfile,
    };

    use crate::config::Config;

    const SECRET: &str = "whsec_routes";

    struct TestApp {
        router: Router,
        sandbox: Arc<SandboxProcessor>,
        user_id: Uuid,
    }

    fn test_app() -> TestApp {
        let user_id = Uuid::new_v4();
        let store = Arc::new(MemoryBillingStore::new().with_user(UserProfile {
            user_id,
            email: "skipper@example.com".into(),
            name: "Skipper".into(),
            membership_tier: MembershipTier::Free,
            premium_expires_at: None,
        }));
        let sandbox = Arc::new(SandboxProcessor::new(SECRET));
        let billing = Arc::new(BillingService::new(
            sandbox.clone(),
            store,
            Arc::new(SubscriptionCatalog::standard()),
        ));
        let state = AppState {
            config: Config {
                bind_address: "127.0.0.1:0".into(),
                database_url: None,
                webhook_secret: SECRET.into(),
                allowed_origins: vec![],
            },
            billing,
        };
        TestApp {
            router: create_router(state),
            sandbox,
            user_id,
        }
    }

    fn authed(request: Request<Body>, user_id: Uuid) -> Request<Body> {
        let (mut parts, body) = request.into_parts();
        parts
            .headers
            .insert("x-user-id", user_id.to_string().parse().unwrap());
        Request::from_parts(parts, body)
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_answers_ok() {
        let app = test_app();
        let response = app
            .router
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn plans_are_public_and_exclude_retired() {
        let app = test_app();
        let response = app
            .router
            .oneshot(Request::get("/billing/plans").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        let plans = body["plans"].as_array().unwrap();
        assert_eq!(plans.len(), 3);
        assert!(plans
            .iter()
            .all(|p| p["planId"] != "premium_individual_legacy"));
    }

    #[tokio::test]
    async fn subscription_endpoints_require_identity() {
        let app = test_app();
        let response = app
            .router
            .oneshot(
                Request::post("/billing/subscriptions")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"planId":"premium_individual","billingCycle":"monthly","paymentMethodId":"pm_1"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn create_then_fetch_account() {
        let app = test_app();

        let request = authed(
            Request::post("/billing/subscriptions")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    r#"{"planId":"premium_individual","billingCycle":"monthly","paymentMethodId":"pm_1"}"#,
                ))
                .unwrap(),
            app.user_id,
        );
        let response = app.router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let created = body_json(response).await;
        assert_eq!(created["planId"], "premium_individual");
        assert_eq!(created["amountCents"], 2999);
        assert_eq!(created["status"], "active");

        let response = app
            .router
            .oneshot(authed(
                Request::get("/billing/account").body(Body::empty()).unwrap(),
                app.user_id,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let account = body_json(response).await;
        assert_eq!(account["subscriptionId"], created["subscriptionId"]);
        assert_eq!(account["hasAccess"], true);
    }

    #[tokio::test]
    async fn unknown_plan_is_404() {
        let app = test_app();
        let response = app
            .router
            .oneshot(authed(
                Request::post("/billing/subscriptions")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(
                        r#"{"planId":"gold_anchor","billingCycle":"monthly","paymentMethodId":"pm_1"}"#,
                    ))
                    .unwrap(),
                app.user_id,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["code"], "PLAN_NOT_FOUND");
    }

    #[tokio::test]
    async fn bad_billing_cycle_is_400() {
        let app = test_app();
        let response = app
            .router
            .oneshot(authed(
                Request::post("/billing/subscriptions")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(
                        r#"{"planId":"premium_individual","billingCycle":"fortnightly","paymentMethodId":"pm_1"}"#,
                    ))
                    .unwrap(),
                app.user_id,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn declined_subscription_create_is_402() {
        let app = test_app();
        app.sandbox
            .fail_next_subscription_create(boatyard_billing::ProcessorError::Declined {
                code: "card_declined".into(),
                message: "declined".into(),
            });
        let response = app
            .router
            .oneshot(authed(
                Request::post("/billing/subscriptions")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(
                        r#"{"planId":"premium_individual","billingCycle":"monthly","paymentMethodId":"pm_bad"}"#,
                    ))
                    .unwrap(),
                app.user_id,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
    }

    #[tokio::test]
    async fn update_by_non_owner_is_404() {
        let app = test_app();
        let response = app
            .router
            .clone()
            .oneshot(authed(
                Request::post("/billing/subscriptions")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(
                        r#"{"planId":"premium_individual","billingCycle":"monthly","paymentMethodId":"pm_1"}"#,
                    ))
                    .unwrap(),
                app.user_id,
            ))
            .await
            .unwrap();
        let subscription_id = body_json(response).await["subscriptionId"]
            .as_str()
            .unwrap()
            .to_string();

        let stranger = Uuid::new_v4();
        let response = app
            .router
            .oneshot(authed(
                Request::put(format!("/billing/subscriptions/{subscription_id}"))
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"planId":"premium_dealer"}"#))
                    .unwrap(),
                stranger,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn cancel_at_period_end_keeps_access() {
        let app = test_app();
        let response = app
            .router
            .clone()
            .oneshot(authed(
                Request::post("/billing/subscriptions")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(
                        r#"{"planId":"premium_individual","billingCycle":"monthly","paymentMethodId":"pm_1"}"#,
                    ))
                    .unwrap(),
                app.user_id,
            ))
            .await
            .unwrap();
        let subscription_id = body_json(response).await["subscriptionId"]
            .as_str()
            .unwrap()
            .to_string();

        let response = app
            .router
            .clone()
            .oneshot(authed(
                Request::delete(format!("/billing/subscriptions/{subscription_id}"))
                    .body(Body::empty())
                    .unwrap(),
                app.user_id,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "canceled");

        let response = app
            .router
            .oneshot(authed(
                Request::get("/billing/account").body(Body::empty()).unwrap(),
                app.user_id,
            ))
            .await
            .unwrap();
        assert_eq!(body_json(response).await["hasAccess"], true);
    }

    #[tokio::test]
    async fn refund_requires_admin_role() {
        let app = test_app();
        let transaction_id = Uuid::new_v4();
        let response = app
            .router
            .oneshot(authed(
                Request::post(format!("/billing/transactions/{transaction_id}/refund"))
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"reason":"requested_by_customer"}"#))
                    .unwrap(),
                app.user_id,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn webhook_roundtrip_and_duplicate() {
        let app = test_app();
        let (payload, signature) = app
            .sandbox
            .signed_event(
                "evt_route",
                "payment_intent.succeeded",
                serde_json::json!({ "transactionId": "ch_unknown" }),
            )
            .unwrap();

        let deliver = |payload: Vec<u8>, signature: String| {
            Request::post("/billing/webhooks/sandbox")
                .header("x-webhook-signature", signature)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(payload))
                .unwrap()
        };

        let response = app
            .router
            .clone()
            .oneshot(deliver(payload.clone(), signature.clone()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["received"], true);

        let response = app
            .router
            .oneshot(deliver(payload, signature))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["duplicate"], true);
    }

    #[tokio::test]
    async fn webhook_bad_signature_is_401() {
        let app = test_app();
        let forger = SandboxProcessor::new("whsec_other");
        let (payload, signature) = forger
            .signed_event("evt_forged", "payment_intent.succeeded", serde_json::json!({}))
            .unwrap();

        let response = app
            .router
            .oneshot(
                Request::post("/billing/webhooks/sandbox")
                    .header("x-webhook-signature", signature)
                    .body(Body::from(payload))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn webhook_unknown_processor_is_404() {
        let app = test_app();
        let (payload, signature) = app
            .sandbox
            .signed_event("evt_x", "payment_intent.succeeded", serde_json::json!({}))
            .unwrap();

        let response = app
            .router
            .oneshot(
                Request::post("/billing/webhooks/paypal")
                    .header("x-webhook-signature", signature)
                    .body(Body::from(payload))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
