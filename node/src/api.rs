//! # HTTP API
//!
//! Builds the axum router for the Chally node. All handlers share state
//! through axum's `State` extractor, and every core error is translated
//! to an HTTP status exactly once, in [`ApiError`].
//!
//! ## Endpoints
//!
//! | Method | Path                       | Description                              |
//! |--------|----------------------------|------------------------------------------|
//! | GET    | `/health`                  | Liveness probe                           |
//! | GET    | `/wallet`                  | Balance + ledger entries                 |
//! | POST   | `/wallet/deposit/checkout` | Open a checkout session                  |
//! | POST   | `/wallet/withdraw`         | FIFO refund withdrawal                   |
//! | POST   | `/stripe/webhook`          | Signed payment-processor events          |
//! | POST   | `/challenges/:id/join`     | Join a challenge (stakes tokens)         |
//! | POST   | `/challenges/:id/settle`   | Settle a completed challenge (internal)  |
//!
//! ## Identity
//!
//! The identity service is an external collaborator; its contract here
//! is a bearer credential that resolves to an opaque user id. Handlers
//! that act on a wallet require `Authorization: Bearer <user-id>` and
//! answer 401 otherwise.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use chally_challenges::challenge::ChallengeRegistry;
use chally_challenges::participant::Enrollment;
use chally_challenges::settlement::{SettlementEngine, SettlementOutcome};
use chally_core::config::Settings;
use chally_core::deposit::{DepositOutcome, DepositPipeline};
use chally_core::error::CoreError;
use chally_core::ledger::LedgerEntry;
use chally_core::processor::webhook;
use chally_core::wallet::Wallet;
use chally_core::withdraw::{WithdrawalEngine, WithdrawalReport};

use crate::metrics::SharedMetrics;

// ---------------------------------------------------------------------------
// Application State
// ---------------------------------------------------------------------------

/// Shared application state for all request handlers.
///
/// Cheap to clone — every service is an `Arc` or internally shared.
#[derive(Clone)]
pub struct AppState {
    /// Runtime configuration.
    pub settings: Arc<Settings>,
    /// Balance reads and statement queries.
    pub wallet: Wallet,
    /// Checkout-session creation and webhook ingestion.
    pub deposits: DepositPipeline,
    /// FIFO refund engine.
    pub withdrawals: WithdrawalEngine,
    /// Challenge + participant store.
    pub registry: Arc<ChallengeRegistry>,
    /// Join / verification surface.
    pub enrollment: Enrollment,
    /// End-of-challenge distribution.
    pub settlement: SettlementEngine,
    /// Prometheus handles.
    pub metrics: SharedMetrics,
}

// ---------------------------------------------------------------------------
// Error Translation
// ---------------------------------------------------------------------------

/// The single boundary where [`CoreError`] becomes an HTTP response.
///
/// Bodies are `{"detail": "..."}` with terse messages that never leak
/// internal identifiers.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }

    fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "missing or invalid credentials")
    }
}

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        let status = match &e {
            CoreError::InvalidAmount { .. }
            | CoreError::DailyLimit { .. }
            | CoreError::Insufficient { .. }
            | CoreError::NoRefundableFunds
            | CoreError::InvalidSignature { .. } => StatusCode::BAD_REQUEST,
            CoreError::NotFound { .. } => StatusCode::NOT_FOUND,
            // Duplicate is resolved to success inside the core; if one
            // escapes, a conflict is the honest answer.
            CoreError::StateConflict { .. } | CoreError::Duplicate { .. } => StatusCode::CONFLICT,
            CoreError::WalletBusy | CoreError::Disabled => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::Processor(_) => StatusCode::BAD_GATEWAY,
            CoreError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let detail = match &e {
            // Storage details stay in the logs, not in responses.
            CoreError::Storage(inner) => {
                tracing::error!("storage failure surfaced to API: {}", inner);
                "internal error".to_string()
            }
            other => other.to_string(),
        };
        Self { status, detail }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "detail": self.detail }));
        (self.status, body).into_response()
    }
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Resolves the bearer credential to a user id.
///
/// The identity collaborator hands clients an opaque id; this node
/// accepts it as `Authorization: Bearer <uuid>`.
fn authenticate(headers: &HeaderMap) -> Result<Uuid, ApiError> {
    let raw = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(ApiError::unauthorized)?;
    Uuid::parse_str(raw.trim()).map_err(|_| ApiError::unauthorized())
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Request body for `POST /wallet/deposit/checkout`.
#[derive(Debug, Deserialize)]
pub struct CheckoutBody {
    /// Tokens to purchase.
    pub tokens: u64,
    /// Redirect after successful payment.
    pub success_url: String,
    /// Redirect after cancelled payment.
    pub cancel_url: String,
}

/// Response body for `POST /wallet/deposit/checkout`.
#[derive(Debug, Serialize, Deserialize)]
pub struct CheckoutResponse {
    /// Hosted checkout URL to redirect the user to.
    pub checkout_url: String,
    /// The processor's session identifier.
    pub session_id: String,
}

/// Request body for `POST /wallet/withdraw`.
#[derive(Debug, Deserialize)]
pub struct WithdrawBody {
    /// Tokens to withdraw.
    pub tokens: u64,
}

/// Response body for `GET /wallet`.
#[derive(Debug, Serialize)]
pub struct WalletResponse {
    /// Current balance in tokens.
    pub balance: u64,
    /// Full statement, oldest first.
    pub entries: Vec<LedgerEntry>,
}

/// Response body for `POST /challenges/:id/join`.
#[derive(Debug, Serialize, Deserialize)]
pub struct JoinResponse {
    /// The created participant row.
    pub participant_id: Uuid,
    /// Tokens debited as the stake.
    pub stake_paid: u64,
}

/// Response body for `POST /stripe/webhook`.
#[derive(Debug, Serialize)]
pub struct WebhookAck {
    /// Always `true` — a non-2xx status is how failure is signalled.
    pub ok: bool,
}

// ---------------------------------------------------------------------------
// Router Construction
// ---------------------------------------------------------------------------

/// Builds the full axum [`Router`] with all API routes, CORS, and
/// request tracing.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/wallet", get(wallet_handler))
        .route("/wallet/deposit/checkout", post(checkout_handler))
        .route("/wallet/withdraw", post(withdraw_handler))
        .route("/stripe/webhook", post(webhook_handler))
        .route("/challenges/:id/join", post(join_handler))
        .route("/challenges/:id/settle", post(settle_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /health` — liveness probe for orchestrators.
async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

/// `GET /wallet` — the authenticated user's balance and statement.
async fn wallet_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<WalletResponse>, ApiError> {
    let user_id = authenticate(&headers)?;
    let balance = state.wallet.balance(&user_id)?;
    let entries = state.wallet.ledger().entries(&user_id)?;
    Ok(Json(WalletResponse { balance, entries }))
}

/// `POST /wallet/deposit/checkout` — opens a checkout session.
///
/// No money moves here; the wallet is credited when the processor's
/// webhook confirms payment.
async fn checkout_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CheckoutBody>,
) -> Result<Json<CheckoutResponse>, ApiError> {
    let user_id = authenticate(&headers)?;
    let session = state
        .deposits
        .begin_deposit(user_id, body.tokens, &body.success_url, &body.cancel_url)
        .await?;
    Ok(Json(CheckoutResponse {
        checkout_url: session.checkout_url,
        session_id: session.session_id,
    }))
}

/// `POST /wallet/withdraw` — FIFO refund withdrawal.
///
/// Partial success is a 200 with `partial: true`, not an error.
async fn withdraw_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<WithdrawBody>,
) -> Result<Json<WithdrawalReport>, ApiError> {
    let user_id = authenticate(&headers)?;
    let timer = state.metrics.wallet_op_seconds.start_timer();
    let report = state.withdrawals.withdraw(user_id, body.tokens).await?;
    timer.observe_duration();

    if report.refunded > 0 {
        state.metrics.withdrawals_total.inc();
        state.metrics.refund_tokens_total.inc_by(report.refunded);
    }
    if report.partial {
        state.metrics.withdrawals_partial_total.inc();
    }
    Ok(Json(report))
}

/// `POST /stripe/webhook` — signed payment-processor events.
///
/// Verification happens against the raw body before any parsing. A 2xx
/// tells the processor to stop retrying, so it is returned only after
/// the credit committed (or was recognized as a replay).
async fn webhook_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, ApiError> {
    let signature = headers
        .get("Stripe-Signature")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    let event = webhook::verify_and_parse(
        &body,
        signature,
        &state.settings.webhook_secret,
        Utc::now(),
    )
    .map_err(|e| {
        state.metrics.webhook_rejected_total.inc();
        ApiError::from(e)
    })?;

    state.metrics.webhook_events_total.inc();
    let outcome = state.deposits.on_payment_confirmed(&event).await?;
    if let DepositOutcome::Credited { tokens, .. } = outcome {
        state.metrics.deposits_credited_total.inc();
        state.metrics.deposit_tokens_total.inc_by(tokens);
    }

    Ok(Json(WebhookAck { ok: true }))
}

/// `POST /challenges/:id/join` — stakes tokens and enrolls the user.
async fn join_handler(
    State(state): State<AppState>,
    Path(challenge_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<JoinResponse>, ApiError> {
    let user_id = authenticate(&headers)?;
    let timer = state.metrics.wallet_op_seconds.start_timer();
    let receipt = state.enrollment.join(user_id, challenge_id).await?;
    timer.observe_duration();

    Ok(Json(JoinResponse {
        participant_id: receipt.participant_id,
        stake_paid: receipt.stake_paid,
    }))
}

/// `POST /challenges/:id/settle` — settles a completed challenge.
///
/// Internal/admin surface: in production this route is reachable only
/// from the operations network; the settlement worker drives it under
/// normal operation. Idempotent — re-settling returns the stored
/// outcome.
async fn settle_handler(
    State(state): State<AppState>,
    Path(challenge_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<SettlementOutcome>, ApiError> {
    authenticate(&headers)?;
    let outcome = state.settlement.settle(challenge_id).await?;

    state.metrics.settlements_total.inc();
    if outcome.platform_revenue > 0 {
        state
            .metrics
            .forfeited_tokens_total
            .inc_by(outcome.platform_revenue);
    }
    Ok(Json(outcome))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::ChallyMetrics;
    use axum::body::Body;
    use axum::http::Request;
    use chally_challenges::challenge::ChallengeLocks;
    use chally_core::ledger::Ledger;
    use chally_core::processor::MockProcessor;
    use chally_core::storage::CoreDb;
    use chally_core::wallet::WalletLocks;
    use chrono::Duration;
    use http_body_util::BodyExt;
    use tower::util::ServiceExt;

    const TEST_SECRET: &str = "whsec_router_test";

    fn test_state() -> AppState {
        let db = Arc::new(CoreDb::open_temporary().expect("temp db"));
        let settings = Arc::new(Settings {
            webhook_secret: TEST_SECRET.to_string(),
            ..Settings::default()
        });
        let ledger = Ledger::new(Arc::clone(&db), "USD");
        let wallet = Wallet::new(Arc::clone(&db), ledger, Arc::new(WalletLocks::new()));
        let processor = Arc::new(MockProcessor::new());
        let deposits =
            DepositPipeline::new(wallet.clone(), processor.clone(), Arc::clone(&settings));
        let withdrawals = WithdrawalEngine::new(
            Arc::clone(&db),
            wallet.clone(),
            processor,
            Arc::clone(&settings),
        );
        let registry = Arc::new(ChallengeRegistry::new(&db).expect("registry"));
        let locks = Arc::new(ChallengeLocks::new());
        let enrollment =
            Enrollment::new(Arc::clone(&registry), wallet.clone(), Arc::clone(&locks));
        let settlement = SettlementEngine::new(
            Arc::clone(&db),
            Arc::clone(&registry),
            wallet.clone(),
            locks,
            settings.platform_user_id,
        )
        .expect("engine");

        AppState {
            settings,
            wallet,
            deposits,
            withdrawals,
            registry,
            enrollment,
            settlement,
            metrics: Arc::new(ChallyMetrics::new()),
        }
    }

    fn bearer(user: Uuid) -> String {
        format!("Bearer {user}")
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn paid_webhook_request(user: Uuid, payment_intent: &str, amount_cents: u64) -> Request<Body> {
        let body = serde_json::json!({
            "type": "checkout.session.completed",
            "data": { "object": {
                "payment_intent": payment_intent,
                "client_reference_id": user.to_string(),
                "amount_total": amount_cents,
                "payment_status": "paid",
            }}
        })
        .to_string();
        let signature = webhook::signature_header(body.as_bytes(), TEST_SECRET, Utc::now());

        Request::builder()
            .method("POST")
            .uri("/stripe/webhook")
            .header("Stripe-Signature", signature)
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn health_is_open() {
        let app = create_router(test_state());
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn wallet_requires_credentials() {
        let app = create_router(test_state());
        let response = app
            .oneshot(Request::builder().uri("/wallet").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn garbage_bearer_is_unauthorized() {
        let app = create_router(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/wallet")
                    .header("authorization", "Bearer not-a-uuid")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn empty_wallet_reads_zero() {
        let app = create_router(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/wallet")
                    .header("authorization", bearer(Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["balance"], 0);
        assert_eq!(json["entries"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn checkout_round_trip() {
        let app = create_router(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/wallet/deposit/checkout")
                    .header("authorization", bearer(Uuid::new_v4()))
                    .header("content-type", "application/json")
                    .body(Body::from(
                        serde_json::json!({
                            "tokens": 1000,
                            "success_url": "https://app.test/ok",
                            "cancel_url": "https://app.test/no",
                        })
                        .to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert!(json["checkout_url"].as_str().unwrap().starts_with("https://"));
        assert!(!json["session_id"].as_str().unwrap().is_empty());
    }

    #[tokio::test]
    async fn zero_token_checkout_is_bad_request() {
        let app = create_router(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/wallet/deposit/checkout")
                    .header("authorization", bearer(Uuid::new_v4()))
                    .header("content-type", "application/json")
                    .body(Body::from(
                        serde_json::json!({
                            "tokens": 0,
                            "success_url": "https://a",
                            "cancel_url": "https://b",
                        })
                        .to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert!(json["detail"].as_str().unwrap().contains("positive"));
    }

    #[tokio::test]
    async fn webhook_credits_and_wallet_reflects_it() {
        let state = test_state();
        let app = create_router(state);
        let user = Uuid::new_v4();

        let response = app
            .clone()
            .oneshot(paid_webhook_request(user, "pi_http", 1000))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/wallet")
                    .header("authorization", bearer(user))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["balance"], 1000);
        assert_eq!(json["entries"][0]["kind"], "Deposit");
    }

    #[tokio::test]
    async fn webhook_replay_is_acknowledged_but_credits_once() {
        let state = test_state();
        let app = create_router(state.clone());
        let user = Uuid::new_v4();

        for _ in 0..3 {
            let response = app
                .clone()
                .oneshot(paid_webhook_request(user, "pi_replay", 500))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        assert_eq!(state.wallet.balance(&user).unwrap(), 500);
    }

    #[tokio::test]
    async fn unsigned_webhook_is_rejected() {
        let app = create_router(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/stripe/webhook")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn withdraw_without_funds_is_bad_request() {
        let app = create_router(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/wallet/withdraw")
                    .header("authorization", bearer(Uuid::new_v4()))
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::json!({ "tokens": 100 }).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn withdraw_after_deposit_reports_refunds() {
        let state = test_state();
        let app = create_router(state);
        let user = Uuid::new_v4();

        app.clone()
            .oneshot(paid_webhook_request(user, "pi_wd", 800))
            .await
            .unwrap();

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/wallet/withdraw")
                    .header("authorization", bearer(user))
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::json!({ "tokens": 300 }).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["requested"], 300);
        assert_eq!(json["refunded"], 300);
        assert_eq!(json["partial"], false);
    }

    #[tokio::test]
    async fn join_unknown_challenge_is_not_found() {
        let app = create_router(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/challenges/{}/join", Uuid::new_v4()))
                    .header("authorization", bearer(Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn join_and_settle_through_http() {
        let state = test_state();
        let app = create_router(state.clone());
        let user = Uuid::new_v4();

        // Fund the user and open a challenge.
        app.clone()
            .oneshot(paid_webhook_request(user, "pi_join", 500))
            .await
            .unwrap();
        let challenge = state
            .registry
            .create(
                Uuid::new_v4(),
                200,
                Utc::now() + Duration::hours(1),
                Utc::now() + Duration::hours(25),
                None,
                2,
                false,
            )
            .unwrap();
        state.registry.activate(&challenge.id).unwrap();

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/challenges/{}/join", challenge.id))
                    .header("authorization", bearer(user))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["stake_paid"], 200);

        // Double join conflicts.
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/challenges/{}/join", challenge.id))
                    .header("authorization", bearer(user))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        // Settling before completion conflicts.
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/challenges/{}/settle", challenge.id))
                    .header("authorization", bearer(user))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }
}
