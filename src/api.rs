use std::sync::Arc;

use axum::{
    extract::{rejection::QueryRejection, Query, State},
    http::HeaderValue,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{debug, warn};

use crate::{
    challenge::ChallengeStore,
    config::Config,
    directory::Directory,
    error::{internal, ApiError},
    explorer::{Explorer, ExplorerError},
    lnurl::LnurlAuthService,
    monitor::AddressMonitor,
    reviews, stores,
    types::*,
    verify::TransactionVerifier,
};

const LNURL_ACTIONS: [&str; 4] = ["register", "login", "link", "auth"];

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub directory: Arc<dyn Directory>,
    pub lnurl: Arc<LnurlAuthService>,
    pub verifier: Arc<TransactionVerifier>,
    pub monitor: Arc<AddressMonitor>,
}

impl AppState {
    pub fn new(
        config: Config,
        directory: Arc<dyn Directory>,
        challenges: Arc<ChallengeStore>,
    ) -> Result<Self, ExplorerError> {
        let explorer = Explorer::new(&config.mempool_api_url, config.explorer_timeout)?;
        Ok(Self {
            lnurl: Arc::new(LnurlAuthService::new(config.domain.clone(), challenges)),
            verifier: Arc::new(TransactionVerifier::new(explorer.clone(), config.review_min_amount)),
            monitor: Arc::new(AddressMonitor::new(explorer, config.monitor_interval)),
            directory,
            config: Arc::new(config),
        })
    }
}

pub fn router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.cors_origins);
    let timeout = state.config.request_timeout;

    Router::new()
        .route("/", get(health))
        .route("/api/lnauth/challenge", get(lnurl_challenge))
        .route("/api/auth/lnurl/callback", get(lnurl_callback).post(lnurl_callback))
        .route("/api/auth/lnurl/status", get(lnurl_status))
        .route("/api/stores", post(stores::create).get(stores::list))
        .route("/api/stores/verify", post(stores::check_transaction))
        .route(
            "/api/stores/:id",
            get(stores::fetch).put(stores::update).delete(stores::remove),
        )
        .route("/api/stores/:id/verify", post(stores::verify))
        .route(
            "/api/stores/:id/monitor",
            get(stores::monitor_status)
                .post(stores::start_monitor)
                .delete(stores::stop_monitor),
        )
        .route("/api/reviews", post(reviews::create))
        .route("/api/reviews/verify", post(reviews::check_transaction))
        .route("/api/reviews/store/:store_id", get(reviews::list))
        .route(
            "/api/reviews/:id",
            get(reviews::fetch).put(reviews::update).delete(reviews::remove),
        )
        .route("/api/reviews/:id/verify", post(reviews::verify))
        .with_state(state)
        .layer(cors)
        .layer(TimeoutLayer::new(timeout))
        .layer(TraceLayer::new_for_http())
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() {
        return CorsLayer::permissive();
    }
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match o.parse() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!("ignoring invalid CORS origin {o}");
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(Any)
        .allow_headers(Any)
}

// ---------- API HANDLERS ---------- //

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "healthy", "message": "We Accept Bitcoin API is running"}))
}

async fn lnurl_challenge(State(state): State<AppState>) -> Result<Json<ChallengeRes>, ApiError> {
    let ch = state.lnurl.generate_challenge().map_err(internal)?;
    Ok(Json(ChallengeRes {
        k1: ch.k1,
        lnurl: ch.lnurl,
        qr_code: ch.qr_code,
        expires_at: ch.expires_at.to_rfc3339(),
    }))
}

/// Wallet callback. LNURL clients expect 200 with `status` even on failure.
async fn lnurl_callback(
    State(state): State<AppState>,
    query: Result<Query<CallbackQuery>, QueryRejection>,
) -> Json<LnurlStatus> {
    let Ok(Query(q)) = query else {
        return Json(LnurlStatus::error("Missing k1, key or sig"));
    };
    if q.tag.as_deref().is_some_and(|t| t != "login") {
        return Json(LnurlStatus::error("Unsupported tag"));
    }
    if let Some(action) = q.action.as_deref() {
        if !LNURL_ACTIONS.contains(&action) {
            return Json(LnurlStatus::error("Unsupported action"));
        }
        debug!("lnurl-auth {action} for {}", q.k1);
    }

    if state.lnurl.verify_signature(&q.k1, &q.sig, &q.key) {
        Json(LnurlStatus::ok(None))
    } else {
        Json(LnurlStatus::error("Invalid signature"))
    }
}

async fn lnurl_status(
    State(state): State<AppState>,
    Query(q): Query<StatusQuery>,
) -> Json<LnurlStatus> {
    match state.lnurl.get_challenge_data(&q.k1) {
        None => Json(LnurlStatus::error("Challenge not found or expired")),
        Some(c) if c.verified => Json(LnurlStatus::ok(c.pubkey)),
        Some(_) => Json(LnurlStatus::pending()),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::directory::MemoryDirectory;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
        response::Response,
    };
    use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
    use serde_json::Value;
    use tower::ServiceExt;

    pub(crate) fn test_state(explorer_url: &str) -> AppState {
        let config = Config::from_lookup(|k| match k {
            "DOMAIN" => Some("btcapproved.test".into()),
            "MEMPOOL_API_URL" => Some(explorer_url.into()),
            "EXPLORER_TIMEOUT_MS" => Some("2000".into()),
            "MONITOR_INTERVAL_SECS" => Some("1".into()),
            _ => None,
        })
        .unwrap();
        AppState::new(config, Arc::new(MemoryDirectory::new()), Arc::new(ChallengeStore::new())).unwrap()
    }

    pub(crate) async fn call(state: &AppState, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let req = Request::builder().method(method).uri(uri);
        let req = match body {
            Some(b) => req
                .header("content-type", "application/json")
                .body(Body::from(b.to_string())),
            None => req.body(Body::empty()),
        }
        .unwrap();
        let res: Response = router(state.clone()).oneshot(req).await.unwrap();
        let status = res.status();
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    fn sign(k1: &str) -> (String, String) {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[0x21; 32]).unwrap();
        let digest: [u8; 32] = hex::decode(k1).unwrap().try_into().unwrap();
        let sig = secp.sign_ecdsa(&Message::from_digest(digest), &sk);
        let pk = PublicKey::from_secret_key(&secp, &sk);
        (hex::encode(sig.serialize_der()), hex::encode(pk.serialize()))
    }

    #[tokio::test]
    async fn health_check() {
        let state = test_state("http://127.0.0.1:1");
        let (status, body) = call(&state, "GET", "/", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn lnurl_login_flow() {
        let state = test_state("http://127.0.0.1:1");

        let (status, ch) = call(&state, "GET", "/api/lnauth/challenge", None).await;
        assert_eq!(status, StatusCode::OK);
        let k1 = ch["k1"].as_str().unwrap().to_owned();
        assert!(ch["lnurl"].as_str().unwrap().starts_with("LNURL1"));
        assert!(!ch["qr_code"].as_str().unwrap().is_empty());

        let status_uri = format!("/api/auth/lnurl/status?k1={k1}");
        let (_, body) = call(&state, "GET", &status_uri, None).await;
        assert_eq!(body, json!({"status": "PENDING"}));

        let (sig, key) = sign(&k1);
        let cb = format!("/api/auth/lnurl/callback?tag=login&k1={k1}&sig={sig}&key={key}&action=login");
        let (status, body) = call(&state, "GET", &cb, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"status": "OK"}));

        let (_, body) = call(&state, "POST", &cb, None).await;
        assert_eq!(body, json!({"status": "ERROR", "reason": "Invalid signature"}));

        let (_, body) = call(&state, "GET", &status_uri, None).await;
        assert_eq!(body, json!({"status": "OK", "pubkey": key}));
    }

    #[tokio::test]
    async fn lnurl_callback_failures_are_reported_in_body() {
        let state = test_state("http://127.0.0.1:1");

        let (status, body) = call(&state, "GET", "/api/auth/lnurl/callback?k1=abc", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ERROR");

        let (_, body) = call(&state, "GET", "/api/auth/lnurl/callback?k1=ab&sig=00&key=00&tag=channelRequest", None).await;
        assert_eq!(body["reason"], "Unsupported tag");

        let (_, body) = call(&state, "GET", "/api/auth/lnurl/status?k1=unknown", None).await;
        assert_eq!(body, json!({"status": "ERROR", "reason": "Challenge not found or expired"}));
    }
}
