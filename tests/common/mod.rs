#![allow(dead_code)]

//! In-process mock of the Bazaar auth API.
//!
//! Tokens are real HS256 JWTs. Refresh tokens are single use: presenting one
//! twice is rejected, like a server with reuse detection.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::{Multipart, State};
use axum::http::{HeaderMap, Request, Response, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use bazaar_session::store::{FALLBACK_KEY, KeyValueStore, MemoryStore};
use bazaar_session::transport::{BoxError, HttpClient, REQUEST_ID_HEADER, from_service};
use bazaar_session::{ClientConfig, RetryConfig, Session, TokenPair};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use jsonwebtoken::{EncodingKey, Header};
use serde::Serialize;
use serde_json::json;
use tower::ServiceExt;
use url::Url;

pub const API_BASE: &str = "http://bazaar.test/";
pub const EMAIL: &str = "alice@example.com";
pub const USERNAME: &str = "alice";
pub const PASSWORD: &str = "correct horse battery staple";
pub const JWT_SECRET: &[u8] = b"test-jwt-secret";

/// Login attempts the mock accepts per minute before answering 429.
pub const LOGIN_ATTEMPTS_PER_MINUTE: u32 = 3;

/// Value of cookie `name` in the request's Cookie header.
pub fn get_cookie<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(header::COOKIE)?
        .to_str()
        .ok()?
        .split(';')
        .filter_map(|part| part.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value)
}

#[derive(Serialize)]
struct AccessClaims<'a> {
    id: u64,
    email: &'a str,
    username: &'a str,
    role: &'a str,
    exp: i64,
    /// Keeps tokens minted within the same second distinct.
    jti: String,
}

/// Mint an access token for `email` expiring at `exp` (Unix seconds).
pub fn mint_access_token(email: &str, role: &str, exp: i64) -> String {
    let claims = AccessClaims {
        id: 1,
        email,
        username: USERNAME,
        role,
        exp,
        jti: uuid::Uuid::new_v4().to_string(),
    };
    jsonwebtoken::encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(JWT_SECRET),
    )
    .unwrap()
}

pub fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

pub fn url(path: &str) -> String {
    format!("{}{}", API_BASE, path.trim_start_matches('/'))
}

pub fn get_request(path: &str) -> Request<Body> {
    Request::get(url(path)).body(Body::empty()).unwrap()
}

/// Server-side state and call counters.
pub struct MockState {
    pub login_calls: AtomicUsize,
    pub register_calls: AtomicUsize,
    pub refresh_calls: AtomicUsize,
    pub logout_calls: AtomicUsize,
    pub me_calls: AtomicUsize,
    pub resource_calls: AtomicUsize,

    /// Lifetime of minted access tokens, in seconds.
    pub access_ttl: AtomicI64,
    /// Artificial latency of the refresh endpoint.
    pub refresh_latency: Mutex<Duration>,
    /// When set, the refresh endpoint answers with this status.
    pub refresh_status: Mutex<Option<StatusCode>>,
    /// Answer this many upcoming refresh calls with 429.
    pub refresh_rate_limited: AtomicUsize,
    /// Answer this many upcoming register calls with 429.
    pub register_rate_limited: AtomicUsize,
    /// Refresh requests never get a response.
    pub refresh_offline: AtomicBool,
    /// No request gets a response.
    pub offline: AtomicBool,

    access_tokens: Mutex<HashSet<String>>,
    refresh_tokens: Mutex<HashSet<String>>,
    registered: Mutex<HashMap<String, HashMap<String, String>>>,
    login_limiter: DefaultDirectRateLimiter,

    pub authorizations: Mutex<Vec<Option<String>>>,
    pub request_ids: Mutex<Vec<String>>,
    pub listing_bodies: Mutex<Vec<Bytes>>,
}

impl MockState {
    pub fn new() -> Self {
        Self {
            login_calls: AtomicUsize::new(0),
            register_calls: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
            logout_calls: AtomicUsize::new(0),
            me_calls: AtomicUsize::new(0),
            resource_calls: AtomicUsize::new(0),
            access_ttl: AtomicI64::new(3600),
            refresh_latency: Mutex::new(Duration::ZERO),
            refresh_status: Mutex::new(None),
            refresh_rate_limited: AtomicUsize::new(0),
            register_rate_limited: AtomicUsize::new(0),
            refresh_offline: AtomicBool::new(false),
            offline: AtomicBool::new(false),
            access_tokens: Mutex::new(HashSet::new()),
            refresh_tokens: Mutex::new(HashSet::new()),
            registered: Mutex::new(HashMap::new()),
            login_limiter: RateLimiter::direct(Quota::per_minute(
                NonZeroU32::new(LOGIN_ATTEMPTS_PER_MINUTE).unwrap(),
            )),
            authorizations: Mutex::new(Vec::new()),
            request_ids: Mutex::new(Vec::new()),
            listing_bodies: Mutex::new(Vec::new()),
        }
    }

    /// Issue a fresh pair and remember it as valid.
    pub fn issue(&self, email: &str, role: &str) -> TokenPair {
        let exp = now_secs() + self.access_ttl.load(Ordering::SeqCst);
        let access = mint_access_token(email, role, exp);
        let refresh = uuid::Uuid::new_v4().to_string();
        self.access_tokens.lock().unwrap().insert(access.clone());
        self.refresh_tokens.lock().unwrap().insert(refresh.clone());
        TokenPair::new(access, refresh)
    }

    /// Every access token issued so far stops being accepted.
    pub fn expire_access_tokens(&self) {
        self.access_tokens.lock().unwrap().clear();
    }

    pub fn refresh_token_valid(&self, token: &str) -> bool {
        self.refresh_tokens.lock().unwrap().contains(token)
    }

    pub fn set_refresh_status(&self, status: Option<StatusCode>) {
        *self.refresh_status.lock().unwrap() = status;
    }

    pub fn set_refresh_latency(&self, latency: Duration) {
        *self.refresh_latency.lock().unwrap() = latency;
    }

    pub fn registered_fields(&self, email: &str) -> Option<HashMap<String, String>> {
        self.registered.lock().unwrap().get(email).cloned()
    }

    pub fn refresh_count(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    fn bearer_valid(&self, headers: &HeaderMap) -> bool {
        let bearer = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        bearer.is_some_and(|token| self.access_tokens.lock().unwrap().contains(token))
    }

    fn record(&self, headers: &HeaderMap) {
        let authorization = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        self.authorizations.lock().unwrap().push(authorization);
        if let Some(id) = headers.get(REQUEST_ID_HEADER).and_then(|v| v.to_str().ok()) {
            self.request_ids.lock().unwrap().push(id.to_string());
        }
    }
}

fn tokens_response(pair: &TokenPair) -> axum::response::Response {
    axum::Json(json!({
        "accessToken": pair.access_token,
        "refreshToken": pair.refresh_token,
    }))
    .into_response()
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (status, axum::Json(json!({ "error": message }))).into_response()
}

async fn login(
    State(state): State<Arc<MockState>>,
    axum::Json(body): axum::Json<serde_json::Value>,
) -> axum::response::Response {
    state.login_calls.fetch_add(1, Ordering::SeqCst);

    if state.login_limiter.check().is_err() {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            [(header::RETRY_AFTER, "60")],
            axum::Json(json!({ "error": "Too many login attempts" })),
        )
            .into_response();
    }

    let email = body["email"].as_str().unwrap_or_default();
    let password = body["password"].as_str().unwrap_or_default();
    if email != EMAIL || password != PASSWORD {
        return error_response(StatusCode::UNAUTHORIZED, "Invalid credentials");
    }
    tokens_response(&state.issue(email, "USER"))
}

async fn register(
    State(state): State<Arc<MockState>>,
    mut multipart: Multipart,
) -> axum::response::Response {
    state.register_calls.fetch_add(1, Ordering::SeqCst);

    if state
        .register_rate_limited
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
    {
        return error_response(StatusCode::TOO_MANY_REQUESTS, "Slow down");
    }

    let mut fields = HashMap::new();
    while let Some(field) = multipart.next_field().await.unwrap() {
        let name = field.name().unwrap_or_default().to_string();
        let data = field.bytes().await.unwrap();
        fields.insert(name, String::from_utf8_lossy(&data).into_owned());
    }

    let (Some(email), Some(_), Some(_)) = (
        fields.get("email").cloned(),
        fields.get("username"),
        fields.get("password"),
    ) else {
        return error_response(StatusCode::BAD_REQUEST, "Missing required fields");
    };

    let mut registered = state.registered.lock().unwrap();
    if email == EMAIL || registered.contains_key(&email) {
        return error_response(StatusCode::CONFLICT, "Email already registered");
    }
    registered.insert(email.clone(), fields);
    drop(registered);

    (StatusCode::CREATED, tokens_response(&state.issue(&email, "USER"))).into_response()
}

async fn refresh(State(state): State<Arc<MockState>>, headers: HeaderMap) -> axum::response::Response {
    state.refresh_calls.fetch_add(1, Ordering::SeqCst);

    let latency = *state.refresh_latency.lock().unwrap();
    if !latency.is_zero() {
        tokio::time::sleep(latency).await;
    }

    if state
        .refresh_rate_limited
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
    {
        return error_response(StatusCode::TOO_MANY_REQUESTS, "Slow down");
    }

    if let Some(status) = *state.refresh_status.lock().unwrap() {
        return error_response(status, "Refresh refused");
    }

    let Some(presented) = get_cookie(&headers, "refresh_token").map(str::to_string) else {
        return error_response(StatusCode::UNAUTHORIZED, "Missing refresh token");
    };
    // Single use: a second presentation of the same token fails.
    if !state.refresh_tokens.lock().unwrap().remove(&presented) {
        return error_response(StatusCode::UNAUTHORIZED, "Invalid refresh token");
    }
    tokens_response(&state.issue(EMAIL, "USER"))
}

async fn logout(State(state): State<Arc<MockState>>, headers: HeaderMap) -> StatusCode {
    state.logout_calls.fetch_add(1, Ordering::SeqCst);
    if let Some(token) = get_cookie(&headers, "refresh_token") {
        state.refresh_tokens.lock().unwrap().remove(token);
    }
    StatusCode::NO_CONTENT
}

async fn me(State(state): State<Arc<MockState>>, headers: HeaderMap) -> axum::response::Response {
    state.me_calls.fetch_add(1, Ordering::SeqCst);
    if !state.bearer_valid(&headers) {
        return error_response(StatusCode::UNAUTHORIZED, "Token expired");
    }
    axum::Json(json!({
        "user": { "id": 1, "email": EMAIL, "username": USERNAME, "role": "USER" }
    }))
    .into_response()
}

async fn list_listings(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
) -> axum::response::Response {
    state.resource_calls.fetch_add(1, Ordering::SeqCst);
    state.record(&headers);
    if !state.bearer_valid(&headers) {
        return error_response(StatusCode::UNAUTHORIZED, "Token expired");
    }
    axum::Json(json!([{ "id": 1, "title": "Road bike" }])).into_response()
}

async fn create_listing(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    body: Bytes,
) -> axum::response::Response {
    state.resource_calls.fetch_add(1, Ordering::SeqCst);
    state.record(&headers);
    state.listing_bodies.lock().unwrap().push(body.clone());
    if !state.bearer_valid(&headers) {
        return error_response(StatusCode::UNAUTHORIZED, "Token expired");
    }
    let Ok(listing) = serde_json::from_slice::<serde_json::Value>(&body) else {
        return error_response(StatusCode::UNPROCESSABLE_ENTITY, "Body must be JSON");
    };
    if listing["title"].as_str().is_none_or(str::is_empty) {
        return error_response(StatusCode::UNPROCESSABLE_ENTITY, "Title is required");
    }
    (StatusCode::CREATED, axum::Json(listing)).into_response()
}

/// Waits before checking the bearer, so tokens can change mid-request.
async fn slow_listing(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
) -> axum::response::Response {
    state.resource_calls.fetch_add(1, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(100)).await;
    state.record(&headers);
    if !state.bearer_valid(&headers) {
        return error_response(StatusCode::UNAUTHORIZED, "Token expired");
    }
    axum::Json(json!({ "id": 2 })).into_response()
}

/// Rejects every request, even with a valid token.
async fn restricted(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
) -> axum::response::Response {
    state.resource_calls.fetch_add(1, Ordering::SeqCst);
    state.record(&headers);
    error_response(StatusCode::UNAUTHORIZED, "Not allowed")
}

pub fn mock_router(state: Arc<MockState>) -> Router {
    Router::new()
        .route("/auth/login", post(login))
        .route("/auth/register", post(register))
        .route("/auth/refresh", post(refresh))
        .route("/auth/logout", post(logout))
        .route("/auth/me", get(me))
        .route("/listings", get(list_listings).post(create_listing))
        .route("/listings/slow", get(slow_listing))
        .route("/restricted", get(restricted))
        .with_state(state)
}

/// Client that talks to the mock router, honouring the offline switches.
pub fn mock_client(state: Arc<MockState>) -> HttpClient {
    let router = mock_router(state.clone());
    from_service(tower::service_fn(move |request: Request<Body>| {
        let router = router.clone();
        let state = state.clone();
        async move {
            let refresh = request.uri().path() == "/auth/refresh";
            if state.offline.load(Ordering::SeqCst)
                || (refresh && state.refresh_offline.load(Ordering::SeqCst))
            {
                return Err::<Response<Body>, BoxError>("connection refused".into());
            }
            router
                .oneshot(request)
                .await
                .map_err(|e| -> BoxError { match e {} })
        }
    }))
}

pub fn test_config() -> ClientConfig {
    ClientConfig::new(Url::parse(API_BASE).unwrap())
}

pub struct TestContext {
    pub state: Arc<MockState>,
    pub client: HttpClient,
    pub fallback: Arc<MemoryStore>,
    pub session: Session,
    pub redirects: Arc<AtomicUsize>,
}

impl TestContext {
    /// A second session over the same server and fallback storage, as after
    /// a page reload.
    pub fn reload(&self) -> Session {
        new_session(&self.client, &self.fallback, &self.redirects, &test_config())
    }

    pub fn redirect_count(&self) -> usize {
        self.redirects.load(Ordering::SeqCst)
    }

    /// Store `pair` in the fallback only, as if the cookie had been lost.
    pub fn seed_fallback(&self, pair: &TokenPair) {
        self.fallback
            .set(FALLBACK_KEY, &serde_json::to_string(pair).unwrap())
            .unwrap();
    }

    pub async fn login(&self) {
        self.session.login(EMAIL, PASSWORD).await.unwrap();
    }
}

fn new_session(
    client: &HttpClient,
    fallback: &Arc<MemoryStore>,
    redirects: &Arc<AtomicUsize>,
    config: &ClientConfig,
) -> Session {
    let counter = redirects.clone();
    let redirect = move || {
        counter.fetch_add(1, Ordering::SeqCst);
    };
    Session::with_fallback(client.clone(), fallback.clone(), config, Arc::new(redirect))
}

pub fn setup() -> TestContext {
    setup_with_retry(RetryConfig::default())
}

pub fn setup_with_retry(retry: RetryConfig) -> TestContext {
    let state = Arc::new(MockState::new());
    let client = mock_client(state.clone());
    let fallback = Arc::new(MemoryStore::new());
    let redirects = Arc::new(AtomicUsize::new(0));
    let config = test_config().with_retry(retry);
    let session = new_session(&client, &fallback, &redirects, &config);

    TestContext {
        state,
        client,
        fallback,
        session,
        redirects,
    }
}
