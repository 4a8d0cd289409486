use std::{collections::HashMap, sync::Arc};

use anyhow::Result;
use async_trait::async_trait;
use axum::{
    extract::State,
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use parley_crypto::{
    generate_signing_key, sign_message, signing_key_from_base64, verify_signature,
    verifying_key_from, Signature, SigningKey, VerifyingKey,
};
use parley_storage::{
    CreateUserError, CredentialError, NewUser, PersistedSession, SessionPersistence, StoragePool,
    UserRepository, UserSummary,
};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{
    config::SessionConfig,
    response::{required_field, ErrorBody},
    users::UserDirectory,
    AppState,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("no session token supplied")]
    MissingToken,
    #[error("session token is invalid")]
    InvalidToken,
    #[error("session token has expired")]
    TokenExpired,
}

impl AuthError {
    pub fn reason(&self) -> &'static str {
        match self {
            AuthError::MissingToken => "missing_token",
            AuthError::InvalidToken => "invalid_token",
            AuthError::TokenExpired => "token_expired",
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        (
            StatusCode::UNAUTHORIZED,
            Json(ErrorBody::unauthorized(self.reason())),
        )
            .into_response()
    }
}

#[derive(Clone)]
pub struct SessionContext {
    signer: SessionSigner,
    authenticator: Arc<dyn SessionAuthenticator>,
    repository: Arc<dyn SessionRepository>,
    ttl: Duration,
}

impl SessionContext {
    pub fn new(
        signer: SessionSigner,
        authenticator: Arc<dyn SessionAuthenticator>,
        repository: Arc<dyn SessionRepository>,
    ) -> Self {
        Self {
            signer,
            authenticator,
            repository,
            ttl: Duration::hours(SessionConfig::default().ttl_hours),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub async fn login(&self, attempt: LoginAttempt) -> Result<Option<LoginResponse>> {
        let user = match self.authenticator.authenticate(&attempt).await? {
            Some(user) => user,
            None => return Ok(None),
        };

        let claims = self.build_claims(user.identity);
        let token = self.signer.sign(&claims)?;
        self.repository.persist_session(&claims).await?;

        Ok(Some(LoginResponse {
            token,
            email: claims.identity,
            expires_at: claims.expires_at,
        }))
    }

    /// Check a token's signature and expiry against the current time.
    pub fn verify(&self, token: &str) -> Result<SessionClaims, AuthError> {
        self.signer.verify(token, Utc::now())
    }

    /// Resolve the session carried by an `Authorization: Bearer` header.
    pub fn authorize(&self, headers: &HeaderMap) -> Result<SessionClaims, AuthError> {
        let token = bearer_token(headers).ok_or(AuthError::MissingToken)?;
        self.verify(token)
    }

    fn build_claims(&self, identity: String) -> SessionClaims {
        let issued_at = Utc::now();
        SessionClaims {
            session_id: Uuid::new_v4(),
            identity,
            issued_at,
            expires_at: issued_at + self.ttl,
        }
    }
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Signs session claims as `base64url(claims).base64url(signature)`.
#[derive(Clone)]
pub struct SessionSigner {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl SessionSigner {
    pub fn from_config(config: &SessionConfig) -> Result<Self> {
        let signing_key = match config.signing_key.as_deref() {
            Some(raw) => signing_key_from_base64(raw)?,
            None => generate_signing_key(),
        };
        Ok(Self::from_key(signing_key))
    }

    fn from_key(signing_key: SigningKey) -> Self {
        let verifying_key = verifying_key_from(&signing_key);
        Self {
            signing_key,
            verifying_key,
        }
    }

    pub fn verifying_key_base64(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.verifying_key.as_bytes())
    }

    pub fn sign(&self, claims: &SessionClaims) -> Result<String> {
        let payload = serde_json::to_vec(claims)?;
        let signature = sign_message(&self.signing_key, &payload);

        Ok(format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&payload),
            URL_SAFE_NO_PAD.encode(signature.to_bytes())
        ))
    }

    pub fn verify(&self, token: &str, now: DateTime<Utc>) -> Result<SessionClaims, AuthError> {
        let (payload, signature) = token
            .trim()
            .split_once('.')
            .ok_or(AuthError::InvalidToken)?;
        let payload = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| AuthError::InvalidToken)?;
        let signature: [u8; 64] = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| AuthError::InvalidToken)?
            .try_into()
            .map_err(|_| AuthError::InvalidToken)?;

        verify_signature(
            &self.verifying_key,
            &payload,
            &Signature::from_bytes(&signature),
        )
        .map_err(|_| AuthError::InvalidToken)?;

        let claims: SessionClaims =
            serde_json::from_slice(&payload).map_err(|_| AuthError::InvalidToken)?;
        if claims.expires_at <= now {
            return Err(AuthError::TokenExpired);
        }
        Ok(claims)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionClaims {
    pub session_id: Uuid,
    pub identity: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct LoginAttempt {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub identity: String,
}

#[async_trait]
pub trait SessionAuthenticator: Send + Sync {
    async fn authenticate(&self, attempt: &LoginAttempt) -> Result<Option<AuthenticatedUser>>;
}

#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn persist_session(&self, claims: &SessionClaims) -> Result<()>;
}

/// Accounts and sessions kept in process memory, used when no database is configured.
#[derive(Default)]
pub struct InMemorySessionStore {
    accounts: RwLock<HashMap<String, AccountRecord>>,
    sessions: RwLock<HashMap<Uuid, SessionClaims>>,
}

struct AccountRecord {
    username: String,
    number: String,
    secret: String,
}

#[async_trait]
impl SessionAuthenticator for InMemorySessionStore {
    async fn authenticate(&self, attempt: &LoginAttempt) -> Result<Option<AuthenticatedUser>> {
        let accounts = self.accounts.read().await;
        match accounts.get(&attempt.email) {
            Some(record) if record.secret == attempt.password => Ok(Some(AuthenticatedUser {
                identity: attempt.email.clone(),
            })),
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl SessionRepository for InMemorySessionStore {
    async fn persist_session(&self, claims: &SessionClaims) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        sessions.retain(|_, existing| existing.expires_at > claims.issued_at);
        sessions.insert(claims.session_id, claims.clone());
        Ok(())
    }
}

#[async_trait]
impl UserDirectory for InMemorySessionStore {
    async fn create_user(&self, user: &NewUser) -> Result<(), CreateUserError> {
        let mut accounts = self.accounts.write().await;
        if accounts.contains_key(&user.email) {
            return Err(CreateUserError::EmailTaken);
        }
        if accounts.values().any(|a| a.username == user.username) {
            return Err(CreateUserError::UsernameTaken);
        }
        if accounts.values().any(|a| a.number == user.number) {
            return Err(CreateUserError::NumberTaken);
        }
        accounts.insert(
            user.email.clone(),
            AccountRecord {
                username: user.username.clone(),
                number: user.number.clone(),
                secret: user.password.clone(),
            },
        );
        Ok(())
    }

    async fn list_users(&self) -> Result<Vec<UserSummary>> {
        let accounts = self.accounts.read().await;
        let mut users: Vec<UserSummary> = accounts
            .iter()
            .map(|(email, record)| UserSummary {
                username: record.username.clone(),
                email: email.clone(),
            })
            .collect();
        users.sort_by(|a, b| a.username.cmp(&b.username));
        Ok(users)
    }
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[derive(Clone)]
pub struct DatabaseSessionAuthenticator {
    pool: StoragePool,
}

impl DatabaseSessionAuthenticator {
    pub fn new(pool: StoragePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionAuthenticator for DatabaseSessionAuthenticator {
    async fn authenticate(&self, attempt: &LoginAttempt) -> Result<Option<AuthenticatedUser>> {
        match UserRepository::verify_credentials(self.pool.pool(), &attempt.email, &attempt.password)
            .await
        {
            Ok(identity) => Ok(Some(AuthenticatedUser { identity })),
            Err(err) => match err.downcast_ref::<CredentialError>() {
                Some(CredentialError::InvalidCredentials | CredentialError::UserNotFound) => {
                    Ok(None)
                }
                None => Err(err),
            },
        }
    }
}

pub struct PostgresSessionRepository {
    persistence: SessionPersistence,
}

impl PostgresSessionRepository {
    pub fn new(pool: StoragePool) -> Self {
        Self {
            persistence: SessionPersistence::new(pool),
        }
    }
}

#[async_trait]
impl SessionRepository for PostgresSessionRepository {
    async fn persist_session(&self, claims: &SessionClaims) -> Result<()> {
        let persisted = PersistedSession {
            session_id: claims.session_id,
            identity: claims.identity.clone(),
            issued_at: claims.issued_at,
            expires_at: claims.expires_at,
        };
        self.persistence.store_session(&persisted).await
    }
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl LoginRequest {
    fn validate(self) -> Result<LoginAttempt, Vec<crate::response::FieldError>> {
        let mut errors = Vec::new();
        let email = required_field(self.email, "email", &mut errors);
        let password = required_field(self.password, "password", &mut errors);

        if errors.is_empty() {
            Ok(LoginAttempt { email, password })
        } else {
            Err(errors)
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoginResponse {
    pub token: String,
    pub email: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Serialize)]
struct VerifyResponse {
    email: String,
    expires_at: DateTime<Utc>,
}

pub async fn login(State(state): State<AppState>, Json(payload): Json<LoginRequest>) -> Response {
    let attempt = match payload.validate() {
        Ok(attempt) => attempt,
        Err(errors) => {
            return (StatusCode::BAD_REQUEST, Json(ErrorBody::validation(errors))).into_response();
        }
    };

    match state.session().login(attempt).await {
        Ok(Some(response)) => (StatusCode::OK, Json(response)).into_response(),
        Ok(None) => (
            StatusCode::UNAUTHORIZED,
            Json(ErrorBody::simple("invalid_credentials")),
        )
            .into_response(),
        Err(err) => {
            tracing::error!(?err, "failed to complete login attempt");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorBody::simple("server_error")),
            )
                .into_response()
        }
    }
}

pub async fn verify(State(state): State<AppState>, Json(payload): Json<VerifyRequest>) -> Response {
    let token = payload.token.unwrap_or_default();
    if token.trim().is_empty() {
        return AuthError::MissingToken.into_response();
    }

    match state.session().verify(&token) {
        Ok(claims) => (
            StatusCode::OK,
            Json(VerifyResponse {
                email: claims.identity,
                expires_at: claims.expires_at,
            }),
        )
            .into_response(),
        Err(err) => err.into_response(),
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    pub struct SessionTestHarness {
        pub context: Arc<SessionContext>,
        pub store: Arc<InMemorySessionStore>,
    }

    impl SessionTestHarness {
        pub fn new() -> Self {
            let store = Arc::new(InMemorySessionStore::new());
            let signer = SessionSigner::from_config(&SessionConfig::default()).expect("signer");
            let context = Arc::new(SessionContext::new(signer, store.clone(), store.clone()));
            Self { context, store }
        }

        pub async fn register_user(&self, email: &str, password: &str) {
            let tag = email.split('@').next().unwrap_or(email);
            self.store
                .create_user(&NewUser {
                    email: email.to_string(),
                    username: tag.to_string(),
                    number: format!("+1-{tag}"),
                    password: password.to_string(),
                })
                .await
                .expect("user registers");
        }

        /// Registers `email` and returns a freshly issued token for it.
        pub async fn token_for(&self, email: &str) -> String {
            self.register_user(email, "test-secret").await;
            self.context
                .login(LoginAttempt {
                    email: email.to_string(),
                    password: "test-secret".to_string(),
                })
                .await
                .expect("login succeeds")
                .expect("login response")
                .token
        }
    }

    #[tokio::test]
    async fn login_issues_verifiable_token_and_persists_session() {
        let harness = SessionTestHarness::new();
        let token = harness.token_for("alice@example.org").await;

        let claims = harness.context.verify(&token).expect("token verifies");
        assert_eq!(claims.identity, "alice@example.org");
        assert!(claims.expires_at > claims.issued_at);
        assert_eq!(harness.store.session_count().await, 1);
    }

    #[tokio::test]
    async fn login_rejects_wrong_password() {
        let harness = SessionTestHarness::new();
        harness.register_user("bob@example.org", "right").await;

        let result = harness
            .context
            .login(LoginAttempt {
                email: "bob@example.org".into(),
                password: "wrong".into(),
            })
            .await
            .expect("login completes");
        assert!(result.is_none());
    }

    #[test]
    fn verify_distinguishes_expired_from_invalid() {
        let signer = SessionSigner::from_key(generate_signing_key());
        let now = Utc::now();
        let claims = SessionClaims {
            session_id: Uuid::new_v4(),
            identity: "carol@example.org".into(),
            issued_at: now - Duration::hours(2),
            expires_at: now - Duration::hours(1),
        };
        let token = signer.sign(&claims).expect("signs");
        assert_eq!(signer.verify(&token, now), Err(AuthError::TokenExpired));

        let other = SessionSigner::from_key(generate_signing_key());
        let foreign = other
            .sign(&SessionClaims {
                expires_at: now + Duration::hours(1),
                ..claims.clone()
            })
            .expect("signs");
        assert_eq!(signer.verify(&foreign, now), Err(AuthError::InvalidToken));
        assert_eq!(signer.verify("garbage", now), Err(AuthError::InvalidToken));
    }

    #[test]
    fn bearer_token_requires_bearer_scheme() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(AUTHORIZATION, "Basic abc".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);

        headers.insert(AUTHORIZATION, "Bearer abc.def".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("abc.def"));
    }
}
