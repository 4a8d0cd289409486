use anyhow::Result;
use async_trait::async_trait;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use parley_storage::{CreateUserError, NewUser, StoragePool, UserRepository, UserSummary};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::{
    response::{required_field, ErrorBody, FieldError},
    AppState,
};

/// Account records consumed by signup and the user listing.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn create_user(&self, user: &NewUser) -> Result<(), CreateUserError>;
    async fn list_users(&self) -> Result<Vec<UserSummary>>;
}

#[derive(Clone)]
pub struct DatabaseUserDirectory {
    pool: StoragePool,
}

impl DatabaseUserDirectory {
    pub fn new(pool: StoragePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserDirectory for DatabaseUserDirectory {
    async fn create_user(&self, user: &NewUser) -> Result<(), CreateUserError> {
        UserRepository::create_user(self.pool.pool(), user)
            .await
            .map(|_| ())
    }

    async fn list_users(&self) -> Result<Vec<UserSummary>> {
        UserRepository::list_users(self.pool.pool()).await
    }
}

#[derive(Debug, Deserialize)]
pub struct SignupRequest {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub number: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl SignupRequest {
    fn validate(self) -> Result<NewUser, Vec<FieldError>> {
        let mut errors = Vec::new();

        let email = required_field(self.email, "email", &mut errors);
        if !email.is_empty() && !email.contains('@') {
            errors.push(FieldError::new("email", "must be an email address"));
        }
        let username = required_field(self.username, "username", &mut errors);
        let number = required_field(self.number, "number", &mut errors);
        let password = required_field(self.password, "password", &mut errors);

        if errors.is_empty() {
            Ok(NewUser {
                email,
                username,
                number,
                password,
            })
        } else {
            Err(errors)
        }
    }
}

#[derive(Debug, Serialize)]
struct SignupResponse {
    email: String,
    username: String,
}

pub async fn signup(State(state): State<AppState>, Json(payload): Json<SignupRequest>) -> Response {
    let user = match payload.validate() {
        Ok(user) => user,
        Err(details) => {
            return (StatusCode::BAD_REQUEST, Json(ErrorBody::validation(details))).into_response();
        }
    };

    match state.users().create_user(&user).await {
        Ok(()) => (
            StatusCode::CREATED,
            Json(SignupResponse {
                email: user.email,
                username: user.username,
            }),
        )
            .into_response(),
        Err(CreateUserError::EmailTaken) => conflict("email_taken"),
        Err(CreateUserError::UsernameTaken) => conflict("username_taken"),
        Err(CreateUserError::NumberTaken) => conflict("number_taken"),
        Err(CreateUserError::Other(err)) => {
            error!(?err, "failed to create user");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorBody::simple("server_error")),
            )
                .into_response()
        }
    }
}

fn conflict(error: &'static str) -> Response {
    (StatusCode::CONFLICT, Json(ErrorBody::simple(error))).into_response()
}

pub async fn list_users(State(state): State<AppState>) -> Response {
    match state.users().list_users().await {
        Ok(users) => (StatusCode::OK, Json(users)).into_response(),
        Err(err) => {
            error!(?err, "failed to list users");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(Vec::<UserSummary>::new()),
            )
                .into_response()
        }
    }
}
