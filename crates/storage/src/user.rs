use anyhow::{anyhow, Context, Result};
use argon2::{password_hash::SaltString, Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use pwhash::rand_core::OsRng;
use serde::Serialize;
use sqlx::PgPool;
use thiserror::Error;
use uuid::Uuid;

/// Repository utilities for user persistence.
pub struct UserRepository;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("user not found")]
    UserNotFound,
    #[error("invalid credentials")]
    InvalidCredentials,
}

#[derive(Debug, Error)]
pub enum CreateUserError {
    #[error("email already registered")]
    EmailTaken,
    #[error("username already taken")]
    UsernameTaken,
    #[error("number already used")]
    NumberTaken,
    #[error("failed to create user: {0}")]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub username: String,
    pub number: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct UserSummary {
    #[serde(rename = "name")]
    pub username: String,
    pub email: String,
}

impl UserRepository {
    /// Create a new user with a hashed password.
    pub async fn create_user(pool: &PgPool, user: &NewUser) -> Result<Uuid, CreateUserError> {
        let id = Uuid::new_v4();
        let salt = SaltString::generate(&mut OsRng);
        let password_hash = Argon2::default()
            .hash_password(user.password.as_bytes(), &salt)
            .map_err(|err| anyhow!("hashing password failed: {err}"))?
            .to_string();

        sqlx::query(
            r#"
            INSERT INTO users (id, email, username, phone_number, password_hash)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(id)
        .bind(&user.email)
        .bind(&user.username)
        .bind(&user.number)
        .bind(password_hash)
        .execute(pool)
        .await
        .map_err(|err| match err {
            sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23505") => {
                match db_err.constraint() {
                    Some("users_email_key") => CreateUserError::EmailTaken,
                    Some("users_username_key") => CreateUserError::UsernameTaken,
                    Some("users_phone_number_key") => CreateUserError::NumberTaken,
                    _ => CreateUserError::Other(anyhow!(db_err.to_string())),
                }
            }
            other => CreateUserError::Other(
                anyhow!(other).context(format!("creating user '{}'", user.email)),
            ),
        })?;

        Ok(id)
    }

    /// Verify credentials and return the account email, which doubles as the
    /// user's identity.
    pub async fn verify_credentials(pool: &PgPool, email: &str, password: &str) -> Result<String> {
        let record = sqlx::query_as::<_, (String, String)>(
            r#"
            SELECT email, password_hash
            FROM users
            WHERE email = $1
            "#,
        )
        .bind(email)
        .fetch_optional(pool)
        .await
        .with_context(|| format!("querying user '{email}'"))?;

        let Some((identity, password_hash)) = record else {
            return Err(CredentialError::UserNotFound.into());
        };

        let parsed_hash = PasswordHash::new(&password_hash)
            .map_err(|err| anyhow!("invalid password hash for '{email}': {err}"))?;

        Argon2::default()
            .verify_password(password.as_bytes(), &parsed_hash)
            .map_err(|_| CredentialError::InvalidCredentials)?;

        Ok(identity)
    }

    pub async fn list_users(pool: &PgPool) -> Result<Vec<UserSummary>> {
        let users = sqlx::query_as::<_, UserSummary>(
            r#"
            SELECT username, email
            FROM users
            ORDER BY username ASC
            "#,
        )
        .fetch_all(pool)
        .await?;
        Ok(users)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_pool;

    fn new_user(tag: &str) -> NewUser {
        NewUser {
            email: format!("{tag}@example.org"),
            username: tag.to_string(),
            number: format!("+1555{}", &tag[..8]),
            password: "correct horse".into(),
        }
    }

    #[tokio::test]
    async fn duplicate_fields_are_reported_when_database_available() -> anyhow::Result<()> {
        let Some(pool) = test_pool("user uniqueness test").await? else {
            return Ok(());
        };
        let tag = Uuid::new_v4().simple().to_string();
        let user = new_user(&tag);
        UserRepository::create_user(pool.pool(), &user).await?;

        let same_email = NewUser {
            username: format!("{tag}-2"),
            number: format!("{}-2", user.number),
            ..user.clone()
        };
        assert!(matches!(
            UserRepository::create_user(pool.pool(), &same_email).await,
            Err(CreateUserError::EmailTaken)
        ));

        let identity =
            UserRepository::verify_credentials(pool.pool(), &user.email, &user.password).await?;
        assert_eq!(identity, user.email);

        let wrong = UserRepository::verify_credentials(pool.pool(), &user.email, "nope").await;
        assert!(matches!(
            wrong.unwrap_err().downcast_ref::<CredentialError>(),
            Some(CredentialError::InvalidCredentials)
        ));
        Ok(())
    }
}
