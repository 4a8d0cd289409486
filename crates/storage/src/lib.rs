//! Storage helpers for Postgres access.

use std::sync::Arc;

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;

pub mod messaging;
pub mod session;
pub mod user;

pub use sqlx::PgPool;

pub use messaging::MessageRepository;
pub use session::{PersistedSession, SessionPersistence};
pub use user::{CreateUserError, CredentialError, NewUser, UserRepository, UserSummary};

const MAX_POOL_CONNECTIONS: u32 = 10;

/// Shared handle to the Postgres pool used by every repository.
#[derive(Clone)]
pub struct StoragePool(Arc<PgPool>);

impl StoragePool {
    pub fn new(pool: PgPool) -> Self {
        Self(Arc::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.0
    }
}

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations");

/// Connect to Postgres and bring the schema up to date.
pub async fn connect(database_url: &str) -> Result<StoragePool> {
    let pool = PgPoolOptions::new()
        .max_connections(MAX_POOL_CONNECTIONS)
        .connect(database_url)
        .await?;
    MIGRATOR.run(&pool).await?;

    Ok(StoragePool::new(pool))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::env;

    /// Connects to the test database, or returns `None` when none is configured.
    pub async fn test_pool(label: &str) -> Result<Option<StoragePool>> {
        let database_url =
            match env::var("PARLEY_TEST_DATABASE_URL").or_else(|_| env::var("DATABASE_URL")) {
                Ok(url) => url,
                Err(_) => {
                    eprintln!(
                        "skipping {label}: set PARLEY_TEST_DATABASE_URL or DATABASE_URL"
                    );
                    return Ok(None);
                }
            };
        connect(&database_url).await.map(Some)
    }
}
