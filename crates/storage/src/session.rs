use anyhow::Result;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::StoragePool;

/// A login session as recorded in the `sessions` table.
#[derive(Debug, Clone)]
pub struct PersistedSession {
    pub session_id: Uuid,
    pub identity: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct SessionPersistence {
    pool: StoragePool,
}

impl SessionPersistence {
    pub fn new(pool: StoragePool) -> Self {
        Self { pool }
    }

    /// Session ids are minted per login, so a duplicate id is an error.
    pub async fn store_session(&self, session: &PersistedSession) -> Result<()> {
        sqlx::query(
            "INSERT INTO sessions (session_id, identity, issued_at, expires_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(session.session_id)
        .bind(&session.identity)
        .bind(session.issued_at)
        .bind(session.expires_at)
        .execute(self.pool.pool())
        .await?;
        Ok(())
    }

    /// Drop sessions whose expiry has passed. Returns the number removed.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(r#"DELETE FROM sessions WHERE expires_at <= $1"#)
            .bind(now)
            .execute(self.pool.pool())
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_pool;
    use anyhow::Context;
    use chrono::Duration;
    use sqlx::Row;

    #[tokio::test]
    async fn stores_session_when_database_available() -> anyhow::Result<()> {
        let Some(pool) = test_pool("session persistence test").await? else {
            return Ok(());
        };
        let persistence = SessionPersistence::new(pool.clone());

        let session = PersistedSession {
            session_id: Uuid::new_v4(),
            identity: "tester@example.org".into(),
            issued_at: Utc::now() - Duration::hours(2),
            expires_at: Utc::now() - Duration::hours(1),
        };

        persistence.store_session(&session).await?;

        let stored = sqlx::query(r#"SELECT identity FROM sessions WHERE session_id = $1"#)
            .bind(session.session_id)
            .fetch_one(pool.pool())
            .await
            .with_context(|| "expected session row to exist")?;
        let identity: String = stored.try_get("identity")?;
        assert_eq!(identity, session.identity);

        assert!(persistence.purge_expired(Utc::now()).await? >= 1);
        let remaining = sqlx::query(r#"SELECT 1 FROM sessions WHERE session_id = $1"#)
            .bind(session.session_id)
            .fetch_optional(pool.pool())
            .await?;
        assert!(remaining.is_none());

        Ok(())
    }
}
