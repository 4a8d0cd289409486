use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::{
    registry::Connection,
    session::{AuthError, SessionClaims, SessionContext},
};

/// Decides whether a connection may authenticate and whether its events are
/// admitted to the relay.
#[derive(Clone)]
pub struct SessionGate {
    sessions: Arc<SessionContext>,
    required: bool,
}

impl SessionGate {
    pub fn new(sessions: Arc<SessionContext>, required: bool) -> Self {
        Self { sessions, required }
    }

    pub fn authenticate(&self, token: &str) -> Result<SessionClaims, AuthError> {
        if token.trim().is_empty() {
            return Err(AuthError::MissingToken);
        }
        self.sessions.verify(token)
    }

    /// Expiry applies to every bound connection, even when sessions are optional.
    pub fn admit(&self, connection: &Connection, now: DateTime<Utc>) -> Result<(), AuthError> {
        if let Some(expires_at) = connection.session_expires_at {
            if expires_at <= now {
                return Err(AuthError::TokenExpired);
            }
        }
        if self.required && !connection.is_bound() {
            return Err(AuthError::MissingToken);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{registry::ConnectionId, session::tests::SessionTestHarness};
    use chrono::Duration;

    fn connection(identity: Option<&str>, expires_at: Option<DateTime<Utc>>) -> Connection {
        Connection {
            id: ConnectionId::new(),
            identity: identity.map(str::to_string),
            session_expires_at: expires_at,
            connected_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn authenticate_verifies_issued_tokens() {
        let harness = SessionTestHarness::new();
        let token = harness.token_for("dana@example.org").await;
        let gate = SessionGate::new(harness.context.clone(), true);

        let claims = gate.authenticate(&token).expect("token accepted");
        assert_eq!(claims.identity, "dana@example.org");
        assert_eq!(gate.authenticate("  "), Err(AuthError::MissingToken));
        assert_eq!(gate.authenticate("nope"), Err(AuthError::InvalidToken));
    }

    #[test]
    fn unbound_connections_need_a_session_only_when_required() {
        let harness = SessionTestHarness::new();
        let now = Utc::now();
        let anonymous = connection(None, None);

        let strict = SessionGate::new(harness.context.clone(), true);
        assert_eq!(strict.admit(&anonymous, now), Err(AuthError::MissingToken));

        let open = SessionGate::new(harness.context, false);
        assert_eq!(open.admit(&anonymous, now), Ok(()));
    }

    #[test]
    fn expired_sessions_are_refused_in_either_mode() {
        let harness = SessionTestHarness::new();
        let now = Utc::now();
        let stale = connection(Some("erin@example.org"), Some(now - Duration::seconds(1)));
        let fresh = connection(Some("erin@example.org"), Some(now + Duration::hours(1)));

        for required in [true, false] {
            let gate = SessionGate::new(harness.context.clone(), required);
            assert_eq!(gate.admit(&stale, now), Err(AuthError::TokenExpired));
            assert_eq!(gate.admit(&fresh, now), Ok(()));
        }
    }
}
