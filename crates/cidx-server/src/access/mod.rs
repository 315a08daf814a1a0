//! Access Control: local password auth, sessions, group ACLs,
//! impersonation, and the append-only audit log.
//!
//! `EffectiveIdentity` is the "who is calling, what are they allowed to
//! do" object threaded through every call boundary, resolved once per
//! request and never recomputed mid-dispatch.

use std::collections::HashSet;

use argon2::password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use chrono::{Duration, Utc};
use cidx_core::error::{CidxError, CidxResult};
use cidx_core::model::{AuditEvent, AuditOutcome, CorrelationId, Group, Permission, Session, User};
use sqlx::SqlitePool;
use uuid::Uuid;

/// Whether the server currently refuses new mutating requests,
/// evaluated before impersonation and group ACL on every authorize call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaintenanceState {
    Normal,
    Maintenance,
}

/// The identity a permission check is evaluated against, after
/// impersonation substitution.
#[derive(Debug, Clone)]
pub struct EffectiveIdentity {
    pub caller: String,
    pub acting_as: String,
    pub group: Group,
}

pub struct AccessControl {
    pool: SqlitePool,
}

impl AccessControl {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create_user(&self, username: &str, password: &str, group: &str) -> CidxResult<()> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| CidxError::Internal(format!("password hashing failed: {e}")))?
            .to_string();

        sqlx::query("INSERT INTO users (username, password_hash, group_name) VALUES (?, ?, ?)")
            .bind(username)
            .bind(hash)
            .bind(group)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                if e.to_string().contains("UNIQUE") {
                    CidxError::Conflict(format!("user '{username}' already exists"))
                } else {
                    CidxError::Internal(e.to_string())
                }
            })?;
        Ok(())
    }

    /// Verifies a username/password pair and mints a short-lived,
    /// refreshable session.
    pub async fn login(&self, username: &str, password: &str, ttl_secs: u64) -> CidxResult<Session> {
        let row: Option<(String,)> = sqlx::query_as("SELECT password_hash FROM users WHERE username = ?")
            .bind(username)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| CidxError::Internal(e.to_string()))?;

        let Some((hash,)) = row else {
            return Err(CidxError::Unauthenticated("invalid username or password".to_string()));
        };
        let parsed = PasswordHash::new(&hash)
            .map_err(|e| CidxError::Internal(format!("corrupt password hash: {e}")))?;
        if Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_err()
        {
            return Err(CidxError::Unauthenticated("invalid username or password".to_string()));
        }

        let now = Utc::now();
        let session = Session {
            id: Uuid::new_v4(),
            username: username.to_string(),
            impersonating: None,
            created_at: now,
            expires_at: now + Duration::seconds(ttl_secs as i64),
        };
        sqlx::query(
            "INSERT INTO sessions (id, username, impersonating, created_at, expires_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(session.id.to_string())
        .bind(&session.username)
        .bind(&session.impersonating)
        .bind(session.created_at.to_rfc3339())
        .bind(session.expires_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| CidxError::Internal(e.to_string()))?;

        Ok(session)
    }

    pub async fn get_session(&self, id: Uuid) -> CidxResult<Session> {
        let row: Option<(String, Option<String>, String, String)> = sqlx::query_as(
            "SELECT username, impersonating, created_at, expires_at FROM sessions WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CidxError::Internal(e.to_string()))?;

        let Some((username, impersonating, created_at, expires_at)) = row else {
            return Err(CidxError::Unauthenticated("session not found".to_string()));
        };
        let session = Session {
            id,
            username,
            impersonating,
            created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
                .map_err(|e| CidxError::Internal(e.to_string()))?
                .with_timezone(&Utc),
            expires_at: chrono::DateTime::parse_from_rfc3339(&expires_at)
                .map_err(|e| CidxError::Internal(e.to_string()))?
                .with_timezone(&Utc),
        };
        if session.is_expired() {
            return Err(CidxError::Unauthenticated("session expired".to_string()));
        }
        Ok(session)
    }

    /// Admin-only: set or clear an impersonation target on a live
    /// session. Never widens permissions — enforced at check time by
    /// evaluating the *target's* group, not the caller's.
    pub async fn impersonate(&self, session_id: Uuid, target: Option<&str>) -> CidxResult<()> {
        sqlx::query("UPDATE sessions SET impersonating = ? WHERE id = ?")
            .bind(target)
            .bind(session_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| CidxError::Internal(e.to_string()))?;
        Ok(())
    }

    async fn load_group_for(&self, username: &str) -> CidxResult<Group> {
        let user_row: Option<(String,)> = sqlx::query_as("SELECT group_name FROM users WHERE username = ?")
            .bind(username)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| CidxError::Internal(e.to_string()))?;
        let Some((group_name,)) = user_row else {
            return Err(CidxError::NotFound(format!("user '{username}' not found")));
        };

        let group_row: Option<(String, String)> = sqlx::query_as(
            "SELECT accessible_repos_json, permissions_json FROM groups WHERE name = ?",
        )
        .bind(&group_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CidxError::Internal(e.to_string()))?;
        let Some((repos_json, perms_json)) = group_row else {
            return Err(CidxError::NotFound(format!("group '{group_name}' not found")));
        };

        let accessible_repos: HashSet<String> =
            serde_json::from_str(&repos_json).map_err(|e| CidxError::Internal(e.to_string()))?;
        let permissions: HashSet<Permission> =
            serde_json::from_str(&perms_json).map_err(|e| CidxError::Internal(e.to_string()))?;

        Ok(Group {
            name: group_name,
            accessible_repos,
            permissions,
        })
    }

    /// Resolves a session to the identity permission checks evaluate
    /// against: the impersonation target's group if set, else the
    /// caller's own.
    pub async fn effective_identity(&self, session: &Session) -> CidxResult<EffectiveIdentity> {
        let acting_as = session.effective_username().to_string();
        let group = self.load_group_for(&acting_as).await?;
        Ok(EffectiveIdentity {
            caller: session.username.clone(),
            acting_as,
            group,
        })
    }

    /// Checks `(a)` maintenance, `(b)` impersonation-scoped permission,
    /// `(c)` repository ACL, in that order, recorded to the audit log
    /// regardless of outcome.
    pub async fn authorize(
        &self,
        identity: &EffectiveIdentity,
        maintenance: MaintenanceState,
        is_write: bool,
        required: Permission,
        repo_alias: Option<&str>,
        action: &str,
        correlation_id: &CorrelationId,
    ) -> CidxResult<()> {
        let result = self
            .authorize_inner(identity, maintenance, is_write, required, repo_alias)
            .await;

        let outcome = match &result {
            Ok(()) => AuditOutcome::Allowed,
            Err(CidxError::PermissionDenied(_)) | Err(CidxError::Maintenance(_)) => {
                AuditOutcome::Denied
            }
            Err(_) => AuditOutcome::Error,
        };
        let _ = self
            .record_audit(
                &identity.caller,
                Some(&identity.acting_as).filter(|a| **a != identity.caller),
                action,
                repo_alias,
                correlation_id,
                outcome,
            )
            .await;

        result
    }

    async fn authorize_inner(
        &self,
        identity: &EffectiveIdentity,
        maintenance: MaintenanceState,
        is_write: bool,
        required: Permission,
        repo_alias: Option<&str>,
    ) -> CidxResult<()> {
        if is_write && maintenance == MaintenanceState::Maintenance {
            return Err(CidxError::Maintenance(
                "server is in maintenance mode; writes are refused".to_string(),
            ));
        }
        if !identity.group.permissions.contains(&required) {
            return Err(CidxError::PermissionDenied(format!(
                "'{}' lacks permission {:?}",
                identity.acting_as, required
            )));
        }
        if let Some(alias) = repo_alias {
            if !identity.group.can_access_repo(alias) {
                return Err(CidxError::PermissionDenied(format!(
                    "'{}' has no access to repository '{alias}'",
                    identity.acting_as
                )));
            }
        }
        Ok(())
    }

    pub async fn record_audit(
        &self,
        actor: &str,
        acting_as: Option<&str>,
        action: &str,
        target: Option<&str>,
        correlation_id: &CorrelationId,
        outcome: AuditOutcome,
    ) -> CidxResult<()> {
        let event = AuditEvent {
            id: Uuid::new_v4(),
            at: Utc::now(),
            actor: actor.to_string(),
            acting_as: acting_as.map(str::to_string),
            action: action.to_string(),
            target: target.map(str::to_string),
            correlation_id: correlation_id.clone(),
            outcome,
        };
        sqlx::query(
            "INSERT INTO audit_log (id, at, actor, acting_as, action, target, correlation_id, outcome) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(event.id.to_string())
        .bind(event.at.to_rfc3339())
        .bind(&event.actor)
        .bind(&event.acting_as)
        .bind(&event.action)
        .bind(&event.target)
        .bind(event.correlation_id.to_string())
        .bind(format!("{:?}", event.outcome))
        .execute(&self.pool)
        .await
        .map_err(|e| CidxError::Internal(e.to_string()))?;
        Ok(())
    }

    /// Audit entries in `[from, to]`, newest first.
    pub async fn audit_log(
        &self,
        from: chrono::DateTime<Utc>,
        to: chrono::DateTime<Utc>,
    ) -> CidxResult<Vec<AuditEvent>> {
        let rows: Vec<(String, String, String, Option<String>, String, Option<String>, String, String)> =
            sqlx::query_as(
                "SELECT id, at, actor, acting_as, action, target, correlation_id, outcome \
                 FROM audit_log WHERE at >= ? AND at <= ? ORDER BY at DESC",
            )
            .bind(from.to_rfc3339())
            .bind(to.to_rfc3339())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| CidxError::Internal(e.to_string()))?;

        rows.into_iter()
            .map(|(id, at, actor, acting_as, action, target, correlation_id, outcome)| {
                Ok(AuditEvent {
                    id: Uuid::parse_str(&id).map_err(|e| CidxError::Internal(e.to_string()))?,
                    at: chrono::DateTime::parse_from_rfc3339(&at)
                        .map_err(|e| CidxError::Internal(e.to_string()))?
                        .with_timezone(&Utc),
                    actor,
                    acting_as,
                    action,
                    target,
                    correlation_id: CorrelationId(correlation_id),
                    outcome: match outcome.as_str() {
                        "Allowed" => AuditOutcome::Allowed,
                        "Denied" => AuditOutcome::Denied,
                        _ => AuditOutcome::Error,
                    },
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_pool() -> SqlitePool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        crate::db::migrate(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn login_rejects_unknown_user() {
        let pool = test_pool().await;
        let ac = AccessControl::new(pool);
        let err = ac.login("nobody", "whatever", 900).await.unwrap_err();
        assert!(matches!(err, CidxError::Unauthenticated(_)));
    }

    #[tokio::test]
    async fn login_succeeds_with_correct_password() {
        let pool = test_pool().await;
        let ac = AccessControl::new(pool);
        ac.create_user("alice", "correct horse", "default").await.unwrap();
        let session = ac.login("alice", "correct horse", 900).await.unwrap();
        assert_eq!(session.username, "alice");
    }

    #[tokio::test]
    async fn login_rejects_wrong_password() {
        let pool = test_pool().await;
        let ac = AccessControl::new(pool);
        ac.create_user("alice", "correct horse", "default").await.unwrap();
        let err = ac.login("alice", "wrong", 900).await.unwrap_err();
        assert!(matches!(err, CidxError::Unauthenticated(_)));
    }

    #[tokio::test]
    async fn impersonation_uses_target_group_not_callers() {
        let pool = test_pool().await;
        let ac = AccessControl::new(pool);

        sqlx::query("INSERT INTO groups (name, accessible_repos_json, permissions_json) VALUES (?, ?, ?)")
            .bind("admins")
            .bind(serde_json::to_string(&HashSet::<String>::from_iter(["foo-global".to_string()])).unwrap())
            .bind(serde_json::to_string(&HashSet::from([Permission::RepositoryAdmin])).unwrap())
            .execute(&ac.pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO groups (name, accessible_repos_json, permissions_json) VALUES (?, ?, ?)")
            .bind("readonly")
            .bind(serde_json::to_string(&HashSet::<String>::from_iter(["foo-global".to_string()])).unwrap())
            .bind(serde_json::to_string(&HashSet::from([Permission::QueryRepos])).unwrap())
            .execute(&ac.pool)
            .await
            .unwrap();

        ac.create_user("admin_user", "pw", "admins").await.unwrap();
        ac.create_user("limited_user", "pw", "readonly").await.unwrap();

        let session = ac.login("admin_user", "pw", 900).await.unwrap();
        ac.impersonate(session.id, Some("limited_user")).await.unwrap();
        let refreshed = ac.get_session(session.id).await.unwrap();

        let identity = ac.effective_identity(&refreshed).await.unwrap();
        assert_eq!(identity.acting_as, "limited_user");
        assert!(!identity.group.permissions.contains(&Permission::RepositoryAdmin));
    }
}
