//! Session links and per-(identity, index) access grants.

use chrono::{DateTime, Utc};
use sqlx::Row;

use docdex_shared::{AccessLevel, DocdexError, Identity, IndexName, Result, Scope};

use crate::{Store, storage_err};

/// An authorization tuple binding an identity (or every identity, when both
/// ids are `NULL`) to an index at an access level.
#[derive(Debug, Clone)]
pub struct AccessGrant {
    pub scope: Scope,
    pub user_id: Option<String>,
    pub team_id: Option<String>,
    pub index_name: IndexName,
    pub access_level: AccessLevel,
    pub granted_by: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl AccessGrant {
    /// Grant for a specific identity.
    pub fn for_identity(
        identity: &Identity,
        index_name: IndexName,
        access_level: AccessLevel,
        granted_by: impl Into<String>,
    ) -> Self {
        Self {
            scope: identity.scope,
            user_id: identity.user_id.clone(),
            team_id: identity.team_id.clone(),
            index_name,
            access_level,
            granted_by: granted_by.into(),
            expires_at: None,
        }
    }

    /// Grant every identity access to the index.
    pub fn universal(
        index_name: IndexName,
        access_level: AccessLevel,
        granted_by: impl Into<String>,
    ) -> Self {
        Self {
            scope: Scope::User,
            user_id: None,
            team_id: None,
            index_name,
            access_level,
            granted_by: granted_by.into(),
            expires_at: None,
        }
    }

    pub fn expiring_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }
}

/// Grant-matching predicate shared by the access queries: a non-expired row
/// that is universal or matches the identity's scope-selected id.
const GRANT_MATCH: &str = "(expires_at IS NULL OR expires_at > now())
      AND ( (user_id IS NULL AND team_id IS NULL)
         OR (scope = 'user' AND user_id = $1)
         OR (scope = 'team' AND team_id = $2) )";

impl Store {
    /// Link a session id to an identity (upsert by session id).
    pub async fn link_session(&self, session_id: &str, identity: &Identity) -> Result<()> {
        identity.validate()?;
        sqlx::query(
            "INSERT INTO user_links (session_id, user_id, team_id, scope)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (session_id) DO UPDATE SET
               user_id = excluded.user_id,
               team_id = excluded.team_id,
               scope = excluded.scope,
               last_used_at = now()",
        )
        .bind(session_id)
        .bind(&identity.user_id)
        .bind(&identity.team_id)
        .bind(identity.scope.as_str())
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    /// Resolve a session to its linked identity, refreshing the idle clock.
    /// Fails with [`DocdexError::NotLinked`] when no link exists.
    pub async fn session_identity(&self, session_id: &str) -> Result<Identity> {
        let row = sqlx::query(
            "UPDATE user_links SET last_used_at = now()
             WHERE session_id = $1
             RETURNING user_id, team_id, scope",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        let Some(row) = row else {
            return Err(DocdexError::NotLinked);
        };

        let scope: String = row.try_get("scope").map_err(storage_err)?;
        Ok(Identity {
            scope: scope.parse()?,
            user_id: row.try_get("user_id").map_err(storage_err)?,
            team_id: row.try_get("team_id").map_err(storage_err)?,
        })
    }

    /// Upsert an access grant (unique by scope + identity ids + index).
    pub async fn grant_access(&self, grant: &AccessGrant) -> Result<()> {
        sqlx::query(
            "INSERT INTO doc_access
               (user_id, team_id, scope, index_name, access_level, granted_by, expires_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (COALESCE(user_id, ''), COALESCE(team_id, ''), scope, index_name)
             DO UPDATE SET
               access_level = excluded.access_level,
               granted_by = excluded.granted_by,
               granted_at = now(),
               expires_at = excluded.expires_at",
        )
        .bind(&grant.user_id)
        .bind(&grant.team_id)
        .bind(grant.scope.as_str())
        .bind(grant.index_name.as_str())
        .bind(grant.access_level.as_str())
        .bind(&grant.granted_by)
        .bind(grant.expires_at)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    /// Distinct index names the identity holds a grant for (any level).
    pub async fn accessible_indexes(&self, identity: &Identity) -> Result<Vec<String>> {
        identity.validate()?;
        let (user_id, team_id) = scoped_ids(identity);

        let rows = sqlx::query(&format!(
            "SELECT DISTINCT index_name FROM doc_access
             WHERE {GRANT_MATCH}
             ORDER BY index_name"
        ))
        .bind(user_id)
        .bind(team_id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        rows.iter()
            .map(|row| row.try_get("index_name").map_err(storage_err))
            .collect()
    }

    /// Whether the identity's best grant on `index` is at least `required`.
    pub async fn has_access(
        &self,
        identity: &Identity,
        index: &IndexName,
        required: AccessLevel,
    ) -> Result<bool> {
        identity.validate()?;
        let (user_id, team_id) = scoped_ids(identity);

        let rows = sqlx::query(&format!(
            "SELECT access_level FROM doc_access
             WHERE {GRANT_MATCH} AND index_name = $3"
        ))
        .bind(user_id)
        .bind(team_id)
        .bind(index.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        let best = rows
            .iter()
            .filter_map(|row| {
                row.try_get::<String, _>("access_level")
                    .ok()
                    .and_then(|level| level.parse::<AccessLevel>().ok())
            })
            .max();

        Ok(best.is_some_and(|level| level >= required))
    }

    /// Garbage-collect session links idle longer than the window. Returns
    /// the number of pruned rows.
    pub async fn prune_session_links(&self, idle_days: u32) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM user_links
             WHERE last_used_at < now() - make_interval(days => $1)",
        )
        .bind(i32::try_from(idle_days).unwrap_or(i32::MAX))
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(result.rows_affected())
    }
}

/// The identity ids used for grant matching, restricted to the identity's
/// scope so a team session never matches user grants and vice versa.
fn scoped_ids(identity: &Identity) -> (Option<&str>, Option<&str>) {
    match identity.scope {
        Scope::User => (identity.user_id.as_deref(), None),
        Scope::Team => (None, identity.team_id.as_deref()),
    }
}
