//! Cross-process embed rate coordination.
//!
//! Admission is serialized through a named advisory lock and a singleton
//! counter row. The lock is only held while reading/rolling/updating the
//! row; when a caller has to wait for a window to roll, it releases the
//! lock first, sleeps, and retries, so waiting processes never block each
//! other's admission checks.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::{Connection, Row};
use tracing::debug;

use docdex_shared::Result;

use crate::storage_err;

/// Advisory lock key for the embed rate window ("docdex" in ASCII).
const ADVISORY_LOCK_KEY: i64 = 0x646F_6364_6578;

const MINUTE: Duration = Duration::from_secs(60);
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Window quotas mirrored from the in-process limiter configuration.
#[derive(Debug, Clone)]
pub struct RateWindowQuotas {
    pub requests_per_minute: u64,
    pub tokens_per_minute: u64,
    pub tokens_per_day: u64,
}

/// Cross-process admission gate backed by `docs_embed_rate_window`.
#[derive(Clone)]
pub struct DistributedRateLimiter {
    pool: PgPool,
    quotas: RateWindowQuotas,
}

enum Admission {
    Admitted,
    WaitFor(Duration),
}

impl DistributedRateLimiter {
    pub fn new(pool: PgPool, quotas: RateWindowQuotas) -> Self {
        Self { pool, quotas }
    }

    /// Block until the shared windows admit `requests`/`tokens`, then admit
    /// by bumping the shared counters.
    pub async fn acquire(&self, requests: u64, tokens: u64) -> Result<()> {
        loop {
            let decision = self.locked_admission(requests, tokens).await?;
            match decision {
                Admission::Admitted => return Ok(()),
                Admission::WaitFor(wait) => {
                    debug!(
                        wait_ms = wait.as_millis() as u64,
                        "shared rate window full, waiting"
                    );
                    // The advisory lock is already released here.
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Take the advisory lock, run one admission check, release the lock.
    async fn locked_admission(&self, requests: u64, tokens: u64) -> Result<Admission> {
        let mut conn = self.pool.acquire().await.map_err(storage_err)?;

        sqlx::query("SELECT pg_advisory_lock($1)")
            .bind(ADVISORY_LOCK_KEY)
            .execute(&mut *conn)
            .await
            .map_err(storage_err)?;

        let decision = self.try_admit(&mut *conn, requests, tokens).await;

        let unlock = sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(ADVISORY_LOCK_KEY)
            .execute(&mut *conn)
            .await;

        if unlock.is_err() {
            // The lock is tied to the session; closing the connection frees it.
            let _ = conn.detach().close().await;
        }

        decision
    }

    async fn try_admit(
        &self,
        conn: &mut sqlx::PgConnection,
        requests: u64,
        tokens: u64,
    ) -> Result<Admission> {
        let row = sqlx::query(
            "SELECT minute_start, minute_requests, minute_tokens, day_start, day_tokens
             FROM docs_embed_rate_window WHERE id = 1",
        )
        .fetch_one(&mut *conn)
        .await
        .map_err(storage_err)?;

        let now = Utc::now();
        let mut minute_start: DateTime<Utc> = row.try_get("minute_start").map_err(storage_err)?;
        let mut minute_requests: i64 = row.try_get("minute_requests").map_err(storage_err)?;
        let mut minute_tokens: i64 = row.try_get("minute_tokens").map_err(storage_err)?;
        let mut day_start: DateTime<Utc> = row.try_get("day_start").map_err(storage_err)?;
        let mut day_tokens: i64 = row.try_get("day_tokens").map_err(storage_err)?;

        // Deterministic rollover relative to each window's start.
        if elapsed(minute_start, now) >= MINUTE {
            minute_start = now;
            minute_requests = 0;
            minute_tokens = 0;
        }
        if elapsed(day_start, now) >= DAY {
            day_start = now;
            day_tokens = 0;
        }

        let minute_ok = admits(
            minute_requests as u64,
            requests,
            self.quotas.requests_per_minute,
        ) && admits(minute_tokens as u64, tokens, self.quotas.tokens_per_minute);
        let day_ok = admits(day_tokens as u64, tokens, self.quotas.tokens_per_day);

        if minute_ok && day_ok {
            sqlx::query(
                "UPDATE docs_embed_rate_window SET
                   minute_start = $1,
                   minute_requests = $2,
                   minute_tokens = $3,
                   day_start = $4,
                   day_tokens = $5
                 WHERE id = 1",
            )
            .bind(minute_start)
            .bind(minute_requests + requests as i64)
            .bind(minute_tokens + tokens as i64)
            .bind(day_start)
            .bind(day_tokens + tokens as i64)
            .execute(&mut *conn)
            .await
            .map_err(storage_err)?;
            return Ok(Admission::Admitted);
        }

        let until_minute = remaining(minute_start, MINUTE, now);
        let until_day = remaining(day_start, DAY, now);
        let wait = match (minute_ok, day_ok) {
            (false, true) => until_minute,
            (true, false) => until_day,
            _ => until_minute.min(until_day),
        };
        Ok(Admission::WaitFor(wait.max(Duration::from_millis(50))))
    }
}

fn elapsed(start: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - start).to_std().unwrap_or(Duration::ZERO)
}

fn remaining(start: DateTime<Utc>, window: Duration, now: DateTime<Utc>) -> Duration {
    window.saturating_sub(elapsed(start, now))
}

/// Same oversize rule as the in-process limiter: an admission larger than a
/// whole quota is allowed alone at the start of a fresh window.
fn admits(used: u64, add: u64, quota: u64) -> bool {
    used + add <= quota || (add > quota && used == 0)
}
