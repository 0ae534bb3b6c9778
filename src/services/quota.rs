//! Atomic fixed-window admission control backed by a server-side script.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use redis::ErrorKind;

const QUOTA_KEY_PREFIX: &str = "image_jobs:quota";

/// Check-and-increment in one step. Returns 1 when admitted, 0 when denied;
/// a denial leaves the counter untouched.
const QUOTA_SCRIPT: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
if current >= tonumber(ARGV[1]) then
  return 0
end
local updated = redis.call('INCR', KEYS[1])
if updated == 1 then
  redis.call('EXPIRE', KEYS[1], ARGV[2])
end
return 1
"#;

#[derive(Debug, thiserror::Error)]
pub enum QuotaError {
    #[error("window seconds must be positive and fit in milliseconds, got {0}")]
    InvalidWindow(i64),

    #[error("subject id must not be empty")]
    EmptySubject,

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Index of the fixed window containing `now`.
pub fn window_key(now: DateTime<Utc>, window_seconds: i64) -> Result<i64, QuotaError> {
    let window_millis = window_millis(window_seconds)?;
    Ok(now.timestamp_millis().div_euclid(window_millis))
}

fn window_millis(window_seconds: i64) -> Result<i64, QuotaError> {
    match window_seconds.checked_mul(1000) {
        Some(millis) if millis > 0 => Ok(millis),
        _ => Err(QuotaError::InvalidWindow(window_seconds)),
    }
}

pub fn counter_key(subject_id: &str, window_key: i64) -> String {
    format!("{}:{}:{}", QUOTA_KEY_PREFIX, subject_id, window_key)
}

/// Input checks that run before any round-trip. `Ok(false)` means the
/// request is denied outright.
pub fn precheck(subject_id: &str, limit: i64, window_seconds: i64) -> Result<bool, QuotaError> {
    window_millis(window_seconds)?;
    if subject_id.trim().is_empty() {
        return Err(QuotaError::EmptySubject);
    }
    Ok(limit > 0)
}

/// Per-connection limiter. Owns the cached script hash for its connection,
/// so nothing leaks across connections or tests.
pub struct QuotaLimiter {
    conn: MultiplexedConnection,
    script_sha: Mutex<Option<String>>,
}

impl QuotaLimiter {
    pub fn new(conn: MultiplexedConnection) -> Self {
        Self {
            conn,
            script_sha: Mutex::new(None),
        }
    }

    pub async fn check_and_increment(
        &self,
        subject_id: &str,
        limit: i64,
        window_seconds: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, QuotaError> {
        if !precheck(subject_id, limit, window_seconds)? {
            return Ok(false);
        }

        let key = counter_key(subject_id, window_key(now, window_seconds)?);
        let mut conn = self.conn.clone();

        let cached = self.script_sha.lock().clone();
        let sha = match cached {
            Some(sha) => sha,
            None => self.load_script(&mut conn).await?,
        };

        let admitted = match eval(&mut conn, &sha, &key, limit, window_seconds).await {
            Ok(admitted) => admitted,
            Err(e) if e.kind() == ErrorKind::NoScriptError => {
                // Script cache was flushed server-side: reload and retry once.
                tracing::debug!("Quota script evicted, reloading");
                let sha = self.load_script(&mut conn).await?;
                eval(&mut conn, &sha, &key, limit, window_seconds).await?
            }
            Err(e) => return Err(e.into()),
        };

        Ok(admitted == 1)
    }

    async fn load_script(&self, conn: &mut MultiplexedConnection) -> Result<String, QuotaError> {
        let sha: String = redis::cmd("SCRIPT")
            .arg("LOAD")
            .arg(QUOTA_SCRIPT)
            .query_async(conn)
            .await?;
        *self.script_sha.lock() = Some(sha.clone());
        Ok(sha)
    }
}

async fn eval(
    conn: &mut MultiplexedConnection,
    sha: &str,
    key: &str,
    limit: i64,
    window_seconds: i64,
) -> redis::RedisResult<i64> {
    redis::cmd("EVALSHA")
        .arg(sha)
        .arg(1)
        .arg(key)
        .arg(limit)
        .arg(window_seconds)
        .query_async(conn)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_window_key_is_floor_of_millis() {
        let now = Utc.timestamp_millis_opt(7_199_999).unwrap();
        assert_eq!(window_key(now, 3600).unwrap(), 1);
        let now = Utc.timestamp_millis_opt(7_200_000).unwrap();
        assert_eq!(window_key(now, 3600).unwrap(), 2);
    }

    #[test]
    fn test_window_too_large_for_millis_is_invalid() {
        let huge = i64::MAX / 100;
        let now = Utc.timestamp_millis_opt(7_200_000).unwrap();
        assert!(matches!(window_key(now, huge), Err(QuotaError::InvalidWindow(w)) if w == huge));
        assert!(matches!(precheck("u", 5, huge), Err(QuotaError::InvalidWindow(w)) if w == huge));
        // The largest window that still fits is accepted.
        assert!(precheck("u", 5, i64::MAX / 1000).unwrap());
    }

    #[test]
    fn test_counter_key_layout() {
        assert_eq!(counter_key("user-1", 42), "image_jobs:quota:user-1:42");
    }

    #[test]
    fn test_invalid_window_fails_fast() {
        assert!(matches!(precheck("u", 5, 0), Err(QuotaError::InvalidWindow(0))));
        assert!(matches!(precheck("u", 5, -10), Err(QuotaError::InvalidWindow(-10))));
    }

    #[test]
    fn test_non_positive_limit_denies() {
        assert!(!precheck("u", 0, 60).unwrap());
        assert!(precheck("u", 1, 60).unwrap());
    }

    #[test]
    fn test_empty_subject_rejected() {
        assert!(matches!(precheck("  ", 5, 60), Err(QuotaError::EmptySubject)));
    }
}
