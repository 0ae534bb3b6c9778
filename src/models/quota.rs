use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Fixed-window usage state for one subject.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QuotaWindow {
    pub subject_id: String,
    pub window_start_at: DateTime<Utc>,
    pub used_count: i64,
    pub limit: i64,
    pub window_hours: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QuotaDecision {
    pub allowed: bool,
    pub window: QuotaWindow,
    /// Set only on denial: when the current window rolls over.
    pub next_window_start_at: Option<DateTime<Utc>>,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum QuotaModelError {
    #[error("requested images must be non-negative, got {0}")]
    NegativeRequest(i64),

    #[error("window hours must be positive and representable, got {0}")]
    InvalidWindow(i64),
}

/// Pure model of the fixed-window quota, identical in semantics to the
/// server-side script but evaluated against an explicit state object.
pub fn apply_quota(
    window: &QuotaWindow,
    requested_images: i64,
    now: DateTime<Utc>,
    limit: i64,
    window_hours: i64,
) -> Result<QuotaDecision, QuotaModelError> {
    if requested_images < 0 {
        return Err(QuotaModelError::NegativeRequest(requested_images));
    }
    let span = match Duration::try_hours(window_hours) {
        Some(span) if window_hours > 0 => span,
        _ => return Err(QuotaModelError::InvalidWindow(window_hours)),
    };
    let rollover = |start: DateTime<Utc>| {
        start
            .checked_add_signed(span)
            .ok_or(QuotaModelError::InvalidWindow(window_hours))
    };

    if now.signed_duration_since(window.window_start_at) >= span {
        // A fresh window still has to fit the request.
        let allowed = requested_images <= limit;
        let next_window_start_at = if allowed { None } else { Some(rollover(now)?) };
        let next = QuotaWindow {
            subject_id: window.subject_id.clone(),
            window_start_at: now,
            used_count: if allowed { requested_images } else { 0 },
            limit,
            window_hours,
        };
        return Ok(QuotaDecision {
            allowed,
            next_window_start_at,
            window: next,
        });
    }

    let mut next = QuotaWindow {
        limit,
        window_hours,
        ..window.clone()
    };

    // A sum past i64::MAX can never fit the limit.
    match window.used_count.checked_add(requested_images) {
        Some(used) if used <= limit => {
            next.used_count = used;
            Ok(QuotaDecision {
                allowed: true,
                window: next,
                next_window_start_at: None,
            })
        }
        _ => Ok(QuotaDecision {
            allowed: false,
            next_window_start_at: Some(rollover(window.window_start_at)?),
            window: next,
        }),
    }
}
