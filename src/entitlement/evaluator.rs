//! Pure entitlement evaluation.
//!
//! `evaluate` is a function of a record and a clock instant and nothing
//! else. It never writes; callers that observe an expiry crossing persist
//! it themselves (see the access gate and the status endpoint).

use serde::{Deserialize, Serialize};

use super::store::{Entitlement, EntitlementStatus};

const SECONDS_PER_DAY: u64 = 86_400;

/// Why access was denied, in the shape clients consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DenialReason {
    TrialExpired,
    SubscriptionRequired,
    PaymentPastDue,
    FreeAccessExpired,
}

impl std::fmt::Display for DenialReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::TrialExpired => "trial expired",
            Self::SubscriptionRequired => "subscription required",
            Self::PaymentPastDue => "payment past due",
            Self::FreeAccessExpired => "free access expired",
        };
        f.write_str(s)
    }
}

/// Result of evaluating an entitlement at an instant.
#[derive(Debug, Clone, Serialize)]
pub struct Evaluation {
    pub has_access: bool,
    /// The effective status, which may differ from the stored one: a
    /// lapsed trial or free-access window evaluates as `Expired` even
    /// before the record is rewritten.
    pub status: EntitlementStatus,
    pub is_trial: bool,
    /// Whole days until the validity window closes, rounded up. `Some(0)`
    /// exactly at the expiry instant, never negative, `None` when there is
    /// no window.
    pub days_remaining: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub denial_reason: Option<DenialReason>,
}

impl Evaluation {
    fn denied(status: EntitlementStatus, reason: DenialReason) -> Self {
        Self {
            has_access: false,
            status,
            is_trial: false,
            days_remaining: None,
            denial_reason: Some(reason),
        }
    }
}

fn days_remaining(valid_until: u64, now: u64) -> u64 {
    let remaining = valid_until.saturating_sub(now);
    remaining.div_ceil(SECONDS_PER_DAY)
}

// A missing window on Trial or FreeAccess means the provider supplied no
// usable timestamp. There is nothing to compare, so the window is treated
// as still open rather than guessed at.
fn window_open(valid_until: Option<u64>, now: u64) -> bool {
    match valid_until {
        Some(until) => until >= now,
        None => true,
    }
}

/// Evaluate an entitlement record at `now` (unix seconds).
///
/// Rules, in priority order:
/// 1. `FreeAccess` within its window grants access and wins over anything
///    the provider ever said.
/// 2. A lapsed `FreeAccess` window denies as `Expired`.
/// 3. `Active` grants access regardless of any validity window.
/// 4. `Trial` within its window grants access, flagged as a trial with the
///    days remaining.
/// 5. A lapsed `Trial` denies as `Expired`.
/// 6. Everything else denies, with `PastDue` distinguished so clients can
///    prompt for payment rather than a new subscription.
#[must_use]
pub fn evaluate(entitlement: &Entitlement, now: u64) -> Evaluation {
    match entitlement.status {
        EntitlementStatus::FreeAccess => {
            if window_open(entitlement.status_valid_until, now) {
                Evaluation {
                    has_access: true,
                    status: EntitlementStatus::FreeAccess,
                    is_trial: false,
                    days_remaining: entitlement.status_valid_until.map(|v| days_remaining(v, now)),
                    denial_reason: None,
                }
            } else {
                Evaluation::denied(EntitlementStatus::Expired, DenialReason::FreeAccessExpired)
            }
        }
        EntitlementStatus::Active => Evaluation {
            has_access: true,
            status: EntitlementStatus::Active,
            is_trial: false,
            days_remaining: entitlement.status_valid_until.map(|v| days_remaining(v, now)),
            denial_reason: None,
        },
        EntitlementStatus::Trial => {
            if window_open(entitlement.status_valid_until, now) {
                Evaluation {
                    has_access: true,
                    status: EntitlementStatus::Trial,
                    is_trial: true,
                    days_remaining: entitlement.status_valid_until.map(|v| days_remaining(v, now)),
                    denial_reason: None,
                }
            } else {
                Evaluation::denied(EntitlementStatus::Expired, DenialReason::TrialExpired)
            }
        }
        EntitlementStatus::PastDue => {
            Evaluation::denied(EntitlementStatus::PastDue, DenialReason::PaymentPastDue)
        }
        EntitlementStatus::Expired => {
            // A stored Expired record no longer knows which window lapsed;
            // the precise reason was reported at the crossing, before the
            // record was rewritten.
            Evaluation::denied(EntitlementStatus::Expired, DenialReason::SubscriptionRequired)
        }
        status => Evaluation::denied(status, DenialReason::SubscriptionRequired),
    }
}
