//! Token records and the update-lock state machine.
//!
//! A [`Token`] is stored once per connected account. Its `is_updating`,
//! `last_update_ms` and `require_refresh` fields encode three states:
//!
//! ```text
//!            admit_update (fresh or stale lock)
//!   Idle ──────────────────────────────────────▶ Updating
//!    ▲                                              │
//!    │ complete_update                              │ credential failure
//!    └──────────────────────────────────────────────┤
//!    ▲                                              ▼
//!    └──────────────── reset ─────────────── RequireRefresh
//! ```
//!
//! `reset` returns any state to `Idle`.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::ProviderError;

/// Default age after which an `is_updating` lock is presumed abandoned.
pub const DEFAULT_STALE_THRESHOLD: Duration = Duration::from_secs(5 * 3600);

/// Persistent record for one connected account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    /// Unique external access identifier (the downstream access token).
    pub access_token: String,
    /// Human-readable account name; names the account queue.
    pub account_name: String,
    /// Opaque service data handed to the integrator.
    #[serde(default)]
    pub data: Value,
    /// Opaque continuation cursor from the last successful cycle.
    #[serde(default)]
    pub cursor: Option<Value>,
    /// Whether an update cycle currently holds the lock.
    #[serde(default)]
    pub is_updating: bool,
    /// When the current (or last) update cycle started, ms since epoch.
    #[serde(default)]
    pub last_update_ms: Option<u64>,
    /// Set once a task reports a credential failure.
    #[serde(default)]
    pub require_refresh: bool,
}

/// State derived from the token flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenState {
    /// No cycle running.
    Idle,
    /// A cycle holds the lock.
    Updating,
    /// Update requests are rejected until an explicit reset.
    RequireRefresh,
}

/// Outcome of a successful lock acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateAdmission {
    /// The token was idle.
    Fresh,
    /// An existing lock was stale (presumed crash) or the caller forced it.
    ForcedRestart,
}

impl UpdateAdmission {
    /// Whether the caller should be told an abandoned cycle is being restarted.
    #[must_use]
    pub const fn is_forced(self) -> bool {
        matches!(self, Self::ForcedRestart)
    }
}

impl Token {
    /// Create an idle token for a freshly connected account.
    pub fn new(access_token: impl Into<String>, account_name: impl Into<String>, data: Value) -> Self {
        Self {
            access_token: access_token.into(),
            account_name: account_name.into(),
            data,
            cursor: None,
            is_updating: false,
            last_update_ms: None,
            require_refresh: false,
        }
    }

    /// Current state of the update lock.
    #[must_use]
    pub const fn state(&self) -> TokenState {
        if self.require_refresh {
            TokenState::RequireRefresh
        } else if self.is_updating {
            TokenState::Updating
        } else {
            TokenState::Idle
        }
    }

    /// Whether the held lock is older than `threshold`.
    ///
    /// A lock without a start time is treated as stale.
    #[must_use]
    pub fn is_stale(&self, now_ms: u64, threshold: Duration) -> bool {
        self.last_update_ms.map_or(true, |started| {
            u128::from(now_ms.saturating_sub(started)) >= threshold.as_millis()
        })
    }

    /// Decide whether a new update cycle may start. Has no side effects.
    ///
    /// # Errors
    ///
    /// - `RequireRefresh` when a credential failure has not been reset yet
    /// - `AlreadyProcessing` when a fresh lock is held and `force` is unset
    pub fn admit_update(
        &self,
        now_ms: u64,
        stale_threshold: Duration,
        force: bool,
    ) -> Result<UpdateAdmission, ProviderError> {
        match self.state() {
            TokenState::RequireRefresh => Err(ProviderError::RequireRefresh),
            TokenState::Idle => Ok(UpdateAdmission::Fresh),
            TokenState::Updating if force || self.is_stale(now_ms, stale_threshold) => {
                Ok(UpdateAdmission::ForcedRestart)
            }
            TokenState::Updating => Err(ProviderError::AlreadyProcessing),
        }
    }

    /// Take the lock.
    pub fn begin_update(&mut self, now_ms: u64) {
        self.is_updating = true;
        self.last_update_ms = Some(now_ms);
    }

    /// Release the lock after a successful cycle.
    pub fn complete_update(&mut self, cursor: Option<Value>, data: Option<Value>) {
        self.cursor = cursor;
        if let Some(data) = data {
            self.data = data;
        }
        self.is_updating = false;
    }

    /// Reject further cycles until [`Token::reset`].
    pub fn mark_require_refresh(&mut self) {
        self.require_refresh = true;
    }

    /// Return to `Idle` and forget the cursor so the next cycle starts over.
    pub fn reset(&mut self) {
        self.cursor = None;
        self.is_updating = false;
        self.last_update_ms = None;
        self.require_refresh = false;
    }
}

/// Ephemeral OAuth handshake state, used at most once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TempToken {
    /// Authorization code issued by the downstream API.
    pub code: String,
    /// Where to send the user once the handshake completes.
    pub return_to: String,
    /// Pre-authorization data produced by the integrator.
    #[serde(default)]
    pub data: Value,
    /// Creation time, ms since epoch.
    pub created_at_ms: u64,
}

impl TempToken {
    /// Whether this handshake outlived `ttl`.
    #[must_use]
    pub fn is_expired(&self, now_ms: u64, ttl: Duration) -> bool {
        u128::from(now_ms.saturating_sub(self.created_at_ms)) >= ttl.as_millis()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const HOUR_MS: u64 = 3600 * 1000;

    fn updating_token(started: u64) -> Token {
        let mut token = Token::new("access", "account", json!({}));
        token.begin_update(started);
        token
    }

    #[test]
    fn idle_token_is_admitted_fresh() {
        let token = Token::new("access", "account", json!({}));
        let admission = token.admit_update(0, DEFAULT_STALE_THRESHOLD, false).unwrap();
        assert_eq!(admission, UpdateAdmission::Fresh);
    }

    #[test]
    fn fresh_lock_rejects_second_request() {
        let token = updating_token(10 * HOUR_MS);
        let before = token.clone();
        let err = token
            .admit_update(10 * HOUR_MS + 1000, DEFAULT_STALE_THRESHOLD, false)
            .unwrap_err();
        assert!(matches!(err, ProviderError::AlreadyProcessing));
        assert_eq!(token, before);
    }

    #[test]
    fn stale_lock_is_restarted() {
        let token = updating_token(0);
        let admission = token.admit_update(6 * HOUR_MS, DEFAULT_STALE_THRESHOLD, false).unwrap();
        assert!(admission.is_forced());
    }

    #[test]
    fn force_flag_bypasses_fresh_lock() {
        let token = updating_token(HOUR_MS);
        let admission = token.admit_update(HOUR_MS + 1, DEFAULT_STALE_THRESHOLD, true).unwrap();
        assert_eq!(admission, UpdateAdmission::ForcedRestart);
    }

    #[test]
    fn require_refresh_blocks_even_forced_updates() {
        let mut token = updating_token(0);
        token.mark_require_refresh();
        assert_eq!(token.state(), TokenState::RequireRefresh);
        let err = token.admit_update(10 * HOUR_MS, DEFAULT_STALE_THRESHOLD, true).unwrap_err();
        assert!(matches!(err, ProviderError::RequireRefresh));
    }

    #[test]
    fn reset_always_returns_to_idle() {
        let mut token = updating_token(42);
        token.cursor = Some(json!("cursor-1"));
        token.mark_require_refresh();
        token.reset();
        assert_eq!(token.state(), TokenState::Idle);
        assert_eq!(token.cursor, None);
        assert_eq!(token.last_update_ms, None);
        assert!(!token.is_updating);
        assert!(!token.require_refresh);
    }

    #[test]
    fn complete_update_keeps_data_when_none_returned() {
        let mut token = updating_token(1);
        token.data = json!({"keep": true});
        token.complete_update(Some(json!(7)), None);
        assert_eq!(token.data, json!({"keep": true}));
        assert_eq!(token.cursor, Some(json!(7)));
        assert_eq!(token.state(), TokenState::Idle);
    }

    #[test]
    fn temp_token_expiry() {
        let temp = TempToken {
            code: "c".into(),
            return_to: "https://manager".into(),
            data: json!(null),
            created_at_ms: 1_000,
        };
        let ttl = Duration::from_secs(600);
        assert!(!temp.is_expired(1_000 + 599_999, ttl));
        assert!(temp.is_expired(1_000 + 600_000, ttl));
    }
}
