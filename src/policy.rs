use std::collections::HashMap;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::limits::*;
use crate::model::*;

/// Business vertical a tenant operates in. Each has its own defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Vertical {
    Restaurant,
    Clinic,
    #[default]
    Generic,
}

/// Every numeric knob the trust, hold and confirmation logic reads.
/// Fetched once per request and passed down explicitly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    pub initial_score: i32,
    /// Score a customer gets back after an expired block is lifted.
    pub neutral_score: i32,
    pub confirmation_threshold: i32,
    pub deposit_threshold: i32,
    pub block_threshold: i32,
    pub no_show_delta: i32,
    pub no_pickup_delta: i32,
    pub late_cancellation_delta: i32,
    pub success_delta: i32,
    pub no_show_block_strikes: u32,
    pub no_pickup_block_strikes: u32,
    pub block_days: u32,
    pub penalty_retention_days: u32,
    pub hold_minutes: u32,
    pub confirmation_timeout_minutes: u32,
    pub confirmation_auto_action: AutoAction,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            initial_score: 80,
            neutral_score: 50,
            confirmation_threshold: 60,
            deposit_threshold: 40,
            block_threshold: 20,
            no_show_delta: -20,
            no_pickup_delta: -25,
            late_cancellation_delta: -10,
            success_delta: 5,
            no_show_block_strikes: 3,
            no_pickup_block_strikes: 2,
            block_days: 30,
            penalty_retention_days: 90,
            hold_minutes: 10,
            confirmation_timeout_minutes: 24 * 60,
            confirmation_auto_action: AutoAction::NotifyStaff,
        }
    }
}

impl Policy {
    pub fn for_vertical(vertical: Vertical) -> Self {
        let base = Self::default();
        match vertical {
            Vertical::Generic => base,
            Vertical::Clinic => Self {
                confirmation_timeout_minutes: 12 * 60,
                confirmation_auto_action: AutoAction::Cancel,
                ..base
            },
            Vertical::Restaurant => Self {
                hold_minutes: 5,
                confirmation_timeout_minutes: 2 * 60,
                confirmation_auto_action: AutoAction::Keep,
                ..base
            },
        }
    }

    pub fn delta_for(&self, kind: ViolationKind) -> i32 {
        match kind {
            ViolationKind::NoShow => self.no_show_delta,
            ViolationKind::NoPickup => self.no_pickup_delta,
            ViolationKind::LateCancellation => self.late_cancellation_delta,
        }
    }

    /// Strike count at which a violation kind triggers an auto-block, if any.
    pub fn block_strikes_for(&self, kind: ViolationKind) -> Option<u32> {
        match kind {
            ViolationKind::NoShow => Some(self.no_show_block_strikes),
            ViolationKind::NoPickup => Some(self.no_pickup_block_strikes),
            ViolationKind::LateCancellation => None,
        }
    }

    pub fn hold_ttl_ms(&self) -> Ms {
        (self.hold_minutes as Ms * MINUTE_MS).clamp(MIN_HOLD_TTL_MS, MAX_HOLD_TTL_MS)
    }

    pub fn block_duration_ms(&self) -> Ms {
        self.block_days as Ms * DAY_MS
    }

    pub fn penalty_retention_ms(&self) -> Ms {
        self.penalty_retention_days as Ms * DAY_MS
    }

    pub fn confirmation_timeout_ms(&self) -> Ms {
        self.confirmation_timeout_minutes as Ms * MINUTE_MS
    }

    pub fn status_for(&self, record: &TrustScore, is_blocked: bool) -> TrustStatus {
        TrustStatus {
            score: record.score,
            requires_confirmation: record.score < self.confirmation_threshold,
            requires_deposit: record.score < self.deposit_threshold,
            is_blocked,
            is_vip: record.is_vip,
        }
    }

    /// Pull scores back into range and make penalty deltas non-positive.
    fn sanitized(mut self) -> Self {
        self.initial_score = clamp_score(self.initial_score);
        self.neutral_score = clamp_score(self.neutral_score);
        self.confirmation_threshold = clamp_score(self.confirmation_threshold);
        self.deposit_threshold = clamp_score(self.deposit_threshold);
        self.block_threshold = clamp_score(self.block_threshold);
        self.no_show_delta = -self.no_show_delta.saturating_abs();
        self.no_pickup_delta = -self.no_pickup_delta.saturating_abs();
        self.late_cancellation_delta = -self.late_cancellation_delta.saturating_abs();
        self.success_delta = self.success_delta.saturating_abs();
        self.no_show_block_strikes = self.no_show_block_strikes.max(1);
        self.no_pickup_block_strikes = self.no_pickup_block_strikes.max(1);
        self
    }
}

/// Sparse set of fields to lay over a base policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyOverrides {
    pub initial_score: Option<i32>,
    pub neutral_score: Option<i32>,
    pub confirmation_threshold: Option<i32>,
    pub deposit_threshold: Option<i32>,
    pub block_threshold: Option<i32>,
    pub no_show_delta: Option<i32>,
    pub no_pickup_delta: Option<i32>,
    pub late_cancellation_delta: Option<i32>,
    pub success_delta: Option<i32>,
    pub no_show_block_strikes: Option<u32>,
    pub no_pickup_block_strikes: Option<u32>,
    pub block_days: Option<u32>,
    pub penalty_retention_days: Option<u32>,
    pub hold_minutes: Option<u32>,
    pub confirmation_timeout_minutes: Option<u32>,
    pub confirmation_auto_action: Option<AutoAction>,
}

macro_rules! overlay {
    ($base:ident, $over:ident, $($field:ident),+ $(,)?) => {
        $( if let Some(v) = $over.$field { $base.$field = v; } )+
    };
}

impl PolicyOverrides {
    pub fn apply(&self, mut base: Policy) -> Policy {
        let o = self;
        overlay!(
            base,
            o,
            initial_score,
            neutral_score,
            confirmation_threshold,
            deposit_threshold,
            block_threshold,
            no_show_delta,
            no_pickup_delta,
            late_cancellation_delta,
            success_delta,
            no_show_block_strikes,
            no_pickup_block_strikes,
            block_days,
            penalty_retention_days,
            hold_minutes,
            confirmation_timeout_minutes,
            confirmation_auto_action,
        );
        base
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantPolicy {
    #[serde(default)]
    pub vertical: Vertical,
    #[serde(default)]
    pub overrides: PolicyOverrides,
}

/// All policy configuration: per-vertical overrides and per-tenant entries.
/// Resolution order is built-in vertical defaults, then vertical overrides,
/// then tenant overrides. Unknown tenants get the generic defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyBook {
    #[serde(default)]
    pub verticals: HashMap<Vertical, PolicyOverrides>,
    #[serde(default)]
    pub tenants: HashMap<String, TenantPolicy>,
}

impl PolicyBook {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Load from a JSON file. A missing file yields an empty book.
    pub fn load(path: &Path) -> io::Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::from_json(&text)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e),
        }
    }

    pub fn resolve(&self, tenant: &str) -> Policy {
        let entry = self.tenants.get(tenant);
        let vertical = entry.map(|t| t.vertical).unwrap_or_default();
        let mut policy = Policy::for_vertical(vertical);
        if let Some(over) = self.verticals.get(&vertical) {
            policy = over.apply(policy);
        }
        if let Some(t) = entry {
            policy = t.overrides.apply(policy);
        }
        policy.sanitized()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let p = Policy::default();
        assert_eq!(p.initial_score, 80);
        assert_eq!(p.neutral_score, 50);
        assert_eq!(p.no_show_block_strikes, 3);
        assert!(p.no_pickup_block_strikes < p.no_show_block_strikes);
        assert!(p.no_show_delta < p.late_cancellation_delta);
        assert!(p.success_delta < -p.late_cancellation_delta);
        assert_eq!(p.penalty_retention_ms(), 90 * DAY_MS);
    }

    #[test]
    fn unknown_tenant_gets_generic() {
        let book = PolicyBook::default();
        assert_eq!(book.resolve("nobody"), Policy::default());
    }

    #[test]
    fn layering_vertical_then_tenant() {
        let book = PolicyBook::from_json(
            r#"{
                "verticals": { "clinic": { "deposit_threshold": 55 } },
                "tenants": {
                    "acme_dental": {
                        "vertical": "clinic",
                        "overrides": { "hold_minutes": 15, "confirmation_auto_action": "notify_staff" }
                    }
                }
            }"#,
        )
        .unwrap();
        let p = book.resolve("acme_dental");
        assert_eq!(p.deposit_threshold, 55);
        assert_eq!(p.hold_minutes, 15);
        assert_eq!(p.confirmation_timeout_minutes, 12 * 60);
        assert_eq!(p.confirmation_auto_action, AutoAction::NotifyStaff);
    }

    #[test]
    fn sanitizes_out_of_range_values() {
        let book = PolicyBook::from_json(
            r#"{ "tenants": { "t": { "overrides": {
                "confirmation_threshold": 250,
                "no_show_delta": 30,
                "no_show_block_strikes": 0
            } } } }"#,
        )
        .unwrap();
        let p = book.resolve("t");
        assert_eq!(p.confirmation_threshold, 100);
        assert_eq!(p.no_show_delta, -30);
        assert_eq!(p.no_show_block_strikes, 1);
    }

    #[test]
    fn extreme_deltas_saturate() {
        let book = PolicyBook::from_json(&format!(
            r#"{{ "tenants": {{ "t": {{ "overrides": {{
                "no_pickup_delta": {min},
                "success_delta": {min}
            }} }} }} }}"#,
            min = i32::MIN
        ))
        .unwrap();
        let p = book.resolve("t");
        assert_eq!(p.no_pickup_delta, -i32::MAX);
        assert_eq!(p.success_delta, i32::MAX);
    }

    #[test]
    fn hold_ttl_is_bounded() {
        let p = Policy {
            hold_minutes: 100_000,
            ..Policy::default()
        };
        assert_eq!(p.hold_ttl_ms(), MAX_HOLD_TTL_MS);
        let p = Policy {
            hold_minutes: 0,
            ..Policy::default()
        };
        assert_eq!(p.hold_ttl_ms(), MIN_HOLD_TTL_MS);
    }

    #[test]
    fn status_thresholds() {
        let p = Policy::default();
        let mut r = TrustScore::new(&CustomerRef::new(None, "a"), 25, 0);
        let s = p.status_for(&r, false);
        assert!(s.requires_confirmation);
        assert!(s.requires_deposit);
        r.score = 60;
        let s = p.status_for(&r, false);
        assert!(!s.requires_confirmation);
        assert!(!s.requires_deposit);
    }

    #[test]
    fn missing_file_is_empty_book() {
        let path = std::env::temp_dir().join("slotguard_no_such_policy.json");
        let _ = std::fs::remove_file(&path);
        assert_eq!(PolicyBook::load(&path).unwrap(), PolicyBook::default());
    }
}
