use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;
use crate::policy::Policy;

use super::store::{EntryKind, SlotKey};
use super::{Engine, EngineError};

/// Arguments to [`Engine::acquire_hold`].
#[derive(Debug, Clone)]
pub struct HoldRequest {
    pub branch_id: Ulid,
    pub start: Ms,
    pub duration: Ms,
    pub session_id: String,
    pub kind: HoldKind,
    pub customer_id: Option<Ulid>,
    pub staff_id: Option<Ulid>,
    pub service_id: Option<Ulid>,
    /// Overrides the policy's hold lifetime for this one hold.
    pub hold_minutes: Option<u32>,
}

impl HoldRequest {
    pub fn new(branch_id: Ulid, start: Ms, duration: Ms, session_id: impl Into<String>) -> Self {
        Self {
            branch_id,
            start,
            duration,
            session_id: session_id.into(),
            kind: HoldKind::Voice,
            customer_id: None,
            staff_id: None,
            service_id: None,
            hold_minutes: None,
        }
    }

    pub fn kind(mut self, kind: HoldKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn customer(mut self, id: Ulid) -> Self {
        self.customer_id = Some(id);
        self
    }

    pub fn staff(mut self, id: Ulid) -> Self {
        self.staff_id = Some(id);
        self
    }
}

fn validate_window(start: Ms, duration: Ms, now: Ms) -> Result<Span, &'static str> {
    if duration <= 0 {
        return Err("duration must be positive");
    }
    if duration > MAX_HOLD_DURATION_MS {
        return Err("duration exceeds hold limit");
    }
    let span = in_range_span(start, duration).ok_or("timestamp out of range")?;
    if start <= now {
        return Err("slot start is not in the future");
    }
    Ok(span)
}

/// The window `[start, start + duration)` if it lies inside the accepted
/// timestamp range.
pub(super) fn in_range_span(start: Ms, duration: Ms) -> Option<Span> {
    if !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&start) {
        return None;
    }
    Span::try_from_duration(start, duration).filter(|s| s.end <= MAX_VALID_TIMESTAMP_MS)
}

fn rejection_label(r: &HoldRejection) -> &'static str {
    match r {
        HoldRejection::SlotBeingProcessed => "slot_being_processed",
        HoldRejection::SlotHeld { .. } => "slot_held",
        HoldRejection::SlotBooked { .. } => "slot_booked",
        HoldRejection::InvalidWindow(_) => "invalid_window",
    }
}

impl Engine {
    fn reject_hold(&self, rejection: HoldRejection) -> HoldOutcome {
        let reason = rejection_label(&rejection);
        metrics::counter!(observability::HOLDS_REJECTED_TOTAL, "reason" => reason).increment(1);
        debug!("hold rejected: {reason}");
        HoldOutcome::Rejected(rejection)
    }

    /// Provisionally claim `[start, start + duration)` on a branch.
    ///
    /// The slot lock is taken with `try_lock`: a second caller for the same
    /// (branch, start) is turned away at once instead of queueing. The branch
    /// lock then makes check-and-insert atomic against callers whose windows
    /// overlap but start elsewhere.
    pub async fn acquire_hold(
        &self,
        policy: &Policy,
        req: HoldRequest,
    ) -> Result<HoldOutcome, EngineError> {
        if req.session_id.len() > MAX_SESSION_ID_LEN {
            return Err(EngineError::LimitExceeded("session id too long"));
        }
        let now = self.clock.now();
        let span = match validate_window(req.start, req.duration, now) {
            Ok(span) => span,
            Err(reason) => return Ok(self.reject_hold(HoldRejection::InvalidWindow(reason))),
        };

        let key = SlotKey {
            branch_id: req.branch_id,
            start: req.start,
        };
        let Some(_slot) = self.slot_locks.try_lock(&key) else {
            return Ok(self.reject_hold(HoldRejection::SlotBeingProcessed));
        };
        let _branch = self.branch_locks.lock(&req.branch_id).await;

        if let Some(entry) = self.store.branch_conflict(req.branch_id, &span, now, |_| false) {
            let rejection = match entry.kind {
                EntryKind::Hold { .. } => HoldRejection::SlotHeld {
                    hold_id: entry.id,
                    span: entry.span,
                },
                EntryKind::Booking => HoldRejection::SlotBooked {
                    booking_id: entry.id,
                    span: entry.span,
                },
            };
            return Ok(self.reject_hold(rejection));
        }

        let ttl = match req.hold_minutes {
            Some(m) => (m as Ms * MINUTE_MS).clamp(MIN_HOLD_TTL_MS, MAX_HOLD_TTL_MS),
            None => policy.hold_ttl_ms(),
        };
        let hold = Hold {
            id: Ulid::new(),
            branch_id: req.branch_id,
            span,
            session_id: req.session_id,
            kind: req.kind,
            customer_id: req.customer_id,
            staff_id: req.staff_id,
            service_id: req.service_id,
            status: HoldStatus::Active,
            created_at: now,
            expires_at: now + ttl,
            converted_to: None,
            release_reason: None,
        };
        let (hold_id, expires_at) = (hold.id, hold.expires_at);
        self.commit(vec![Event::HoldPlaced { hold }]).await?;

        metrics::counter!(observability::HOLDS_GRANTED_TOTAL).increment(1);
        info!("hold {hold_id} granted on branch {} until {expires_at}", req.branch_id);
        Ok(HoldOutcome::Granted {
            hold_id,
            expires_at,
        })
    }

    /// `active → converted`. Returns false if the hold is already terminal.
    pub async fn convert_hold(&self, hold_id: Ulid, booking_id: Ulid) -> Result<bool, EngineError> {
        let branch_id = self.hold_branch(&hold_id)?;
        let _branch = self.branch_locks.lock(&branch_id).await;
        if !self.hold_is_active(&hold_id) {
            return Ok(false);
        }
        self.commit(vec![Event::HoldConverted {
            id: hold_id,
            booking_id,
        }])
        .await?;
        info!("hold {hold_id} converted to booking {booking_id}");
        Ok(true)
    }

    /// `active → released`. Returns false if the hold is already terminal.
    pub async fn release_hold(
        &self,
        hold_id: Ulid,
        reason: Option<String>,
    ) -> Result<bool, EngineError> {
        if reason.as_ref().is_some_and(|r| r.len() > MAX_NOTE_LEN) {
            return Err(EngineError::LimitExceeded("release reason too long"));
        }
        let branch_id = self.hold_branch(&hold_id)?;
        let _branch = self.branch_locks.lock(&branch_id).await;
        if !self.hold_is_active(&hold_id) {
            return Ok(false);
        }
        self.commit(vec![Event::HoldReleased { id: hold_id, reason }])
            .await?;
        info!("hold {hold_id} released");
        Ok(true)
    }

    /// Release every active hold a conversation still owns.
    pub async fn release_session(
        &self,
        session_id: &str,
        reason: Option<String>,
    ) -> Result<usize, EngineError> {
        let ids: Vec<Ulid> = self
            .store
            .sessions
            .get(session_id)
            .map(|ids| ids.value().clone())
            .unwrap_or_default();
        let mut released = 0;
        for id in ids {
            if self.release_hold(id, reason.clone()).await? {
                released += 1;
            }
        }
        Ok(released)
    }

    /// Move every active hold past its expiry to `expired`.
    /// Safe to run concurrently with itself: each hold is claimed under its
    /// branch lock and re-checked before it is written.
    pub async fn reap_expired_holds(&self) -> Result<usize, EngineError> {
        let now = self.clock.now();
        let mut reaped = 0;
        for (hold_id, branch_id) in self.collect_expired_holds(now) {
            let _branch = self.branch_locks.lock(&branch_id).await;
            let still_due = self
                .store
                .holds
                .get(&hold_id)
                .is_some_and(|h| h.status == HoldStatus::Active && h.expires_at <= now);
            if !still_due {
                debug!("reaper skip {hold_id}: no longer active");
                continue;
            }
            self.commit(vec![Event::HoldExpired { id: hold_id }]).await?;
            reaped += 1;
        }
        if reaped > 0 {
            metrics::counter!(observability::HOLDS_REAPED_TOTAL).increment(reaped as u64);
            info!("reaped {reaped} expired holds");
        }
        Ok(reaped)
    }

    pub fn collect_expired_holds(&self, now: Ms) -> Vec<(Ulid, Ulid)> {
        let mut expired = Vec::new();
        for tl in self.store.branches.iter() {
            for entry in &tl.entries {
                if let EntryKind::Hold { expires_at } = entry.kind
                    && expires_at <= now
                {
                    expired.push((entry.id, entry.branch_id));
                }
                if expired.len() >= MAX_SWEEP_BATCH {
                    return expired;
                }
            }
        }
        expired
    }

    pub fn get_hold(&self, id: &Ulid) -> Option<Hold> {
        self.store.holds.get(id).map(|h| h.value().clone())
    }

    /// Holds on a branch that currently block other callers.
    pub fn active_holds(&self, branch_id: &Ulid) -> Vec<Hold> {
        let now = self.clock.now();
        let ids: Vec<Ulid> = self
            .store
            .branches
            .get(branch_id)
            .map(|tl| {
                tl.entries
                    .iter()
                    .filter(|e| matches!(e.kind, EntryKind::Hold { .. }))
                    .map(|e| e.id)
                    .collect()
            })
            .unwrap_or_default();
        ids.iter()
            .filter_map(|id| self.get_hold(id))
            .filter(|h| h.is_live(now))
            .collect()
    }

    pub fn session_holds(&self, session_id: &str) -> Vec<Hold> {
        let ids: Vec<Ulid> = self
            .store
            .sessions
            .get(session_id)
            .map(|ids| ids.value().clone())
            .unwrap_or_default();
        ids.iter().filter_map(|id| self.get_hold(id)).collect()
    }

    fn hold_branch(&self, hold_id: &Ulid) -> Result<Ulid, EngineError> {
        self.store
            .holds
            .get(hold_id)
            .map(|h| h.branch_id)
            .ok_or(EngineError::NotFound(*hold_id))
    }

    pub(super) fn hold_is_active(&self, hold_id: &Ulid) -> bool {
        self.store
            .holds
            .get(hold_id)
            .is_some_and(|h| h.status == HoldStatus::Active)
    }
}
