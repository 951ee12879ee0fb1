use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;
use crate::policy::Policy;

use super::holds::in_range_span;
use super::store::{subject_keys, EntryKind, SubjectKey};
use super::{Engine, EngineError};

/// Arguments to [`Engine::commit_booking`].
#[derive(Debug, Clone)]
pub struct BookingRequest {
    pub id: Ulid,
    pub kind: BookingKind,
    pub branch_id: Ulid,
    pub staff_id: Option<Ulid>,
    pub customer: Option<CustomerRef>,
    pub start: Ms,
    pub duration: Ms,
    /// Hold to convert once the booking is written.
    pub hold_id: Option<Ulid>,
}

impl BookingRequest {
    pub fn new(kind: BookingKind, branch_id: Ulid, start: Ms, duration: Ms) -> Self {
        Self {
            id: Ulid::new(),
            kind,
            branch_id,
            staff_id: None,
            customer: None,
            start,
            duration,
            hold_id: None,
        }
    }

    pub fn staff(mut self, id: Ulid) -> Self {
        self.staff_id = Some(id);
        self
    }

    pub fn customer(mut self, customer: CustomerRef) -> Self {
        self.customer = Some(customer);
        self
    }

    pub fn from_hold(mut self, hold_id: Ulid) -> Self {
        self.hold_id = Some(hold_id);
        self
    }
}

/// Arguments to [`Engine::reschedule_booking`].
#[derive(Debug, Clone)]
pub struct RescheduleRequest {
    pub booking_id: Ulid,
    pub start: Ms,
    pub duration: Ms,
    /// Hand the booking to another staff member. `None` keeps the current one.
    pub staff_id: Option<Ulid>,
}

impl RescheduleRequest {
    pub fn new(booking_id: Ulid, start: Ms, duration: Ms) -> Self {
        Self {
            booking_id,
            start,
            duration,
            staff_id: None,
        }
    }

    pub fn staff(mut self, id: Ulid) -> Self {
        self.staff_id = Some(id);
        self
    }
}

/// Row locks covering one booking's staff, customer and branch rows.
pub(super) struct BookingLocks {
    _subjects: Vec<OwnedMutexGuard<()>>,
    _branch: OwnedMutexGuard<()>,
}

fn validate_booking_window(start: Ms, duration: Ms, now: Ms) -> Result<Span, &'static str> {
    if duration <= 0 {
        return Err("duration must be positive");
    }
    if duration > MAX_BOOKING_DURATION_MS {
        return Err("duration exceeds booking limit");
    }
    let span = in_range_span(start, duration).ok_or("timestamp out of range")?;
    if span.end <= now {
        return Err("window already over");
    }
    Ok(span)
}

impl Engine {
    /// Read-only advisory check: the first active booking of a staff member
    /// or customer overlapping `[start, start + duration)`.
    ///
    /// `branch_id` narrows the search to one branch; `None` searches the
    /// whole tenant. `exclude` skips a booking being modified.
    pub fn find_conflict(
        &self,
        kind: SubjectKind,
        subject_id: Ulid,
        branch_id: Option<Ulid>,
        start: Ms,
        duration: Ms,
        exclude: Option<Ulid>,
    ) -> Option<Conflict> {
        let span = in_range_span(start, duration)?;
        let key = SubjectKey {
            kind,
            id: subject_id,
        };
        self.store.subject_conflict(key, branch_id, &span, exclude)
    }

    /// Take the subject rows in sorted order, then the branch row. Every
    /// writer uses this order, so two writers never wait on each other in a cycle.
    pub(super) async fn lock_rows(&self, mut subjects: Vec<SubjectKey>, branch_id: Ulid) -> BookingLocks {
        subjects.sort();
        subjects.dedup();
        let mut guards = Vec::with_capacity(subjects.len());
        for key in &subjects {
            guards.push(self.subject_locks.lock(key).await);
        }
        let branch = self.branch_locks.lock(&branch_id).await;
        BookingLocks {
            _subjects: guards,
            _branch: branch,
        }
    }

    pub(super) async fn lock_booking(&self, booking: &Booking) -> BookingLocks {
        self.lock_rows(subject_keys(booking), booking.branch_id).await
    }

    fn reject_booking(&self, rejection: BookingRejection) -> BookingOutcome {
        let reason = match &rejection {
            BookingRejection::CustomerBlocked { .. } => "customer_blocked",
            BookingRejection::InvalidWindow(_) => "invalid_window",
            BookingRejection::Conflict(c) => match c.subject {
                SubjectKind::Staff => "staff_conflict",
                SubjectKind::Customer => "customer_conflict",
            },
            BookingRejection::SlotHeld { .. } => "slot_held",
            BookingRejection::HoldNotActive(_) => "hold_not_active",
        };
        metrics::counter!(observability::BOOKINGS_REJECTED_TOTAL, "reason" => reason).increment(1);
        debug!("booking rejected: {reason}");
        BookingOutcome::Rejected(rejection)
    }

    /// Validate and persist a booking, converting the caller's hold in the
    /// same commit.
    ///
    /// Blocked customers and bad windows are turned away before any lock is
    /// taken. The overlap checks then run under blocking row locks on the
    /// staff member, the customer and the branch, so two writers targeting
    /// the same person serialize instead of racing.
    pub async fn commit_booking(
        &self,
        policy: &Policy,
        req: BookingRequest,
    ) -> Result<BookingOutcome, EngineError> {
        if req
            .customer
            .as_ref()
            .is_some_and(|c| c.contact.len() > MAX_CONTACT_LEN)
        {
            return Err(EngineError::LimitExceeded("contact too long"));
        }
        let now = self.clock.now();
        let span = match validate_booking_window(req.start, req.duration, now) {
            Ok(span) => span,
            Err(reason) => return Ok(self.reject_booking(BookingRejection::InvalidWindow(reason))),
        };
        if let Some(customer) = &req.customer
            && let Some(block) = self.check_blocked(&customer.contact)
        {
            return Ok(self.reject_booking(BookingRejection::CustomerBlocked {
                until: block.unblock_at,
            }));
        }

        let hold = match req.hold_id {
            Some(id) => {
                let hold = self.get_hold(&id).ok_or(EngineError::NotFound(id))?;
                if hold.branch_id != req.branch_id {
                    return Err(EngineError::InvalidInput("hold belongs to another branch"));
                }
                Some(hold)
            }
            None => None,
        };

        let booking = Booking {
            id: req.id,
            kind: req.kind,
            branch_id: req.branch_id,
            staff_id: req.staff_id,
            customer_id: req.customer.as_ref().and_then(|c| c.id),
            contact: req.customer.as_ref().map(|c| c.contact.clone()),
            span,
            status: BookingStatus::Scheduled,
            confirmation: BookingConfirmation::NotRequired,
            hold_id: req.hold_id,
            created_at: now,
            rewarded: false,
        };

        {
            let _locks = self.lock_booking(&booking).await;

            if self.store.bookings.contains_key(&booking.id) {
                return Err(EngineError::InvalidInput("booking id already used"));
            }
            if let Some(h) = &hold
                && !self.hold_is_active(&h.id)
            {
                return Ok(self.reject_booking(BookingRejection::HoldNotActive(h.id)));
            }
            for key in subject_keys(&booking) {
                if let Some(conflict) = self.store.subject_conflict(key, None, &span, None) {
                    return Ok(self.reject_booking(BookingRejection::Conflict(conflict)));
                }
            }
            let own_session = hold.as_ref().map(|h| h.session_id.as_str());
            let foreign_hold = self.store.branch_conflict(booking.branch_id, &span, now, |e| {
                match e.kind {
                    EntryKind::Booking => true,
                    EntryKind::Hold { .. } => {
                        own_session.is_some_and(|s| {
                            self.store.holds.get(&e.id).is_some_and(|h| h.session_id == s)
                        })
                    }
                }
            });
            if let Some(entry) = foreign_hold {
                return Ok(self.reject_booking(BookingRejection::SlotHeld {
                    hold_id: entry.id,
                    span: entry.span,
                }));
            }

            let mut events = vec![Event::BookingCreated {
                booking: booking.clone(),
            }];
            if let Some(h) = &hold {
                events.push(Event::HoldConverted {
                    id: h.id,
                    booking_id: booking.id,
                });
            }
            self.commit(events).await?;
        }

        metrics::counter!(observability::BOOKINGS_COMMITTED_TOTAL).increment(1);
        info!(
            "booking {} committed on branch {} [{}, {})",
            booking.id, booking.branch_id, span.start, span.end
        );

        let trust = match &req.customer {
            Some(customer) => Some(self.get_status(policy, customer).await?),
            None => None,
        };
        Ok(BookingOutcome::Booked {
            booking_id: booking.id,
            trust,
        })
    }

    /// Move an active booking to a new window, optionally with a new staff
    /// member. The overlap checks skip the booking itself, so it may slide
    /// over its own old window. The move is one commit.
    pub async fn reschedule_booking(&self, req: RescheduleRequest) -> Result<BookingOutcome, EngineError> {
        let booking = self
            .get_booking(&req.booking_id)
            .ok_or(EngineError::NotFound(req.booking_id))?;
        let now = self.clock.now();
        let span = match validate_booking_window(req.start, req.duration, now) {
            Ok(span) => span,
            Err(reason) => return Ok(self.reject_booking(BookingRejection::InvalidWindow(reason))),
        };
        let mut moved = booking.clone();
        moved.span = span;
        if req.staff_id.is_some() {
            moved.staff_id = req.staff_id;
        }

        let mut subjects = subject_keys(&booking);
        subjects.extend(subject_keys(&moved));
        {
            let _locks = self.lock_rows(subjects, booking.branch_id).await;

            let current = self
                .get_booking(&booking.id)
                .ok_or(EngineError::NotFound(booking.id))?;
            if !current.status.is_blocking() || current.status == BookingStatus::Completed {
                return Err(EngineError::InvalidInput("booking is no longer active"));
            }
            for key in subject_keys(&moved) {
                if let Some(conflict) = self.store.subject_conflict(key, None, &span, Some(booking.id)) {
                    return Ok(self.reject_booking(BookingRejection::Conflict(conflict)));
                }
            }
            let held = self.store.branch_conflict(booking.branch_id, &span, now, |e| {
                matches!(e.kind, EntryKind::Booking)
            });
            if let Some(entry) = held {
                return Ok(self.reject_booking(BookingRejection::SlotHeld {
                    hold_id: entry.id,
                    span: entry.span,
                }));
            }
            self.commit(vec![Event::BookingRescheduled {
                id: booking.id,
                span,
                staff_id: moved.staff_id,
            }])
            .await?;
        }

        info!(
            "booking {} moved from [{}, {}) to [{}, {})",
            booking.id, booking.span.start, booking.span.end, span.start, span.end
        );
        Ok(BookingOutcome::Booked {
            booking_id: booking.id,
            trust: None,
        })
    }

    /// Events for moving a booking to `status`, or `None` if the move is not
    /// allowed. Caller must hold the booking's row locks.
    pub(super) fn status_change_events(&self, booking: &Booking, status: BookingStatus) -> Option<Vec<Event>> {
        let current = self.store.bookings.get(&booking.id)?.status;
        let settled = !current.is_blocking() || current == BookingStatus::Completed;
        if settled || current == status {
            return None;
        }
        Some(vec![Event::BookingStatusChanged {
            id: booking.id,
            status,
        }])
    }

    /// Move a scheduled/confirmed booking to a new status. Cancelled, no-show
    /// and rescheduled free the window. Returns false if the booking was
    /// already settled or already in that status.
    pub async fn set_booking_status(&self, id: Ulid, status: BookingStatus) -> Result<bool, EngineError> {
        let booking = self.get_booking(&id).ok_or(EngineError::NotFound(id))?;
        let _locks = self.lock_booking(&booking).await;
        let Some(events) = self.status_change_events(&booking, status) else {
            return Ok(false);
        };
        self.commit(events).await?;
        info!("booking {id} now {status:?}");
        Ok(true)
    }
}
