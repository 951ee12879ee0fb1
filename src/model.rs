use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 60 * MINUTE_MS;
pub const DAY_MS: Ms = 24 * HOUR_MS;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn from_duration(start: Ms, duration: Ms) -> Self {
        Self::new(start, start + duration)
    }

    /// `None` for an empty window or one whose end does not fit in an `Ms`.
    pub fn try_from_duration(start: Ms, duration: Ms) -> Option<Self> {
        let end = start.checked_add(duration)?;
        (start < end).then_some(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

/// Trim and lowercase a contact handle (phone, email, chat id) so that the same
/// person always lands on the same trust/block row.
pub fn normalize_contact(raw: &str) -> String {
    raw.trim().to_lowercase()
}

// ── Holds ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HoldKind {
    Voice,
    Chat,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HoldStatus {
    Active,
    Converted,
    Expired,
    Released,
}

impl HoldStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, HoldStatus::Active)
    }
}

/// A speculative claim on a window of one branch, made mid-conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hold {
    pub id: Ulid,
    pub branch_id: Ulid,
    pub span: Span,
    pub session_id: String,
    pub kind: HoldKind,
    pub customer_id: Option<Ulid>,
    pub staff_id: Option<Ulid>,
    pub service_id: Option<Ulid>,
    pub status: HoldStatus,
    pub created_at: Ms,
    pub expires_at: Ms,
    pub converted_to: Option<Ulid>,
    pub release_reason: Option<String>,
}

impl Hold {
    /// Active and not yet past its expiry. An active hold past expiry is dead
    /// weight waiting for the reaper and never blocks anyone.
    pub fn is_live(&self, now: Ms) -> bool {
        self.status == HoldStatus::Active && self.expires_at > now
    }
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingKind {
    Appointment,
    Order,
    Reservation,
}

/// Polymorphic pointer to whatever was booked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BookingRef {
    pub kind: BookingKind,
    pub id: Ulid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Scheduled,
    Confirmed,
    Completed,
    Cancelled,
    NoShow,
    Rescheduled,
}

impl BookingStatus {
    /// Whether a booking in this status still occupies its window.
    pub fn is_blocking(self) -> bool {
        !matches!(
            self,
            BookingStatus::Cancelled | BookingStatus::NoShow | BookingStatus::Rescheduled
        )
    }
}

/// Customer-facing confirmation state mirrored onto the booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingConfirmation {
    NotRequired,
    Pending,
    Confirmed,
    Declined,
    ChangeRequested,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub kind: BookingKind,
    pub branch_id: Ulid,
    pub staff_id: Option<Ulid>,
    pub customer_id: Option<Ulid>,
    pub contact: Option<String>,
    pub span: Span,
    pub status: BookingStatus,
    pub confirmation: BookingConfirmation,
    pub hold_id: Option<Ulid>,
    pub created_at: Ms,
    /// Set once a completed visit has been credited to the customer.
    pub rewarded: bool,
}

impl Booking {
    pub fn reference(&self) -> BookingRef {
        BookingRef {
            kind: self.kind,
            id: self.id,
        }
    }
}

// ── Trust, penalties, blocks ─────────────────────────────────────

/// Who a trust decision is about. The contact handle is authoritative;
/// a profile id may not exist yet for a first-time violator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerRef {
    pub id: Option<Ulid>,
    pub contact: String,
}

impl CustomerRef {
    pub fn new(id: Option<Ulid>, contact: &str) -> Self {
        Self {
            id,
            contact: normalize_contact(contact),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustScore {
    pub contact: String,
    pub customer_id: Option<Ulid>,
    pub score: i32,
    pub no_shows: u32,
    pub no_pickups: u32,
    pub late_cancellations: u32,
    pub completed: u32,
    pub is_vip: bool,
    pub is_blocked: bool,
    pub updated_at: Ms,
}

impl TrustScore {
    pub fn new(customer: &CustomerRef, score: i32, now: Ms) -> Self {
        Self {
            contact: customer.contact.clone(),
            customer_id: customer.id,
            score: clamp_score(score),
            no_shows: 0,
            no_pickups: 0,
            late_cancellations: 0,
            completed: 0,
            is_vip: false,
            is_blocked: false,
            updated_at: now,
        }
    }

    /// Add `delta` and clamp into [0, 100].
    pub fn adjust(&mut self, delta: i32) {
        self.score = clamp_score(self.score.saturating_add(delta));
    }
}

pub fn clamp_score(score: i32) -> i32 {
    score.clamp(0, 100)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ViolationKind {
    NoShow,
    NoPickup,
    LateCancellation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
}

/// Append-only violation log entry. Only the `resolved*` fields ever change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Penalty {
    pub id: Ulid,
    pub contact: String,
    pub customer_id: Option<Ulid>,
    pub kind: ViolationKind,
    pub booking: Option<BookingRef>,
    pub severity: Severity,
    pub strike: u32,
    pub resolved: bool,
    pub resolved_at: Option<Ms>,
    pub resolution_note: Option<String>,
    pub created_at: Ms,
    pub expires_at: Ms,
}

impl Penalty {
    /// Counts toward the strike ordinal of later penalties of the same kind.
    pub fn counts_as_strike(&self, now: Ms) -> bool {
        !self.resolved && self.expires_at > now
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockReason {
    /// Score fell under the block threshold.
    AutoScore,
    /// Too many unresolved strikes of one kind.
    AutoStrikes(ViolationKind),
    Manual,
}

impl BlockReason {
    pub fn is_auto(self) -> bool {
        !matches!(self, BlockReason::Manual)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub id: Ulid,
    pub contact: String,
    pub customer_id: Option<Ulid>,
    pub reason: BlockReason,
    pub note: Option<String>,
    pub created_at: Ms,
    /// `None` = permanent.
    pub unblock_at: Option<Ms>,
    pub is_active: bool,
    pub resolved_at: Option<Ms>,
    pub resolved_by: Option<String>,
}

impl Block {
    pub fn in_force(&self, now: Ms) -> bool {
        self.is_active && self.unblock_at.is_none_or(|t| t > now)
    }
}

// ── Confirmations ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfirmKind {
    Booking,
    Deposit,
    Reminder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Channel {
    Voice,
    Sms,
    WhatsApp,
    Email,
    Chat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfirmStatus {
    Pending,
    Sent,
    Delivered,
    Read,
    Responded,
    Expired,
    Failed,
}

impl ConfirmStatus {
    /// Position along pending → sent → delivered → read → responded.
    pub fn rank(self) -> u8 {
        match self {
            ConfirmStatus::Pending => 0,
            ConfirmStatus::Sent => 1,
            ConfirmStatus::Delivered => 2,
            ConfirmStatus::Read => 3,
            ConfirmStatus::Responded => 4,
            ConfirmStatus::Expired | ConfirmStatus::Failed => 5,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ConfirmStatus::Responded | ConfirmStatus::Expired | ConfirmStatus::Failed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CustomerResponse {
    Confirmed,
    Cancelled,
    NeedChange,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoAction {
    Cancel,
    Keep,
    NotifyStaff,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Confirmation {
    pub id: Ulid,
    pub booking: BookingRef,
    pub kind: ConfirmKind,
    pub channel: Channel,
    pub contact: String,
    pub status: ConfirmStatus,
    pub created_at: Ms,
    pub expires_at: Ms,
    pub response: Option<CustomerResponse>,
    pub responded_at: Option<Ms>,
    pub auto_action: AutoAction,
    pub auto_action_executed: bool,
}

// ── Outcomes fed back from booking lifecycle ─────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    NoShow,
    NoPickup,
    LateCancellation,
    /// Codes we do not recognise (e.g. refund/courtesy). Never touch trust.
    Other(String),
}

impl Outcome {
    pub fn parse(code: &str) -> Self {
        match code.trim().to_lowercase().as_str() {
            "completed" => Outcome::Completed,
            "no_show" => Outcome::NoShow,
            "no_pickup" => Outcome::NoPickup,
            "late_cancellation" => Outcome::LateCancellation,
            other => Outcome::Other(other.to_string()),
        }
    }

    pub fn violation(&self) -> Option<ViolationKind> {
        match self {
            Outcome::NoShow => Some(ViolationKind::NoShow),
            Outcome::NoPickup => Some(ViolationKind::NoPickup),
            Outcome::LateCancellation => Some(ViolationKind::LateCancellation),
            Outcome::Completed | Outcome::Other(_) => None,
        }
    }
}

/// The event types, flat with no nesting. A WAL record is a commit holding one
/// or more of these, applied all-or-nothing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    HoldPlaced {
        hold: Hold,
    },
    HoldConverted {
        id: Ulid,
        booking_id: Ulid,
    },
    HoldExpired {
        id: Ulid,
    },
    HoldReleased {
        id: Ulid,
        reason: Option<String>,
    },
    BookingCreated {
        booking: Booking,
    },
    BookingStatusChanged {
        id: Ulid,
        status: BookingStatus,
    },
    BookingConfirmationChanged {
        id: Ulid,
        confirmation: BookingConfirmation,
    },
    BookingRescheduled {
        id: Ulid,
        span: Span,
        staff_id: Option<Ulid>,
    },
    BookingRewarded {
        id: Ulid,
    },
    TrustWritten {
        record: TrustScore,
    },
    PenaltyRecorded {
        penalty: Penalty,
    },
    PenaltyResolved {
        id: Ulid,
        at: Ms,
        note: Option<String>,
    },
    BlockCreated {
        block: Block,
    },
    BlockLifted {
        id: Ulid,
        at: Ms,
        resolved_by: Option<String>,
    },
    ConfirmationWritten {
        confirmation: Confirmation,
    },
}

// ── Call results ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SubjectKind {
    Staff,
    Customer,
}

/// An existing booking that collides with a candidate window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conflict {
    pub subject: SubjectKind,
    pub booking_id: Ulid,
    pub branch_id: Ulid,
    pub span: Span,
}

/// Why a hold was not granted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HoldRejection {
    /// Another caller is acquiring the same slot right now.
    SlotBeingProcessed,
    SlotHeld { hold_id: Ulid, span: Span },
    SlotBooked { booking_id: Ulid, span: Span },
    InvalidWindow(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HoldOutcome {
    Granted { hold_id: Ulid, expires_at: Ms },
    Rejected(HoldRejection),
}

impl HoldOutcome {
    pub fn is_granted(&self) -> bool {
        matches!(self, HoldOutcome::Granted { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrustStatus {
    pub score: i32,
    pub requires_confirmation: bool,
    pub requires_deposit: bool,
    pub is_blocked: bool,
    pub is_vip: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookingRejection {
    CustomerBlocked { until: Option<Ms> },
    InvalidWindow(&'static str),
    Conflict(Conflict),
    SlotHeld { hold_id: Ulid, span: Span },
    HoldNotActive(Ulid),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookingOutcome {
    Booked { booking_id: Ulid, trust: Option<TrustStatus> },
    Rejected(BookingRejection),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PenaltyResult {
    pub strike_count: u32,
    pub new_score: i32,
    pub auto_blocked: bool,
}

/// What routing a booking outcome did to the customer's standing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeEffect {
    Penalized(PenaltyResult),
    Rewarded { new_score: i32 },
    /// Unknown outcome code, or no contact on the booking.
    Ignored,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
        assert!(s.contains_instant(100));
        assert!(s.contains_instant(199));
        assert!(!s.contains_instant(200)); // half-open
    }

    #[test]
    fn span_overlap_half_open() {
        let ten = 10 * HOUR_MS;
        let a = Span::from_duration(ten, 30 * MINUTE_MS);
        let b = Span::from_duration(ten + 15 * MINUTE_MS, 30 * MINUTE_MS);
        let c = Span::from_duration(ten + 30 * MINUTE_MS, 30 * MINUTE_MS);
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c)); // back-to-back
        assert!(!c.overlaps(&a));
    }

    #[test]
    fn booking_status_blocking() {
        assert!(BookingStatus::Scheduled.is_blocking());
        assert!(BookingStatus::Confirmed.is_blocking());
        assert!(BookingStatus::Completed.is_blocking());
        assert!(!BookingStatus::Cancelled.is_blocking());
        assert!(!BookingStatus::NoShow.is_blocking());
        assert!(!BookingStatus::Rescheduled.is_blocking());
    }

    #[test]
    fn trust_adjust_clamps() {
        let c = CustomerRef::new(None, "+1555");
        let mut t = TrustScore::new(&c, 80, 0);
        t.adjust(-500);
        assert_eq!(t.score, 0);
        t.adjust(i32::MAX);
        assert_eq!(t.score, 100);
    }

    #[test]
    fn contact_normalized() {
        let c = CustomerRef::new(None, "  Alice@Example.COM ");
        assert_eq!(c.contact, "alice@example.com");
    }

    #[test]
    fn block_in_force() {
        let mut b = Block {
            id: Ulid::new(),
            contact: "x".into(),
            customer_id: None,
            reason: BlockReason::Manual,
            note: None,
            created_at: 0,
            unblock_at: Some(1000),
            is_active: true,
            resolved_at: None,
            resolved_by: None,
        };
        assert!(b.in_force(999));
        assert!(!b.in_force(1000));
        b.unblock_at = None;
        assert!(b.in_force(i64::MAX));
        b.is_active = false;
        assert!(!b.in_force(0));
    }

    #[test]
    fn confirm_status_ranks() {
        assert!(ConfirmStatus::Pending.rank() < ConfirmStatus::Sent.rank());
        assert!(ConfirmStatus::Read.rank() < ConfirmStatus::Responded.rank());
        assert!(ConfirmStatus::Expired.is_terminal());
        assert!(!ConfirmStatus::Read.is_terminal());
    }

    #[test]
    fn outcome_parse_unknown_codes() {
        assert_eq!(Outcome::parse("no_show"), Outcome::NoShow);
        assert_eq!(Outcome::parse(" Completed "), Outcome::Completed);
        let other = Outcome::parse("courtesy");
        assert_eq!(other, Outcome::Other("courtesy".into()));
        assert_eq!(other.violation(), None);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::HoldReleased {
            id: Ulid::new(),
            reason: Some("caller hung up".into()),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
