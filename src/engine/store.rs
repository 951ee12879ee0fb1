use dashmap::DashMap;
use ulid::Ulid;

use crate::model::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Hold { expires_at: Ms },
    Booking,
}

/// One occupied window on a timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    pub id: Ulid,
    pub branch_id: Ulid,
    pub span: Span,
    pub kind: EntryKind,
}

/// Occupied windows sorted by `span.start`. A branch timeline carries active
/// holds and blocking bookings; a staff or customer timeline carries only
/// that subject's blocking bookings.
#[derive(Debug, Clone, Default)]
pub struct Timeline {
    pub entries: Vec<Entry>,
}

impl Timeline {
    /// Insert maintaining sort order by span.start.
    pub fn insert(&mut self, entry: Entry) {
        let pos = self
            .entries
            .binary_search_by_key(&entry.span.start, |e| e.span.start)
            .unwrap_or_else(|e| e);
        self.entries.insert(pos, entry);
    }

    pub fn remove(&mut self, id: Ulid) -> Option<Entry> {
        let pos = self.entries.iter().position(|e| e.id == id)?;
        Some(self.entries.remove(pos))
    }

    /// Entries whose span overlaps the query window.
    /// Binary search skips everything starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Entry> {
        let right_bound = self.entries.partition_point(|e| e.span.start < query.end);
        self.entries[..right_bound]
            .iter()
            .filter(move |e| e.span.end > query.start)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubjectKey {
    pub kind: SubjectKind,
    pub id: Ulid,
}

/// Identity of a slot for the non-blocking acquisition lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotKey {
    pub branch_id: Ulid,
    pub start: Ms,
}

/// Every row the engine owns, indexed for the lookups the components need.
///
/// `apply` is the only writer. Callers serialize through the engine's row
/// locks before they build events, so `apply` itself never blocks on anything
/// but DashMap shards.
#[derive(Default)]
pub struct Store {
    pub holds: DashMap<Ulid, Hold>,
    pub sessions: DashMap<String, Vec<Ulid>>,
    pub bookings: DashMap<Ulid, Booking>,
    pub branches: DashMap<Ulid, Timeline>,
    pub subjects: DashMap<SubjectKey, Timeline>,
    pub trust: DashMap<String, TrustScore>,
    /// Penalty log per normalised contact, in insertion order.
    pub penalties: DashMap<String, Vec<Penalty>>,
    pub penalty_owner: DashMap<Ulid, String>,
    pub blocks: DashMap<Ulid, Block>,
    /// contact → id of its single active block.
    pub active_blocks: DashMap<String, Ulid>,
    pub confirmations: DashMap<Ulid, Confirmation>,
}

pub(crate) fn subject_keys(booking: &Booking) -> Vec<SubjectKey> {
    let mut keys = Vec::with_capacity(2);
    if let Some(id) = booking.staff_id {
        keys.push(SubjectKey {
            kind: SubjectKind::Staff,
            id,
        });
    }
    if let Some(id) = booking.customer_id {
        keys.push(SubjectKey {
            kind: SubjectKind::Customer,
            id,
        });
    }
    keys
}

impl Store {
    pub fn apply(&self, event: &Event) {
        match event {
            Event::HoldPlaced { hold } => {
                if hold.status == HoldStatus::Active {
                    self.branches.entry(hold.branch_id).or_default().insert(Entry {
                        id: hold.id,
                        branch_id: hold.branch_id,
                        span: hold.span,
                        kind: EntryKind::Hold {
                            expires_at: hold.expires_at,
                        },
                    });
                    self.sessions
                        .entry(hold.session_id.clone())
                        .or_default()
                        .push(hold.id);
                }
                self.holds.insert(hold.id, hold.clone());
            }
            Event::HoldConverted { id, booking_id } => {
                self.finish_hold(*id, HoldStatus::Converted, |h| h.converted_to = Some(*booking_id));
            }
            Event::HoldExpired { id } => {
                self.finish_hold(*id, HoldStatus::Expired, |_| {});
            }
            Event::HoldReleased { id, reason } => {
                self.finish_hold(*id, HoldStatus::Released, |h| h.release_reason = reason.clone());
            }
            Event::BookingCreated { booking } => {
                if booking.status.is_blocking() {
                    self.index_booking(booking);
                }
                self.bookings.insert(booking.id, booking.clone());
            }
            Event::BookingStatusChanged { id, status } => {
                let snapshot = match self.bookings.get_mut(id) {
                    Some(mut b) => {
                        let was_blocking = b.status.is_blocking();
                        b.status = *status;
                        (was_blocking && !status.is_blocking()).then(|| b.clone())
                    }
                    None => None,
                };
                if let Some(booking) = snapshot {
                    self.unindex_booking(&booking);
                }
            }
            Event::BookingConfirmationChanged { id, confirmation } => {
                if let Some(mut b) = self.bookings.get_mut(id) {
                    b.confirmation = *confirmation;
                }
            }
            Event::BookingRescheduled { id, span, staff_id } => {
                let Some(old) = self.bookings.get(id).map(|b| b.value().clone()) else {
                    return;
                };
                let mut moved = old.clone();
                moved.span = *span;
                moved.staff_id = *staff_id;
                if old.status.is_blocking() {
                    self.unindex_booking(&old);
                    self.index_booking(&moved);
                }
                self.bookings.insert(*id, moved);
            }
            Event::BookingRewarded { id } => {
                if let Some(mut b) = self.bookings.get_mut(id) {
                    b.rewarded = true;
                }
            }
            Event::TrustWritten { record } => {
                self.trust.insert(record.contact.clone(), record.clone());
            }
            Event::PenaltyRecorded { penalty } => {
                self.penalty_owner.insert(penalty.id, penalty.contact.clone());
                self.penalties
                    .entry(penalty.contact.clone())
                    .or_default()
                    .push(penalty.clone());
            }
            Event::PenaltyResolved { id, at, note } => {
                let Some(contact) = self.penalty_owner.get(id).map(|c| c.value().clone()) else {
                    return;
                };
                if let Some(mut log) = self.penalties.get_mut(&contact)
                    && let Some(p) = log.iter_mut().find(|p| p.id == *id)
                {
                    p.resolved = true;
                    p.resolved_at = Some(*at);
                    p.resolution_note = note.clone();
                }
            }
            Event::BlockCreated { block } => {
                if block.is_active {
                    self.active_blocks
                        .entry(block.contact.clone())
                        .or_insert(block.id);
                }
                self.blocks.insert(block.id, block.clone());
            }
            Event::BlockLifted { id, at, resolved_by } => {
                let contact = match self.blocks.get_mut(id) {
                    Some(mut b) => {
                        b.is_active = false;
                        b.resolved_at = Some(*at);
                        b.resolved_by = resolved_by.clone();
                        b.contact.clone()
                    }
                    None => return,
                };
                self.active_blocks.remove_if(&contact, |_, active| active == id);
            }
            Event::ConfirmationWritten { confirmation } => {
                self.confirmations
                    .insert(confirmation.id, confirmation.clone());
            }
        }
    }

    fn finish_hold(&self, id: Ulid, status: HoldStatus, update: impl FnOnce(&mut Hold)) {
        let (branch_id, session_id) = match self.holds.get_mut(&id) {
            Some(mut h) if h.status == HoldStatus::Active => {
                h.status = status;
                update(&mut h);
                (h.branch_id, h.session_id.clone())
            }
            _ => return,
        };
        if let Some(mut tl) = self.branches.get_mut(&branch_id) {
            tl.remove(id);
        }
        if let Some(mut ids) = self.sessions.get_mut(&session_id) {
            ids.retain(|h| *h != id);
        }
        self.sessions.remove_if(&session_id, |_, ids| ids.is_empty());
    }

    fn index_booking(&self, booking: &Booking) {
        let entry = Entry {
            id: booking.id,
            branch_id: booking.branch_id,
            span: booking.span,
            kind: EntryKind::Booking,
        };
        self.branches.entry(booking.branch_id).or_default().insert(entry);
        for key in subject_keys(booking) {
            self.subjects.entry(key).or_default().insert(entry);
        }
    }

    fn unindex_booking(&self, booking: &Booking) {
        if let Some(mut tl) = self.branches.get_mut(&booking.branch_id) {
            tl.remove(booking.id);
        }
        for key in subject_keys(booking) {
            if let Some(mut tl) = self.subjects.get_mut(&key) {
                tl.remove(booking.id);
            }
        }
    }

    /// Blocking entry on the branch timeline that collides with `span`,
    /// skipping dead holds and anything `skip` says to ignore.
    pub fn branch_conflict(
        &self,
        branch_id: Ulid,
        span: &Span,
        now: Ms,
        skip: impl Fn(&Entry) -> bool,
    ) -> Option<Entry> {
        let tl = self.branches.get(&branch_id)?;
        tl.overlapping(span)
            .filter(|e| match e.kind {
                EntryKind::Hold { expires_at } => expires_at > now,
                EntryKind::Booking => true,
            })
            .find(|e| !skip(*e))
            .copied()
    }

    /// First booking of a staff member or customer that overlaps `span`.
    pub fn subject_conflict(
        &self,
        key: SubjectKey,
        branch_id: Option<Ulid>,
        span: &Span,
        exclude: Option<Ulid>,
    ) -> Option<Conflict> {
        let tl = self.subjects.get(&key)?;
        tl.overlapping(span)
            .filter(|e| Some(e.id) != exclude)
            .find(|e| branch_id.is_none_or(|b| b == e.branch_id))
            .map(|e| Conflict {
                subject: key.kind,
                booking_id: e.id,
                branch_id: e.branch_id,
                span: e.span,
            })
    }

    /// Unresolved, unexpired penalties of one kind for a contact.
    pub fn live_strikes(&self, contact: &str, kind: ViolationKind, now: Ms) -> u32 {
        self.penalties
            .get(contact)
            .map(|log| {
                log.iter()
                    .filter(|p| p.kind == kind && p.counts_as_strike(now))
                    .count() as u32
            })
            .unwrap_or(0)
    }

    pub fn active_block(&self, contact: &str) -> Option<Block> {
        let id = *self.active_blocks.get(contact)?.value();
        self.blocks.get(&id).map(|b| b.value().clone())
    }

    /// Events that recreate the current state from nothing.
    pub fn snapshot(&self) -> Vec<Event> {
        let mut events = Vec::new();
        for h in self.holds.iter() {
            events.push(Event::HoldPlaced { hold: h.clone() });
        }
        for b in self.bookings.iter() {
            events.push(Event::BookingCreated { booking: b.clone() });
        }
        for t in self.trust.iter() {
            events.push(Event::TrustWritten { record: t.clone() });
        }
        for log in self.penalties.iter() {
            for p in log.iter() {
                events.push(Event::PenaltyRecorded { penalty: p.clone() });
            }
        }
        for b in self.blocks.iter() {
            events.push(Event::BlockCreated { block: b.clone() });
        }
        for c in self.confirmations.iter() {
            events.push(Event::ConfirmationWritten {
                confirmation: c.clone(),
            });
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(start: Ms, end: Ms) -> Entry {
        Entry {
            id: Ulid::new(),
            branch_id: Ulid::nil(),
            span: Span::new(start, end),
            kind: EntryKind::Booking,
        }
    }

    #[test]
    fn timeline_ordering() {
        let mut tl = Timeline::default();
        tl.insert(entry(300, 400));
        tl.insert(entry(100, 200));
        tl.insert(entry(200, 300));
        let starts: Vec<Ms> = tl.entries.iter().map(|e| e.span.start).collect();
        assert_eq!(starts, vec![100, 200, 300]);
    }

    #[test]
    fn overlapping_skips_past_and_future() {
        let mut tl = Timeline::default();
        tl.insert(entry(100, 200));
        tl.insert(entry(450, 600));
        tl.insert(entry(1000, 1100));
        let hits: Vec<_> = tl.overlapping(&Span::new(500, 800)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span, Span::new(450, 600));
    }

    #[test]
    fn overlapping_adjacent_not_included() {
        let mut tl = Timeline::default();
        tl.insert(entry(100, 200));
        assert_eq!(tl.overlapping(&Span::new(200, 300)).count(), 0);
        assert_eq!(tl.overlapping(&Span::new(0, 100)).count(), 0);
        assert_eq!(tl.overlapping(&Span::new(199, 300)).count(), 1);
    }

    #[test]
    fn remove_nonexistent_returns_none() {
        let mut tl = Timeline::default();
        tl.insert(entry(100, 200));
        assert!(tl.remove(Ulid::new()).is_none());
        assert_eq!(tl.entries.len(), 1);
    }

    #[test]
    fn terminal_hold_event_applies_once() {
        let store = Store::default();
        let hold = Hold {
            id: Ulid::new(),
            branch_id: Ulid::new(),
            span: Span::new(100, 200),
            session_id: "s1".into(),
            kind: HoldKind::Chat,
            customer_id: None,
            staff_id: None,
            service_id: None,
            status: HoldStatus::Active,
            created_at: 0,
            expires_at: 50,
            converted_to: None,
            release_reason: None,
        };
        store.apply(&Event::HoldPlaced { hold: hold.clone() });
        assert_eq!(store.branches.get(&hold.branch_id).unwrap().entries.len(), 1);
        assert!(store.sessions.contains_key("s1"));

        store.apply(&Event::HoldReleased {
            id: hold.id,
            reason: Some("bye".into()),
        });
        store.apply(&Event::HoldExpired { id: hold.id });

        let stored = store.holds.get(&hold.id).unwrap();
        assert_eq!(stored.status, HoldStatus::Released);
        assert_eq!(stored.release_reason.as_deref(), Some("bye"));
        assert!(store.branches.get(&hold.branch_id).unwrap().entries.is_empty());
        assert!(!store.sessions.contains_key("s1"));
    }

    #[test]
    fn lifted_block_leaves_history() {
        let store = Store::default();
        let block = Block {
            id: Ulid::new(),
            contact: "+1555".into(),
            customer_id: None,
            reason: BlockReason::AutoScore,
            note: None,
            created_at: 0,
            unblock_at: Some(10),
            is_active: true,
            resolved_at: None,
            resolved_by: None,
        };
        store.apply(&Event::BlockCreated { block: block.clone() });
        assert_eq!(store.active_block("+1555").unwrap().id, block.id);

        store.apply(&Event::BlockLifted {
            id: block.id,
            at: 11,
            resolved_by: None,
        });
        assert!(store.active_block("+1555").is_none());
        let hist = store.blocks.get(&block.id).unwrap();
        assert!(!hist.is_active);
        assert_eq!(hist.resolved_at, Some(11));
    }

    #[test]
    fn rescheduled_booking_moves_on_every_timeline() {
        let store = Store::default();
        let staff = Ulid::new();
        let booking = Booking {
            id: Ulid::new(),
            kind: BookingKind::Appointment,
            branch_id: Ulid::new(),
            staff_id: Some(staff),
            customer_id: None,
            contact: None,
            span: Span::new(100, 200),
            status: BookingStatus::Scheduled,
            confirmation: BookingConfirmation::NotRequired,
            hold_id: None,
            created_at: 0,
            rewarded: false,
        };
        store.apply(&Event::BookingCreated { booking: booking.clone() });
        let other = Ulid::new();
        store.apply(&Event::BookingRescheduled {
            id: booking.id,
            span: Span::new(500, 600),
            staff_id: Some(other),
        });

        let old_key = SubjectKey { kind: SubjectKind::Staff, id: staff };
        let new_key = SubjectKey { kind: SubjectKind::Staff, id: other };
        assert!(store.subjects.get(&old_key).unwrap().entries.is_empty());
        assert_eq!(store.subjects.get(&new_key).unwrap().entries[0].span, Span::new(500, 600));
        let branch = store.branches.get(&booking.branch_id).unwrap();
        assert_eq!(branch.entries.len(), 1);
        assert_eq!(branch.entries[0].span, Span::new(500, 600));
    }
}
