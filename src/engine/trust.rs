use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;
use crate::outbox::Outbound;
use crate::policy::Policy;

use super::{Engine, EngineError};

fn validated(customer: &CustomerRef) -> Result<CustomerRef, EngineError> {
    let c = CustomerRef::new(customer.id, &customer.contact);
    if c.contact.is_empty() {
        return Err(EngineError::InvalidInput("empty contact handle"));
    }
    if c.contact.len() > MAX_CONTACT_LEN {
        return Err(EngineError::LimitExceeded("contact too long"));
    }
    Ok(c)
}

fn default_severity(kind: ViolationKind) -> Severity {
    match kind {
        ViolationKind::NoShow | ViolationKind::NoPickup => Severity::High,
        ViolationKind::LateCancellation => Severity::Low,
    }
}

/// What one violation writes, and what to announce once it is committed.
struct PenaltyPlan {
    events: Vec<Event>,
    result: PenaltyResult,
    /// False for a VIP or an already-penalized booking.
    recorded: bool,
    /// Lapsed block lifted in the same commit.
    lifted: Option<Ulid>,
    /// `Some(unblock_at)` when a new auto-block is written.
    new_block: Option<Option<Ms>>,
}

fn violation_label(kind: ViolationKind) -> &'static str {
    match kind {
        ViolationKind::NoShow => "no_show",
        ViolationKind::NoPickup => "no_pickup",
        ViolationKind::LateCancellation => "late_cancellation",
    }
}

impl Engine {
    /// The block currently in force for a contact, if any.
    pub fn check_blocked(&self, contact: &str) -> Option<Block> {
        let now = self.clock.now();
        self.store
            .active_block(&normalize_contact(contact))
            .filter(|b| b.in_force(now))
    }

    pub fn trust_record(&self, contact: &str) -> Option<TrustScore> {
        self.store
            .trust
            .get(&normalize_contact(contact))
            .map(|t| t.value().clone())
    }

    pub fn penalties_for(&self, contact: &str) -> Vec<Penalty> {
        self.store
            .penalties
            .get(&normalize_contact(contact))
            .map(|log| log.value().clone())
            .unwrap_or_default()
    }

    /// Every block ever issued to a contact, oldest first.
    pub fn block_history(&self, contact: &str) -> Vec<Block> {
        let contact = normalize_contact(contact);
        let mut blocks: Vec<Block> = self
            .store
            .blocks
            .iter()
            .filter(|b| b.contact == contact)
            .map(|b| b.value().clone())
            .collect();
        blocks.sort_by_key(|b| b.id);
        blocks
    }

    /// Current record, or a fresh one at the policy's initial score.
    /// Caller holds the contact's trust lock.
    fn load_trust(&self, policy: &Policy, customer: &CustomerRef, now: Ms) -> (TrustScore, bool) {
        match self.store.trust.get(&customer.contact) {
            Some(t) => {
                let mut record = t.value().clone();
                if record.customer_id.is_none() {
                    record.customer_id = customer.id;
                }
                (record, false)
            }
            None => (TrustScore::new(customer, policy.initial_score, now), true),
        }
    }

    /// Score and gating flags for a customer. Creates the record at the
    /// policy's initial score on first sight.
    pub async fn get_status(
        &self,
        policy: &Policy,
        customer: &CustomerRef,
    ) -> Result<TrustStatus, EngineError> {
        let customer = validated(customer)?;
        let _row = self.trust_locks.lock(&customer.contact).await;
        let now = self.clock.now();
        let (record, fresh) = self.load_trust(policy, &customer, now);
        if fresh {
            self.commit(vec![Event::TrustWritten {
                record: record.clone(),
            }])
            .await?;
        }
        let blocked = self.check_blocked(&customer.contact).is_some();
        Ok(policy.status_for(&record, blocked))
    }

    /// If the contact's active block has run out but the sweep has not
    /// lifted it yet, the event that lifts it now. The record goes back to
    /// the neutral score, as the sweep would have left it.
    fn lift_lapsed_block(&self, policy: &Policy, record: &mut TrustScore, now: Ms) -> Option<Event> {
        let block = self.store.active_block(&record.contact)?;
        if block.in_force(now) {
            return None;
        }
        record.score = clamp_score(policy.neutral_score);
        record.is_blocked = false;
        record.updated_at = now;
        Some(Event::BlockLifted {
            id: block.id,
            at: now,
            resolved_by: None,
        })
    }

    /// Everything one violation writes. Caller holds the contact's trust lock.
    fn plan_penalty(
        &self,
        policy: &Policy,
        customer: &CustomerRef,
        kind: ViolationKind,
        booking: Option<BookingRef>,
        severity: Severity,
        now: Ms,
    ) -> PenaltyPlan {
        let (mut record, _) = self.load_trust(policy, customer, now);
        let skipped = |strike_count, score| PenaltyPlan {
            events: Vec::new(),
            result: PenaltyResult {
                strike_count,
                new_score: score,
                auto_blocked: false,
            },
            recorded: false,
            lifted: None,
            new_block: None,
        };

        if record.is_vip {
            debug!("penalty for VIP {} skipped", customer.contact);
            return skipped(0, record.score);
        }
        if let Some(bref) = booking {
            let duplicate = self
                .store
                .penalties
                .get(&customer.contact)
                .and_then(|log| {
                    log.iter()
                        .find(|p| p.kind == kind && p.booking == Some(bref))
                        .map(|p| p.strike)
                });
            if let Some(strike) = duplicate {
                debug!("penalty for booking {} already recorded", bref.id);
                return skipped(strike, record.score);
            }
        }

        let mut events = Vec::new();
        let lapsed = self.lift_lapsed_block(policy, &mut record, now);
        let lifted = match &lapsed {
            Some(Event::BlockLifted { id, .. }) => Some(*id),
            _ => None,
        };
        events.extend(lapsed);

        let strike = self.store.live_strikes(&customer.contact, kind, now) + 1;
        let penalty = Penalty {
            id: Ulid::new(),
            contact: customer.contact.clone(),
            customer_id: customer.id,
            kind,
            booking,
            severity,
            strike,
            resolved: false,
            resolved_at: None,
            resolution_note: None,
            created_at: now,
            expires_at: now + policy.penalty_retention_ms(),
        };

        record.adjust(policy.delta_for(kind));
        match kind {
            ViolationKind::NoShow => record.no_shows += 1,
            ViolationKind::NoPickup => record.no_pickups += 1,
            ViolationKind::LateCancellation => record.late_cancellations += 1,
        }
        record.updated_at = now;

        let strikes_of = |k: ViolationKind| {
            if k == kind {
                strike
            } else {
                self.store.live_strikes(&customer.contact, k, now)
            }
        };
        let block_reason = if record.score < policy.block_threshold {
            Some(BlockReason::AutoScore)
        } else {
            [ViolationKind::NoShow, ViolationKind::NoPickup]
                .into_iter()
                .find(|k| {
                    policy
                        .block_strikes_for(*k)
                        .is_some_and(|limit| strikes_of(*k) >= limit)
                })
                .map(BlockReason::AutoStrikes)
        };

        events.push(Event::PenaltyRecorded { penalty });
        let mut new_block = None;
        if let Some(reason) = block_reason {
            let in_force = self
                .store
                .active_block(&customer.contact)
                .is_some_and(|b| b.in_force(now));
            if in_force {
                debug!("{} already blocked; auto-block is a no-op", customer.contact);
            } else {
                let block = Block {
                    id: Ulid::new(),
                    contact: customer.contact.clone(),
                    customer_id: customer.id,
                    reason,
                    note: None,
                    created_at: now,
                    unblock_at: Some(now + policy.block_duration_ms()),
                    is_active: true,
                    resolved_at: None,
                    resolved_by: None,
                };
                record.is_blocked = true;
                new_block = Some(block.unblock_at);
                events.push(Event::BlockCreated { block });
            }
        }
        let new_score = record.score;
        events.push(Event::TrustWritten { record });

        PenaltyPlan {
            events,
            result: PenaltyResult {
                strike_count: strike,
                new_score,
                auto_blocked: new_block.is_some(),
            },
            recorded: true,
            lifted,
            new_block,
        }
    }

    /// Logs, metrics and outbox messages for a committed penalty plan.
    fn announce_penalty(&self, contact: &str, kind: ViolationKind, plan: &PenaltyPlan) {
        if let Some(id) = plan.lifted {
            metrics::counter!(observability::UNBLOCKS_TOTAL).increment(1);
            info!("block {id} on {contact} had expired and was lifted");
        }
        metrics::counter!(observability::PENALTIES_TOTAL, "kind" => violation_label(kind)).increment(1);
        info!(
            "penalty {:?} for {contact}: strike {}, score {}",
            kind, plan.result.strike_count, plan.result.new_score
        );
        if let Some(until) = plan.new_block {
            metrics::counter!(observability::AUTO_BLOCKS_TOTAL).increment(1);
            warn!("auto-blocked {contact} until {until:?}");
            self.outbox.send(Outbound::CustomerBlocked {
                contact: contact.to_string(),
                until,
            });
        }
    }

    /// Log a violation, apply its score delta, and auto-block if the customer
    /// crossed the score or strike thresholds.
    ///
    /// Runs under the contact's trust lock, so concurrent penalties for one
    /// customer see each other's strikes. A penalty for a booking that already
    /// has one of the same kind is not logged twice. A block whose time ran
    /// out is lifted in the same commit, so a repeat offender can be blocked
    /// again before the sweep gets to it.
    pub async fn record_penalty(
        &self,
        policy: &Policy,
        customer: &CustomerRef,
        kind: ViolationKind,
        booking: Option<BookingRef>,
        severity: Severity,
    ) -> Result<PenaltyResult, EngineError> {
        let customer = validated(customer)?;
        let _row = self.trust_locks.lock(&customer.contact).await;
        let now = self.clock.now();
        let mut plan = self.plan_penalty(policy, &customer, kind, booking, severity, now);
        if !plan.recorded {
            return Ok(plan.result);
        }
        self.commit(std::mem::take(&mut plan.events)).await?;
        self.announce_penalty(&customer.contact, kind, &plan);
        Ok(plan.result)
    }

    fn success_record(&self, policy: &Policy, customer: &CustomerRef, now: Ms) -> TrustScore {
        let (mut record, _) = self.load_trust(policy, customer, now);
        record.adjust(policy.success_delta);
        record.completed += 1;
        record.updated_at = now;
        record
    }

    /// Reward a completed booking and return the new score.
    pub async fn record_success(
        &self,
        policy: &Policy,
        customer: &CustomerRef,
    ) -> Result<i32, EngineError> {
        let customer = validated(customer)?;
        let _row = self.trust_locks.lock(&customer.contact).await;
        let record = self.success_record(policy, &customer, self.clock.now());
        let score = record.score;
        self.commit(vec![Event::TrustWritten { record }]).await?;
        Ok(score)
    }

    /// Lift up to `batch_limit` blocks whose unblock time has passed, putting
    /// each customer back at the neutral score. Block rows stay as history.
    pub async fn unblock_expired(&self, policy: &Policy, batch_limit: usize) -> Result<usize, EngineError> {
        let now = self.clock.now();
        let limit = batch_limit.min(MAX_SWEEP_BATCH);
        let due: Vec<(String, Ulid)> = self
            .store
            .active_blocks
            .iter()
            .filter(|e| {
                self.store
                    .blocks
                    .get(e.value())
                    .is_some_and(|b| b.unblock_at.is_some_and(|t| t <= now))
            })
            .take(limit)
            .map(|e| (e.key().clone(), *e.value()))
            .collect();

        let mut lifted = 0;
        for (contact, block_id) in due {
            let _row = self.trust_locks.lock(&contact).await;
            // A penalty or manual block may have replaced this block meanwhile.
            let still_active = self
                .store
                .active_blocks
                .get(&contact)
                .is_some_and(|e| *e.value() == block_id);
            let block = match self.store.blocks.get(&block_id) {
                Some(b) if still_active && b.is_active && !b.in_force(now) => b.value().clone(),
                _ => continue,
            };
            let customer = CustomerRef {
                id: block.customer_id,
                contact: contact.clone(),
            };
            let (mut record, _) = self.load_trust(policy, &customer, now);
            record.score = clamp_score(policy.neutral_score);
            record.is_blocked = false;
            record.updated_at = now;
            self.commit(vec![
                Event::BlockLifted {
                    id: block_id,
                    at: now,
                    resolved_by: None,
                },
                Event::TrustWritten { record },
            ])
            .await?;
            info!("block {block_id} on {contact} expired and was lifted");
            lifted += 1;
        }
        if lifted > 0 {
            metrics::counter!(observability::UNBLOCKS_TOTAL).increment(lifted as u64);
        }
        Ok(lifted)
    }

    /// Staff-issued block. Returns false if one is already in force.
    pub async fn block_customer(
        &self,
        policy: &Policy,
        customer: &CustomerRef,
        note: Option<String>,
        until: Option<Ms>,
    ) -> Result<bool, EngineError> {
        let customer = validated(customer)?;
        if note.as_ref().is_some_and(|n| n.len() > MAX_NOTE_LEN) {
            return Err(EngineError::LimitExceeded("note too long"));
        }
        let _row = self.trust_locks.lock(&customer.contact).await;
        let now = self.clock.now();
        if self
            .store
            .active_block(&customer.contact)
            .is_some_and(|b| b.in_force(now))
        {
            return Ok(false);
        }
        if until.is_some_and(|t| t <= now) {
            return Err(EngineError::InvalidInput("unblock time is in the past"));
        }
        let (mut record, _) = self.load_trust(policy, &customer, now);
        let mut events: Vec<Event> = self.lift_lapsed_block(policy, &mut record, now).into_iter().collect();
        record.is_blocked = true;
        record.updated_at = now;
        let block = Block {
            id: Ulid::new(),
            contact: customer.contact.clone(),
            customer_id: customer.id,
            reason: BlockReason::Manual,
            note,
            created_at: now,
            unblock_at: until,
            is_active: true,
            resolved_at: None,
            resolved_by: None,
        };
        events.push(Event::BlockCreated { block });
        events.push(Event::TrustWritten { record });
        self.commit(events).await?;
        info!("manually blocked {}", customer.contact);
        self.outbox.send(Outbound::CustomerBlocked {
            contact: customer.contact,
            until,
        });
        Ok(true)
    }

    /// Staff-issued unblock. The score is left where it is.
    pub async fn unblock_customer(
        &self,
        contact: &str,
        resolved_by: Option<String>,
    ) -> Result<bool, EngineError> {
        let contact = normalize_contact(contact);
        let _row = self.trust_locks.lock(&contact).await;
        let Some(block_id) = self.store.active_blocks.get(&contact).map(|e| *e.value()) else {
            return Ok(false);
        };
        let now = self.clock.now();
        let mut events = vec![Event::BlockLifted {
            id: block_id,
            at: now,
            resolved_by,
        }];
        if let Some(mut record) = self.trust_record(&contact) {
            record.is_blocked = false;
            record.updated_at = now;
            events.push(Event::TrustWritten { record });
        }
        self.commit(events).await?;
        info!("block {block_id} on {contact} lifted by staff");
        Ok(true)
    }

    /// Mark a penalty resolved so it stops counting toward strikes.
    pub async fn resolve_penalty(&self, penalty_id: Ulid, note: Option<String>) -> Result<bool, EngineError> {
        let contact = self
            .store
            .penalty_owner
            .get(&penalty_id)
            .map(|c| c.value().clone())
            .ok_or(EngineError::NotFound(penalty_id))?;
        let _row = self.trust_locks.lock(&contact).await;
        let already = self
            .store
            .penalties
            .get(&contact)
            .and_then(|log| log.iter().find(|p| p.id == penalty_id).map(|p| p.resolved))
            .unwrap_or(true);
        if already {
            return Ok(false);
        }
        self.commit(vec![Event::PenaltyResolved {
            id: penalty_id,
            at: self.clock.now(),
            note,
        }])
        .await?;
        Ok(true)
    }

    pub async fn set_vip(&self, policy: &Policy, customer: &CustomerRef, vip: bool) -> Result<(), EngineError> {
        let customer = validated(customer)?;
        let _row = self.trust_locks.lock(&customer.contact).await;
        let now = self.clock.now();
        let (mut record, _) = self.load_trust(policy, &customer, now);
        record.is_vip = vip;
        record.updated_at = now;
        self.commit(vec![Event::TrustWritten { record }]).await
    }

    /// Route a booking lifecycle outcome: settle the booking's status and
    /// reward or penalize the customer in one commit. Replaying the same
    /// outcome is harmless, and a completed booking is credited at most once.
    ///
    /// Takes the booking's row locks, then the customer's trust lock.
    pub async fn record_outcome(
        &self,
        policy: &Policy,
        booking_id: Ulid,
        outcome: Outcome,
    ) -> Result<OutcomeEffect, EngineError> {
        let booking = self.get_booking(&booking_id).ok_or(EngineError::NotFound(booking_id))?;
        let status = match &outcome {
            Outcome::Completed => BookingStatus::Completed,
            Outcome::NoShow | Outcome::NoPickup => BookingStatus::NoShow,
            Outcome::LateCancellation => BookingStatus::Cancelled,
            Outcome::Other(code) => {
                debug!("outcome {code:?} for booking {booking_id} ignored");
                return Ok(OutcomeEffect::Ignored);
            }
        };

        let _locks = self.lock_booking(&booking).await;
        let current = self.get_booking(&booking_id).ok_or(EngineError::NotFound(booking_id))?;
        let status_events = self.status_change_events(&current, status);
        let changed = status_events.is_some();
        let mut events = status_events.unwrap_or_default();

        let Some(contact) = current.contact.as_deref() else {
            self.commit(events).await?;
            return Ok(OutcomeEffect::Ignored);
        };
        let customer = validated(&CustomerRef::new(current.customer_id, contact))?;
        let _row = self.trust_locks.lock(&customer.contact).await;
        let now = self.clock.now();

        let effect = match outcome.violation() {
            Some(kind) => {
                let mut plan = self.plan_penalty(
                    policy,
                    &customer,
                    kind,
                    Some(current.reference()),
                    default_severity(kind),
                    now,
                );
                events.append(&mut plan.events);
                self.commit(events).await?;
                if plan.recorded {
                    self.announce_penalty(&customer.contact, kind, &plan);
                }
                OutcomeEffect::Penalized(plan.result)
            }
            None => {
                let settled_earlier = current.status == BookingStatus::Completed;
                if current.rewarded || !(changed || settled_earlier) {
                    self.commit(events).await?;
                    return Ok(OutcomeEffect::Ignored);
                }
                let record = self.success_record(policy, &customer, now);
                let new_score = record.score;
                events.push(Event::TrustWritten { record });
                events.push(Event::BookingRewarded { id: booking_id });
                self.commit(events).await?;
                OutcomeEffect::Rewarded { new_score }
            }
        };
        if changed {
            info!("booking {booking_id} now {status:?}");
        }
        Ok(effect)
    }
}
