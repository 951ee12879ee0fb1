use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;
use crate::outbox::Outbound;
use crate::policy::Policy;

use super::{Engine, EngineError};

/// Arguments to [`Engine::request_confirmation`].
#[derive(Debug, Clone)]
pub struct ConfirmationRequest {
    pub booking: BookingRef,
    pub kind: ConfirmKind,
    pub channel: Channel,
    /// Defaults to the booking's contact.
    pub contact: Option<String>,
}

/// Delivery-channel callback for an outbound confirmation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryReceipt {
    Sent,
    Delivered,
    Read,
    Failed,
}

impl DeliveryReceipt {
    fn status(self) -> ConfirmStatus {
        match self {
            DeliveryReceipt::Sent => ConfirmStatus::Sent,
            DeliveryReceipt::Delivered => ConfirmStatus::Delivered,
            DeliveryReceipt::Read => ConfirmStatus::Read,
            DeliveryReceipt::Failed => ConfirmStatus::Failed,
        }
    }
}

fn action_label(action: AutoAction) -> &'static str {
    match action {
        AutoAction::Cancel => "cancel",
        AutoAction::Keep => "keep",
        AutoAction::NotifyStaff => "notify_staff",
    }
}

/// Unanswered and past its deadline with the auto-action still pending. A
/// failed delivery never gets an answer, so it counts as unanswered.
fn auto_action_due(c: &Confirmation, now: Ms) -> bool {
    let unanswered = !c.status.is_terminal() || c.status == ConfirmStatus::Failed;
    unanswered && !c.auto_action_executed && c.expires_at <= now
}

impl Engine {
    pub fn get_confirmation(&self, id: &Ulid) -> Option<Confirmation> {
        self.store.confirmations.get(id).map(|c| c.value().clone())
    }

    /// Open a confirmation cycle for a booking. Expiry and the auto-action
    /// come from the policy. The message itself is sent by whoever listens
    /// on the outbox.
    pub async fn request_confirmation(
        &self,
        policy: &Policy,
        req: ConfirmationRequest,
    ) -> Result<Ulid, EngineError> {
        let booking = self
            .get_booking(&req.booking.id)
            .ok_or(EngineError::NotFound(req.booking.id))?;
        if booking.kind != req.booking.kind {
            return Err(EngineError::InvalidInput("booking kind mismatch"));
        }
        let contact = req
            .contact
            .as_deref()
            .or(booking.contact.as_deref())
            .map(normalize_contact)
            .ok_or(EngineError::InvalidInput("no contact to confirm with"))?;
        if contact.is_empty() {
            return Err(EngineError::InvalidInput("empty contact handle"));
        }
        if contact.len() > MAX_CONTACT_LEN {
            return Err(EngineError::LimitExceeded("contact too long"));
        }

        let now = self.clock.now();
        let confirmation = Confirmation {
            id: Ulid::new(),
            booking: req.booking,
            kind: req.kind,
            channel: req.channel,
            contact: contact.clone(),
            status: ConfirmStatus::Pending,
            created_at: now,
            expires_at: now + policy.confirmation_timeout_ms(),
            response: None,
            responded_at: None,
            auto_action: policy.confirmation_auto_action,
            auto_action_executed: false,
        };
        let id = confirmation.id;
        self.commit(vec![
            Event::ConfirmationWritten { confirmation },
            Event::BookingConfirmationChanged {
                id: req.booking.id,
                confirmation: BookingConfirmation::Pending,
            },
        ])
        .await?;

        info!("confirmation {id} requested for booking {}", req.booking.id);
        self.outbox.send(Outbound::SendConfirmation {
            confirmation_id: id,
            booking: req.booking,
            kind: req.kind,
            channel: req.channel,
            contact,
        });
        Ok(id)
    }

    /// Apply a delivery receipt. Receipts only move the status forward;
    /// late or duplicate receipts return false.
    pub async fn record_delivery(&self, id: Ulid, receipt: DeliveryReceipt) -> Result<bool, EngineError> {
        let _row = self.confirmation_locks.lock(&id).await;
        let mut c = self.get_confirmation(&id).ok_or(EngineError::NotFound(id))?;
        let next = receipt.status();
        if c.status.is_terminal() || next.rank() <= c.status.rank() {
            debug!("confirmation {id}: ignoring {receipt:?} in {:?}", c.status);
            return Ok(false);
        }
        c.status = next;
        self.commit(vec![Event::ConfirmationWritten { confirmation: c }])
            .await?;
        Ok(true)
    }

    /// Record the customer's answer and mirror it onto the booking in the
    /// same commit. A cancellation also cancels the booking.
    pub async fn record_response(
        &self,
        id: Ulid,
        response: CustomerResponse,
    ) -> Result<bool, EngineError> {
        let _row = self.confirmation_locks.lock(&id).await;
        let mut c = self.get_confirmation(&id).ok_or(EngineError::NotFound(id))?;
        if c.status.is_terminal() {
            return Ok(false);
        }
        let now = self.clock.now();
        c.status = ConfirmStatus::Responded;
        c.response = Some(response);
        c.responded_at = Some(now);

        let mirrored = match response {
            CustomerResponse::Confirmed => BookingConfirmation::Confirmed,
            CustomerResponse::Cancelled => BookingConfirmation::Declined,
            CustomerResponse::NeedChange | CustomerResponse::Other => {
                BookingConfirmation::ChangeRequested
            }
        };
        let booking_id = c.booking.id;
        let mut events = vec![
            Event::ConfirmationWritten { confirmation: c },
            Event::BookingConfirmationChanged {
                id: booking_id,
                confirmation: mirrored,
            },
        ];

        match self.get_booking(&booking_id) {
            Some(booking) => {
                let _locks = self.lock_booking(&booking).await;
                let next = match response {
                    CustomerResponse::Confirmed => Some(BookingStatus::Confirmed),
                    CustomerResponse::Cancelled => Some(BookingStatus::Cancelled),
                    CustomerResponse::NeedChange | CustomerResponse::Other => None,
                };
                if let Some(status) = next
                    && let Some(change) = self.status_change_events(&booking, status)
                {
                    events.extend(change);
                }
                self.commit(events).await?;
            }
            None => self.commit(events).await?,
        }
        info!("confirmation {id} answered {response:?}");
        Ok(true)
    }

    /// Expire unanswered confirmations past their deadline and fire each
    /// one's auto-action exactly once. Failed deliveries keep their status
    /// but still get the auto-action. The `auto_action_executed` flag is
    /// checked and set under the confirmation's row lock in the same commit
    /// as the action, so overlapping sweeps cannot both fire it.
    pub async fn sweep_confirmations(&self) -> Result<usize, EngineError> {
        let now = self.clock.now();
        let due: Vec<Ulid> = self
            .store
            .confirmations
            .iter()
            .filter(|c| auto_action_due(c, now))
            .take(MAX_SWEEP_BATCH)
            .map(|c| c.id)
            .collect();

        let mut fired = 0;
        for id in due {
            let _row = self.confirmation_locks.lock(&id).await;
            let Some(mut c) = self.get_confirmation(&id) else {
                continue;
            };
            if !auto_action_due(&c, now) {
                debug!("confirmation {id} already settled");
                continue;
            }
            if c.status != ConfirmStatus::Failed {
                c.status = ConfirmStatus::Expired;
            }
            c.auto_action_executed = true;
            let action = c.auto_action;
            let booking_ref = c.booking;

            let mut events = vec![
                Event::ConfirmationWritten { confirmation: c },
                Event::BookingConfirmationChanged {
                    id: booking_ref.id,
                    confirmation: BookingConfirmation::Expired,
                },
            ];
            let mut cancelled = false;
            match self.get_booking(&booking_ref.id) {
                Some(booking) if action == AutoAction::Cancel => {
                    let _locks = self.lock_booking(&booking).await;
                    if let Some(change) = self.status_change_events(&booking, BookingStatus::Cancelled) {
                        events.extend(change);
                        cancelled = true;
                    }
                    self.commit(events).await?;
                }
                _ => self.commit(events).await?,
            }

            match action {
                AutoAction::Cancel if cancelled => {
                    self.outbox.send(Outbound::BookingAutoCancelled { booking: booking_ref });
                }
                AutoAction::NotifyStaff => {
                    self.outbox.send(Outbound::NotifyStaff {
                        confirmation_id: id,
                        booking: booking_ref,
                    });
                }
                _ => {}
            }
            metrics::counter!(observability::CONFIRMATION_AUTO_ACTIONS_TOTAL, "action" => action_label(action))
                .increment(1);
            info!("confirmation {id} expired; auto-action {}", action_label(action));
            fired += 1;
        }
        Ok(fired)
    }
}
