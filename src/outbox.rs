use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::*;

const CHANNEL_CAPACITY: usize = 256;

/// Requests this core hands to collaborators it does not implement:
/// message delivery and staff notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    SendConfirmation {
        confirmation_id: Ulid,
        booking: BookingRef,
        kind: ConfirmKind,
        channel: Channel,
        contact: String,
    },
    NotifyStaff {
        confirmation_id: Ulid,
        booking: BookingRef,
    },
    BookingAutoCancelled {
        booking: BookingRef,
    },
    CustomerBlocked {
        contact: String,
        until: Option<Ms>,
    },
}

/// Broadcast hub for outbound requests of one tenant.
pub struct Outbox {
    sender: broadcast::Sender<Outbound>,
}

impl Default for Outbox {
    fn default() -> Self {
        Self::new()
    }
}

impl Outbox {
    pub fn new() -> Self {
        Self {
            sender: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Outbound> {
        self.sender.subscribe()
    }

    /// Publish a request. No-op if nobody is listening.
    pub fn send(&self, msg: Outbound) {
        let _ = self.sender.send(msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribe_and_receive() {
        let outbox = Outbox::new();
        let mut rx = outbox.subscribe();

        let msg = Outbound::BookingAutoCancelled {
            booking: BookingRef {
                kind: BookingKind::Reservation,
                id: Ulid::new(),
            },
        };
        outbox.send(msg.clone());

        assert_eq!(rx.recv().await.unwrap(), msg);
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let outbox = Outbox::new();
        outbox.send(Outbound::CustomerBlocked {
            contact: "+1555".into(),
            until: None,
        });
    }
}
