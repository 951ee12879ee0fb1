mod confirm;
mod error;
mod holds;
mod locks;
mod overlap;
mod store;
mod trust;

pub use confirm::{ConfirmationRequest, DeliveryReceipt};
pub use error::EngineError;
pub use holds::HoldRequest;
pub use locks::RowLocks;
pub use overlap::{BookingRequest, RescheduleRequest};
pub use store::{Entry, EntryKind, SlotKey, Store, SubjectKey, Timeline};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::clock::Clock;
use crate::model::*;
use crate::outbox::Outbox;
use crate::wal::Wal;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingCommit = (Vec<Event>, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches commits for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { events, response } => {
                let mut batch = vec![(events, response)];

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { events, response }) => {
                            batch.push((events, response));
                        }
                        Ok(other) => {
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty, flush batch
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<PendingCommit>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingCommit]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (events, _) in batch {
        if let Err(e) = wal.append_buffered(events) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush, even on append error, so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// One tenant's booking concurrency and trust core.
///
/// State lives in `store` and is rebuilt from the WAL on startup. Every
/// mutation follows the same shape: take the row locks it needs, read,
/// build the events, `commit` them (WAL first, then apply), drop the locks.
pub struct Engine {
    pub store: Store,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub outbox: Arc<Outbox>,
    pub clock: Clock,
    /// Commits take it shared; compaction takes it exclusive so no commit
    /// lands between the snapshot and the file swap.
    commit_gate: RwLock<()>,
    /// Non-blocking claim per (branch, slot start).
    pub(super) slot_locks: RowLocks<SlotKey>,
    pub(super) branch_locks: RowLocks<Ulid>,
    pub(super) subject_locks: RowLocks<SubjectKey>,
    /// Keyed by normalised contact; guards trust, penalty and block rows.
    pub(super) trust_locks: RowLocks<String>,
    pub(super) confirmation_locks: RowLocks<Ulid>,
}

impl Engine {
    pub fn new(wal_path: PathBuf, outbox: Arc<Outbox>, clock: Clock) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = Store::default();
        for event in &events {
            store.apply(event);
        }

        Ok(Self {
            store,
            wal_tx,
            outbox,
            clock,
            commit_gate: RwLock::new(()),
            slot_locks: RowLocks::default(),
            branch_locks: RowLocks::default(),
            subject_locks: RowLocks::default(),
            trust_locks: RowLocks::default(),
            confirmation_locks: RowLocks::default(),
        })
    }

    /// Write events to the WAL as one commit, then apply them.
    pub(super) async fn commit(&self, events: Vec<Event>) -> Result<(), EngineError> {
        if events.is_empty() {
            return Ok(());
        }
        let _gate = self.commit_gate.read().await;
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                events: events.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        for event in &events {
            self.store.apply(event);
        }
        Ok(())
    }

    pub fn get_booking(&self, id: &Ulid) -> Option<Booking> {
        self.store.bookings.get(id).map(|b| b.value().clone())
    }

    /// Rewrite the WAL with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;
        let events = self.store.snapshot();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Forget lock rows nobody is using. Returns how many were dropped.
    pub fn prune_locks(&self) -> usize {
        self.slot_locks.prune()
            + self.branch_locks.prune()
            + self.subject_locks.prune()
            + self.trust_locks.prune()
            + self.confirmation_locks.prune()
    }
}
