//! Correlates publishes with broker acknowledgments.
//!
//! rumqttc assigns packet ids inside the event loop, so the caller of
//! `AsyncClient::publish` never learns the id of its own message. The event
//! loop does emit `Outgoing::Publish(pkid)` in request order, which is enough:
//!
//! ```text
//! publish()  --enqueue-->  queued (FIFO)
//! Outgoing::Publish(pkid)  --pop front-->  inflight[pkid]   (QoS 0 resolves here)
//! PubAck(pkid) / PubComp(pkid)  --remove-->  waiter resolved
//! ```
//!
//! Enqueue and the client request must happen under one lock so the FIFO and
//! the request channel agree on order. After a reconnect rumqttc replays
//! unacknowledged publishes with their original ids; an outgoing id that is
//! already inflight is such a replay and leaves the FIFO alone.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Mutex, MutexGuard},
};

use rumqttc::QoS;
use tokio::sync::oneshot;
use tracing::trace;

/// Resolution of one publish: `Err` carries the reason it will never be acknowledged.
pub type AckOutcome = Result<(), String>;

struct Waiter {
    qos: QoS,
    tx: oneshot::Sender<AckOutcome>,
}

impl Waiter {
    fn resolve(self, outcome: AckOutcome) {
        // The receiver is gone once its caller timed out.
        let _ = self.tx.send(outcome);
    }
}

#[derive(Default)]
struct Pending {
    queued: VecDeque<Waiter>,
    inflight: HashMap<u16, Waiter>,
}

#[derive(Default)]
pub struct AckTracker {
    pending: Mutex<Pending>,
}

impl AckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn pending(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers the next publish handed to the client.
    pub fn enqueue(&self, qos: QoS) -> oneshot::Receiver<AckOutcome> {
        let (tx, rx) = oneshot::channel();
        self.pending().queued.push_back(Waiter { qos, tx });
        rx
    }

    /// Withdraws the most recent registration after the client refused the request.
    pub fn cancel_last(&self) {
        self.pending().queued.pop_back();
    }

    pub fn on_outgoing(&self, pkid: u16) {
        let mut pending = self.pending();

        if pkid != 0 && pending.inflight.contains_key(&pkid) {
            trace!(pkid, "Replayed publish, keeping existing waiter");
            return;
        }

        let Some(waiter) = pending.queued.pop_front() else {
            trace!(pkid, "Outgoing publish without a registered waiter");
            return;
        };

        match waiter.qos {
            QoS::AtMostOnce => waiter.resolve(Ok(())),
            _ => {
                pending.inflight.insert(pkid, waiter);
            }
        }
    }

    /// PUBACK for QoS 1, PUBCOMP for QoS 2.
    pub fn on_ack(&self, pkid: u16) {
        match self.pending().inflight.remove(&pkid) {
            Some(waiter) => waiter.resolve(Ok(())),
            None => trace!(pkid, "Acknowledgment for untracked packet"),
        }
    }

    /// Fails every registered publish. Used once the connection is closed for good.
    pub fn fail_all(&self, reason: &str) {
        let mut pending = self.pending();
        for waiter in pending.queued.drain(..) {
            waiter.resolve(Err(reason.to_string()));
        }
        for (_, waiter) in pending.inflight.drain() {
            waiter.resolve(Err(reason.to_string()));
        }
    }

    /// Publishes registered but not yet acknowledged.
    pub fn len(&self) -> usize {
        let pending = self.pending();
        pending.queued.len() + pending.inflight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
