//! Typed publish/subscribe for match events
//!
//! In-process listeners (persistence, audit logging) subscribe with a callback and are
//! unsubscribed explicitly on teardown. Every published event is also forwarded to the
//! network broadcast channel, and the latest phase announcement is cached so late
//! joiners can resynchronise.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::ws::protocol::{MatchEvent, ServerMsg};

pub type SubscriptionId = u64;
pub type Listener = Box<dyn FnMut(u64, &MatchEvent) + Send>;

pub struct EventBus {
    next_id: SubscriptionId,
    listeners: Vec<(SubscriptionId, Listener)>,
    network: broadcast::Sender<ServerMsg>,
    latest_phase: Arc<RwLock<Option<ServerMsg>>>,
}

impl EventBus {
    pub fn new(network: broadcast::Sender<ServerMsg>, latest_phase: Arc<RwLock<Option<ServerMsg>>>) -> Self {
        Self {
            next_id: 1,
            listeners: Vec::new(),
            network,
            latest_phase,
        }
    }

    pub fn subscribe(&mut self, listener: Listener) -> SubscriptionId {
        let id = self.next_id;
        self.next_id += 1;
        self.listeners.push((id, listener));
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(sid, _)| *sid != id);
        self.listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Deliver to listeners in subscription order, then to the network
    pub fn publish(&mut self, tick: u64, event: MatchEvent) {
        for (_, listener) in self.listeners.iter_mut() {
            listener(tick, &event);
        }

        let msg = ServerMsg::Event { tick, event };
        if matches!(msg, ServerMsg::Event { event: MatchEvent::PhaseChanged { .. }, .. }) {
            *self.latest_phase.write() = Some(msg.clone());
        }
        // No receivers is normal before anyone connects
        let _ = self.network.send(msg);
    }

    /// Send a message that is not a match event (snapshots, errors, pongs)
    pub fn send(&self, msg: ServerMsg) {
        let _ = self.network.send(msg);
    }
}
