//! Structured wallet events
//!
//! The core reports what it did through [`WalletEvent`]s delivered to a
//! host-registered [`EventListener`]. Events never carry key material.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// Events emitted by coin selection, transaction building and the proof engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WalletEvent {
    CoinsSelected {
        inputs: usize,
        total_in: u64,
        fee: u64,
    },
    TransactionBuilt {
        txid: String,
        vsize: u64,
        fee: u64,
        signed: bool,
    },
    FeeTierUnavailable {
        tier: String,
        reason: String,
    },
    PqKeypairReady {
        degraded: bool,
    },
    PqSigningFellBack {
        reason: String,
    },
    ProofGenerated {
        id: String,
        strong: bool,
    },
}

impl WalletEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            WalletEvent::CoinsSelected { .. } => "coins_selected",
            WalletEvent::TransactionBuilt { .. } => "transaction_built",
            WalletEvent::FeeTierUnavailable { .. } => "fee_tier_unavailable",
            WalletEvent::PqKeypairReady { .. } => "pq_keypair_ready",
            WalletEvent::PqSigningFellBack { .. } => "pq_signing_fell_back",
            WalletEvent::ProofGenerated { .. } => "proof_generated",
        }
    }
}

/// Receiver for wallet events
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &WalletEvent);
}

/// Discards every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl EventListener for NoopListener {
    fn on_event(&self, _event: &WalletEvent) {}
}

/// Forwards events to `tracing` at debug level
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingListener;

impl EventListener for TracingListener {
    fn on_event(&self, event: &WalletEvent) {
        tracing::debug!(event_type = event.event_type(), ?event, "wallet event");
    }
}

/// Keeps events in memory, in emission order
#[derive(Debug, Default, Clone)]
pub struct RecordingListener {
    events: Arc<Mutex<Vec<WalletEvent>>>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<WalletEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl EventListener for RecordingListener {
    fn on_event(&self, event: &WalletEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}
