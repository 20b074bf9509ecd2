use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::lightning::invoice::LnInvoice;
use crate::models::Payment;
use crate::reverse_swap::ReverseSwapInfo;
use crate::swap::SwapInfo;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BreezEvent {
    NewBlock {
        block: u32,
    },
    InvoicePaid {
        details: InvoicePaidDetails,
    },
    PaymentSucceed {
        details: Payment,
    },
    PaymentFailed {
        details: PaymentFailedData,
    },
    BackupStarted,
    BackupSucceeded,
    BackupFailed {
        details: BackupFailedData,
    },
    SwapUpdated {
        details: SwapInfo,
    },
    ReverseSwapUpdated {
        details: ReverseSwapInfo,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoicePaidDetails {
    pub payment_hash: String,
    pub bolt11: String,
    pub payment: Option<Payment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentFailedData {
    pub error: String,
    pub node_id: String,
    pub invoice: Option<LnInvoice>,
    pub label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupFailedData {
    pub error: String,
}

/// Ordered, append-only event stream. Subscribers only see events sent after they attach.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BreezEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BreezEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: BreezEvent) {
        tracing::debug!(?event, "emit event");
        // No receivers is fine: events are not persisted.
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn late_subscriber_sees_no_replay() {
        let bus = EventBus::new();
        let mut early = bus.subscribe();
        bus.emit(BreezEvent::NewBlock { block: 1 });
        let mut late = bus.subscribe();
        bus.emit(BreezEvent::NewBlock { block: 2 });

        assert_eq!(early.recv().await.unwrap(), BreezEvent::NewBlock { block: 1 });
        assert_eq!(early.recv().await.unwrap(), BreezEvent::NewBlock { block: 2 });
        assert_eq!(late.recv().await.unwrap(), BreezEvent::NewBlock { block: 2 });
        assert!(late.try_recv().is_err());
    }
}
