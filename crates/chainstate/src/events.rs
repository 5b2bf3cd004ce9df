//! Chain notifications delivered to wallet-side subscribers.

use std::sync::{Mutex, PoisonError};

use schilling_consensus::Hash256;
use schilling_primitives::Transaction;
use tokio::sync::mpsc;

use crate::chain::BlockSource;
use crate::stored_block::StoredBlock;
use crate::validation::VerificationError;

#[derive(Clone, Debug)]
pub enum ChainEvent {
    /// A block joined the best chain.
    BlockConnected { block: StoredBlock },
    /// A block left the best chain during a reorganization.
    BlockDisconnected { block: StoredBlock },
    TransactionConnected {
        txid: Hash256,
        tx: Transaction,
        block_hash: Hash256,
        height: i32,
    },
    /// A previously connected transaction was unwound.
    TransactionDisconnected {
        txid: Hash256,
        tx: Transaction,
        block_hash: Hash256,
        height: i32,
    },
    Reorganized {
        split: StoredBlock,
        old_head: StoredBlock,
        new_head: StoredBlock,
    },
    HeadChanged { head: StoredBlock },
    BlockRejected {
        hash: Hash256,
        source: BlockSource,
        error: VerificationError,
    },
}

/// Selects the transactions worth reporting.
pub trait TransactionFilter: Send + Sync {
    fn is_relevant(&self, tx: &Transaction) -> bool;
}

/// Reports every transaction.
pub struct AcceptAll;

impl TransactionFilter for AcceptAll {
    fn is_relevant(&self, _tx: &Transaction) -> bool {
        true
    }
}

#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<ChainEvent>>>,
}

impl EventBus {
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ChainEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    /// Delivers `events` in order to every live subscriber; closed receivers are dropped.
    pub fn publish(&self, events: Vec<ChainEvent>) {
        if events.is_empty() {
            return;
        }
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|subscriber| {
            events
                .iter()
                .all(|event| subscriber.send(event.clone()).is_ok())
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_subscribers_are_pruned() {
        let bus = EventBus::default();
        let mut live = bus.subscribe();
        let dropped = bus.subscribe();
        drop(dropped);

        bus.publish(vec![ChainEvent::HeadChanged {
            head: StoredBlock::genesis(
                &schilling_consensus::chain_params(schilling_consensus::Network::Regtest)
                    .consensus,
            )
            .expect("genesis"),
        }]);

        assert_eq!(bus.subscriber_count(), 1);
        assert!(matches!(live.try_recv(), Ok(ChainEvent::HeadChanged { .. })));
    }
}
