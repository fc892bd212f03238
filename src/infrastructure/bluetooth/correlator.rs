//! Reply Correlator
//!
//! Matches replies arriving on the command notify channel to the operation
//! waiting for them. At most one waiter exists per opcode; a waiter may cover
//! several opcodes at once and is resolved by whichever arrives first.

use crate::infrastructure::bluetooth::protocol::{ProtocolError, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::trace;

struct Waiter {
    id: u64,
    sender: mpsc::UnboundedSender<Vec<u8>>,
}

#[derive(Default)]
pub struct ReplyCorrelator {
    waiters: Mutex<HashMap<u8, Waiter>>,
    next_id: AtomicU64,
}

impl ReplyCorrelator {
    fn waiters(&self) -> MutexGuard<'_, HashMap<u8, Waiter>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register interest in `opcodes` before the command is sent.
    ///
    /// Fails with [`ProtocolError::Busy`] if any of them is already awaited.
    pub fn expect(self: &Arc<Self>, opcodes: &[u8]) -> Result<PendingReply> {
        let mut waiters = self.waiters();
        if let Some(&busy) = opcodes.iter().find(|op| waiters.contains_key(op)) {
            return Err(ProtocolError::Busy(busy));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();
        for &op in opcodes {
            waiters.insert(
                op,
                Waiter {
                    id,
                    sender: sender.clone(),
                },
            );
        }

        Ok(PendingReply {
            correlator: Arc::clone(self),
            id,
            opcodes: opcodes.to_vec(),
            receiver,
        })
    }

    /// Hand a reply to its waiter. Returns false if nobody was waiting.
    pub fn dispatch(&self, bytes: &[u8]) -> bool {
        let Some(&op) = bytes.first() else {
            return false;
        };
        match self.waiters().remove(&op) {
            Some(waiter) => waiter.sender.send(bytes.to_vec()).is_ok(),
            None => false,
        }
    }

    pub fn is_waiting(&self, opcode: u8) -> bool {
        self.waiters().contains_key(&opcode)
    }

    fn release(&self, id: u64, opcodes: &[u8]) {
        let mut waiters = self.waiters();
        for op in opcodes {
            if waiters.get(op).is_some_and(|w| w.id == id) {
                waiters.remove(op);
            }
        }
    }
}

/// Handle for a registered wait; dropping it releases its opcodes
pub struct PendingReply {
    correlator: Arc<ReplyCorrelator>,
    id: u64,
    opcodes: Vec<u8>,
    receiver: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl PendingReply {
    /// Wait for the next reply on any of the registered opcodes.
    ///
    /// Each opcode resolves at most once. A timeout leaves the connection
    /// untouched so the caller can retry.
    pub async fn wait(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        match tokio::time::timeout(timeout, self.receiver.recv()).await {
            Ok(Some(bytes)) => Ok(bytes),
            Ok(None) | Err(_) => {
                trace!("Timed out waiting for {:02X?}", self.opcodes);
                Err(ProtocolError::timeout(&self.opcodes))
            }
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        self.correlator.release(self.id, &self.opcodes);
    }
}
