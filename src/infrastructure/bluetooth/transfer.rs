//! Bulk Transfer Accumulator
//!
//! Collects file bytes from the bulk transfer channel between the start and
//! end markers of one download. Bytes are appended in arrival order with no
//! framing.

use crate::infrastructure::bluetooth::protocol::{TRANSFER_END, TRANSFER_START};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct TransferState {
    buffer: Vec<u8>,
    active: bool,
    complete: bool,
}

#[derive(Debug, Default)]
pub struct BulkTransfer {
    state: Mutex<TransferState>,
}

impl BulkTransfer {
    fn state(&self) -> MutexGuard<'_, TransferState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop any leftover bytes and flags before requesting a file
    pub fn reset(&self) {
        *self.state() = TransferState::default();
    }

    pub fn append(&self, bytes: &[u8]) {
        let mut state = self.state();
        if !state.active {
            debug!("Bulk data outside an announced transfer ({} bytes)", bytes.len());
        }
        state.buffer.extend_from_slice(bytes);
    }

    /// Apply a transfer marker byte from a `0xC8` reply
    pub fn on_marker(&self, marker: u8) {
        let mut state = self.state();
        match marker {
            TRANSFER_START => {
                state.active = true;
                state.complete = false;
            }
            TRANSFER_END => {
                state.active = false;
                state.complete = true;
            }
            other => warn!("Unknown transfer marker {:#04x}", other),
        }
    }

    pub fn is_active(&self) -> bool {
        self.state().active
    }

    pub fn is_complete(&self) -> bool {
        self.state().complete
    }

    pub fn len(&self) -> usize {
        self.state().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot the buffer and clear it in one step
    pub fn take(&self) -> Vec<u8> {
        std::mem::take(&mut self.state().buffer)
    }
}
