//! BLE Connection Module
//!
//! The seam between the protocol engine and whatever BLE stack the
//! application uses. The adapter implements [`Transport`] for writes and
//! forwards every notification to a [`NotificationRouter`].

use crate::infrastructure::bluetooth::correlator::ReplyCorrelator;
use crate::infrastructure::bluetooth::protocol::{self, opcode};
use crate::infrastructure::bluetooth::transfer::BulkTransfer;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace, warn};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("device is not connected")]
    NotConnected,
    #[error("write failed: {0}")]
    Write(String),
}

/// Logical GATT channels the core knows about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    CommandWrite,
    CommandNotify,
    BulkTransferNotify,
    EventsNotify,
}

impl Channel {
    pub fn uuid(&self) -> &'static str {
        match self {
            Self::CommandWrite => protocol::COMMAND_WRITE_CHAR_UUID,
            Self::CommandNotify => protocol::COMMAND_NOTIFY_CHAR_UUID,
            Self::BulkTransferNotify => protocol::BULK_TRANSFER_CHAR_UUID,
            Self::EventsNotify => protocol::EVENTS_CHAR_UUID,
        }
    }

    /// Map a characteristic UUID back to its channel
    pub fn from_uuid(uuid: &str) -> Option<Self> {
        [
            Self::CommandWrite,
            Self::CommandNotify,
            Self::BulkTransferNotify,
            Self::EventsNotify,
        ]
        .into_iter()
        .find(|c| c.uuid().eq_ignore_ascii_case(uuid))
    }
}

/// Write access to the command channel, provided by the BLE adapter
pub trait Transport: Send + Sync {
    fn write(&self, bytes: &[u8]) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// Entry point for notifications coming from the BLE adapter.
///
/// Cheap to clone; the adapter keeps one in its notification callback.
#[derive(Clone, Default)]
pub struct NotificationRouter {
    correlator: Arc<ReplyCorrelator>,
    transfer: Arc<BulkTransfer>,
}

impl NotificationRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn correlator(&self) -> &Arc<ReplyCorrelator> {
        &self.correlator
    }

    pub fn transfer(&self) -> &Arc<BulkTransfer> {
        &self.transfer
    }

    /// Deliver one notification
    pub fn on_notification(&self, channel: Channel, bytes: &[u8]) {
        match channel {
            Channel::CommandNotify => self.on_reply(bytes),
            Channel::BulkTransferNotify => self.transfer.append(bytes),
            Channel::EventsNotify => trace!("Ignoring event notification {:02X?}", bytes),
            Channel::CommandWrite => warn!("Notification on the write channel: {:02X?}", bytes),
        }
    }

    fn on_reply(&self, bytes: &[u8]) {
        let Some(&op) = bytes.first() else {
            debug!("Empty reply notification");
            return;
        };

        #[cfg(debug_assertions)]
        trace!("Reply: {:02X?}", bytes);

        // Transfer markers drive the accumulator even when nobody waits
        if op == opcode::TRANSFER {
            if let Some(&marker) = bytes.get(2) {
                self.transfer.on_marker(marker);
            }
        }

        if !self.correlator.dispatch(bytes) {
            trace!("Dropping unmatched reply {:#04x}", op);
        }
    }
}
