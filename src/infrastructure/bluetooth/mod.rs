//! Bluetooth Module
//!
//! Talks to the tablet over whatever BLE stack the host provides.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    NoteSyncService                       │
//! │  (registry lookup, download / decode / delete loop)      │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!                       ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                    DeviceSession                         │
//! │  (one operation at a time, variant-specific quirks)      │
//! └──────┬──────────────────────────────────────┬───────────┘
//!        │ write                                 │ expect / take
//!        ▼                                       ▼
//! ┌────────────┐   notifications   ┌──────────────────────────┐
//! │ Transport  │ ────────────────▶ │   NotificationRouter     │
//! │ (adapter)  │                   │ - ReplyCorrelator        │
//! └────────────┘                   │ - BulkTransfer           │
//!                                  └──────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Opcodes, envelope, status codes and device time
//! - [`connection`] - Transport trait, channels and notification routing
//! - [`correlator`] - Matching replies to waiting operations
//! - [`transfer`] - Bulk file byte accumulation
//! - [`engine`] - Device operations and registration
//! - [`service`] - Multi-file download workflow

pub mod connection;
pub mod correlator;
pub mod engine;
pub mod protocol;
pub mod service;
pub mod transfer;

pub use engine::DeviceSession;
pub use service::NoteSyncService;
