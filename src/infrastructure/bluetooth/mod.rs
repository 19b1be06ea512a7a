//! Bluetooth Module
//!
//! Provides BLE communication with the Hello Fairy curtain light.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    DeviceController                      │
//! │  (Main coordinator - public API for the application)     │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┼─────────────┬──────────────┐
//!         │             │             │              │
//!         ▼             ▼             ▼              ▼
//! ┌────────────┐ ┌────────────┐ ┌───────────┐ ┌────────────┐
//! │ Connection │ │ Scheduler  │ │  Chunker  │ │  Protocol  │
//! │            │ │            │ │           │ │            │
//! │ - Connect  │ │ - FIFO     │ │ - MTU     │ │ - UUIDs    │
//! │   retries  │ │ - Retries  │ │   split   │ │ - Commands │
//! │ - Notify   │ │ - Delays   │ │           │ │ - Checksum │
//! └─────┬──────┘ └─────┬──────┘ └───────────┘ └────────────┘
//!       │              │
//!       ▼              ▼
//! ┌─────────────────────────┐
//! │   Transport (host BLE)  │
//! └─────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Frame layout, command encoding and notification parsing
//! - [`chunker`] - Splitting pixel batches to fit the negotiated MTU
//! - [`transport`] - The async seam a host BLE stack implements, plus a dry-run transport
//! - [`connection`] - Connecting and enabling notifications, with retries
//! - [`scheduler`] - Serialized per-device write queue

pub mod chunker;
pub mod connection;
pub mod protocol;
pub mod scheduler;
pub mod transport;

// Re-export the transport seam for convenience
pub use transport::{DeviceHandle, DryRunTransport, SharedTransport, Transport, TransportError, TransportEvent};
