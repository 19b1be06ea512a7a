//! BLE transport seam
//!
//! The host application owns the actual BLE stack. It plugs in here by
//! implementing [`Transport`]; the controller only ever talks to this trait.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Errors reported by a transport implementation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    #[error("Device disconnected")]
    Disconnected,

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Write not confirmed in time")]
    Timeout,

    #[error("Notification subscription failed: {0}")]
    SubscribeFailed(String),
}

/// An open link to one light
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceHandle {
    pub address: String,
    /// Advertised name, used to detect the pixel-count variant
    pub name: Option<String>,
    /// Negotiated ATT MTU, if an exchange happened
    pub mtu: Option<u16>,
}

/// Inbound traffic on the notify characteristic, in arrival order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Notification(Vec<u8>),
    Disconnected,
}

/// The host-provided BLE client
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect to a device by address
    async fn connect(&self, address: &str) -> Result<DeviceHandle, TransportError>;

    /// Write one frame to the write characteristic
    async fn write(&self, handle: &DeviceHandle, bytes: &[u8]) -> Result<(), TransportError>;

    /// Enable notifications; the receiver yields every notification and the
    /// final disconnect, in order
    async fn subscribe(
        &self,
        handle: &DeviceHandle,
    ) -> Result<mpsc::UnboundedReceiver<TransportEvent>, TransportError>;

    async fn disconnect(&self, handle: &DeviceHandle) -> Result<(), TransportError>;
}

/// Type alias for a shared transport
pub type SharedTransport = Arc<dyn Transport>;

/// Transport that logs every frame instead of touching a radio
///
/// Useful for trying out command sequences without hardware. It can also
/// simulate a flaky link: failing writes, write latency, inbound
/// notifications and a dropped connection.
pub struct DryRunTransport {
    name: String,
    mtu: Option<u16>,
    latency: Duration,
    written: Mutex<Vec<Vec<u8>>>,
    events: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
    failures_left: AtomicUsize,
    severed: AtomicBool,
    writes_in_progress: AtomicUsize,
    max_concurrent_writes: AtomicUsize,
}

impl DryRunTransport {
    pub fn new(name: impl Into<String>, mtu: Option<u16>) -> Self {
        Self {
            name: name.into(),
            mtu,
            latency: Duration::ZERO,
            written: Mutex::new(Vec::new()),
            events: Mutex::new(None),
            failures_left: AtomicUsize::new(0),
            severed: AtomicBool::new(false),
            writes_in_progress: AtomicUsize::new(0),
            max_concurrent_writes: AtomicUsize::new(0),
        }
    }

    /// Every write takes this long before it completes
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Make the next `count` writes fail
    pub fn fail_writes(&self, count: usize) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    /// Every frame written successfully so far
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.written.lock().clone()
    }

    pub fn clear_written(&self) {
        self.written.lock().clear();
    }

    /// Highest number of writes that were ever running at the same time
    pub fn max_concurrent_writes(&self) -> usize {
        self.max_concurrent_writes.load(Ordering::SeqCst)
    }

    /// Deliver a notification as if the device had sent it
    pub fn inject_notification(&self, bytes: Vec<u8>) -> bool {
        match self.events.lock().as_ref() {
            Some(tx) => tx.send(TransportEvent::Notification(bytes)).is_ok(),
            None => false,
        }
    }

    /// Fail every later write with `Disconnected` without raising a link event,
    /// like a stack that only notices the loss when writing
    pub fn sever_writes(&self) {
        self.severed.store(true, Ordering::SeqCst);
    }

    /// Drop the link as if the device went out of range
    pub fn drop_link(&self) {
        if let Some(tx) = self.events.lock().take() {
            let _ = tx.send(TransportEvent::Disconnected);
        }
    }
}

#[async_trait]
impl Transport for DryRunTransport {
    async fn connect(&self, address: &str) -> Result<DeviceHandle, TransportError> {
        info!("[dry-run] connect {} ({})", address, self.name);
        Ok(DeviceHandle {
            address: address.to_string(),
            name: Some(self.name.clone()),
            mtu: self.mtu,
        })
    }

    async fn write(&self, handle: &DeviceHandle, bytes: &[u8]) -> Result<(), TransportError> {
        let running = self.writes_in_progress.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent_writes.fetch_max(running, Ordering::SeqCst);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        if self.severed.load(Ordering::SeqCst) {
            self.writes_in_progress.fetch_sub(1, Ordering::SeqCst);
            debug!("[dry-run] {} write on a severed link", handle.address);
            return Err(TransportError::Disconnected);
        }

        let failed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        self.writes_in_progress.fetch_sub(1, Ordering::SeqCst);

        if failed {
            debug!("[dry-run] {} write failed: {:02X?}", handle.address, bytes);
            return Err(TransportError::WriteFailed("simulated failure".into()));
        }

        debug!("[dry-run] {} <- {:02X?}", handle.address, bytes);
        self.written.lock().push(bytes.to_vec());
        Ok(())
    }

    async fn subscribe(
        &self,
        _handle: &DeviceHandle,
    ) -> Result<mpsc::UnboundedReceiver<TransportEvent>, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.events.lock() = Some(tx);
        Ok(rx)
    }

    async fn disconnect(&self, handle: &DeviceHandle) -> Result<(), TransportError> {
        info!("[dry-run] disconnect {}", handle.address);
        self.drop_link();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dry_run_records_writes() {
        let transport = DryRunTransport::new("Hello Fairy BLE900", Some(247));
        let handle = transport.connect("AA:BB:CC:DD:EE:FF").await.unwrap();
        assert_eq!(handle.mtu, Some(247));
        assert_eq!(handle.name.as_deref(), Some("Hello Fairy BLE900"));

        let mut events = transport.subscribe(&handle).await.unwrap();
        transport.write(&handle, &[0xAA, 0x00]).await.unwrap();
        transport.disconnect(&handle).await.unwrap();

        assert_eq!(transport.written(), vec![vec![0xAA, 0x00]]);
        assert_eq!(events.recv().await, Some(TransportEvent::Disconnected));
    }

    #[tokio::test]
    async fn test_dry_run_simulated_failures() {
        let transport = DryRunTransport::new("BMSL", None);
        let handle = transport.connect("11:22:33:44:55:66").await.unwrap();
        let mut events = transport.subscribe(&handle).await.unwrap();

        transport.fail_writes(1);
        assert!(transport.write(&handle, &[0x01]).await.is_err());
        assert!(transport.write(&handle, &[0x02]).await.is_ok());
        assert_eq!(transport.written(), vec![vec![0x02]]);
        assert_eq!(transport.max_concurrent_writes(), 1);

        assert!(transport.inject_notification(vec![0xAA]));
        assert_eq!(events.recv().await, Some(TransportEvent::Notification(vec![0xAA])));
    }

    #[tokio::test]
    async fn test_severed_writes_report_disconnect_silently() {
        let transport = DryRunTransport::new("Hello Fairy BLE256", None);
        let handle = transport.connect("AA:BB:CC:DD:EE:FF").await.unwrap();
        let mut events = transport.subscribe(&handle).await.unwrap();

        transport.sever_writes();
        assert_eq!(transport.write(&handle, &[0x01]).await, Err(TransportError::Disconnected));
        assert!(transport.written().is_empty());
        assert!(events.try_recv().is_err());
    }
}
