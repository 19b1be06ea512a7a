//! BLE Connection Module
//!
//! Establishes the link and the notification subscription, retrying both.

use crate::domain::models::{ControllerEvent, MessageSeverity, StatusMessage};
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::transport::{
    DeviceHandle, SharedTransport, TransportError, TransportEvent,
};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Configuration for connection behavior
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Maximum connection attempts
    pub max_connect_attempts: u32,
    /// Delay between connection attempts in milliseconds
    pub connect_retry_delay_ms: u64,
    /// Maximum notification subscription attempts
    pub max_subscribe_attempts: u32,
    /// Service UUID to look for
    pub service_uuid: String,
    /// Write characteristic UUID
    pub write_char_uuid: String,
    /// Notify characteristic UUID
    pub notify_char_uuid: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_connect_attempts: 4,
            connect_retry_delay_ms: 1000,
            max_subscribe_attempts: 3,
            service_uuid: protocol::SERVICE_UUID.to_string(),
            write_char_uuid: protocol::WRITE_CHAR_UUID.to_string(),
            notify_char_uuid: protocol::NOTIFY_CHAR_UUID.to_string(),
        }
    }
}

/// Result of a successful connection
pub struct ConnectionResult {
    pub handle: DeviceHandle,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// BLE Connection handler
pub struct BleConnection {
    transport: SharedTransport,
    event_sender: mpsc::UnboundedSender<ControllerEvent>,
    config: ConnectionConfig,
}

impl BleConnection {
    /// Create a new connection handler
    pub fn new(
        transport: SharedTransport,
        event_sender: mpsc::UnboundedSender<ControllerEvent>,
        config: ConnectionConfig,
    ) -> Self {
        Self {
            transport,
            event_sender,
            config,
        }
    }

    /// Connect to a device by Bluetooth address and subscribe to notifications
    pub async fn connect(&self, address: &str) -> Result<ConnectionResult, TransportError> {
        info!(
            "Connecting to curtain light: {} (service {}, write {})",
            address, self.config.service_uuid, self.config.write_char_uuid
        );
        self.send_log("Connecting to device...", MessageSeverity::Info);

        // Step 1: Establish the link
        let handle = self.connect_device(address).await?;
        info!(
            "Device connected: {:?} (mtu {:?})",
            handle.name.as_deref().unwrap_or("<unnamed>"),
            handle.mtu
        );

        // Step 2: Enable notifications on the notify characteristic
        let events = match self.enable_notifications(&handle).await {
            Ok(events) => events,
            Err(e) => {
                let _ = self.transport.disconnect(&handle).await;
                return Err(e);
            }
        };

        self.send_log("Connection established!", MessageSeverity::Success);
        Ok(ConnectionResult { handle, events })
    }

    async fn connect_device(&self, address: &str) -> Result<DeviceHandle, TransportError> {
        let attempts = self.config.max_connect_attempts.max(1);
        let mut last_error = TransportError::ConnectFailed("no attempt made".into());

        for attempt in 1..=attempts {
            match self.transport.connect(address).await {
                Ok(handle) => return Ok(handle),
                Err(e) => {
                    warn!("Connection attempt {} of {} failed: {}", attempt, attempts, e);
                    last_error = e;
                    if attempt < attempts {
                        tokio::time::sleep(Duration::from_millis(self.config.connect_retry_delay_ms)).await;
                    }
                }
            }
        }

        error!("Failed to connect after {} attempts", attempts);
        self.send_log("Could not connect to device", MessageSeverity::Error);
        Err(last_error)
    }

    /// Enable notifications with retry logic
    async fn enable_notifications(
        &self,
        handle: &DeviceHandle,
    ) -> Result<mpsc::UnboundedReceiver<TransportEvent>, TransportError> {
        info!(
            "Enabling notifications on {} (CCCD {})",
            self.config.notify_char_uuid,
            protocol::CCCD_UUID
        );
        let attempts = self.config.max_subscribe_attempts.max(1);

        for attempt in 1..=attempts {
            match self.transport.subscribe(handle).await {
                Ok(events) => {
                    info!("Notifications enabled successfully");
                    return Ok(events);
                }
                Err(TransportError::Disconnected) => return Err(TransportError::Disconnected),
                Err(e) => {
                    warn!("Notification subscription attempt {} failed: {}", attempt, e);
                    if attempt < attempts {
                        tokio::time::sleep(Duration::from_millis(500)).await;
                    } else {
                        error!("Failed to enable notifications after {} attempts", attempt);
                        return Err(e);
                    }
                }
            }
        }

        Err(TransportError::SubscribeFailed("no attempt made".into()))
    }

    /// Send a log message
    fn send_log(&self, message: &str, severity: MessageSeverity) {
        let _ = self.event_sender.send(ControllerEvent::LogMessage(StatusMessage {
            message: message.to_string(),
            severity,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::transport::Transport;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Refuses a number of connects and subscriptions before giving in
    #[derive(Default)]
    struct Stubborn {
        connect_refusals: Mutex<u32>,
        subscribe_refusals: Mutex<u32>,
        disconnects: Mutex<u32>,
    }

    #[async_trait]
    impl Transport for Stubborn {
        async fn connect(&self, address: &str) -> Result<DeviceHandle, TransportError> {
            let mut left = self.connect_refusals.lock();
            if *left > 0 {
                *left -= 1;
                return Err(TransportError::ConnectFailed("out of range".into()));
            }
            Ok(DeviceHandle {
                address: address.to_string(),
                name: Some("Hello Fairy BLE256".into()),
                mtu: None,
            })
        }

        async fn write(&self, _handle: &DeviceHandle, _bytes: &[u8]) -> Result<(), TransportError> {
            Ok(())
        }

        async fn subscribe(
            &self,
            _handle: &DeviceHandle,
        ) -> Result<mpsc::UnboundedReceiver<TransportEvent>, TransportError> {
            let mut left = self.subscribe_refusals.lock();
            if *left > 0 {
                *left -= 1;
                return Err(TransportError::SubscribeFailed("CCCD write rejected".into()));
            }
            let (_tx, rx) = mpsc::unbounded_channel();
            Ok(rx)
        }

        async fn disconnect(&self, _handle: &DeviceHandle) -> Result<(), TransportError> {
            *self.disconnects.lock() += 1;
            Ok(())
        }
    }

    fn connection(
        transport: Arc<Stubborn>,
    ) -> (BleConnection, mpsc::UnboundedReceiver<ControllerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (BleConnection::new(transport, tx, ConnectionConfig::default()), rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_retries_until_success() {
        let transport = Arc::new(Stubborn::default());
        *transport.connect_refusals.lock() = 3;
        let (connection, _events) = connection(transport.clone());

        let result = connection.connect("AA:BB:CC:DD:EE:FF").await.unwrap();
        assert_eq!(result.handle.address, "AA:BB:CC:DD:EE:FF");
        assert_eq!(*transport.connect_refusals.lock(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_gives_up_after_max_attempts() {
        let transport = Arc::new(Stubborn::default());
        *transport.connect_refusals.lock() = 10;
        let (connection, mut events) = connection(transport.clone());

        let result = connection.connect("AA:BB:CC:DD:EE:FF").await;
        assert!(matches!(result, Err(TransportError::ConnectFailed(_))));
        assert_eq!(*transport.connect_refusals.lock(), 6);

        let mut saw_error = false;
        while let Ok(event) = events.try_recv() {
            if let ControllerEvent::LogMessage(msg) = event {
                saw_error |= msg.severity == MessageSeverity::Error;
            }
        }
        assert!(saw_error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_subscription_drops_the_link() {
        let transport = Arc::new(Stubborn::default());
        *transport.subscribe_refusals.lock() = 3;
        let (connection, _events) = connection(transport.clone());

        let result = connection.connect("AA:BB:CC:DD:EE:FF").await;
        assert!(matches!(result, Err(TransportError::SubscribeFailed(_))));
        assert_eq!(*transport.disconnects.lock(), 1);
    }
}
