//! Outbound device commands.
//!
//! The dispatcher hands every command to a [`CommandChannel`] after the
//! registry has been updated. Delivery is fire-and-forget: there is no
//! acknowledgement from the device, and a send failure never undoes the
//! registry write.

use async_trait::async_trait;
use rumqttc::{AsyncClient, QoS};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::device::DeviceId;

pub type SharedChannel = Arc<dyn CommandChannel>;

/// Wire shape of a command, published as JSON to `cmd/<deviceId>`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceCommand {
    pub device_id: DeviceId,
    pub command: String,
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CommandSendError {
    #[error("send timed out after {0:?}")]
    Timeout(Duration),
    #[error("transport error: {0}")]
    Transport(String),
}

#[async_trait]
pub trait CommandChannel: Send + Sync + 'static {
    async fn send(&self, command: &DeviceCommand) -> Result<(), CommandSendError>;
}

pub fn command_topic(id: &DeviceId) -> String {
    format!("cmd/{id}")
}

// ---------------------------------------------------------------------------
// MQTT
// ---------------------------------------------------------------------------

pub struct MqttCommandChannel {
    client: AsyncClient,
    timeout: Duration,
}

impl MqttCommandChannel {
    pub fn new(client: AsyncClient, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

#[async_trait]
impl CommandChannel for MqttCommandChannel {
    async fn send(&self, command: &DeviceCommand) -> Result<(), CommandSendError> {
        let payload = serde_json::to_vec(command)
            .map_err(|e| CommandSendError::Transport(e.to_string()))?;

        let publish = self.client.publish(
            command_topic(&command.device_id),
            QoS::AtLeastOnce,
            false,
            payload,
        );

        match tokio::time::timeout(self.timeout, publish).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(CommandSendError::Transport(e.to_string())),
            Err(_) => Err(CommandSendError::Timeout(self.timeout)),
        }
    }
}

// ---------------------------------------------------------------------------
// Simulated
// ---------------------------------------------------------------------------

/// Logs each command and reports success. Used when no broker is wanted.
pub struct SimulatedCommandChannel;

#[async_trait]
impl CommandChannel for SimulatedCommandChannel {
    async fn send(&self, command: &DeviceCommand) -> Result<(), CommandSendError> {
        info!(
            device = %command.device_id,
            command = %command.command,
            params = %command.params,
            "simulated command sent"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Test double
// ---------------------------------------------------------------------------

/// Records every command; fails each send while `fail` is set.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingChannel {
    pub(crate) sent: std::sync::Mutex<Vec<DeviceCommand>>,
    pub(crate) fail: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
impl RecordingChannel {
    pub(crate) fn failing() -> Self {
        let channel = Self::default();
        channel
            .fail
            .store(true, std::sync::atomic::Ordering::SeqCst);
        channel
    }

    pub(crate) fn sent(&self) -> Vec<DeviceCommand> {
        self.sent.lock().unwrap().clone()
    }
}

#[cfg(test)]
#[async_trait]
impl CommandChannel for RecordingChannel {
    async fn send(&self, command: &DeviceCommand) -> Result<(), CommandSendError> {
        self.sent.lock().unwrap().push(command.clone());
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(CommandSendError::Transport("broker unreachable".into()));
        }
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
