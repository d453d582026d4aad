//! # In-Memory Collaborators
//!
//! A process-local network and device store. Each attached engine gets its
//! own inbox, drained by one task so messages are handled in delivery order.
//! The network records every delivered message and can be told to drop or
//! rewrite messages in flight, which is how loss and tampering are simulated.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::engine::VerificationEngine;
use super::error::{StoreError, TransportError};
use super::hooks::{DeviceStore, Transport};
use super::message::{DeviceId, DeviceIdentity, UserId, VerificationMessage};

// ---------------------------------------------------------------------------
// Network
// ---------------------------------------------------------------------------

/// One message on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Sending user.
    pub from: UserId,
    /// Addressed user.
    pub to_user: UserId,
    /// Addressed device (never the wildcard; wildcard sends fan out).
    pub to_device: DeviceId,
    /// The message.
    pub message: VerificationMessage,
}

/// Decides the fate of a message in flight: return `false` to drop it, or
/// mutate it before delivery.
pub type Interceptor = Arc<dyn Fn(&mut Envelope) -> bool + Send + Sync>;

type DeviceKey = (UserId, DeviceId);

#[derive(Default)]
struct NetworkInner {
    inboxes: DashMap<DeviceKey, mpsc::UnboundedSender<Envelope>>,
    delivered: Mutex<Vec<Envelope>>,
    unreachable: RwLock<HashSet<DeviceKey>>,
    interceptor: RwLock<Option<Interceptor>>,
}

/// A lossless, ordered, in-process to-device network.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl MemoryNetwork {
    /// Create an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport that sends as `user_id`.
    pub fn transport(&self, user_id: impl Into<UserId>) -> Arc<MemoryTransport> {
        Arc::new(MemoryTransport {
            network: self.clone(),
            sender: user_id.into(),
        })
    }

    /// Open an inbox for a device and return its receiving end.
    pub fn register(
        &self,
        user_id: impl Into<UserId>,
        device_id: impl Into<DeviceId>,
    ) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.inboxes.insert((user_id.into(), device_id.into()), tx);
        rx
    }

    /// Route a device's inbox into `engine`, one message at a time.
    pub fn attach(&self, engine: VerificationEngine) -> JoinHandle<()> {
        let own = engine.own_device();
        let mut inbox = self.register(own.user_id.clone(), own.device_id.clone());
        tokio::spawn(async move {
            while let Some(envelope) = inbox.recv().await {
                if let Err(err) = engine.handle_message(&envelope.from, envelope.message).await {
                    debug!(
                        device = %envelope.to_device,
                        error = %err,
                        "verification message not handled"
                    );
                }
            }
        })
    }

    /// Make sends to a device fail with [`TransportError::Unreachable`].
    pub fn set_unreachable(&self, user_id: impl Into<UserId>, device_id: impl Into<DeviceId>, unreachable: bool) {
        let key = (user_id.into(), device_id.into());
        let mut set = self.inner.unreachable.write();
        if unreachable {
            set.insert(key);
        } else {
            set.remove(&key);
        }
    }

    /// Install (or clear) the in-flight interceptor.
    pub fn set_interceptor(&self, interceptor: Option<Interceptor>) {
        *self.inner.interceptor.write() = interceptor;
    }

    /// Every message delivered so far, in delivery order.
    pub fn delivered(&self) -> Vec<Envelope> {
        self.inner.delivered.lock().clone()
    }

    /// Delivered messages of one event type.
    pub fn delivered_of(&self, event_type: &str) -> Vec<Envelope> {
        self.inner
            .delivered
            .lock()
            .iter()
            .filter(|envelope| envelope.message.event_type() == event_type)
            .cloned()
            .collect()
    }

    fn deliver(
        &self,
        from: &UserId,
        user_id: &UserId,
        device_id: &DeviceId,
        message: &VerificationMessage,
    ) -> Result<(), TransportError> {
        let targets: Vec<DeviceKey> = if device_id.is_wildcard() {
            self.inner
                .inboxes
                .iter()
                .filter(|slot| slot.key().0 == *user_id)
                .map(|slot| slot.key().clone())
                .collect()
        } else {
            vec![(user_id.clone(), device_id.clone())]
        };

        let unreachable = || TransportError::Unreachable {
            user_id: user_id.to_string(),
            device_id: device_id.to_string(),
        };
        if targets.is_empty() {
            return Err(unreachable());
        }

        let interceptor = self.inner.interceptor.read().clone();
        for target in targets {
            if self.inner.unreachable.read().contains(&target) {
                return Err(unreachable());
            }
            let Some(inbox) = self.inner.inboxes.get(&target).map(|slot| slot.value().clone()) else {
                return Err(unreachable());
            };

            let mut envelope = Envelope {
                from: from.clone(),
                to_user: target.0,
                to_device: target.1,
                message: message.clone(),
            };
            if let Some(interceptor) = &interceptor {
                if !interceptor(&mut envelope) {
                    trace!(event = envelope.message.event_type(), "message dropped in flight");
                    continue;
                }
            }

            self.inner.delivered.lock().push(envelope.clone());
            inbox
                .send(envelope)
                .map_err(|_| TransportError::SendFailed("inbox closed".to_string()))?;
        }
        Ok(())
    }
}

/// [`Transport`] over a [`MemoryNetwork`], sending as one user.
pub struct MemoryTransport {
    network: MemoryNetwork,
    sender: UserId,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send_to_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        message: &VerificationMessage,
    ) -> Result<(), TransportError> {
        self.network.deliver(&self.sender, user_id, device_id, message)
    }
}

// ---------------------------------------------------------------------------
// Device Store
// ---------------------------------------------------------------------------

/// Known devices and the trust writes made to them.
#[derive(Default)]
pub struct MemoryDeviceStore {
    devices: DashMap<DeviceKey, DeviceIdentity>,
    trust_writes: Mutex<Vec<DeviceIdentity>>,
}

impl MemoryDeviceStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a device known.
    pub fn add_device(&self, device: DeviceIdentity) {
        self.devices
            .insert((device.user_id.clone(), device.device_id.clone()), device);
    }

    /// Whether the device was ever marked verified.
    pub fn is_verified(&self, user_id: &UserId, device_id: &DeviceId) -> bool {
        self.trust_writes
            .lock()
            .iter()
            .any(|d| d.user_id == *user_id && d.device_id == *device_id)
    }

    /// Number of `mark_verified` calls so far.
    pub fn trust_writes(&self) -> usize {
        self.trust_writes.lock().len()
    }
}

#[async_trait]
impl DeviceStore for MemoryDeviceStore {
    async fn get_device(&self, user_id: &UserId, device_id: &DeviceId) -> Option<DeviceIdentity> {
        self.devices
            .get(&(user_id.clone(), device_id.clone()))
            .map(|slot| slot.value().clone())
    }

    async fn mark_verified(&self, device: &DeviceIdentity) -> Result<(), StoreError> {
        if !self
            .devices
            .contains_key(&(device.user_id.clone(), device.device_id.clone()))
        {
            return Err(StoreError(format!(
                "device {}/{} is not known",
                device.user_id, device.device_id
            )));
        }
        self.trust_writes.lock().push(device.clone());
        Ok(())
    }
}
