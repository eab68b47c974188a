//! Connection registry and message routing.
//!
//! The registry maps identity → device → [`Connection`]. Register and
//! unregister are serialized through a single coordinating task
//! ([`HubRunner`]); forward and broadcast read the registry directly under a
//! shared lock. Every send is a non-blocking enqueue, so the lock is never
//! held across socket I/O.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, Notify};
use uuid::Uuid;

use crate::connection::{Connection, Enqueue};
use crate::directory::DeviceDirectory;
use crate::protocol::{
    self, DeviceInfo, DeviceListPayload, DeviceOfflinePayload, DeviceOnlinePayload, MessageType,
    StreamEndPayload, StreamStartPayload,
};
use crate::telemetry::HubStats;

const COMMAND_QUEUE_CAPACITY: usize = 256;

type Registry = HashMap<Uuid, HashMap<Uuid, Arc<Connection>>>;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HubError {
    #[error("hub is shut down")]
    ShutDown,
}

enum Command {
    Register {
        conn: Arc<Connection>,
        done: oneshot::Sender<()>,
    },
    Unregister {
        conn: Arc<Connection>,
    },
}

pub struct Hub {
    registry: RwLock<Registry>,
    commands: mpsc::Sender<Command>,
    presence: Option<Arc<dyn DeviceDirectory>>,
    stats: Arc<HubStats>,
    stopping: AtomicBool,
    shutdown: Notify,
}

/// Owns the receiving side of the hub's command queue. Run it on its own task.
pub struct HubRunner {
    hub: Arc<Hub>,
    commands: mpsc::Receiver<Command>,
}

/// Non-owning handle held by connections and the upgrade handler.
#[derive(Clone)]
pub struct HubHandle {
    hub: Weak<Hub>,
    commands: mpsc::Sender<Command>,
}

impl Hub {
    pub fn new(presence: Option<Arc<dyn DeviceDirectory>>) -> (Arc<Self>, HubRunner) {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let hub = Arc::new(Self {
            registry: RwLock::new(HashMap::new()),
            commands: tx,
            presence,
            stats: Arc::new(HubStats::default()),
            stopping: AtomicBool::new(false),
            shutdown: Notify::new(),
        });
        let runner = HubRunner {
            hub: hub.clone(),
            commands: rx,
        };
        (hub, runner)
    }

    pub fn handle(self: &Arc<Self>) -> HubHandle {
        HubHandle {
            hub: Arc::downgrade(self),
            commands: self.commands.clone(),
        }
    }

    pub fn stats(&self) -> &Arc<HubStats> {
        &self.stats
    }

    /// Stops the coordinating loop. Live connections keep running until
    /// their own transport ends; later register calls fail.
    pub fn shutdown(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.shutdown.notify_one();
    }

    pub fn is_shut_down(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    fn read(&self) -> RwLockReadGuard<'_, Registry> {
        self.registry.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Registry> {
        self.registry.write().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn apply_register(&self, conn: Arc<Connection>) {
        let user_id = conn.user_id();
        let device_id = conn.device_id();
        let mut registry = self.write();
        let devices = registry.entry(user_id).or_default();

        if let Some(old) = devices.insert(device_id, conn.clone()) {
            old.close();
            self.stats.on_supersede();
            tracing::info!(
                user_id = %user_id,
                device_id = %device_id,
                old_conn = %old.conn_id(),
                new_conn = %conn.conn_id(),
                "superseded existing connection"
            );
        }
        conn.mark_registered();
        self.stats.on_register();

        tracing::info!(
            user_id = %user_id,
            device_id = %device_id,
            total_user_devices = devices.len(),
            "client registered"
        );

        let mut snapshot: Vec<DeviceInfo> = devices.values().map(|c| c.device().clone()).collect();
        snapshot.sort_by(|a, b| a.device_name.cmp(&b.device_name).then(a.id.cmp(&b.id)));
        match protocol::encode(MessageType::DeviceList, &DeviceListPayload { devices: snapshot }) {
            Ok(msg) => {
                self.deliver(&conn, msg);
            }
            Err(err) => tracing::error!(error = %err, "failed to encode device list"),
        }

        let online = DeviceOnlinePayload {
            device: conn.device().clone(),
        };
        Self::broadcast_locked(
            devices,
            Some(device_id),
            MessageType::DeviceOnline,
            &online,
            |c, msg| self.deliver(c, msg),
        );
        drop(registry);

        self.notify_presence(device_id, true);
    }

    /// Returns false when `conn` is no longer the registered instance for its
    /// key (already removed, or superseded by a newer connection).
    pub(crate) fn apply_unregister(&self, conn: &Arc<Connection>) -> bool {
        let user_id = conn.user_id();
        let device_id = conn.device_id();
        let mut registry = self.write();
        let Some(devices) = registry.get_mut(&user_id) else {
            return false;
        };
        match devices.get(&device_id) {
            Some(current) if Arc::ptr_eq(current, conn) => {}
            _ => return false,
        }
        devices.remove(&device_id);
        conn.close();
        self.stats.on_unregister();

        tracing::info!(user_id = %user_id, device_id = %device_id, "client unregistered");

        if devices.is_empty() {
            registry.remove(&user_id);
        } else {
            Self::broadcast_locked(
                devices,
                Some(device_id),
                MessageType::DeviceOffline,
                &DeviceOfflinePayload { device_id },
                |c, msg| self.deliver(c, msg),
            );
        }
        drop(registry);

        self.notify_presence(device_id, false);
        true
    }

    fn deliver(&self, conn: &Connection, msg: String) -> bool {
        match conn.send(msg) {
            Enqueue::Queued => true,
            Enqueue::Full => {
                self.stats.on_drop();
                false
            }
            Enqueue::Closed => false,
        }
    }

    fn broadcast_locked<T: Serialize>(
        devices: &HashMap<Uuid, Arc<Connection>>,
        exclude: Option<Uuid>,
        typ: MessageType,
        payload: &T,
        mut deliver: impl FnMut(&Connection, String) -> bool,
    ) -> usize {
        let msg = match protocol::encode(typ, payload) {
            Ok(msg) => msg,
            Err(err) => {
                tracing::error!(error = %err, msg_type = %typ, "failed to encode broadcast message");
                return 0;
            }
        };
        let mut delivered = 0;
        for (device_id, conn) in devices {
            if Some(*device_id) == exclude {
                continue;
            }
            if deliver(conn, msg.clone()) {
                delivered += 1;
            }
        }
        delivered
    }

    fn notify_presence(&self, device_id: Uuid, online: bool) {
        let Some(presence) = self.presence.clone() else {
            return;
        };
        let Ok(rt) = tokio::runtime::Handle::try_current() else {
            tracing::debug!(device_id = %device_id, "no runtime for presence update");
            return;
        };
        rt.spawn(async move {
            if let Err(err) = presence.set_online(device_id, online).await {
                tracing::warn!(
                    device_id = %device_id,
                    online,
                    error = %err,
                    "failed to update device online status"
                );
            }
        });
    }

    /// Point-to-point delivery. An unknown identity or device is a silent
    /// drop; the return value only reports whether the message was queued.
    pub fn forward<T: Serialize>(
        &self,
        user_id: Uuid,
        target_device: Uuid,
        typ: MessageType,
        payload: &T,
    ) -> bool {
        let registry = self.read();
        let Some(target) = registry
            .get(&user_id)
            .and_then(|devices| devices.get(&target_device))
        else {
            self.stats.on_forward_miss();
            tracing::warn!(
                user_id = %user_id,
                device_id = %target_device,
                msg_type = %typ,
                "target device not found"
            );
            return false;
        };
        let msg = match protocol::encode(typ, payload) {
            Ok(msg) => msg,
            Err(err) => {
                tracing::error!(error = %err, msg_type = %typ, "failed to encode forward message");
                return false;
            }
        };
        let queued = self.deliver(target, msg);
        if queued {
            self.stats.on_forward();
        }
        queued
    }

    /// Delivers to every device of `user_id` except `exclude`. Returns the
    /// number of connections the message was queued on.
    pub fn broadcast<T: Serialize>(
        &self,
        user_id: Uuid,
        exclude: Option<Uuid>,
        typ: MessageType,
        payload: &T,
    ) -> usize {
        let registry = self.read();
        let Some(devices) = registry.get(&user_id) else {
            return 0;
        };
        Self::broadcast_locked(devices, exclude, typ, payload, |c, msg| self.deliver(c, msg))
    }

    pub fn broadcast_stream_start(
        &self,
        user_id: Uuid,
        stream_id: Uuid,
        source_device_id: Uuid,
        stream_type: &str,
        quality: &str,
    ) -> usize {
        self.broadcast(
            user_id,
            None,
            MessageType::StreamStart,
            &StreamStartPayload {
                stream_id,
                source_device_id,
                stream_type: stream_type.to_string(),
                quality: quality.to_string(),
            },
        )
    }

    pub fn broadcast_stream_end(&self, user_id: Uuid, stream_id: Uuid) -> usize {
        self.broadcast(
            user_id,
            None,
            MessageType::StreamEnd,
            &StreamEndPayload { stream_id },
        )
    }

    pub fn online_devices(&self, user_id: Uuid) -> Vec<DeviceInfo> {
        let registry = self.read();
        let mut devices: Vec<DeviceInfo> = registry
            .get(&user_id)
            .map(|d| d.values().map(|c| c.device().clone()).collect())
            .unwrap_or_default();
        devices.sort_by(|a, b| a.device_name.cmp(&b.device_name).then(a.id.cmp(&b.id)));
        devices
    }

    pub fn is_device_online(&self, user_id: Uuid, device_id: Uuid) -> bool {
        self.read()
            .get(&user_id)
            .map(|d| d.contains_key(&device_id))
            .unwrap_or(false)
    }

    /// Empties the registry, closes every outbound queue and marks each
    /// device offline. Each write pump then sends a close frame and exits.
    /// Used on process shutdown, after which unregister commands go nowhere.
    pub fn close_all(&self) -> usize {
        let drained: Vec<Arc<Connection>> = self
            .write()
            .drain()
            .flat_map(|(_, devices)| devices.into_values())
            .collect();
        for conn in &drained {
            conn.close();
            self.notify_presence(conn.device_id(), false);
        }
        if !drained.is_empty() {
            tracing::info!(connections = drained.len(), "closed live connections");
        }
        drained.len()
    }

    pub fn has_identity(&self, user_id: Uuid) -> bool {
        self.read().contains_key(&user_id)
    }

    pub fn connection_count(&self) -> usize {
        self.read().values().map(HashMap::len).sum()
    }
}

impl HubRunner {
    /// Serializes register/unregister until [`Hub::shutdown`] is called or
    /// every command sender is gone.
    pub async fn run(mut self) {
        tracing::info!("websocket hub started");
        loop {
            if self.hub.is_shut_down() {
                break;
            }
            tokio::select! {
                biased;
                _ = self.hub.shutdown.notified() => break,
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Register { conn, done }) => {
                        self.hub.apply_register(conn);
                        let _ = done.send(());
                    }
                    Some(Command::Unregister { conn }) => {
                        self.hub.apply_unregister(&conn);
                    }
                    None => break,
                },
            }
        }
        tracing::info!("hub shutting down");
    }
}

impl HubHandle {
    /// Registers `conn` and waits until it is installed and its device list
    /// has been queued.
    pub async fn register(&self, conn: Arc<Connection>) -> Result<(), HubError> {
        if self.hub.upgrade().map_or(true, |hub| hub.is_shut_down()) {
            return Err(HubError::ShutDown);
        }
        let (done, installed) = oneshot::channel();
        self.commands
            .send(Command::Register { conn, done })
            .await
            .map_err(|_| HubError::ShutDown)?;
        installed.await.map_err(|_| HubError::ShutDown)
    }

    pub async fn unregister(&self, conn: Arc<Connection>) {
        if self.commands.send(Command::Unregister { conn }).await.is_err() {
            tracing::debug!("hub stopped before unregister");
        }
    }

    pub fn forward<T: Serialize>(
        &self,
        user_id: Uuid,
        target_device: Uuid,
        typ: MessageType,
        payload: &T,
    ) -> bool {
        match self.hub.upgrade() {
            Some(hub) => hub.forward(user_id, target_device, typ, payload),
            None => false,
        }
    }

    pub fn broadcast<T: Serialize>(
        &self,
        user_id: Uuid,
        exclude: Option<Uuid>,
        typ: MessageType,
        payload: &T,
    ) -> usize {
        match self.hub.upgrade() {
            Some(hub) => hub.broadcast(user_id, exclude, typ, payload),
            None => 0,
        }
    }
}
