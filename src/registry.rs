//! # Channel Registry and State Machine
//!
//! Owns every `Channel`, the per-(address,priority) `Transport` pool, and
//! the wiring between the two (spec.md §4.4, §9's "Cyclic references"
//! note: the registry owns both sides strongly; a `Channel` only ever
//! holds a `Weak` back-reference to the registry and a copy of the
//! `TransportKey` it currently resolves to, never a strong `Transport`
//! pointer). This mirrors the teacher's `TransportFactory` owning created
//! transports centrally (`ipc/mod.rs`) rather than transports owning each
//! other.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::codec::{dbr_type_code, Bundle, Command, MetaKind, Value, ValueKind};
use crate::config::Config;
use crate::error::{CaResult, Status};
use crate::iomux::{IoMux, RequestKind, RequestOutcome};
use crate::monitor::{Consumer, EventMask, Monitor, NotifierFactory};
use crate::search::{SearchEngine, SearchResponse};
use crate::transport::{
    control_frame, string_frame, value_frame, Transport, TransportKey, TransportSink,
    CLIENT_MINOR_VERSION,
};
use crate::utils::IdGenerator;

/// spec.md §3's `ConnectionState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    NeverConnected,
    Connected,
    Disconnected,
    Closed,
}

/// spec.md §3's `AccessRights`, decoded from the ACCESS_RIGHTS frame's
/// parameter2 bitmask (bit 0 = read, bit 1 = write).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessRights {
    NoAccess,
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl AccessRights {
    fn from_bits(bits: u32) -> Self {
        match (bits & 0x1 != 0, bits & 0x2 != 0) {
            (false, false) => AccessRights::NoAccess,
            (true, false) => AccessRights::ReadOnly,
            (false, true) => AccessRights::WriteOnly,
            (true, true) => AccessRights::ReadWrite,
        }
    }
}

/// The map spec.md §6 asks `getProperties()` to return.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelProperties {
    pub native_type_code: u16,
    pub native_element_count: u32,
    pub native_type: &'static str,
}

fn type_name(kind: ValueKind) -> &'static str {
    match kind {
        ValueKind::Byte => "byte",
        ValueKind::Short => "short",
        ValueKind::Int => "int",
        ValueKind::Float => "float",
        ValueKind::Double => "double",
        ValueKind::String => "string",
    }
}

/// Opaque disposer for a connection/access-rights listener registration.
/// Disposing is idempotent (spec.md §4.4).
#[derive(Clone)]
pub struct ListenerHandle {
    removed: Arc<AtomicBool>,
}

impl ListenerHandle {
    pub fn dispose(&self) {
        self.removed.store(true, Ordering::SeqCst);
    }
}

struct ListenerEntry<T> {
    removed: Arc<AtomicBool>,
    callback: Box<dyn Fn(T) + Send + Sync>,
}

/// Snapshot-on-iterate event bus for one event type on one channel (spec.md
/// §9: "a listener removing itself during dispatch does not disturb the
/// current round").
struct EventBus<T: Clone> {
    listeners: Mutex<Vec<ListenerEntry<T>>>,
}

impl<T: Clone> EventBus<T> {
    fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
        }
    }

    fn add(&self, callback: Box<dyn Fn(T) + Send + Sync>) -> ListenerHandle {
        let removed = Arc::new(AtomicBool::new(false));
        self.listeners.lock().push(ListenerEntry {
            removed: removed.clone(),
            callback,
        });
        ListenerHandle { removed }
    }

    /// Dispatches to every listener registered at the time `fire` was
    /// called. `Box<dyn Fn>` isn't cheaply cloneable, so rather than
    /// snapshotting callbacks themselves, the lock is only held long
    /// enough to copy each entry's removed-flag before calling through by
    /// index; a listener disposing itself mid-dispatch just gets skipped
    /// on its own turn rather than disturbing siblings already in this
    /// round. Registrations added during dispatch are not part of it
    /// (append-only Vec, indices stable).
    fn fire(&self, value: T) {
        let count = self.listeners.lock().len();
        for i in 0..count {
            let (removed, should_call) = {
                let guard = self.listeners.lock();
                match guard.get(i) {
                    Some(e) => (e.removed.clone(), !e.removed.load(Ordering::SeqCst)),
                    None => continue,
                }
            };
            if !should_call || removed.load(Ordering::SeqCst) {
                continue;
            }
            let guard = self.listeners.lock();
            if let Some(e) = guard.get(i) {
                if !e.removed.load(Ordering::SeqCst) {
                    (e.callback)(value.clone());
                }
            }
        }
    }
}

/// The application-visible channel handle (spec.md §3, §6's "Channel
/// facade operations").
pub struct Channel {
    cid: u32,
    name: String,
    value_kind: ValueKind,
    priority: u8,
    registry: Weak<ChannelRegistry>,
    state: Mutex<ConnectionState>,
    server_id: Mutex<Option<u32>>,
    native: Mutex<Option<(u16, u32)>>,
    access_rights: Mutex<AccessRights>,
    transport_key: Mutex<Option<TransportKey>>,
    conn_listeners: EventBus<bool>,
    access_listeners: EventBus<AccessRights>,
    connect_watchers: Mutex<Vec<oneshot::Sender<CaResult<()>>>>,
    monitors: Mutex<Vec<Arc<Monitor>>>,
}

impl Channel {
    pub fn cid(&self) -> u32 {
        self.cid
    }

    pub fn get_name(&self) -> &str {
        &self.name
    }

    pub fn get_connection_state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn get_access_rights(&self) -> AccessRights {
        *self.access_rights.lock()
    }

    /// Zero-valued outside CONNECTED, per spec.md §3's invariant.
    pub fn get_properties(&self) -> ChannelProperties {
        let native = *self.native.lock();
        let connected = *self.state.lock() == ConnectionState::Connected;
        let (code, count) = if connected {
            native.unwrap_or((0, 0))
        } else {
            (0, 0)
        };
        ChannelProperties {
            native_type_code: code,
            native_element_count: count,
            native_type: type_name(self.value_kind),
        }
    }

    /// Register a watcher and return its receiver immediately, resolved as
    /// soon as the channel reaches CONNECTED (or right away, if it already
    /// has). This is the non-blocking flavor; the search/transport
    /// background tasks are what actually complete it (spec.md §5).
    pub fn connect_async(&self) -> oneshot::Receiver<CaResult<()>> {
        let (tx, rx) = oneshot::channel();
        if *self.state.lock() == ConnectionState::Connected {
            let _ = tx.send(Ok(()));
        } else if *self.state.lock() == ConnectionState::Closed {
            let _ = tx.send(Err(Status::ChanDestroy));
        } else {
            self.connect_watchers.lock().push(tx);
        }
        rx
    }

    /// Blocks (awaits) until CONNECTED. No implicit timeout; apply one with
    /// `tokio::time::timeout` at the call site, per spec.md §4.2's
    /// "yields a timeout only if the caller applies one".
    pub async fn connect(&self) -> CaResult<()> {
        self.connect_async()
            .await
            .unwrap_or(Err(Status::ChanDestroy))
    }

    pub fn add_connection_listener<F>(&self, f: F) -> ListenerHandle
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.conn_listeners.add(Box::new(f))
    }

    pub fn add_access_right_listener<F>(&self, f: F) -> ListenerHandle
    where
        F: Fn(AccessRights) + Send + Sync + 'static,
    {
        self.access_listeners.add(Box::new(f))
    }

    fn registry(&self) -> CaResult<Arc<ChannelRegistry>> {
        self.registry.upgrade().ok_or(Status::ChanDestroy)
    }

    fn require_connected(&self) -> CaResult<(u32, TransportKey)> {
        if *self.state.lock() != ConnectionState::Connected {
            return Err(Status::Disconn);
        }
        let sid = (*self.server_id.lock()).ok_or(Status::Disconn)?;
        let key = (*self.transport_key.lock()).ok_or(Status::Disconn)?;
        Ok((sid, key))
    }

    pub async fn get_async(&self) -> CaResult<Bundle> {
        self.get_meta_async(MetaKind::Plain).await
    }

    pub async fn get(&self) -> CaResult<Bundle> {
        self.get_async().await
    }

    pub async fn get_meta_async(&self, meta: MetaKind) -> CaResult<Bundle> {
        let registry = self.registry()?;
        let (sid, key) = self.require_connected()?;
        let transport = registry.transport_for(key).ok_or(Status::Disconn)?;
        let (io_id, rx) = registry
            .io_mux
            .register(RequestKind::ReadNotify, self.cid, key.hash_u64());
        let count = (*self.native.lock()).map(|(_, c)| c).unwrap_or(1).max(1);
        let data_type = dbr_type_code(self.value_kind, meta);
        transport.send(value_frame(
            Command::ReadNotify,
            data_type,
            count,
            sid,
            io_id,
            &[],
        ));
        match rx.await {
            Ok(Ok(RequestOutcome::Value(bundle))) => Ok(bundle),
            Ok(Ok(_)) => Err(Status::ProtocolError("unexpected outcome for read".into())),
            Ok(Err(status)) => Err(status),
            Err(_) => Err(Status::Disconn),
        }
    }

    pub async fn get_meta(&self, meta: MetaKind) -> CaResult<Bundle> {
        self.get_meta_async(meta).await
    }

    pub async fn put_async(&self, value: Value) -> CaResult<()> {
        if value.kind() != self.value_kind {
            return Err(Status::UsageError(format!(
                "put value kind {:?} does not match channel kind {:?}",
                value.kind(),
                self.value_kind
            )));
        }
        let registry = self.registry()?;
        let (sid, key) = self.require_connected()?;
        let transport = registry.transport_for(key).ok_or(Status::Disconn)?;
        let (io_id, rx) = registry
            .io_mux
            .register(RequestKind::WriteNotify, self.cid, key.hash_u64());
        let bundle = Bundle {
            meta: crate::codec::Metadata::Plain,
            value: value.clone(),
        };
        let payload = crate::codec::wire::encode_payload(&bundle)
            .map_err(|e| Status::ProtocolError(e.to_string()))?;
        transport.send(value_frame(
            Command::WriteNotify,
            dbr_type_code(self.value_kind, MetaKind::Plain),
            value.count() as u32,
            sid,
            io_id,
            &payload,
        ));
        match rx.await {
            Ok(Ok(RequestOutcome::Ack(status))) if status.is_normal() => Ok(()),
            Ok(Ok(RequestOutcome::Ack(status))) => Err(status),
            Ok(Ok(_)) => Err(Status::ProtocolError("unexpected outcome for write".into())),
            Ok(Err(status)) => Err(status),
            Err(_) => Err(Status::Disconn),
        }
    }

    pub async fn put(&self, value: Value) -> CaResult<()> {
        self.put_async(value).await
    }

    /// Fire-and-forget write: bypasses the I/O mux entirely, per spec.md
    /// §4.5 ("no completion tracking").
    pub fn put_no_wait(&self, value: Value) -> CaResult<()> {
        if value.kind() != self.value_kind {
            return Err(Status::UsageError(format!(
                "put value kind {:?} does not match channel kind {:?}",
                value.kind(),
                self.value_kind
            )));
        }
        let registry = self.registry()?;
        let (sid, key) = self.require_connected()?;
        let transport = registry.transport_for(key).ok_or(Status::Disconn)?;
        let bundle = Bundle {
            meta: crate::codec::Metadata::Plain,
            value: value.clone(),
        };
        let payload = crate::codec::wire::encode_payload(&bundle)
            .map_err(|e| Status::ProtocolError(e.to_string()))?;
        transport.send(value_frame(
            Command::Write,
            dbr_type_code(self.value_kind, MetaKind::Plain),
            value.count() as u32,
            sid,
            0,
            &payload,
        ));
        Ok(())
    }

    /// Subscribe for value updates. Non-zero `mask` required (spec.md §3).
    pub fn add_value_monitor(
        &self,
        consumer: Arc<dyn Consumer>,
        mask: EventMask,
    ) -> CaResult<Arc<Monitor>> {
        let registry = self.registry()?;
        let sub_id = registry.sub_ids.next();
        let service = registry.notifier.create(consumer);
        let monitor = Arc::new(Monitor::new(
            sub_id,
            self.cid,
            mask,
            MetaKind::Plain,
            service,
        )?);
        self.monitors.lock().push(monitor.clone());
        registry
            .monitor_index
            .lock()
            .insert(sub_id, (self.cid, monitor.clone()));
        if let Ok((sid, key)) = self.require_connected() {
            if let Some(transport) = registry.transport_for(key) {
                let count = (*self.native.lock()).map(|(_, c)| c).unwrap_or(1).max(1);
                transport.send(value_frame(
                    Command::EventAdd,
                    dbr_type_code(self.value_kind, MetaKind::Plain),
                    count,
                    sid,
                    sub_id,
                    &[],
                ));
            }
        }
        Ok(monitor)
    }

    /// Idempotent; does not decrement the Context-wide notification
    /// service count (spec.md §4.6).
    pub fn close_monitor(&self, monitor: &Arc<Monitor>) {
        if monitor.is_closed() {
            return;
        }
        monitor.close();
        if let Ok(registry) = self.registry() {
            registry.monitor_index.lock().remove(&monitor.id);
            if let Ok((sid, key)) = self.require_connected() {
                if let Some(transport) = registry.transport_for(key) {
                    transport.send(control_frame(Command::EventCancel, 0, 0, sid, monitor.id));
                }
            }
        }
        self.monitors.lock().retain(|m| m.id != monitor.id);
    }

    /// Explicit close: does NOT emit `connected=false` (spec.md §4.4).
    pub fn close(&self) {
        let mut state = self.state.lock();
        if *state == ConnectionState::Closed {
            return;
        }
        *state = ConnectionState::Closed;
        drop(state);

        if let Ok(registry) = self.registry() {
            registry.io_mux.cancel_channel(self.cid, Status::ChanDestroy);
            registry.search.unregister(self.cid);
            if let Some(key) = *self.transport_key.lock() {
                if let Some(transport) = registry.transport_for(key) {
                    transport.unhost(self.cid);
                    registry.maybe_schedule_cooldown(key);
                }
            }
            if let Some(sid) = *self.server_id.lock() {
                registry.sid_to_cid.lock().remove(&sid);
            }
            registry.channels.lock().remove(&self.cid);
        }
        for monitor in self.monitors.lock().drain(..) {
            monitor.close();
        }
        *self.conn_listeners.listeners.lock() = Vec::new();
        *self.access_listeners.listeners.lock() = Vec::new();
        for watcher in self.connect_watchers.lock().drain(..) {
            let _ = watcher.send(Err(Status::ChanDestroy));
        }
    }
}

/// Owns every `Channel` and `Transport`, and serves as the `TransportSink`
/// every `Transport` calls back into (spec.md §4.4).
pub struct ChannelRegistry {
    config: Config,
    io_mux: Arc<IoMux>,
    search: Arc<SearchEngine>,
    notifier: Arc<NotifierFactory>,
    cid_gen: IdGenerator,
    /// Independent from `io_mux`'s internal counter: subscription ids are
    /// recurring (EVENT_ADD responses arrive repeatedly under the same
    /// id), so they can't share the mux's single-completion table.
    sub_ids: IdGenerator,
    channels: Mutex<HashMap<u32, Arc<Channel>>>,
    sid_to_cid: Mutex<HashMap<u32, u32>>,
    transports: Mutex<HashMap<TransportKey, Arc<Transport>>>,
    monitor_index: Mutex<HashMap<u32, (u32, Arc<Monitor>)>>,
}

impl ChannelRegistry {
    pub fn new(
        config: Config,
        io_mux: Arc<IoMux>,
        search: Arc<SearchEngine>,
        notifier: Arc<NotifierFactory>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            io_mux,
            search,
            notifier,
            cid_gen: IdGenerator::new(),
            sub_ids: IdGenerator::new(),
            channels: Mutex::new(HashMap::new()),
            sid_to_cid: Mutex::new(HashMap::new()),
            transports: Mutex::new(HashMap::new()),
            monitor_index: Mutex::new(HashMap::new()),
        })
    }

    /// Consume resolved search responses, forwarding to `on_search_response`.
    /// Spawned once by `Context` alongside the `SearchEngine`.
    pub fn spawn_search_consumer(
        self: &Arc<Self>,
        mut responses: mpsc::UnboundedReceiver<SearchResponse>,
    ) {
        let registry = self.clone();
        tokio::spawn(async move {
            while let Some(resp) = responses.recv().await {
                registry.clone().on_search_response(resp).await;
            }
        });
    }

    pub fn create_channel(self: &Arc<Self>, name: impl Into<String>, kind: ValueKind) -> Arc<Channel> {
        self.create_channel_priority(name, kind, 0)
    }

    pub fn create_channel_priority(
        self: &Arc<Self>,
        name: impl Into<String>,
        kind: ValueKind,
        priority: u8,
    ) -> Arc<Channel> {
        let name = name.into();
        let cid = self.cid_gen.next();
        let channel = Arc::new(Channel {
            cid,
            name: name.clone(),
            value_kind: kind,
            priority,
            registry: Arc::downgrade(self),
            state: Mutex::new(ConnectionState::NeverConnected),
            server_id: Mutex::new(None),
            native: Mutex::new(None),
            access_rights: Mutex::new(AccessRights::NoAccess),
            transport_key: Mutex::new(None),
            conn_listeners: EventBus::new(),
            access_listeners: EventBus::new(),
            connect_watchers: Mutex::new(Vec::new()),
            monitors: Mutex::new(Vec::new()),
        });
        self.channels.lock().insert(cid, channel.clone());
        self.search.register(cid, name);
        channel
    }

    fn transport_for(&self, key: TransportKey) -> Option<Arc<Transport>> {
        self.transports.lock().get(&key).cloned()
    }

    async fn on_search_response(self: Arc<Self>, resp: SearchResponse) {
        let channel = match self.channels.lock().get(&resp.cid).cloned() {
            Some(c) => c,
            None => return,
        };
        {
            let state = channel.state.lock();
            if *state != ConnectionState::NeverConnected && *state != ConnectionState::Disconnected
            {
                return;
            }
        }
        self.search.unregister(resp.cid);
        let key = TransportKey {
            addr: resp.server_addr,
            priority: channel.priority,
        };
        let transport = match self.transport_for(key) {
            Some(t) => t,
            None => match Transport::connect(key, self.io_mux.clone(), self.clone(), self.config.max_array_bytes)
                .await
            {
                Ok(t) => {
                    self.transports.lock().insert(key, t.clone());
                    t
                }
                Err(e) => {
                    tracing::warn!(addr = %key.addr, error = %e, "failed to connect transport, re-entering search");
                    self.search.register(resp.cid, channel.name.clone());
                    return;
                }
            },
        };
        transport.host(resp.cid);
        *channel.transport_key.lock() = Some(key);
        transport.send(string_frame(
            Command::CreateChannel,
            0,
            CLIENT_MINOR_VERSION as u32,
            resp.cid,
            resp.cid,
            &channel.name,
        ));
    }

    fn maybe_schedule_cooldown(self: &Arc<Self>, key: TransportKey) {
        let Some(transport) = self.transport_for(key) else {
            return;
        };
        if transport.hosted_count() > 0 {
            return;
        }
        let registry = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            if let Some(t) = registry.transport_for(key) {
                if t.hosted_count() == 0 {
                    registry.transports.lock().remove(&key);
                }
            }
        });
    }

    fn transition_to_disconnected(&self, cid: u32, status: Status) {
        let channel = match self.channels.lock().get(&cid).cloned() {
            Some(c) => c,
            None => return,
        };
        {
            let mut state = channel.state.lock();
            if *state == ConnectionState::Disconnected || *state == ConnectionState::Closed {
                return;
            }
            *state = ConnectionState::Disconnected;
        }
        self.io_mux.cancel_channel(cid, status);
        for watcher in channel.connect_watchers.lock().drain(..) {
            let _ = watcher.send(Err(Status::Disconn));
        }
        channel.conn_listeners.fire(false);
        for monitor in channel.monitors.lock().iter() {
            monitor.deliver(None);
        }
        if let Some(sid) = channel.server_id.lock().take() {
            self.sid_to_cid.lock().remove(&sid);
        }
        if let Some(key) = channel.transport_key.lock().take() {
            if let Some(transport) = self.transport_for(key) {
                transport.unhost(cid);
            }
        }
        self.search.register(cid, channel.name.clone());
    }

    pub fn close(&self) {
        let channels: Vec<Arc<Channel>> = self.channels.lock().values().cloned().collect();
        for channel in channels {
            channel.close();
        }
        self.transports.lock().clear();
        self.notifier.close();
    }
}

impl TransportSink for ChannelRegistry {
    fn on_create_channel_ok(&self, cid: u32, server_id: u32, native_type: u16, native_count: u32) {
        let channel = match self.channels.lock().get(&cid).cloned() {
            Some(c) => c,
            None => return,
        };
        {
            let mut state = channel.state.lock();
            if *state == ConnectionState::Closed {
                return;
            }
            *state = ConnectionState::Connected;
        }
        *channel.server_id.lock() = Some(server_id);
        *channel.native.lock() = Some((native_type, native_count.max(1)));
        self.sid_to_cid.lock().insert(server_id, cid);

        for watcher in channel.connect_watchers.lock().drain(..) {
            let _ = watcher.send(Ok(()));
        }
        channel.conn_listeners.fire(true);
        channel.access_listeners.fire(*channel.access_rights.lock());

        if let Some(key) = *channel.transport_key.lock() {
            if let Some(transport) = self.transport_for(key) {
                for monitor in channel.monitors.lock().iter() {
                    if monitor.is_closed() {
                        continue;
                    }
                    transport.send(value_frame(
                        Command::EventAdd,
                        dbr_type_code(channel.value_kind, MetaKind::Plain),
                        native_count.max(1),
                        server_id,
                        monitor.id,
                        &[],
                    ));
                }
            }
        }
    }

    fn on_create_channel_fail(&self, cid: u32) {
        tracing::warn!(cid, "CREATE_CHANNEL failed, re-entering search");
        let channel = match self.channels.lock().get(&cid).cloned() {
            Some(c) => c,
            None => return,
        };
        if let Some(key) = channel.transport_key.lock().take() {
            if let Some(transport) = self.transport_for(key) {
                transport.unhost(cid);
            }
        }
        self.search.register(cid, channel.name.clone());
    }

    fn on_access_rights(&self, sid: u32, rights: u32) {
        let Some(cid) = self.sid_to_cid.lock().get(&sid).copied() else {
            return;
        };
        let channel = match self.channels.lock().get(&cid).cloned() {
            Some(c) => c,
            None => return,
        };
        let rights = AccessRights::from_bits(rights);
        *channel.access_rights.lock() = rights;
        channel.access_listeners.fire(rights);
    }

    fn on_server_disconn(&self, sid: u32) {
        let Some(cid) = self.sid_to_cid.lock().get(&sid).copied() else {
            return;
        };
        self.transition_to_disconnected(cid, Status::Disconn);
    }

    fn on_monitor_update(&self, io_id: u32, result: CaResult<Bundle>) {
        let Some((_, monitor)) = self.monitor_index.lock().get(&io_id).cloned() else {
            tracing::warn!(io_id, "EVENT_ADD update for unknown subscription");
            return;
        };
        match result {
            Ok(bundle) => {
                monitor.deliver(Some(bundle));
            }
            Err(e) => {
                tracing::warn!(io_id, error = %e, "monitor update carried a failure status");
            }
        }
    }

    fn on_transport_death(&self, key: TransportKey) {
        let Some(transport) = self.transports.lock().remove(&key) else {
            return;
        };
        self.io_mux.cancel_transport(key.hash_u64(), Status::Disconn);
        for cid in transport.hosted_cids() {
            self.transition_to_disconnected(cid, Status::Disconn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_rights_decode_bits() {
        assert_eq!(AccessRights::from_bits(0), AccessRights::NoAccess);
        assert_eq!(AccessRights::from_bits(1), AccessRights::ReadOnly);
        assert_eq!(AccessRights::from_bits(2), AccessRights::WriteOnly);
        assert_eq!(AccessRights::from_bits(3), AccessRights::ReadWrite);
    }

    #[test]
    fn properties_are_zero_outside_connected() {
        let registry = ChannelRegistry::new(
            Config::default(),
            Arc::new(IoMux::new()),
            test_search_engine(),
            Arc::new(NotifierFactory::new(crate::monitor::NotifierSpec::default())),
        );
        let channel = registry.create_channel("adc01", ValueKind::Double);
        let props = channel.get_properties();
        assert_eq!(props.native_type_code, 0);
        assert_eq!(props.native_element_count, 0);
        assert_eq!(props.native_type, "double");
    }

    #[test]
    fn closing_channel_marks_closed_and_is_idempotent() {
        let registry = ChannelRegistry::new(
            Config::default(),
            Arc::new(IoMux::new()),
            test_search_engine(),
            Arc::new(NotifierFactory::new(crate::monitor::NotifierSpec::default())),
        );
        let channel = registry.create_channel("adc01", ValueKind::Double);
        channel.close();
        channel.close();
        assert_eq!(channel.get_connection_state(), ConnectionState::Closed);
    }

    fn test_search_engine() -> Arc<SearchEngine> {
        let (tx, _rx) = mpsc::unbounded_channel();
        SearchEngine::start(&Config::default(), tx).expect("bind search socket")
    }
}
