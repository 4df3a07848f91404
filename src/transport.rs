//! # Per-Server TCP Transport
//!
//! One `Transport` per (server address, priority), shared by every channel
//! resolved to that pair (spec.md §4.3). A single writer task owns the
//! socket's write half so frames stay ordered; a single reader task owns
//! the read half and dispatches completed frames either to the `IoMux` (by
//! I/O-ID) or to a `TransportSink` (CREATE_CHANNEL replies, ACCESS_RIGHTS,
//! SERVER_DISCONN, transport death). This split mirrors the teacher's
//! `TcpSocketTransport` (`ipc/tcp_socket.rs`), which also separates a
//! connection-owning struct from a spawned per-connection read loop; the
//! difference is this transport is shared by many logical channels rather
//! than built fresh per benchmark run.

use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::codec::wire::{decode_payload, validate_payload_size};
use crate::codec::{decode_dbr_type, padded_len, Bundle, Command, Header};
use crate::error::Status;
use crate::iomux::{IoMux, RequestOutcome};

/// Idle-writer period after which an ECHO keep-alive is sent (spec.md
/// §4.3).
const ECHO_PERIOD: Duration = Duration::from_secs(15);
/// Silence period after which the transport is declared dead (spec.md
/// §4.3).
const DEAD_PERIOD: Duration = Duration::from_secs(30);
/// Client minor protocol revision sent on every fresh link (spec.md §4.1).
pub const CLIENT_MINOR_VERSION: u16 = 13;
/// Consecutive malformed frames within one second that force a transport
/// reset (spec.md §7).
const MAX_PROTOCOL_ERRORS_PER_SEC: u32 = 3;

/// Identifies a transport: one TCP link per (server address, priority)
/// pair, reused across every channel that resolves to it (spec.md §3, and
/// the `[SUPPLEMENT]` priority field in SPEC_FULL.md).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransportKey {
    pub addr: SocketAddr,
    pub priority: u8,
}

impl TransportKey {
    pub fn hash_u64(&self) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }
}

/// Callbacks a `Transport` makes into the channel registry for frames that
/// aren't I/O-ID request/response pairs.
pub trait TransportSink: Send + Sync {
    fn on_create_channel_ok(&self, cid: u32, server_id: u32, native_type: u16, native_count: u32);
    fn on_create_channel_fail(&self, cid: u32);
    fn on_access_rights(&self, sid: u32, rights: u32);
    fn on_server_disconn(&self, sid: u32);
    fn on_monitor_update(&self, io_id: u32, result: Result<Bundle, Status>);
    /// The transport died (keep-alive timeout or socket error). The sink
    /// must move every channel it hosted back to NEVER_CONNECTED and
    /// re-enter search (spec.md §4.3).
    fn on_transport_death(&self, key: TransportKey);
}

/// A single outbound frame, already encoded (header + padded payload).
pub type Frame = Vec<u8>;

/// Build a header-only frame (no payload), used for VERSION, ECHO,
/// EVENT_CANCEL, CLIENT_NAME/HOST_NAME and similar control messages.
pub fn control_frame(command: Command, data_type: u16, data_count: u32, p1: u32, p2: u32) -> Frame {
    let header = Header {
        command: command as u16,
        payload_size: 0,
        data_type,
        data_count,
        parameter1: p1,
        parameter2: p2,
    };
    let mut buf = Vec::new();
    header.encode(&mut buf).expect("encoding to a Vec cannot fail");
    buf
}

/// Build a frame carrying a NUL-terminated, 8-byte-padded string payload
/// (CREATE_CHANNEL's channel name, CLIENT_NAME, HOST_NAME).
pub fn string_frame(command: Command, data_type: u16, data_count: u32, p1: u32, p2: u32, s: &str) -> Frame {
    let mut payload = s.as_bytes().to_vec();
    payload.push(0);
    payload.resize(padded_len(payload.len()), 0);
    let header = Header {
        command: command as u16,
        payload_size: payload.len() as u32,
        data_type,
        data_count,
        parameter1: p1,
        parameter2: p2,
    };
    let mut buf = Vec::new();
    header.encode(&mut buf).expect("encoding to a Vec cannot fail");
    buf.extend_from_slice(&payload);
    buf
}

/// Build a frame carrying an encoded value/metadata bundle (WRITE,
/// WRITE_NOTIFY).
pub fn value_frame(command: Command, data_type: u16, count: u32, p1: u32, p2: u32, payload: &[u8]) -> Frame {
    let header = Header {
        command: command as u16,
        payload_size: payload.len() as u32,
        data_type,
        data_count: count,
        parameter1: p1,
        parameter2: p2,
    };
    let mut buf = Vec::new();
    header.encode(&mut buf).expect("encoding to a Vec cannot fail");
    buf.extend_from_slice(payload);
    buf
}

/// Per (server address, priority) TCP link. Shared by every channel hosted
/// there; reference-counted by the registry, not by this struct itself.
pub struct Transport {
    pub key: TransportKey,
    write_tx: mpsc::UnboundedSender<Frame>,
    minor_version: AtomicU16,
    channels: Mutex<HashSet<u32>>,
    last_write: Mutex<Instant>,
    last_peer_traffic: Mutex<Instant>,
    alive: AtomicBool,
    echo_outstanding: AtomicBool,
}

impl Transport {
    /// Connect to `key.addr` and start the writer/reader/keep-alive tasks.
    /// Sends VERSION, CLIENT_NAME, and HOST_NAME immediately, per spec.md
    /// §4.1 ("on each fresh TCP link send VERSION").
    pub async fn connect(
        key: TransportKey,
        io_mux: Arc<IoMux>,
        sink: Arc<dyn TransportSink>,
        max_array_bytes: usize,
    ) -> Result<Arc<Self>, Status> {
        let stream = TcpStream::connect(key.addr)
            .await
            .map_err(|e| Status::ProtocolError(format!("connect to {}: {e}", key.addr)))?;
        stream.set_nodelay(true).ok();
        let (read_half, write_half) = stream.into_split();

        let (write_tx, write_rx) = mpsc::unbounded_channel::<Frame>();
        let transport = Arc::new(Self {
            key,
            write_tx,
            minor_version: AtomicU16::new(CLIENT_MINOR_VERSION),
            channels: Mutex::new(HashSet::new()),
            last_write: Mutex::new(Instant::now()),
            last_peer_traffic: Mutex::new(Instant::now()),
            alive: AtomicBool::new(true),
            echo_outstanding: AtomicBool::new(false),
        });

        transport.clone().spawn_writer(write_half, write_rx);
        transport.clone().spawn_reader(read_half, io_mux.clone(), sink.clone(), max_array_bytes);
        transport.clone().spawn_keepalive(sink);

        transport.send(control_frame(Command::Version, 0, 0, 0, CLIENT_MINOR_VERSION as u32));
        transport.send(string_frame(Command::ClientName, 0, 0, 0, 0, &whoami_user()));
        transport.send(string_frame(Command::HostName, 0, 0, 0, 0, &whoami_host()));

        Ok(transport)
    }

    /// Enqueue a frame for the writer task. Never blocks the caller.
    pub fn send(&self, frame: Frame) {
        *self.last_write.lock() = Instant::now();
        let _ = self.write_tx.send(frame);
    }

    pub fn host(&self, cid: u32) {
        self.channels.lock().insert(cid);
    }

    pub fn unhost(&self, cid: u32) {
        self.channels.lock().remove(&cid);
    }

    pub fn hosted_count(&self) -> usize {
        self.channels.lock().len()
    }

    pub fn hosted_cids(&self) -> Vec<u32> {
        self.channels.lock().iter().copied().collect()
    }

    pub fn minor_version(&self) -> u16 {
        self.minor_version.load(Ordering::Relaxed)
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn mark_dead(&self, sink: &Arc<dyn TransportSink>) {
        if self.alive.swap(false, Ordering::SeqCst) {
            sink.on_transport_death(self.key);
        }
    }

    fn spawn_writer(
        self: Arc<Self>,
        mut write_half: tokio::net::tcp::OwnedWriteHalf,
        mut rx: mpsc::UnboundedReceiver<Frame>,
    ) {
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if write_half.write_all(&frame).await.is_err() {
                    self.alive.store(false, Ordering::SeqCst);
                    break;
                }
                let _ = write_half.flush().await;
            }
        });
    }

    fn spawn_reader(
        self: Arc<Self>,
        mut read_half: tokio::net::tcp::OwnedReadHalf,
        io_mux: Arc<IoMux>,
        sink: Arc<dyn TransportSink>,
        max_array_bytes: usize,
    ) {
        tokio::spawn(async move {
            let mut protocol_errors = 0u32;
            let mut error_window_start = Instant::now();
            loop {
                match read_frame(&mut read_half, max_array_bytes).await {
                    Ok(Some((header, payload))) => {
                        *self.last_peer_traffic.lock() = Instant::now();
                        self.dispatch(header, payload, &io_mux, &sink);
                    }
                    Ok(None) => {
                        tracing::debug!(addr = %self.key.addr, "transport closed by peer");
                        self.mark_dead(&sink);
                        break;
                    }
                    Err(e) => {
                        if error_window_start.elapsed() > Duration::from_secs(1) {
                            protocol_errors = 0;
                            error_window_start = Instant::now();
                        }
                        protocol_errors += 1;
                        tracing::warn!(addr = %self.key.addr, error = %e, "dropping malformed frame");
                        if protocol_errors > MAX_PROTOCOL_ERRORS_PER_SEC {
                            tracing::error!(addr = %self.key.addr, "too many protocol errors, resetting transport");
                            self.mark_dead(&sink);
                            break;
                        }
                    }
                }
            }
        });
    }

    fn spawn_keepalive(self: Arc<Self>, sink: Arc<dyn TransportSink>) {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(1)).await;
                if !self.alive.load(Ordering::SeqCst) {
                    break;
                }
                let since_traffic = self.last_peer_traffic.lock().elapsed();
                if since_traffic >= DEAD_PERIOD {
                    tracing::warn!(addr = %self.key.addr, "no peer traffic for 30s, declaring transport dead");
                    self.mark_dead(&sink);
                    break;
                }
                let since_write = self.last_write.lock().elapsed();
                if since_write >= ECHO_PERIOD {
                    if self.echo_outstanding.swap(true, Ordering::SeqCst) {
                        tracing::warn!(addr = %self.key.addr, "previous ECHO went unanswered, sending another");
                    }
                    self.send(control_frame(Command::Echo, 0, 0, 0, 0));
                }
            }
        });
    }

    fn dispatch(&self, header: Header, payload: Vec<u8>, io_mux: &Arc<IoMux>, sink: &Arc<dyn TransportSink>) {
        let Some(command) = Command::from_u16(header.command) else {
            tracing::warn!(command = header.command, "unknown command code, dropping frame");
            return;
        };
        match command {
            Command::Version => {
                self.minor_version.store(header.parameter2 as u16, Ordering::Relaxed);
            }
            Command::CreateChannel => {
                let cid = header.parameter2;
                let server_id = header.parameter1;
                let native_type = header.data_type;
                let native_count = header.data_count;
                sink.on_create_channel_ok(cid, server_id, native_type, native_count);
            }
            Command::CreateChFail => {
                sink.on_create_channel_fail(header.parameter1);
            }
            Command::AccessRights => {
                sink.on_access_rights(header.parameter1, header.parameter2);
            }
            Command::ServerDisconn => {
                sink.on_server_disconn(header.parameter1);
            }
            Command::Echo => {
                self.echo_outstanding.store(false, Ordering::SeqCst);
            }
            Command::WriteNotify => {
                let io_id = header.parameter2;
                let status = header.parameter1;
                let outcome = if status == 0 {
                    RequestOutcome::Ack(Status::Normal)
                } else {
                    RequestOutcome::Ack(Status::PutFail)
                };
                io_mux.complete(io_id, Ok(outcome));
            }
            Command::ReadNotify | Command::EventAdd => {
                let io_id = header.parameter2;
                let status = header.parameter1;
                if status != 0 {
                    io_mux.complete(io_id, Err(Status::GetFail));
                    if command == Command::EventAdd {
                        sink.on_monitor_update(io_id, Err(Status::GetFail));
                    }
                    return;
                }
                let Some((value_kind, meta_kind)) = decode_dbr_type(header.data_type) else {
                    tracing::warn!(data_type = header.data_type, "unknown DBR type code");
                    return;
                };
                let count = header.data_count as usize;
                if let Err(e) = validate_payload_size(value_kind, meta_kind, count, payload.len()) {
                    tracing::warn!(error = %e, "payload size validation failed");
                    return;
                }
                match decode_payload(value_kind, meta_kind, count, &payload) {
                    Ok(bundle) => {
                        if command == Command::EventAdd {
                            sink.on_monitor_update(io_id, Ok(bundle));
                        } else {
                            io_mux.complete(io_id, Ok(RequestOutcome::Value(bundle)));
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "failed to decode payload"),
                }
            }
            Command::EventCancel => {
                io_mux.complete(header.parameter2, Ok(RequestOutcome::Ack(Status::Normal)));
            }
            _ => {
                tracing::debug!(command = ?command, "unhandled inbound command");
            }
        }
    }
}

async fn read_frame(
    stream: &mut tokio::net::tcp::OwnedReadHalf,
    max_array_bytes: usize,
) -> std::io::Result<Option<(Header, Vec<u8>)>> {
    let mut header_buf = [0u8; 16];
    match stream.read_exact(&mut header_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let mut cur = Cursor::new(&header_buf[..]);
    let (mut header, extended) = Header::decode_standard(&mut cur)?;
    if extended {
        let mut tail = [0u8; 8];
        stream.read_exact(&mut tail).await?;
        let mut tail_cur = Cursor::new(&tail[..]);
        Header::decode_extended_tail(&mut tail_cur, &mut header)?;
    }
    let payload_len = header.payload_size as usize;
    if payload_len > max_array_bytes {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("payload of {payload_len} bytes exceeds max_array_bytes {max_array_bytes}"),
        ));
    }
    let mut payload = vec![0u8; payload_len];
    if payload_len > 0 {
        stream.read_exact(&mut payload).await?;
    }
    Ok(Some((header, payload)))
}

fn whoami_user() -> String {
    std::env::var("USER").unwrap_or_else(|_| "epics-ca".to_string())
}

fn whoami_host() -> String {
    hostname_fallback()
}

fn hostname_fallback() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}
