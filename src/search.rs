//! # UDP Broadcast Search Engine
//!
//! Resolves channel names to server addresses over UDP broadcast/unicast,
//! per spec.md §4.2. One `SearchEngine` per `Context`; it owns the socket,
//! the per-channel retry schedule, and datagram coalescing, and reports
//! resolved servers back to the `Context` over an unbounded channel so the
//! two don't need a shared lock (mirrors the teacher's use of
//! `tokio::sync::mpsc` to forward accepted connections out of a spawned
//! accept loop in `ipc/tcp_socket.rs`).

use std::collections::HashMap;
use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;
use socket2::{Domain, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::codec::{padded_len, Command, Header};
use crate::config::Config;
use crate::error::Status;

/// Initial per-channel retry delay (spec.md §4.2).
const INITIAL_DELAY: Duration = Duration::from_millis(33);
/// Retry backoff cap (spec.md §4.2).
const MAX_DELAY: Duration = Duration::from_secs(30);
/// Largest datagram the engine will build, leaving headroom under typical
/// Ethernet MTU (spec.md §4.2).
const MAX_DATAGRAM: usize = 1400;
/// Client-side minor protocol revision advertised in VERSION/SEARCH frames.
const CLIENT_MINOR_VERSION: u16 = 13;
/// "Reply even on an exact match" search qos flag (`dataType` field of the
/// SEARCH frame), so every search always gets an answer rather than relying
/// on silence-means-no-match.
const SEARCH_DO_REPLY: u16 = 5;

/// A server resolved for a previously-unresolved channel.
#[derive(Debug, Clone, Copy)]
pub struct SearchResponse {
    pub cid: u32,
    pub server_addr: SocketAddr,
    pub minor_version: u16,
}

struct Target {
    name: String,
    next_attempt: Instant,
    delay: Duration,
}

/// UDP broadcast search engine: name -> server resolution with exponential
/// backoff and datagram coalescing.
pub struct SearchEngine {
    socket: Arc<UdpSocket>,
    addr_list: Vec<SocketAddr>,
    targets: Mutex<HashMap<u32, Target>>,
    responses: mpsc::UnboundedSender<SearchResponse>,
}

impl SearchEngine {
    /// Bind the search socket and spawn the receiver/scheduler background
    /// tasks. Resolved servers arrive on `responses`.
    pub fn start(
        config: &Config,
        responses: mpsc::UnboundedSender<SearchResponse>,
    ) -> Result<Arc<Self>, Status> {
        let socket = bind_broadcast_socket()
            .map_err(|e| Status::ConfigError(format!("failed to bind search socket: {e}")))?;
        let addr_list = if config.addr_list.is_empty() && config.auto_addr_list {
            vec![SocketAddr::new([255, 255, 255, 255].into(), config.server_port)]
        } else {
            config.addr_list.clone()
        };
        let engine = Arc::new(Self {
            socket: Arc::new(socket),
            addr_list,
            targets: Mutex::new(HashMap::new()),
            responses,
        });
        engine.clone().spawn_receiver();
        engine.clone().spawn_scheduler();
        Ok(engine)
    }

    /// Begin searching for `name`, identified by its client-id. Calling
    /// this again for a cid already being searched resets its schedule.
    pub fn register(&self, cid: u32, name: String) {
        self.targets.lock().insert(
            cid,
            Target {
                name,
                next_attempt: Instant::now() + jittered_delay(INITIAL_DELAY),
                delay: INITIAL_DELAY,
            },
        );
    }

    /// Stop searching for a channel (it connected, or was closed while
    /// still unresolved).
    pub fn unregister(&self, cid: u32) {
        self.targets.lock().remove(&cid);
    }

    pub fn pending_count(&self) -> usize {
        self.targets.lock().len()
    }

    fn spawn_receiver(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            loop {
                let (n, _from) = match self.socket.recv_from(&mut buf).await {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::warn!(error = %e, "search socket recv failed");
                        continue;
                    }
                };
                if let Some(resp) = parse_search_response(&buf[..n]) {
                    // Duplicate/unknown-cid responses are ignored (spec.md
                    // §4.2): if we're no longer searching for this cid the
                    // channel has already resolved.
                    if self.targets.lock().contains_key(&resp.cid) {
                        let _ = self.responses.send(resp);
                    }
                }
            }
        });
    }

    fn spawn_scheduler(self: Arc<Self>) {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(20)).await;
                self.fire_due_targets().await;
            }
        });
    }

    async fn fire_due_targets(&self) {
        let now = Instant::now();
        let due: Vec<(u32, String)> = {
            let mut targets = self.targets.lock();
            let mut due = Vec::new();
            for (cid, target) in targets.iter_mut() {
                if target.next_attempt <= now {
                    due.push((*cid, target.name.clone()));
                    let next_delay = (target.delay * 2).min(MAX_DELAY);
                    target.delay = next_delay;
                    target.next_attempt = now + jittered_delay(next_delay);
                }
            }
            due
        };
        if due.is_empty() {
            return;
        }
        for datagram in coalesce(&due) {
            for addr in &self.addr_list {
                let _ = self.socket.send_to(&datagram, *addr).await;
            }
        }
    }
}

/// Apply +/-20% jitter to a retry delay (spec.md §4.2).
fn jittered_delay(base: Duration) -> Duration {
    let jitter = rand::thread_rng().gen_range(-0.2..=0.2);
    let millis = (base.as_millis() as f64 * (1.0 + jitter)).max(0.0);
    Duration::from_millis(millis as u64)
}

/// Pack as many SEARCH requests as fit under `MAX_DATAGRAM`, one VERSION
/// frame per datagram followed by one SEARCH frame per channel (spec.md
/// §4.2: "Coalesces multiple pending channels into single datagrams").
fn coalesce(due: &[(u32, String)]) -> Vec<Vec<u8>> {
    let prefix = encode_version();
    let mut datagrams = Vec::new();
    let mut current = prefix.clone();
    for (cid, name) in due {
        let frame = encode_search(*cid, name);
        if current.len() + frame.len() > MAX_DATAGRAM && current.len() > prefix.len() {
            datagrams.push(std::mem::replace(&mut current, prefix.clone()));
        }
        current.extend_from_slice(&frame);
    }
    if current.len() > prefix.len() {
        datagrams.push(current);
    }
    datagrams
}

fn encode_version() -> Vec<u8> {
    let header = Header {
        command: Command::Version as u16,
        payload_size: 0,
        data_type: 0,
        data_count: 0,
        parameter1: 0,
        parameter2: CLIENT_MINOR_VERSION as u32,
    };
    let mut buf = Vec::new();
    header.encode(&mut buf).expect("encoding to a Vec cannot fail");
    buf
}

fn encode_search(cid: u32, name: &str) -> Vec<u8> {
    let mut payload = name.as_bytes().to_vec();
    payload.push(0);
    payload.resize(padded_len(payload.len()), 0);
    let header = Header {
        command: Command::Search as u16,
        payload_size: payload.len() as u32,
        data_type: SEARCH_DO_REPLY,
        data_count: CLIENT_MINOR_VERSION as u32,
        parameter1: cid,
        parameter2: cid,
    };
    let mut buf = Vec::new();
    header.encode(&mut buf).expect("encoding to a Vec cannot fail");
    buf.extend_from_slice(&payload);
    buf
}

/// Parse an inbound UDP datagram for a SEARCH_RESPONSE. A responding server
/// sends a VERSION frame (carrying its minor revision) followed by a SEARCH
/// reply frame whose `parameter2` echoes the client cid and whose TCP port
/// rides in `dataCount` rather than a dedicated header field, for backward
/// wire compatibility with very old servers.
fn parse_search_response(bytes: &[u8]) -> Option<SearchResponse> {
    let mut cur = Cursor::new(bytes);
    let mut minor_version = CLIENT_MINOR_VERSION;
    loop {
        let (mut header, extended) = Header::decode_standard(&mut cur).ok()?;
        if extended {
            Header::decode_extended_tail(&mut cur, &mut header).ok()?;
        }
        let payload_len = header.payload_size as usize;
        let start = cur.position() as usize;
        let end = start + payload_len;
        if end > bytes.len() {
            return None;
        }
        cur.set_position(end as u64);

        match Command::from_u16(header.command) {
            Some(Command::Version) => {
                minor_version = header.parameter2 as u16;
            }
            Some(Command::Search) => {
                let port = header.data_count as u16;
                let server_ip = std::net::Ipv4Addr::from(header.parameter1);
                return Some(SearchResponse {
                    cid: header.parameter2,
                    server_addr: SocketAddr::new(server_ip.into(), port),
                    minor_version,
                });
            }
            _ => {}
        }
        if end >= bytes.len() {
            return None;
        }
    }
}

fn bind_broadcast_socket() -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, None)?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    socket.bind(&SocketAddr::new([0, 0, 0, 0].into(), 0).into())?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coalesce_splits_datagrams_at_mtu() {
        let due: Vec<(u32, String)> = (0..500).map(|i| (i, format!("pv_{i}"))).collect();
        let datagrams = coalesce(&due);
        assert!(datagrams.len() > 1);
        for d in &datagrams {
            assert!(d.len() <= MAX_DATAGRAM + 64); // one frame may push slightly over
        }
    }

    #[test]
    fn search_response_round_trips_through_parser() {
        let mut datagram = encode_version();
        datagram.extend_from_slice(&encode_search(42, "adc01"));
        // Simulate a server reply: same frames, but the SEARCH frame now
        // carries the server's address/port instead of a blank request.
        let mut reply_header = Header {
            command: Command::Version as u16,
            payload_size: 0,
            data_type: 0,
            data_count: 0,
            parameter1: 0,
            parameter2: 13,
        };
        let mut reply = Vec::new();
        reply_header.encode(&mut reply).unwrap();
        reply_header = Header {
            command: Command::Search as u16,
            payload_size: 0,
            data_type: 0,
            data_count: 5064,
            parameter1: u32::from(std::net::Ipv4Addr::new(10, 0, 0, 5)),
            parameter2: 42,
        };
        reply_header.encode(&mut reply).unwrap();

        let parsed = parse_search_response(&reply).unwrap();
        assert_eq!(parsed.cid, 42);
        assert_eq!(parsed.minor_version, 13);
        assert_eq!(parsed.server_addr.port(), 5064);
    }

    #[test]
    fn jittered_delay_stays_within_twenty_percent() {
        for _ in 0..50 {
            let d = jittered_delay(Duration::from_millis(1000));
            assert!(d.as_millis() >= 800 && d.as_millis() <= 1200);
        }
    }
}
