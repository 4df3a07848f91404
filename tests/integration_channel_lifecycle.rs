//! End-to-end lifecycle tests against a minimal in-process mock IOC: a UDP
//! search responder plus a TCP connection handler that answers
//! CREATE_CHANNEL/READ_NOTIFY/WRITE_NOTIFY/EVENT_ADD/SERVER_DISCONN for a
//! small, fixed set of named channels. Exercises the scenarios spec.md §8
//! calls out end-to-end rather than unit-by-unit, including a server-side
//! disconnect racing a dead transport.

use std::collections::HashMap;
use std::io::Cursor;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

use epics_ca::codec::wire::{decode_payload, encode_payload};
use epics_ca::codec::{decode_dbr_type, Bundle, Command, Header, Metadata, Value, ValueKind};
use epics_ca::config::Config;
use epics_ca::context::Context;
use epics_ca::registry::ConnectionState;
use epics_ca::{AccessRights, Consumer};

struct PvSpec {
    native_type: u16,
    native_count: u32,
    initial: Bundle,
    /// If set, the mock sends SERVER_DISCONN right after the CREATE_CHANNEL
    /// reply and then drops the connection, so the same cid sees a
    /// SERVER_DISCONN frame immediately followed by the transport dying.
    server_disconn_after_connect: bool,
}

struct MockIoc {
    pvs: HashMap<String, PvSpec>,
    sid_gen: std::sync::atomic::AtomicU32,
}

struct ChannelState {
    sid: u32,
    spec_native_type: u16,
    spec_native_count: u32,
    value: Bundle,
    monitor_io_ids: Vec<u32>,
}

/// Bind a UDP search responder and TCP listener, and return the address to
/// feed into `EPICS_CA_ADDR_LIST`.
async fn start_mock_ioc(pvs: Vec<(&str, PvSpec)>) -> SocketAddr {
    let ioc = Arc::new(MockIoc {
        pvs: pvs.into_iter().map(|(n, s)| (n.to_string(), s)).collect(),
        sid_gen: std::sync::atomic::AtomicU32::new(1000),
    });

    let tcp = TcpListener::bind("127.0.0.1:0").await.expect("bind tcp");
    let tcp_port = tcp.local_addr().unwrap().port();
    let udp = UdpSocket::bind("127.0.0.1:0").await.expect("bind udp");
    let udp_addr = udp.local_addr().unwrap();

    let ioc_for_udp = ioc.clone();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        loop {
            let (n, from) = match udp.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(_) => break,
            };
            let mut reply = encode_version_reply();
            let mut any = false;
            for (cid, name) in parse_search_requests(&buf[..n]) {
                if ioc_for_udp.pvs.contains_key(&name) {
                    reply.extend_from_slice(&encode_search_reply(cid, tcp_port));
                    any = true;
                }
            }
            if any {
                let _ = udp.send_to(&reply, from).await;
            }
        }
    });

    tokio::spawn(async move {
        loop {
            let (stream, _) = match tcp.accept().await {
                Ok(v) => v,
                Err(_) => break,
            };
            tokio::spawn(handle_connection(stream, ioc.clone()));
        }
    });

    udp_addr
}

async fn handle_connection(stream: TcpStream, ioc: Arc<MockIoc>) {
    let (mut read_half, mut write_half) = stream.into_split();
    let mut channels: HashMap<u32, ChannelState> = HashMap::new();

    loop {
        let mut header_buf = [0u8; 16];
        if read_half.read_exact(&mut header_buf).await.is_err() {
            return;
        }
        let mut cur = Cursor::new(&header_buf[..]);
        let Ok((header, _extended)) = Header::decode_standard(&mut cur) else {
            return;
        };
        let mut payload = vec![0u8; header.payload_size as usize];
        if !payload.is_empty() && read_half.read_exact(&mut payload).await.is_err() {
            return;
        }

        let Some(command) = Command::from_u16(header.command) else {
            continue;
        };
        match command {
            Command::Version | Command::ClientName | Command::HostName | Command::Echo => {}
            Command::CreateChannel => {
                let cid = header.parameter2;
                let name = parse_c_string(&payload);
                let Some(spec) = ioc.pvs.get(&name) else {
                    let resp = header_only(Command::CreateChFail, 0, 0, cid, 0);
                    if write_half.write_all(&resp).await.is_err() {
                        return;
                    }
                    continue;
                };
                let sid = ioc.sid_gen.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                channels.insert(
                    cid,
                    ChannelState {
                        sid,
                        spec_native_type: spec.native_type,
                        spec_native_count: spec.native_count,
                        value: spec.initial.clone(),
                        monitor_io_ids: Vec::new(),
                    },
                );
                let resp = Header {
                    command: Command::CreateChannel as u16,
                    payload_size: 0,
                    data_type: spec.native_type,
                    data_count: spec.native_count,
                    parameter1: sid,
                    parameter2: cid,
                };
                if write_half.write_all(&encode(&resp)).await.is_err() {
                    return;
                }
                if spec.server_disconn_after_connect {
                    let disconn = header_only(Command::ServerDisconn, 0, 0, sid, 0);
                    let _ = write_half.write_all(&disconn).await;
                    return;
                }
            }
            Command::ReadNotify => {
                let io_id = header.parameter2;
                let Some((cid, _)) = channels.iter().find(|(_, s)| s.sid == header.parameter1) else {
                    continue;
                };
                let cid = *cid;
                let state = channels.get(&cid).unwrap();
                let Some((value_kind, meta_kind)) = decode_dbr_type(header.data_type) else {
                    continue;
                };
                let _ = value_kind;
                let bundle = Bundle {
                    meta: reshape_meta(&state.value.meta, meta_kind),
                    value: state.value.value.clone(),
                };
                let body = encode_payload(&bundle).expect("encode read response");
                let resp = Header {
                    command: Command::ReadNotify as u16,
                    payload_size: body.len() as u32,
                    data_type: header.data_type,
                    data_count: bundle.value.count() as u32,
                    parameter1: 0,
                    parameter2: io_id,
                };
                let mut buf = encode(&resp);
                buf.extend_from_slice(&body);
                if write_half.write_all(&buf).await.is_err() {
                    return;
                }
            }
            Command::WriteNotify => {
                let io_id = header.parameter2;
                let sid = header.parameter1;
                let Some((&cid, _)) = channels.iter().find(|(_, s)| s.sid == sid) else {
                    continue;
                };
                let Some((value_kind, _)) = decode_dbr_type(header.data_type) else {
                    continue;
                };
                let count = header.data_count as usize;
                let new_value = match decode_payload(value_kind, epics_ca::MetaKind::Plain, count, &payload) {
                    Ok(b) => b.value,
                    Err(_) => {
                        let resp = header_only(Command::WriteNotify, 0, 0, 1, io_id);
                        let _ = write_half.write_all(&resp).await;
                        continue;
                    }
                };
                let monitor_ids = {
                    let state = channels.get_mut(&cid).unwrap();
                    state.value.value = new_value.clone();
                    state.monitor_io_ids.clone()
                };
                let ack = header_only(Command::WriteNotify, 0, 0, 0, io_id);
                if write_half.write_all(&ack).await.is_err() {
                    return;
                }
                let state = channels.get(&cid).unwrap();
                for mon_io_id in monitor_ids {
                    let bundle = Bundle {
                        meta: Metadata::Plain,
                        value: new_value.clone(),
                    };
                    let body = encode_payload(&bundle).expect("encode event body");
                    let resp = Header {
                        command: Command::EventAdd as u16,
                        payload_size: body.len() as u32,
                        data_type: dbr_plain_code(state.spec_native_type),
                        data_count: new_value.count() as u32,
                        parameter1: 0,
                        parameter2: mon_io_id,
                    };
                    let mut buf = encode(&resp);
                    buf.extend_from_slice(&body);
                    if write_half.write_all(&buf).await.is_err() {
                        return;
                    }
                }
            }
            Command::EventAdd => {
                let sub_id = header.parameter2;
                let sid = header.parameter1;
                let Some((&cid, _)) = channels.iter().find(|(_, s)| s.sid == sid) else {
                    continue;
                };
                {
                    let state = channels.get_mut(&cid).unwrap();
                    state.monitor_io_ids.push(sub_id);
                }
                let state = channels.get(&cid).unwrap();
                let bundle = Bundle {
                    meta: Metadata::Plain,
                    value: state.value.value.clone(),
                };
                let body = encode_payload(&bundle).expect("encode initial event body");
                let resp = Header {
                    command: Command::EventAdd as u16,
                    payload_size: body.len() as u32,
                    data_type: header.data_type,
                    data_count: bundle.value.count() as u32,
                    parameter1: 0,
                    parameter2: sub_id,
                };
                let mut buf = encode(&resp);
                buf.extend_from_slice(&body);
                if write_half.write_all(&buf).await.is_err() {
                    return;
                }
            }
            Command::EventCancel => {
                let sub_id = header.parameter2;
                for state in channels.values_mut() {
                    state.monitor_io_ids.retain(|id| *id != sub_id);
                }
            }
            _ => {}
        }
    }
}

fn dbr_plain_code(native_type: u16) -> u16 {
    native_type
}

fn reshape_meta(current: &Metadata, requested: epics_ca::MetaKind) -> Metadata {
    if requested == current.kind() {
        current.clone()
    } else {
        current.clone()
    }
}

fn parse_c_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn encode(header: &Header) -> Vec<u8> {
    let mut buf = Vec::new();
    header.encode(&mut buf).expect("header encode cannot fail");
    buf
}

fn header_only(command: Command, data_type: u16, data_count: u32, p1: u32, p2: u32) -> Vec<u8> {
    encode(&Header {
        command: command as u16,
        payload_size: 0,
        data_type,
        data_count,
        parameter1: p1,
        parameter2: p2,
    })
}

fn parse_search_requests(bytes: &[u8]) -> Vec<(u32, String)> {
    let mut cur = Cursor::new(bytes);
    let mut requests = Vec::new();
    while (cur.position() as usize) < bytes.len() {
        let Ok((header, _extended)) = Header::decode_standard(&mut cur) else {
            break;
        };
        let start = cur.position() as usize;
        let end = start + header.payload_size as usize;
        if end > bytes.len() {
            break;
        }
        if header.command == Command::Search as u16 {
            requests.push((header.parameter2, parse_c_string(&bytes[start..end])));
        }
        cur.set_position(end as u64);
    }
    requests
}

fn encode_version_reply() -> Vec<u8> {
    header_only(Command::Version, 0, 0, 0, 13)
}

fn encode_search_reply(cid: u32, port: u16) -> Vec<u8> {
    header_only(Command::Search, 0, port as u32, u32::from(Ipv4Addr::new(127, 0, 0, 1)), cid)
}

fn test_config(addr: SocketAddr) -> Config {
    Config::builder()
        .auto_addr_list(false)
        .addr_list(vec![addr])
        .build()
}

#[tokio::test]
async fn non_existent_channel_times_out_and_stays_never_connected() {
    let _ = tracing_subscriber::fmt::try_init();
    let addr = start_mock_ioc(vec![]).await;
    let ctx = Context::new(test_config(addr)).expect("context");
    let channel = ctx.create_channel("no_such_channel_test", ValueKind::Double);

    let result = tokio::time::timeout(Duration::from_millis(250), channel.connect()).await;
    assert!(result.is_err(), "connect should not resolve for an unknown name");
    assert_eq!(channel.get_connection_state(), ConnectionState::NeverConnected);

    ctx.close().await;
}

#[tokio::test]
async fn basic_connect_reaches_connected_with_native_properties() {
    let _ = tracing_subscriber::fmt::try_init();
    let addr = start_mock_ioc(vec![(
        "adc01",
        PvSpec {
            native_type: 6, // DBR_DOUBLE
            native_count: 2,
            initial: Bundle {
                meta: Metadata::Plain,
                value: Value::Double(vec![0.0, 0.0]),
            },
            server_disconn_after_connect: false,
        },
    )])
    .await;
    let ctx = Context::new(test_config(addr)).expect("context");
    let channel = ctx.create_channel("adc01", ValueKind::Double);

    tokio::time::timeout(Duration::from_secs(2), channel.connect())
        .await
        .expect("connect should not time out")
        .expect("connect should succeed");

    assert_eq!(channel.get_connection_state(), ConnectionState::Connected);
    assert_eq!(channel.get_name(), "adc01");
    let props = channel.get_properties();
    assert_eq!(props.native_type_code, 6);
    assert_eq!(props.native_element_count, 2);
    assert_eq!(props.native_type, "double");

    ctx.close().await;
}

#[tokio::test]
async fn connection_listener_sees_exactly_one_connect_event_and_no_close_event() {
    let _ = tracing_subscriber::fmt::try_init();
    let addr = start_mock_ioc(vec![(
        "adc01",
        PvSpec {
            native_type: 6,
            native_count: 2,
            initial: Bundle {
                meta: Metadata::Plain,
                value: Value::Double(vec![0.0, 0.0]),
            },
            server_disconn_after_connect: false,
        },
    )])
    .await;
    let ctx = Context::new(test_config(addr)).expect("context");
    let channel = ctx.create_channel("adc01", ValueKind::Double);

    let l1_events = Arc::new(Mutex::new(Vec::new()));
    let l1_events_clone = l1_events.clone();
    channel.add_connection_listener(move |connected| l1_events_clone.lock().push(connected));

    let l2_events = Arc::new(Mutex::new(Vec::new()));
    let l2_events_clone = l2_events.clone();
    let l2 = channel.add_connection_listener(move |connected| l2_events_clone.lock().push(connected));
    l2.dispose();

    channel
        .connect()
        .await
        .expect("connect should succeed against the mock IOC");
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(*l1_events.lock(), vec![true]);
    assert!(l2_events.lock().is_empty());

    channel.close();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(*l1_events.lock(), vec![true], "explicit close must not emit connected=false");

    ctx.close().await;
}

#[tokio::test]
async fn server_disconn_immediately_followed_by_transport_death_fires_false_once() {
    let _ = tracing_subscriber::fmt::try_init();
    let addr = start_mock_ioc(vec![(
        "adc01",
        PvSpec {
            native_type: 6,
            native_count: 2,
            initial: Bundle {
                meta: Metadata::Plain,
                value: Value::Double(vec![0.0, 0.0]),
            },
            server_disconn_after_connect: true,
        },
    )])
    .await;
    let ctx = Context::new(test_config(addr)).expect("context");
    let channel = ctx.create_channel("adc01", ValueKind::Double);

    let events = Arc::new(Mutex::new(Vec::new()));
    let events_clone = events.clone();
    channel.add_connection_listener(move |connected| events_clone.lock().push(connected));

    channel
        .connect()
        .await
        .expect("connect should succeed before the mock sends SERVER_DISCONN");

    // The mock sends SERVER_DISCONN then drops the socket right after the
    // CREATE_CHANNEL reply, so both the explicit disconnect and the
    // resulting transport death race to mark this channel disconnected. The
    // mock keeps accepting, so the client may re-search and reconnect into
    // the same trap more than once in the window below; what must hold
    // regardless of how many cycles happen is that the two triggers never
    // both fire for a single disconnection (no duplicate-adjacent values).
    tokio::time::sleep(Duration::from_millis(300)).await;

    let seen = events.lock().clone();
    assert_eq!(seen.first(), Some(&true));
    assert!(
        seen.iter().any(|&c| !c),
        "connected=false must fire at least once, got {seen:?}"
    );
    let mut last = None;
    for &c in &seen {
        assert_ne!(Some(c), last, "no two adjacent events may carry the same value: {seen:?}");
        last = Some(c);
    }

    ctx.close().await;
}

struct RecordingConsumer {
    values: Arc<Mutex<Vec<Option<Bundle>>>>,
}

impl Consumer for RecordingConsumer {
    fn accept(&self, value: Option<Bundle>) {
        self.values.lock().push(value);
    }
}

#[tokio::test]
async fn monitor_observes_default_then_put_value() {
    let _ = tracing_subscriber::fmt::try_init();
    let addr = start_mock_ioc(vec![(
        "counter",
        PvSpec {
            native_type: 5, // DBR_LONG
            native_count: 1,
            initial: Bundle {
                meta: Metadata::Plain,
                value: Value::Int(vec![0]),
            },
            server_disconn_after_connect: false,
        },
    )])
    .await;
    let ctx = Context::new(test_config(addr)).expect("context");
    let channel = ctx.create_channel("counter", ValueKind::Int);
    channel.connect().await.expect("connect should succeed");
    assert_eq!(channel.get_access_rights(), AccessRights::NoAccess);

    let values = Arc::new(Mutex::new(Vec::new()));
    let consumer = Arc::new(RecordingConsumer {
        values: values.clone(),
    });
    let _monitor = channel
        .add_value_monitor(consumer, epics_ca::EventMask::VALUE)
        .expect("subscribing should succeed");

    tokio::time::sleep(Duration::from_millis(150)).await;
    channel
        .put(Value::Int(vec![99]))
        .await
        .expect("put should be acknowledged");
    tokio::time::sleep(Duration::from_millis(150)).await;

    let seen = values.lock().clone();
    assert_eq!(seen.first().and_then(|b| b.clone()).map(|b| b.value), Some(Value::Int(vec![0])));
    assert_eq!(seen.last().and_then(|b| b.clone()).map(|b| b.value), Some(Value::Int(vec![99])));

    ctx.close().await;
}
