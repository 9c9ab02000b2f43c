//! Loopback integration tests
//!
//! Every test runs a real server and client on 127.0.0.1 with an
//! OS-assigned port.
//!
//! Usage:
//!   cargo test --test loopback_test -- --nocapture

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use courier::core::{Outcome, Promise};
use courier::{
    ChannelOption, ChannelOptions, ClientConfig, Error, FrameCodec, JsonSerializer,
    MsgPackSerializer, Request, Response, RpcClient, RpcServer, Serializer, ServerConfig,
};

const TIMEOUT: Duration = Duration::from_millis(500);

fn start_server<S, F>(serializer: S, configure: F) -> (RpcServer<S>, SocketAddr)
where
    S: Serializer,
    F: FnOnce(&mut RpcServer<S>),
{
    let mut server = RpcServer::new(
        ServerConfig::new("test-server", "127.0.0.1:0".parse().unwrap()),
        serializer,
    );
    server.set_io_threads(2).unwrap();
    server.set_dispatch_threads(4).unwrap();
    configure(&mut server);

    let addr = match server.startup().unwrap().get(Duration::from_secs(2)) {
        Outcome::Ready(addr) => addr,
        other => panic!("server not ready: {:?}", other),
    };
    (server, addr)
}

fn start_client<S: Serializer>(serializer: S, addr: SocketAddr) -> RpcClient<S> {
    let client = RpcClient::new(ClientConfig::new("test-client", addr), serializer);
    let ready = client.startup().unwrap();
    assert!(matches!(ready.get(Duration::from_secs(2)), Outcome::Ready(_)));
    client
}

fn echo(req: Request) -> Response {
    Response::ok(req.id, req.payload)
}

/// Poll `cond` until it holds or `limit` passes.
fn wait_for(limit: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

/// Blocking read of one frame from a raw socket.
fn read_frame(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header)?;
    let mut payload = vec![0u8; u32::from_be_bytes(header) as usize];
    stream.read_exact(&mut payload)?;
    Ok(payload)
}

#[test]
fn test_ping_pong() {
    let (_server, addr) = start_server(MsgPackSerializer, |s| {
        s.set_handler(|req: Request| {
            assert_eq!(&req.payload[..], b"ping");
            Response::ok(req.id, "pong")
        })
        .unwrap();
    });
    let client = start_client(MsgPackSerializer, addr);

    let start = Instant::now();
    let resp = client.invoke(Request::new(1, "ping", "ping"), TIMEOUT).unwrap();
    assert!(start.elapsed() < TIMEOUT);
    assert_eq!(resp.id, 1);
    assert_eq!(&resp.payload[..], b"pong");
    assert_eq!(client.pending_count(), 0);
}

#[test]
fn test_out_of_order_responses() {
    let arrived: Promise<()> = Promise::new();
    let gate: Promise<()> = Promise::new();

    let (_server, addr) = {
        let arrived = arrived.clone();
        let gate = gate.clone();
        start_server(MsgPackSerializer, move |s| {
            s.set_handler(move |req: Request| {
                if req.operation == "slow" {
                    arrived.set(());
                    let _ = gate.get(Duration::from_secs(5));
                }
                Response::ok(req.id, req.payload)
            })
            .unwrap();
        })
    };
    let client = Arc::new(start_client(MsgPackSerializer, addr));

    let first = client.request("slow", "one");
    let second = client.request("fast", "two");
    assert_eq!((first.id, second.id), (1, 2));

    let slow = {
        let client = client.clone();
        thread::spawn(move || client.invoke(first, Duration::from_secs(5)))
    };
    assert!(matches!(arrived.get(Duration::from_secs(2)), Outcome::Ready(())));

    // Answered while request 1 is still held by its handler.
    let resp = client.invoke(second, TIMEOUT).unwrap();
    assert_eq!(resp.id, 2);
    assert_eq!(&resp.payload[..], b"two");

    gate.set(());
    let resp = slow.join().unwrap().unwrap();
    assert_eq!(resp.id, 1);
    assert_eq!(&resp.payload[..], b"one");
    assert_eq!(client.pending_count(), 0);
}

#[test]
fn test_concurrent_callers_get_their_own_responses() {
    let (_server, addr) = start_server(MsgPackSerializer, |s| s.set_handler(echo).unwrap());
    let client = Arc::new(start_client(MsgPackSerializer, addr));

    let callers: Vec<_> = (0..4)
        .map(|t| {
            let client = client.clone();
            thread::spawn(move || {
                for i in 0..100 {
                    let payload = format!("{}-{}", t, i);
                    let req = client.request("echo", payload.clone());
                    let id = req.id;
                    let resp = client.invoke(req, Duration::from_secs(2)).unwrap();
                    assert_eq!(resp.id, id);
                    assert_eq!(&resp.payload[..], payload.as_bytes());
                }
            })
        })
        .collect();

    for caller in callers {
        caller.join().unwrap();
    }
    assert_eq!(client.pending_count(), 0);
}

#[test]
fn test_io_thread_clamp() {
    let mut server = RpcServer::new(
        ServerConfig::new("clamp", "127.0.0.1:0".parse().unwrap()),
        MsgPackSerializer,
    );
    assert_eq!(server.set_io_threads(0).unwrap(), 1);
    assert_eq!(
        server.set_io_threads(10_000).unwrap(),
        courier::config::default_io_threads()
    );
}

#[test]
fn test_oversized_request_fails_before_send() {
    let (_server, addr) = start_server(MsgPackSerializer, |s| s.set_handler(echo).unwrap());
    let client = start_client(MsgPackSerializer, addr);

    let req = client.request("echo", vec![0u8; 70_000]);
    assert!(matches!(client.invoke(req, TIMEOUT), Err(Error::Protocol(_))));
    assert_eq!(client.pending_count(), 0);

    // Connection unaffected.
    let resp = client.call("echo", "still here", TIMEOUT).unwrap();
    assert_eq!(&resp.payload[..], b"still here");
}

#[test]
fn test_oversized_length_prefix_closes_connection() {
    let closed = Arc::new(AtomicUsize::new(0));
    let (_server, addr) = {
        let closed = closed.clone();
        start_server(MsgPackSerializer, move |s| {
            s.set_handler(echo).unwrap();
            s.add_close_listener(move |_| {
                closed.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        })
    };

    let mut raw = TcpStream::connect(addr).unwrap();
    raw.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    raw.write_all(&65_536u32.to_be_bytes()).unwrap();

    let mut buf = [0u8; 16];
    let n = raw.read(&mut buf).unwrap_or(0);
    assert_eq!(n, 0, "server should close the connection");
    assert!(wait_for(Duration::from_secs(2), || closed.load(Ordering::SeqCst) == 1));
}

#[test]
fn test_undecodable_frame_is_dropped() {
    let (_server, addr) = start_server(MsgPackSerializer, |s| s.set_handler(echo).unwrap());

    let codec = FrameCodec::default();
    let mut raw = TcpStream::connect(addr).unwrap();
    raw.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

    // 0xc1 is never valid MessagePack.
    raw.write_all(&codec.encode(&[0xc1, 0xc1, 0xc1]).unwrap()).unwrap();
    let valid = MsgPackSerializer
        .encode(&Request::new(9, "echo", "after garbage"))
        .unwrap();
    raw.write_all(&codec.encode(&valid).unwrap()).unwrap();

    let payload = read_frame(&mut raw).unwrap();
    let resp: Response = MsgPackSerializer.decode(&payload).unwrap();
    assert_eq!(resp.id, 9);
    assert_eq!(&resp.payload[..], b"after garbage");
}

#[test]
fn test_double_startup() {
    let (server, addr) = start_server(MsgPackSerializer, |s| s.set_handler(echo).unwrap());
    assert!(matches!(server.startup(), Err(Error::DoubleInit(_))));

    let client = start_client(MsgPackSerializer, addr);
    let before = client.connection();
    assert!(matches!(client.startup(), Err(Error::DoubleInit(_))));
    assert_eq!(client.connection(), before);

    let resp = client.call("echo", "ok", TIMEOUT).unwrap();
    assert_eq!(&resp.payload[..], b"ok");
}

#[test]
fn test_config_frozen_after_startup() {
    let (mut server, addr) = start_server(MsgPackSerializer, |s| s.set_handler(echo).unwrap());
    assert!(matches!(server.set_dispatch_threads(1), Err(Error::FrozenConfig(_))));

    let mut client = start_client(MsgPackSerializer, addr);
    assert!(matches!(client.set_io_threads(1), Err(Error::FrozenConfig(_))));
    assert!(matches!(
        client.add_close_listener(|_| {}),
        Err(Error::FrozenConfig(_))
    ));
}

#[test]
fn test_timeout_removes_pending_entry() {
    let (_server, addr) = start_server(MsgPackSerializer, |s| {
        s.set_handler(|req: Request| {
            if req.operation == "slow" {
                thread::sleep(Duration::from_millis(300));
            }
            Response::ok(req.id, req.payload)
        })
        .unwrap();
    });
    let client = start_client(MsgPackSerializer, addr);

    let req = client.request("slow", "late");
    let id = req.id;
    match client.invoke(req, Duration::from_millis(50)) {
        Err(Error::TimedOut { id: timed_out, .. }) => assert_eq!(timed_out, id),
        other => panic!("expected timeout, got {:?}", other),
    }
    assert_eq!(client.pending_count(), 0);

    // The late response is discarded and does not leak into this call.
    thread::sleep(Duration::from_millis(400));
    let resp = client.call("fast", "fresh", TIMEOUT).unwrap();
    assert_eq!(&resp.payload[..], b"fresh");
    assert_eq!(client.pending_count(), 0);
}

#[test]
fn test_close_listeners_fire_once() {
    let server_closed = Arc::new(AtomicUsize::new(0));
    let (_server, addr) = {
        let server_closed = server_closed.clone();
        start_server(MsgPackSerializer, move |s| {
            s.set_handler(echo).unwrap();
            s.add_close_listener(move |_| {
                server_closed.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        })
    };

    let client_closed = Arc::new(AtomicUsize::new(0));
    let mut client = RpcClient::new(ClientConfig::new("listener", addr), MsgPackSerializer);
    {
        let client_closed = client_closed.clone();
        client
            .add_close_listener(move |info| {
                assert_eq!(info.peer_addr, addr);
                client_closed.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
    }
    client.startup().unwrap();
    client.call("echo", "hi", TIMEOUT).unwrap();

    client.shutdown().unwrap();
    client.shutdown().unwrap();
    assert_eq!(client_closed.load(Ordering::SeqCst), 1);

    assert!(wait_for(Duration::from_secs(2), || {
        server_closed.load(Ordering::SeqCst) == 1
    }));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(server_closed.load(Ordering::SeqCst), 1);
}

#[test]
fn test_panicking_close_listener_does_not_stop_io_thread() {
    let fired = Arc::new(AtomicUsize::new(0));
    let (_server, addr) = {
        let fired = fired.clone();
        start_server(MsgPackSerializer, move |s| {
            // Every connection shares the one I/O thread.
            s.set_io_threads(1).unwrap();
            s.set_handler(echo).unwrap();
            s.add_close_listener(move |_| {
                if fired.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("listener failure");
                }
            })
            .unwrap();
        })
    };

    let a = start_client(MsgPackSerializer, addr);
    let b = start_client(MsgPackSerializer, addr);
    a.call("echo", "a", TIMEOUT).unwrap();
    b.call("echo", "b", TIMEOUT).unwrap();

    a.shutdown().unwrap();
    assert!(wait_for(Duration::from_secs(2), || fired.load(Ordering::SeqCst) == 1));

    let resp = b.call("echo", "still b", TIMEOUT).unwrap();
    assert_eq!(&resp.payload[..], b"still b");

    let c = start_client(MsgPackSerializer, addr);
    let resp = c.call("echo", "new c", TIMEOUT).unwrap();
    assert_eq!(&resp.payload[..], b"new c");

    b.shutdown().unwrap();
    c.shutdown().unwrap();
    assert!(wait_for(Duration::from_secs(2), || fired.load(Ordering::SeqCst) == 3));
}

#[test]
fn test_write_backlog_limit_closes_slow_reader() {
    let closed = Arc::new(AtomicUsize::new(0));
    let (_server, addr) = {
        let closed = closed.clone();
        start_server(MsgPackSerializer, move |s| {
            s.set_max_pending_write(64 * 1024).unwrap();
            s.set_child_option(ChannelOption::SendBufferSize(4096)).unwrap();
            s.set_handler(|req: Request| Response::ok(req.id, vec![0u8; 32 * 1024]))
                .unwrap();
            s.add_close_listener(move |_| {
                closed.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        })
    };

    // Sends requests but never reads a response.
    let mut raw = TcpStream::connect(addr).unwrap();
    ChannelOptions::new()
        .with(ChannelOption::RecvBufferSize(4096))
        .apply(&raw)
        .unwrap();

    let codec = FrameCodec::default();
    for id in 1..=400u64 {
        let payload = MsgPackSerializer
            .encode(&Request::new(id, "big", ""))
            .unwrap();
        if raw.write_all(&codec.encode(&payload).unwrap()).is_err() {
            break;
        }
    }

    assert!(wait_for(Duration::from_secs(5), || {
        closed.load(Ordering::SeqCst) == 1
    }));
}

#[test]
fn test_shutdown_cancels_in_flight_invocation() {
    let arrived: Promise<()> = Promise::new();
    let gate: Promise<()> = Promise::new();

    let (server, addr) = {
        let arrived = arrived.clone();
        let gate = gate.clone();
        start_server(MsgPackSerializer, move |s| {
            s.set_handler(move |req: Request| {
                arrived.set(());
                let _ = gate.get(Duration::from_secs(5));
                Response::ok(req.id, req.payload)
            })
            .unwrap();
        })
    };
    let client = Arc::new(start_client(MsgPackSerializer, addr));

    let waiter = {
        let client = client.clone();
        thread::spawn(move || {
            let start = Instant::now();
            let result = client.call("block", "", Duration::from_secs(5));
            (result, start.elapsed())
        })
    };
    assert!(matches!(arrived.get(Duration::from_secs(2)), Outcome::Ready(())));

    client.shutdown().unwrap();
    let (result, elapsed) = waiter.join().unwrap();
    assert!(matches!(result, Err(Error::ConnectionClosed)));
    assert!(elapsed < Duration::from_secs(5));
    assert_eq!(client.pending_count(), 0);

    assert!(matches!(
        client.call("echo", "", TIMEOUT),
        Err(Error::NotStarted(_))
    ));

    gate.set(());
    server.shutdown().unwrap();
}

#[test]
fn test_server_shutdown_closes_clients() {
    let (server, addr) = start_server(MsgPackSerializer, |s| s.set_handler(echo).unwrap());
    let client = start_client(MsgPackSerializer, addr);
    client.call("echo", "before", TIMEOUT).unwrap();

    server.shutdown().unwrap();
    server.shutdown().unwrap();
    assert!(server.local_addr().is_none());

    assert!(wait_for(Duration::from_secs(2), || {
        matches!(
            client.call("echo", "after", TIMEOUT),
            Err(Error::ConnectionClosed)
        )
    }));
    assert_eq!(client.pending_count(), 0);
}

#[test]
fn test_handler_panic_keeps_connection() {
    let (_server, addr) = start_server(MsgPackSerializer, |s| {
        s.set_handler(|req: Request| {
            if req.operation == "explode" {
                panic!("handler failure");
            }
            Response::ok(req.id, req.payload)
        })
        .unwrap();
    });
    let client = start_client(MsgPackSerializer, addr);

    let resp = client.call("explode", "", TIMEOUT).unwrap();
    assert!(!resp.is_ok());
    assert!(resp.error.unwrap().contains("explode"));

    let resp = client.call("echo", "alive", TIMEOUT).unwrap();
    assert_eq!(&resp.payload[..], b"alive");
}

#[test]
fn test_json_serializer_round_trip() {
    let (_server, addr) = start_server(JsonSerializer, |s| {
        s.set_handler(|req: Request| {
            let tag = req.metadata.get("tag").cloned().unwrap_or_default();
            Response::ok(req.id, format!("{}:{}", tag, String::from_utf8_lossy(&req.payload)))
        })
        .unwrap();
    });
    let client = start_client(JsonSerializer, addr);

    let req = client.request("tagged", "body").with_metadata("tag", "json");
    let resp = client.invoke(req, TIMEOUT).unwrap();
    assert_eq!(&resp.payload[..], b"json:body");
}

#[test]
fn test_connect_refused() {
    let addr = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    let client = RpcClient::new(ClientConfig::new("refused", addr), MsgPackSerializer);
    assert!(matches!(client.startup(), Err(Error::Io(_))));
    assert!(client.shutdown().is_ok());
}
