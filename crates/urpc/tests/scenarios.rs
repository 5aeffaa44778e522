//! Client and server on one event loop over loopback TCP.

use std::cell::RefCell;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::rc::Rc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use urpc::{
    codec, ByteStream, Channel, ChannelOptions, Controller, CorrelationId, Done, ErrorCode,
    EventLoop, MethodDescriptor, Parsed, Protocol, ProtocolType, Server, ServerOptions,
    ServiceBuilder, ServiceOwnership, UrpcProtocol,
};

#[derive(Debug, Default, Serialize, Deserialize)]
struct EchoRequest {
    message: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct EchoResponse {
    message: String,
}

const WAIT: Duration = Duration::from_secs(5);

type Outcome = Rc<RefCell<Vec<(Controller, EchoResponse)>>>;

fn echo_server(ev: &mut EventLoop) -> (Server, String) {
    let mut server = Server::new(ServerOptions::new());
    let service = ServiceBuilder::new("example.EchoService")
        .method(
            "Echo",
            |_cntl: &Controller, req: EchoRequest, done: Done<EchoResponse>| {
                done.finish(EchoResponse {
                    message: req.message,
                })
            },
        )
        .method(
            "Drop",
            |_cntl: &Controller, _req: EchoRequest, _done: Done<EchoResponse>| {},
        )
        .build();
    server
        .add_service(Rc::new(service), ServiceOwnership::ServerOwned)
        .unwrap();
    let addr = server.start(ev, "127.0.0.1:0").unwrap();
    (server, addr.to_string())
}

fn echo_method() -> MethodDescriptor {
    MethodDescriptor::new("example.EchoService", "Echo")
}

fn call(ev: &mut EventLoop, ch: &Channel, method: &MethodDescriptor, cntl: Controller, msg: &str, out: &Outcome) {
    let out = Rc::clone(out);
    ch.call(
        ev,
        method,
        cntl,
        &EchoRequest {
            message: msg.into(),
        },
        move |cntl, resp: EchoResponse| out.borrow_mut().push((cntl, resp)),
    );
}

/// Read from a hand-rolled peer until one whole URPC request is buffered.
fn read_request(sock: &mut TcpStream) -> urpc::RequestFrame {
    let mut inbound = ByteStream::new();
    let mut buf = [0u8; 512];
    loop {
        if let Parsed::Ok(frame) = UrpcProtocol.parse_request(&mut inbound, 1 << 20) {
            return frame;
        }
        let n = sock.read(&mut buf).unwrap();
        assert!(n > 0, "client hung up mid-request");
        inbound.append(&buf[..n]);
    }
}

/// Block until the other side closes.
fn hold_until_closed(sock: &mut TcpStream) {
    let mut buf = [0u8; 512];
    while sock.read(&mut buf).map_or(false, |n| n > 0) {}
}

fn wait_for(ev: &mut EventLoop, out: &Outcome, n: usize) {
    let done = ev.run_until(WAIT, || out.borrow().len() >= n).unwrap();
    assert!(done, "only {} of {} calls completed", out.borrow().len(), n);
}

#[test]
fn test_hello_world() {
    let mut ev = EventLoop::new().unwrap();
    let (mut server, addr) = echo_server(&mut ev);
    let ch = Channel::init(&mut ev, &addr, ChannelOptions::new()).unwrap();

    let out = Outcome::default();
    call(&mut ev, &ch, &echo_method(), Controller::new(), "hello world", &out);
    wait_for(&mut ev, &out, 1);

    let out = out.borrow();
    let (cntl, resp) = &out[0];
    assert!(!cntl.failed(), "{}", cntl.error_text());
    assert_eq!(resp.message, "hello world");
    assert!(cntl.latency().is_some());
    assert_eq!(ev.pending_calls(ch.connection()), Some(0));
    server.stop(&mut ev);
}

#[test]
fn test_pipelined_calls_all_complete() {
    let mut ev = EventLoop::new().unwrap();
    let (mut server, addr) = echo_server(&mut ev);
    let ch = Channel::init(&mut ev, &addr, ChannelOptions::new()).unwrap();

    let out = Outcome::default();
    for i in 0..50 {
        call(&mut ev, &ch, &echo_method(), Controller::new(), &format!("m{}", i), &out);
    }
    wait_for(&mut ev, &out, 50);

    let mut got: Vec<String> = out.borrow().iter().map(|(_, r)| r.message.clone()).collect();
    got.sort();
    let mut want: Vec<String> = (0..50).map(|i| format!("m{}", i)).collect();
    want.sort();
    assert_eq!(got, want);
    assert!(out.borrow().iter().all(|(c, _)| !c.failed()));
    server.stop(&mut ev);
}

#[test]
fn test_unknown_method_fails_call_not_connection() {
    let mut ev = EventLoop::new().unwrap();
    let (mut server, addr) = echo_server(&mut ev);
    let ch = Channel::init(&mut ev, &addr, ChannelOptions::new()).unwrap();

    let out = Outcome::default();
    let missing = MethodDescriptor::new("example.EchoService", "Shout");
    call(&mut ev, &ch, &missing, Controller::new(), "x", &out);
    wait_for(&mut ev, &out, 1);
    {
        let out = out.borrow();
        let (cntl, resp) = &out[0];
        assert!(cntl.failed());
        assert_eq!(cntl.error_code(), ErrorCode::NO_METHOD);
        assert!(resp.message.is_empty());
    }

    // Same connection still serves.
    call(&mut ev, &ch, &echo_method(), Controller::new(), "after", &out);
    wait_for(&mut ev, &out, 2);
    assert_eq!(out.borrow()[1].1.message, "after");
    server.stop(&mut ev);
}

#[test]
fn test_unanswered_handler_is_internal() {
    let mut ev = EventLoop::new().unwrap();
    let (mut server, addr) = echo_server(&mut ev);
    let ch = Channel::init(&mut ev, &addr, ChannelOptions::new()).unwrap();

    let out = Outcome::default();
    let dropper = MethodDescriptor::new("example.EchoService", "Drop");
    call(&mut ev, &ch, &dropper, Controller::new(), "x", &out);
    wait_for(&mut ev, &out, 1);
    assert_eq!(out.borrow()[0].0.error_code(), ErrorCode::INTERNAL);
    server.stop(&mut ev);
}

#[test]
fn test_peer_close_mid_call() {
    // A peer that accepts, reads the request, and hangs up.
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let peer = std::thread::spawn(move || {
        let (mut sock, _) = listener.accept().unwrap();
        let mut buf = [0u8; 64];
        let _ = sock.read(&mut buf);
    });

    let mut ev = EventLoop::new().unwrap();
    let ch = Channel::init(&mut ev, &addr.to_string(), ChannelOptions::new().timeout_ms(-1)).unwrap();
    let out = Outcome::default();
    call(&mut ev, &ch, &echo_method(), Controller::new(), "bye", &out);
    wait_for(&mut ev, &out, 1);
    peer.join().unwrap();

    let out = out.borrow();
    let (cntl, _) = &out[0];
    assert!(cntl.failed());
    assert!(
        cntl.error_code() == ErrorCode::PEER_CLOSED || cntl.error_code() == ErrorCode::IO_FAILURE,
        "unexpected {}",
        cntl.error_code()
    );
    assert_eq!(ev.pending_calls(ch.connection()), Some(0));
}

#[test]
fn test_echo_protocol_channel() {
    let mut ev = EventLoop::new().unwrap();
    let (mut server, addr) = echo_server(&mut ev);
    let urpc = Channel::init(&mut ev, &addr, ChannelOptions::new()).unwrap();
    let echo = Channel::init(&mut ev, &addr, ChannelOptions::new().protocol(ProtocolType::Echo)).unwrap();
    assert_ne!(urpc.connection(), echo.connection());

    // The ECHO server side mirrors the request body, so the request type
    // decodes as the response type.
    let out = Outcome::default();
    call(&mut ev, &echo, &echo_method(), Controller::new(), "one", &out);
    call(&mut ev, &echo, &echo_method(), Controller::new(), "two", &out);
    call(&mut ev, &urpc, &echo_method(), Controller::new(), "three", &out);
    wait_for(&mut ev, &out, 3);

    let got: Vec<String> = out.borrow().iter().map(|(_, r)| r.message.clone()).collect();
    assert!(got.contains(&"one".to_string()));
    assert!(got.contains(&"two".to_string()));
    assert!(got.contains(&"three".to_string()));
    let one = got.iter().position(|m| m == "one").unwrap();
    let two = got.iter().position(|m| m == "two").unwrap();
    assert!(one < two);
    server.stop(&mut ev);
}

#[test]
fn test_late_response_after_timeout_is_dropped() {
    let mut ev = EventLoop::new().unwrap();
    let held: Rc<RefCell<Vec<Done<EchoResponse>>>> = Rc::default();
    let h = Rc::clone(&held);

    let mut server = Server::new(ServerOptions::new());
    let service = ServiceBuilder::new("example.SlowService")
        .method(
            "Hold",
            move |_cntl: &Controller, _req: EchoRequest, done: Done<EchoResponse>| {
                h.borrow_mut().push(done)
            },
        )
        .method(
            "Echo",
            |_cntl: &Controller, req: EchoRequest, done: Done<EchoResponse>| {
                done.finish(EchoResponse {
                    message: req.message,
                })
            },
        )
        .build();
    server
        .add_service(Rc::new(service), ServiceOwnership::ServerOwned)
        .unwrap();
    let addr = server.start(&mut ev, "127.0.0.1:0").unwrap().to_string();
    let ch = Channel::init(&mut ev, &addr, ChannelOptions::new()).unwrap();

    let out = Outcome::default();
    let mut cntl = Controller::new();
    cntl.set_timeout_ms(20);
    call(&mut ev, &ch, &MethodDescriptor::new("example.SlowService", "Hold"), cntl, "slow", &out);
    wait_for(&mut ev, &out, 1);
    assert_eq!(out.borrow()[0].0.error_code(), ErrorCode::TIMEOUT);

    // Answer now; the client drops it and keeps the connection.
    for done in held.borrow_mut().drain(..) {
        done.finish(EchoResponse {
            message: "late".into(),
        });
    }
    call(&mut ev, &ch, &MethodDescriptor::new("example.SlowService", "Echo"), Controller::new(), "fresh", &out);
    wait_for(&mut ev, &out, 2);
    let out = out.borrow();
    assert_eq!(out.len(), 2);
    let (cntl, resp) = &out[1];
    assert!(!cntl.failed(), "{}", cntl.error_text());
    assert_eq!(resp.message, "fresh");
    server.stop(&mut ev);
}

#[test]
fn test_dropping_loop_fails_outstanding_calls() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let out = Outcome::default();
    {
        let mut ev = EventLoop::new().unwrap();
        let ch = Channel::init(&mut ev, &addr.to_string(), ChannelOptions::new().timeout_ms(-1)).unwrap();
        call(&mut ev, &ch, &echo_method(), Controller::new(), "pending", &out);
        ev.run_once(Some(Duration::from_millis(20))).unwrap();
        assert!(out.borrow().is_empty());
    }
    assert_eq!(out.borrow().len(), 1);
    assert_eq!(out.borrow()[0].0.error_code(), ErrorCode::SHUTDOWN);
    drop(listener);
}

#[test]
fn test_unknown_correlation_id_resets_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let peer = std::thread::spawn(move || {
        let (mut sock, _) = listener.accept().unwrap();
        read_request(&mut sock);
        let reply = UrpcProtocol
            .encode_response(CorrelationId::new(999), &Ok(Vec::new()))
            .unwrap();
        sock.write_all(reply.as_slice()).unwrap();
        hold_until_closed(&mut sock);
    });

    let mut ev = EventLoop::new().unwrap();
    let ch = Channel::init(&mut ev, &addr.to_string(), ChannelOptions::new().timeout_ms(-1)).unwrap();
    let out = Outcome::default();
    call(&mut ev, &ch, &echo_method(), Controller::new(), "a", &out);
    call(&mut ev, &ch, &echo_method(), Controller::new(), "b", &out);
    wait_for(&mut ev, &out, 2);

    assert!(out
        .borrow()
        .iter()
        .all(|(cntl, _)| cntl.error_code() == ErrorCode::CORRELATION_MISMATCH));
    assert_eq!(ev.pending_calls(ch.connection()), Some(0));
    drop(ev);
    peer.join().unwrap();
}

#[test]
fn test_channel_reconnects_after_peer_close() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let peer = std::thread::spawn(move || {
        let (mut first, _) = listener.accept().unwrap();
        read_request(&mut first);
        drop(first);

        let (mut second, _) = listener.accept().unwrap();
        let req = read_request(&mut second);
        let body = codec::encode(&EchoResponse {
            message: "ok".into(),
        })
        .unwrap();
        let reply = UrpcProtocol.encode_response(req.correlation_id, &Ok(body)).unwrap();
        second.write_all(reply.as_slice()).unwrap();
        hold_until_closed(&mut second);
    });

    let mut ev = EventLoop::new().unwrap();
    let ch = Channel::init(&mut ev, &addr.to_string(), ChannelOptions::new().timeout_ms(-1)).unwrap();
    let out = Outcome::default();
    call(&mut ev, &ch, &echo_method(), Controller::new(), "first", &out);
    wait_for(&mut ev, &out, 1);
    {
        let out = out.borrow();
        let code = out[0].0.error_code();
        assert!(
            code == ErrorCode::PEER_CLOSED || code == ErrorCode::IO_FAILURE,
            "unexpected {}",
            code
        );
    }

    // Same channel, same handle: the next call connects again.
    call(&mut ev, &ch, &echo_method(), Controller::new(), "second", &out);
    wait_for(&mut ev, &out, 2);
    {
        let out = out.borrow();
        let (cntl, resp) = &out[1];
        assert!(!cntl.failed(), "{}", cntl.error_text());
        assert_eq!(resp.message, "ok");
    }
    assert_eq!(ev.pending_calls(ch.connection()), Some(0));
    drop(ev);
    peer.join().unwrap();
}
