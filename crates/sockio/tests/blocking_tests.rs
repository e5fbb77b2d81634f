//! Tests for the blocking client facade.

mod common;

use std::time::Duration;

use sockio::blocking::EventLoop;
use sockio::{ConnectionState, SocketError};

use common::IDN;

#[test]
fn test_blocking_request_reply() {
    let event_loop = EventLoop::new().unwrap();
    let server = event_loop.run(common::start());
    let client = event_loop.tcp(server.config());

    client.open(None).unwrap();
    assert!(client.connected());
    assert_eq!(client.write_readline(b"*idn?\n", None).unwrap(), IDN);
    assert_eq!(
        client.write_readlines(b"*idn?\n*idn?\n", 2, None).unwrap(),
        vec![IDN, IDN]
    );
    assert_eq!(
        client
            .writelines_readlines([b"*idn?\n", b"*idn?\n"], None, None)
            .unwrap()
            .len(),
        2
    );

    client.writelines([b"*idn?\n"], None).unwrap();
    assert_eq!(client.readuntil(b",", None).unwrap(), &b"ACME,"[..]);
    assert_eq!(client.readexactly(8, None).unwrap(), &b"Model-T,"[..]);
    assert_eq!(client.readlines(1, None).unwrap(), vec![&b"1234,v1.0\n"[..]]);
    assert_eq!(client.in_waiting(), 0);

    client.close();
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(client.connection_counter(), 1);
}

#[test]
fn test_blocking_timeout() {
    let event_loop = EventLoop::new().unwrap();
    let server = event_loop.run(common::start());
    let client = event_loop.tcp(server.config());

    let err = client
        .write_readline(b"sleep 1\n", Some(Duration::from_millis(90)))
        .unwrap_err();
    assert!(matches!(err, SocketError::ConnectionTimeout(_)));
    assert!(client.connected());
    assert_eq!(
        client.readline(Some(Duration::from_secs(3))).unwrap(),
        &b"OK\n"[..]
    );
}

#[test]
fn test_blocking_line_iteration() {
    let event_loop = EventLoop::new().unwrap();
    let server = event_loop.run(common::start());
    let client = event_loop.tcp(server.config());

    client.write(b"data? 3\n", None).unwrap();
    let lines: Vec<_> = (&client).into_iter().map(|line| line.unwrap()).collect();

    assert_eq!(lines.len(), 3);
    assert_eq!(lines[2], common::line(2));
    assert!(!client.connected());
    assert_eq!(client.connection_counter(), 1);
}

#[test]
fn test_blocking_read_until_close() {
    let event_loop = EventLoop::new().unwrap();
    let server = event_loop.run(common::start());
    let client = event_loop.tcp(server.config());

    client.write(b"data? 2\n", None).unwrap();
    let all = client.read_to_end(Some(Duration::from_secs(2))).unwrap();
    assert_eq!(all.len(), common::line(0).len() * 2);
    assert_eq!(client.state(), ConnectionState::Disconnected);

    // The next request reconnects.
    assert_eq!(client.write_readline(b"*idn?\n", None).unwrap(), IDN);
    assert_eq!(client.connection_counter(), 2);
}
