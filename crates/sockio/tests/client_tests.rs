//! Tests for the TCP client against a live line-protocol server.

mod common;

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use sockio::{
    BoxStream, Callbacks, ConnectionState, Connector, Hook, SocketError, TcpClient,
    TcpClientConfig,
};

use common::{BLOCK_SIZE, IDN};

fn counting_hook(counter: &Arc<AtomicUsize>) -> Hook {
    let counter = counter.clone();
    Hook::immediate(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[test]
fn test_client_initial_state() {
    let client = TcpClient::new(TcpClientConfig::new("127.0.0.1", 5025));

    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert!(!client.connected());
    assert_eq!(client.connection_counter(), 0);
    assert_eq!(client.in_waiting(), 0);
    assert_eq!(client.host(), "127.0.0.1");
    assert_eq!(client.port(), 5025);
    assert_eq!(client.address(), "127.0.0.1:5025");
    assert!(client.config().auto_reconnect);
}

#[tokio::test]
async fn test_open_close_counter() {
    let server = common::start().await;
    let client = TcpClient::new(server.config());

    client.open(None).await.unwrap();
    assert!(client.connected());
    assert_eq!(client.connection_counter(), 1);
    assert_eq!(client.in_waiting(), 0);

    let err = client.open(None).await.unwrap_err();
    assert!(matches!(err, SocketError::AlreadyConnected));
    assert_eq!(client.connection_counter(), 1);
    assert!(client.connected());

    client.close().await;
    assert!(!client.connected());
    client.close().await;
    assert_eq!(client.connection_counter(), 1);

    client.open(None).await.unwrap();
    assert_eq!(client.connection_counter(), 2);
    client.close().await;
}

#[tokio::test]
async fn test_concurrent_open_is_rejected() {
    let server = common::start().await;
    let client = TcpClient::new(server.config());

    let (a, b) = tokio::join!(client.open(None), client.open(None));
    let results = [a, b];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(
        results
            .iter()
            .any(|r| matches!(r, Err(SocketError::AlreadyConnecting)))
    );
    assert_eq!(client.connection_counter(), 1);
}

#[tokio::test]
async fn test_open_refused() {
    let port = common::closed_port().await;
    let client = TcpClient::new(TcpClientConfig::new("127.0.0.1", port));

    let err = client.open(None).await.unwrap_err();
    assert!(matches!(err, SocketError::ConnectionRefused(_)), "{err:?}");
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(client.connection_counter(), 0);
}

struct StalledConnector;

impl Connector for StalledConnector {
    fn connect<'a>(&'a self, _: &'a str, _: u16) -> BoxFuture<'a, io::Result<BoxStream>> {
        Box::pin(futures_util::future::pending())
    }
}

#[tokio::test]
async fn test_operations_during_open_are_rejected() {
    let client = TcpClient::with_connector(
        TcpClientConfig::new("10.255.255.1", 5025),
        Callbacks::new(),
        StalledConnector,
    );

    let opener = {
        let client = client.clone();
        tokio::spawn(async move { client.open(None).await })
    };
    wait_for(|| client.state() == ConnectionState::Connecting).await;

    let err = client.write(b"*idn?\n", None).await.unwrap_err();
    assert!(matches!(err, SocketError::AlreadyConnecting), "{err:?}");
    let err = client.readline(None).await.unwrap_err();
    assert!(matches!(err, SocketError::AlreadyConnecting), "{err:?}");
    let err = client.write_readline(b"*idn?\n", None).await.unwrap_err();
    assert!(matches!(err, SocketError::AlreadyConnecting), "{err:?}");

    // Abandoning the attempt leaves the client disconnected.
    opener.abort();
    let _ = opener.await;
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(client.connection_counter(), 0);
}

#[tokio::test]
async fn test_open_timeout() {
    let config =
        TcpClientConfig::new("10.255.255.1", 5025).connection_timeout(Duration::from_secs(5));
    let client = TcpClient::with_connector(config, Callbacks::new(), StalledConnector);

    let start = Instant::now();
    let err = client
        .open(Some(Duration::from_millis(100)))
        .await
        .unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(
        err.to_string(),
        "connect call timeout on '10.255.255.1:5025'"
    );
    assert!(start.elapsed() < Duration::from_secs(1));
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(client.connection_counter(), 0);
}

#[tokio::test]
async fn test_no_auto_reconnect() {
    let server = common::start().await;
    let client = TcpClient::new(server.config().auto_reconnect(false));

    let err = client.write_readline(b"*idn?\n", None).await.unwrap_err();
    assert!(matches!(err, SocketError::NotConnected));
    assert_eq!(client.connection_counter(), 0);

    client.open(None).await.unwrap();
    assert_eq!(client.write_readline(b"*idn?\n", None).await.unwrap(), IDN);
}

#[tokio::test]
async fn test_write_readline() {
    let server = common::start().await;
    let client = TcpClient::new(server.config());

    // First operation connects on its own.
    let reply = client.write_readline(b"*idn?\n", None).await.unwrap();
    assert_eq!(reply, IDN);
    assert_eq!(client.connection_counter(), 1);
    assert_eq!(client.in_waiting(), 0);
}

#[tokio::test]
async fn test_write_readlines() {
    let server = common::start().await;
    let client = TcpClient::new(server.config());

    let replies = client
        .write_readlines(b"*idn?\n*idn?\n", 2, None)
        .await
        .unwrap();
    assert_eq!(replies, vec![IDN, IDN]);
}

#[tokio::test]
async fn test_writelines_readlines() {
    let server = common::start().await;
    let client = TcpClient::new(server.config());

    let replies = client
        .writelines_readlines([b"*idn?\n", b"*idn?\n", b"*idn?\n"], None, None)
        .await
        .unwrap();
    assert_eq!(replies.len(), 3);
    assert!(replies.iter().all(|reply| reply == IDN));

    let replies = client
        .writelines_readlines(vec![b"*idn?\n".to_vec()], Some(1), None)
        .await
        .unwrap();
    assert_eq!(replies, vec![IDN]);
}

#[tokio::test]
async fn test_writelines_then_readlines() {
    let server = common::start().await;
    let client = TcpClient::new(server.config());

    client
        .writelines([&b"*idn?\n"[..], b"bogus\n"], None)
        .await
        .unwrap();
    let replies = client.readlines(2, None).await.unwrap();
    assert_eq!(replies[0], IDN);
    assert!(replies[1].starts_with(b"ERR"));
}

#[tokio::test]
async fn test_readexactly() {
    let server = common::start().await;
    let client = TcpClient::new(server.config());

    client.write(b"data? -3\n", None).await.unwrap();
    for i in 0..3 {
        let block = client.readexactly(BLOCK_SIZE, None).await.unwrap();
        assert_eq!(block, common::block(i));
    }
    let err = client.readexactly(BLOCK_SIZE, None).await.unwrap_err();
    assert!(err.is_eof());
}

#[tokio::test]
async fn test_readuntil() {
    let server = common::start().await;
    let client = TcpClient::new(server.config());

    client.write(b"*idn?\n", None).await.unwrap();
    assert_eq!(client.readuntil(b",", None).await.unwrap(), &b"ACME,"[..]);
    assert_eq!(
        client.readuntil(b",", None).await.unwrap(),
        &b"Model-T,"[..]
    );
    assert_eq!(
        client.readline(None).await.unwrap(),
        &b"1234,v1.0\n"[..]
    );
}

#[tokio::test]
async fn test_read_some() {
    let server = common::start().await;
    let client = TcpClient::new(server.config());

    client.write(b"*idn?\n", None).await.unwrap();
    wait_for(|| client.in_waiting() == IDN.len()).await;

    assert_eq!(client.read(4, None).await.unwrap(), &b"ACME"[..]);
    assert_eq!(client.in_waiting(), IDN.len() - 4);
    assert_eq!(client.read(1024, None).await.unwrap(), &IDN[4..]);
    assert_eq!(client.in_waiting(), 0);
    assert!(client.read(0, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_read_to_end() {
    let server = common::start().await;
    let client = TcpClient::new(server.config());

    client.write(b"data? 4\n", None).await.unwrap();
    let all = client
        .read_to_end(Some(Duration::from_secs(2)))
        .await
        .unwrap();
    let expected: Vec<u8> = (0..4).flat_map(common::line).collect();
    assert_eq!(all, expected);
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_in_waiting_tracks_unread_bytes() {
    let server = common::start().await;
    let client = TcpClient::new(server.config());

    client.write(b"*idn?\n*idn?\n", None).await.unwrap();
    assert_eq!(client.readline(None).await.unwrap(), IDN);
    wait_for(|| client.in_waiting() == IDN.len()).await;
    assert_eq!(client.readline(None).await.unwrap(), IDN);
    assert_eq!(client.in_waiting(), 0);
}

#[tokio::test]
async fn test_timeout_keeps_connection_usable() {
    let server = common::start().await;
    let client = TcpClient::new(server.config());
    client.open(None).await.unwrap();

    let start = Instant::now();
    let err = client
        .write_readline(b"sleep 1\n", Some(Duration::from_millis(90)))
        .await
        .unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(
        err.to_string(),
        format!("write_readline call timeout on '{}'", client.address())
    );
    assert!(start.elapsed() < Duration::from_millis(600));
    assert!(client.connected());

    // The late reply is still delivered, then the connection serves new requests.
    let late = client
        .readline(Some(Duration::from_secs(3)))
        .await
        .unwrap();
    assert_eq!(late, &b"OK\n"[..]);
    assert_eq!(client.write_readline(b"*idn?\n", None).await.unwrap(), IDN);
    assert_eq!(client.connection_counter(), 1);
}

#[tokio::test]
async fn test_default_timeout_from_config() {
    let server = common::start().await;
    let client = TcpClient::new(server.config().timeout(Duration::from_millis(100)));

    let err = client.write_readline(b"sleep 1\n", None).await.unwrap_err();
    assert!(err.is_timeout());

    // A per-call timeout overrides the default.
    let late = client
        .readline(Some(Duration::from_secs(3)))
        .await
        .unwrap();
    assert_eq!(late, &b"OK\n"[..]);
}

#[tokio::test]
async fn test_parallel_requests() {
    let server = common::start().await;
    let client = TcpClient::new(server.config());
    client.open(None).await.unwrap();

    let (a, b) = tokio::join!(
        client.write_readline(b"*idn?\n", None),
        client.write_readline(b"*idn?\n", None),
    );
    assert_eq!(a.unwrap(), IDN);
    assert_eq!(b.unwrap(), IDN);
    assert_eq!(client.connection_counter(), 1);
}

#[tokio::test]
async fn test_eof_mid_read() {
    let server = common::start().await;
    let eofs = Arc::new(AtomicUsize::new(0));
    let lost = Arc::new(AtomicUsize::new(0));
    let callbacks = Callbacks::new()
        .on_eof_received(counting_hook(&eofs))
        .on_connection_lost(counting_hook(&lost));
    let client = TcpClient::with_callbacks(server.config(), callbacks);

    let err = client.write_readline(b"kill\n", None).await.unwrap_err();
    assert!(matches!(err, SocketError::ConnectionEof));
    assert_eq!(client.state(), ConnectionState::Disconnected);
    wait_for(|| eofs.load(Ordering::SeqCst) == 1).await;
    wait_for(|| lost.load(Ordering::SeqCst) == 1).await;

    // Closing a disconnected client does not report the loss again.
    client.close().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(lost.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_idle_eof_fires_only_eof_hook() {
    let server = common::start().await;
    let eofs = Arc::new(AtomicUsize::new(0));
    let lost = Arc::new(AtomicUsize::new(0));
    let callbacks = Callbacks::new()
        .on_eof_received(counting_hook(&eofs))
        .on_connection_lost(counting_hook(&lost));
    let client = TcpClient::with_callbacks(server.config(), callbacks);

    // No read is waiting when the server closes.
    client.write(b"kill\n", None).await.unwrap();
    wait_for(|| !client.connected()).await;
    wait_for(|| eofs.load(Ordering::SeqCst) == 1).await;

    assert!(client.readline(None).await.unwrap_err().is_eof());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(lost.load(Ordering::SeqCst), 0);
    assert_eq!(eofs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_concurrent_readers_all_see_eof() {
    let server = common::start().await;
    let client = TcpClient::new(server.config());
    client.open(None).await.unwrap();

    let readers: Vec<_> = (0..2)
        .map(|_| {
            let client = client.clone();
            tokio::spawn(async move { client.readline(Some(Duration::from_secs(2))).await })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(50)).await;
    client.write(b"kill\n", None).await.unwrap();

    for reader in readers {
        let err = reader.await.unwrap().unwrap_err();
        assert!(matches!(err, SocketError::ConnectionEof), "{err:?}");
    }
}

#[tokio::test]
async fn test_auto_reconnect_after_peer_close() {
    let server = common::start().await;
    let client = TcpClient::new(server.config());

    client.write(b"kill\n", None).await.unwrap();
    assert!(client.readline(None).await.unwrap_err().is_eof());
    assert!(!client.connected());

    assert_eq!(client.write_readline(b"*idn?\n", None).await.unwrap(), IDN);
    assert_eq!(client.connection_counter(), 2);
}

#[tokio::test]
async fn test_partial_line_before_close_is_eof() {
    let server = common::start().await;
    let client = TcpClient::new(server.config());

    client.write(b"data? -1\n", None).await.unwrap();
    let err = client.readuntil(b"never", None).await.unwrap_err();
    assert!(err.is_eof());
    assert_eq!(client.in_waiting(), 0);
}

#[tokio::test]
async fn test_callbacks() {
    let server = common::start().await;
    let made = Arc::new(AtomicUsize::new(0));
    let lost = Arc::new(AtomicUsize::new(0));
    let async_made = Arc::new(AtomicUsize::new(0));

    let counter = async_made.clone();
    let callbacks = Callbacks::new()
        .on_connection_made(Hook::suspending(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }))
        .on_connection_lost(counting_hook(&lost));
    let client = TcpClient::with_callbacks(server.config(), callbacks);

    client.open(None).await.unwrap();
    wait_for(|| async_made.load(Ordering::SeqCst) == 1).await;
    client.close().await;
    wait_for(|| lost.load(Ordering::SeqCst) == 1).await;

    let callbacks = Callbacks::new().on_connection_made(counting_hook(&made));
    let client = TcpClient::with_callbacks(server.config(), callbacks);
    client.open(None).await.unwrap();
    client.open(None).await.unwrap_err();
    wait_for(|| made.load(Ordering::SeqCst) == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(made.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_slow_hook_does_not_delay_open() {
    let server = common::start().await;
    let made = Arc::new(AtomicUsize::new(0));
    let counter = made.clone();
    let callbacks = Callbacks::new().on_connection_made(Hook::immediate(move || {
        std::thread::sleep(Duration::from_millis(500));
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }));
    let client = TcpClient::with_callbacks(server.config(), callbacks);

    let start = Instant::now();
    client.open(None).await.unwrap();
    assert!(start.elapsed() < Duration::from_millis(200));
    assert!(client.connected());
    assert_eq!(client.write_readline(b"*idn?\n", None).await.unwrap(), IDN);

    wait_for(|| made.load(Ordering::SeqCst) == 1).await;
}

#[tokio::test]
async fn test_failing_callbacks_are_contained() {
    let server = common::start().await;
    let callbacks = Callbacks::new()
        .on_connection_made(Hook::immediate(|| Err("made hook failed".into())))
        .on_connection_lost(Hook::immediate(|| panic!("lost hook exploded")));
    let client = TcpClient::with_callbacks(server.config(), callbacks);

    client.open(None).await.unwrap();
    assert!(client.connected());
    client.close().await;
    assert!(!client.connected());

    client.open(None).await.unwrap();
    assert_eq!(client.connection_counter(), 2);
    assert_eq!(client.write_readline(b"*idn?\n", None).await.unwrap(), IDN);
}

#[tokio::test]
async fn test_config_from_file() {
    let server = common::start().await;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("device.toml");
    std::fs::write(
        &path,
        format!(
            "host = \"127.0.0.1\"\nport = {}\ntimeout = 1.0\n\n[socket]\nkeep_alive = true\n",
            server.port
        ),
    )
    .unwrap();

    let client = TcpClient::new(TcpClientConfig::load(&path).unwrap());
    assert_eq!(client.config().timeout, Some(Duration::from_secs(1)));
    assert_eq!(client.write_readline(b"*idn?\n", None).await.unwrap(), IDN);
}
