//! Buffered TCP client with auto-reconnect and per-call timeouts.

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::buffer::ReadBuffer;
use crate::callback::{Callbacks, HookEvent};
use crate::config::TcpClientConfig;
use crate::error::{Result, SocketError};
use crate::state::ConnectionState;
use crate::stream::{BlockStream, LineStream};
use crate::transport::{BoxStream, Connector, TcpConnector};

const NEWLINE: &[u8] = b"\n";

/// Write side of one connection and its close signal.
struct Connection {
    writer: AsyncMutex<WriteHalf<BoxStream>>,
    closed: AtomicBool,
    closed_notify: Notify,
}

impl Connection {
    fn new(writer: WriteHalf<BoxStream>) -> Self {
        Self {
            writer: AsyncMutex::new(writer),
            closed: AtomicBool::new(false),
            closed_notify: Notify::new(),
        }
    }

    /// Abandon any in-flight write so the transport can be dropped.
    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.closed_notify.notify_waiters();
        }
    }

    async fn closed(&self) {
        loop {
            let notified = self.closed_notify.notified();
            if self.closed.load(Ordering::Acquire) {
                return;
            }
            notified.await;
        }
    }
}

/// Mutable connection state, guarded by one mutex per client.
///
/// The lock is only ever held across buffer/state mutation, never across
/// an `.await`.
#[derive(Default)]
struct Inner {
    state: ConnectionState,
    connection_counter: u64,
    buffer: ReadBuffer,
    /// Why the last stream ended, until a read reports it.
    stream_end: Option<SocketError>,
    /// Session number and cause of the most recent transport end.
    last_end: Option<(u64, SocketError)>,
    connection: Option<Arc<Connection>>,
    reader_task: Option<JoinHandle<()>>,
    /// Reads currently waiting for data.
    pending_reads: usize,
}

impl Inner {
    /// Report the end of stream to a read that cannot be satisfied.
    ///
    /// The partial tail is discarded: an incomplete frame is not a result.
    fn take_stream_end(&mut self) -> Option<SocketError> {
        let end = self.stream_end.take()?;
        self.buffer.clear();
        Some(end)
    }
}

/// What ended a connection from the transport side.
enum Cause {
    PeerEof,
    Failure(SocketError),
}

struct Shared {
    config: TcpClientConfig,
    address: String,
    connector: Box<dyn Connector>,
    callbacks: Callbacks,
    inner: Mutex<Inner>,
    data_ready: Notify,
}

impl Shared {
    /// Drive a connected session to `Disconnected` after a transport event.
    ///
    /// Stale events from an earlier session are ignored.
    fn transport_ended(&self, session: u64, cause: Cause) {
        let read_pending = {
            let mut inner = self.inner.lock();
            if inner.connection_counter != session || inner.state != ConnectionState::Connected {
                return;
            }
            inner.state = ConnectionState::Disconnected;
            if let Some(connection) = inner.connection.take() {
                connection.close();
            }
            if let Some(task) = inner.reader_task.take() {
                task.abort();
            }
            let end = match &cause {
                Cause::PeerEof => SocketError::ConnectionEof,
                Cause::Failure(err) => err.clone(),
            };
            inner.last_end = Some((session, end.clone()));
            inner.stream_end = Some(end);
            inner.pending_reads > 0
        };
        self.data_ready.notify_waiters();

        match cause {
            Cause::PeerEof => {
                info!(address = %self.address, connection = session, "peer closed connection");
                self.callbacks.fire(HookEvent::EofReceived, &self.address);
                if read_pending {
                    self.callbacks.fire(HookEvent::ConnectionLost, &self.address);
                }
            }
            Cause::Failure(err) => {
                warn!(address = %self.address, connection = session, error = %err, "connection lost");
                self.callbacks.fire(HookEvent::ConnectionLost, &self.address);
            }
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(task) = self.inner.get_mut().reader_task.take() {
            task.abort();
        }
    }
}

/// Pulls transport bytes into the shared buffer until the stream ends.
///
/// Holds only a weak reference so dropping the last client handle tears the
/// connection down.
async fn read_loop(
    shared: Weak<Shared>,
    session: u64,
    mut reader: ReadHalf<BoxStream>,
    chunk_size: usize,
) {
    let mut chunk = vec![0u8; chunk_size];

    loop {
        let result = reader.read(&mut chunk).await;
        let Some(shared) = shared.upgrade() else {
            return;
        };

        match result {
            Ok(0) => {
                shared.transport_ended(session, Cause::PeerEof);
                return;
            }
            Ok(n) => {
                trace!(address = %shared.address, bytes = n, "received");
                {
                    let mut inner = shared.inner.lock();
                    if inner.connection_counter != session
                        || inner.state != ConnectionState::Connected
                    {
                        return;
                    }
                    inner.buffer.extend(&chunk[..n]);
                }
                shared.data_ready.notify_waiters();
            }
            Err(e) => {
                shared.transport_ended(session, Cause::Failure(e.into()));
                return;
            }
        }
    }
}

/// Resets a `Connecting` state if the connect attempt is abandoned.
struct ConnectingGuard<'a> {
    shared: &'a Shared,
    armed: bool,
}

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut inner = self.shared.inner.lock();
            if inner.state == ConnectionState::Connecting {
                inner.state = ConnectionState::Disconnected;
            }
        }
    }
}

/// Marks a read as pending for as long as it waits for data.
struct PendingRead<'a> {
    shared: &'a Shared,
    /// The connection whose end this read reports, if any.
    session: Option<u64>,
}

impl<'a> PendingRead<'a> {
    fn new(shared: &'a Shared) -> Self {
        let mut inner = shared.inner.lock();
        inner.pending_reads += 1;
        let session = (inner.state == ConnectionState::Connected || inner.stream_end.is_some())
            .then_some(inner.connection_counter);
        Self { shared, session }
    }
}

impl Drop for PendingRead<'_> {
    fn drop(&mut self) {
        self.shared.inner.lock().pending_reads -= 1;
    }
}

/// A buffered TCP client for line-protocol devices.
///
/// The client hides connection establishment and reconnection behind a
/// request/response oriented API:
///
/// - Optional auto-reconnect: any operation on a disconnected client first
///   reopens the connection
/// - Per-call timeouts, falling back to the configured default
/// - Line (`readline`, `readlines`), delimiter (`readuntil`) and block
///   (`readexactly`) framing over an internal receive buffer
/// - Lifecycle hooks for connect, connection loss and peer EOF
///
/// Every operation takes an optional `timeout`. `None` uses the configured
/// default ([`TcpClientConfig::timeout`]); connect attempts use
/// [`TcpClientConfig::connection_timeout`] instead. A timed-out operation
/// fails with [`SocketError::ConnectionTimeout`] but leaves the connection
/// open and keeps every byte already received in the buffer.
///
/// The handle is cheap to clone; clones share one connection. Concurrent
/// reads are not serialised against each other, so callers that need strict
/// request/response pairing should use the `write_read*` helpers or order
/// their own calls.
///
/// # Example
///
/// ```ignore
/// let config = TcpClientConfig::new("192.168.1.20", 5025)
///     .connection_timeout(Duration::from_secs(1));
/// let client = TcpClient::new(config);
///
/// let idn = client.write_readline(b"*idn?\n", None).await?;
/// let pair = client.write_readlines(b"*idn?\n*idn?\n", 2, Some(Duration::from_millis(500))).await?;
/// ```
#[derive(Clone)]
pub struct TcpClient {
    shared: Arc<Shared>,
}

impl TcpClient {
    /// Create a disconnected client with the given configuration.
    pub fn new(config: TcpClientConfig) -> Self {
        Self::with_callbacks(config, Callbacks::default())
    }

    /// Create a disconnected client with lifecycle hooks.
    pub fn with_callbacks(config: TcpClientConfig, callbacks: Callbacks) -> Self {
        let connector = TcpConnector::new(config.socket.clone());
        Self::with_connector(config, callbacks, connector)
    }

    /// Create a disconnected client that opens streams through `connector`.
    pub fn with_connector(
        config: TcpClientConfig,
        callbacks: Callbacks,
        connector: impl Connector,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                address: config.address(),
                config,
                connector: Box::new(connector),
                callbacks,
                inner: Mutex::new(Inner::default()),
                data_ready: Notify::new(),
            }),
        }
    }

    /// Get the current connection state.
    pub fn state(&self) -> ConnectionState {
        self.shared.inner.lock().state
    }

    /// Check if a transport handle is held.
    pub fn connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Number of successful connects so far.
    pub fn connection_counter(&self) -> u64 {
        self.shared.inner.lock().connection_counter
    }

    /// Number of received bytes not consumed by a read yet.
    pub fn in_waiting(&self) -> usize {
        self.shared.inner.lock().buffer.len()
    }

    /// Get the configuration.
    pub fn config(&self) -> &TcpClientConfig {
        &self.shared.config
    }

    /// Get the host this client connects to.
    pub fn host(&self) -> &str {
        &self.shared.config.host
    }

    /// Get the port this client connects to.
    pub fn port(&self) -> u16 {
        self.shared.config.port
    }

    /// Get the full address (host:port) this client connects to.
    pub fn address(&self) -> &str {
        &self.shared.address
    }

    /// Open the connection.
    ///
    /// Fails with [`SocketError::AlreadyConnected`] or
    /// [`SocketError::AlreadyConnecting`] without touching the current
    /// connection. `timeout` overrides the configured connection timeout.
    pub async fn open(&self, timeout: Option<Duration>) -> Result<()> {
        let shared = &*self.shared;
        let counter = {
            let mut inner = shared.inner.lock();
            match inner.state {
                ConnectionState::Connected => return Err(SocketError::AlreadyConnected),
                ConnectionState::Connecting => return Err(SocketError::AlreadyConnecting),
                ConnectionState::Disconnected => {}
            }
            inner.state = ConnectionState::Connecting;
            inner.buffer.clear();
            inner.stream_end = None;
            inner.connection_counter
        };
        let mut guard = ConnectingGuard {
            shared,
            armed: true,
        };

        debug!(address = %shared.address, connection = counter + 1, "opening connection");
        let connect = shared
            .connector
            .connect(&shared.config.host, shared.config.port);
        let result = match timeout.or(shared.config.connection_timeout) {
            Some(limit) => match tokio::time::timeout(limit, connect).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(address = %shared.address, ?limit, "connect timed out");
                    return Err(SocketError::ConnectionTimeout(format!(
                        "connect call timeout on '{}'",
                        shared.address
                    )));
                }
            },
            None => connect.await,
        };
        let stream = result.map_err(|e| {
            warn!(address = %shared.address, error = %e, "connect failed");
            connect_error(&shared.address, e)
        })?;

        let (reader, writer) = tokio::io::split(stream);
        let session = {
            let mut inner = shared.inner.lock();
            inner.state = ConnectionState::Connected;
            inner.connection_counter += 1;
            let session = inner.connection_counter;
            inner.connection = Some(Arc::new(Connection::new(writer)));
            inner.reader_task = Some(tokio::spawn(read_loop(
                Arc::downgrade(&self.shared),
                session,
                reader,
                shared.config.socket.read_buffer_size,
            )));
            session
        };
        guard.armed = false;

        info!(address = %shared.address, connection = session, "connected");
        shared
            .callbacks
            .fire(HookEvent::ConnectionMade, &shared.address);
        Ok(())
    }

    /// Close the connection.
    ///
    /// Discards buffered data and abandons any in-flight write. A no-op on a
    /// disconnected client; the connection-lost hook fires only on the
    /// transition.
    pub async fn close(&self) {
        let shared = &*self.shared;
        let (was_connected, connection) = {
            let mut inner = shared.inner.lock();
            inner.buffer.clear();
            inner.stream_end = None;
            if let Some(task) = inner.reader_task.take() {
                task.abort();
            }
            let connection = inner.connection.take();
            let was_connected = inner.state == ConnectionState::Connected;
            if was_connected {
                inner.state = ConnectionState::Disconnected;
            }
            (was_connected, connection)
        };
        shared.data_ready.notify_waiters();

        if let Some(connection) = connection {
            connection.close();
            // A write that held the lock has been abandoned and drops the
            // stream on its own.
            if let Ok(mut writer) = connection.writer.try_lock() {
                let _ = writer.shutdown().await;
            }
        }

        if was_connected {
            info!(address = %shared.address, "connection closed");
            shared
                .callbacks
                .fire(HookEvent::ConnectionLost, &shared.address);
        }
    }

    /// Make sure there is something to operate on.
    ///
    /// Reads that still have an unreported end of stream (and the bytes
    /// received before it) drain those first instead of reconnecting.
    async fn ensure_open(&self, draining: bool) -> Result<()> {
        let state = {
            let inner = self.shared.inner.lock();
            if draining
                && inner.state == ConnectionState::Disconnected
                && inner.stream_end.is_some()
            {
                return Ok(());
            }
            inner.state
        };

        match state {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Connecting => Err(SocketError::AlreadyConnecting),
            ConnectionState::Disconnected if self.shared.config.auto_reconnect => {
                match self.open(None).await {
                    Err(SocketError::AlreadyConnected) => Ok(()),
                    other => other,
                }
            }
            ConnectionState::Disconnected => Err(SocketError::NotConnected),
        }
    }

    /// Race `operation` against the call's deadline.
    async fn timed<T>(
        &self,
        name: &'static str,
        timeout: Option<Duration>,
        operation: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match timeout.or(self.shared.config.timeout) {
            Some(limit) => match tokio::time::timeout(limit, operation).await {
                Ok(result) => result,
                Err(_) => {
                    debug!(address = %self.shared.address, op = name, ?limit, "call timed out");
                    Err(SocketError::ConnectionTimeout(format!(
                        "{name} call timeout on '{}'",
                        self.shared.address
                    )))
                }
            },
            None => operation.await,
        }
    }

    /// Wait until `poll` can complete from the buffer.
    ///
    /// `poll` runs under the state lock and returns `None` to keep waiting.
    async fn next_frame<T>(
        &self,
        mut poll: impl FnMut(&mut Inner) -> Option<Result<T>>,
    ) -> Result<T> {
        let shared = &*self.shared;
        let pending = PendingRead::new(shared);

        loop {
            let notified = shared.data_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = shared.inner.lock();
                if let Some(result) = poll(&mut inner) {
                    return result;
                }
                // Another read already reported the end this one was waiting on.
                if let Some((ended, end)) = &inner.last_end
                    && pending.session == Some(*ended)
                {
                    return Err(end.clone());
                }
                if inner.state == ConnectionState::Disconnected {
                    return Err(SocketError::NotConnected);
                }
            }

            notified.await;
        }
    }

    async fn read_frame<T>(&self, mut take: impl FnMut(&mut ReadBuffer) -> Option<T>) -> Result<T> {
        self.next_frame(|inner| match take(&mut inner.buffer) {
            Some(frame) => Some(Ok(frame)),
            None => inner.take_stream_end().map(Err),
        })
        .await
    }

    async fn send(&self, data: &[u8]) -> Result<()> {
        let (connection, session) = {
            let inner = self.shared.inner.lock();
            match (&inner.connection, inner.state) {
                (Some(connection), ConnectionState::Connected) => {
                    (connection.clone(), inner.connection_counter)
                }
                _ => return Err(SocketError::NotConnected),
            }
        };

        let write = async {
            let mut writer = connection.writer.lock().await;
            match writer.write_all(data).await {
                Ok(()) => writer.flush().await,
                Err(e) => Err(e),
            }
        };
        let result = tokio::select! {
            result = write => result,
            () = connection.closed() => return Err(SocketError::NotConnected),
        };

        match result {
            Ok(()) => {
                trace!(address = %self.shared.address, bytes = data.len(), "sent");
                Ok(())
            }
            Err(e) => {
                let err = SocketError::from(e);
                self.shared
                    .transport_ended(session, Cause::Failure(err.clone()));
                Err(err)
            }
        }
    }

    /// Write all of `data` to the transport.
    pub async fn write(&self, data: &[u8], timeout: Option<Duration>) -> Result<()> {
        self.ensure_open(false).await?;
        self.timed("write", timeout, self.send(data)).await
    }

    /// Write several chunks as one transport write.
    pub async fn writelines<I>(&self, lines: I, timeout: Option<Duration>) -> Result<()>
    where
        I: IntoIterator,
        I::Item: AsRef<[u8]>,
    {
        let data = join(lines);
        self.ensure_open(false).await?;
        self.timed("writelines", timeout, self.send(&data)).await
    }

    /// Read whatever is available, up to `max` bytes.
    ///
    /// Waits for at least one byte. An empty result means the peer closed
    /// the stream with nothing left buffered.
    pub async fn read(&self, max: usize, timeout: Option<Duration>) -> Result<Bytes> {
        self.ensure_open(true).await?;
        if max == 0 {
            return Ok(Bytes::new());
        }
        let read = self.read_frame(|buffer| buffer.take_some(max));
        match self.timed("read", timeout, read).await {
            Err(SocketError::ConnectionEof) => Ok(Bytes::new()),
            other => other,
        }
    }

    /// Read until the peer closes the stream and return everything received.
    pub async fn read_to_end(&self, timeout: Option<Duration>) -> Result<Bytes> {
        self.ensure_open(true).await?;
        let read = self.next_frame(|inner| {
            let end = inner.stream_end.as_ref()?;
            let result = match end {
                SocketError::ConnectionEof => Ok(inner.buffer.take_all()),
                other => Err(other.clone()),
            };
            inner.take_stream_end();
            Some(result)
        });
        self.timed("read_to_end", timeout, read).await
    }

    /// Read one newline-terminated line, newline included.
    pub async fn readline(&self, timeout: Option<Duration>) -> Result<Bytes> {
        self.readuntil(NEWLINE, timeout).await
    }

    /// Read up to and including `delimiter`.
    ///
    /// Fails with [`SocketError::ConnectionEof`] if the peer closes first;
    /// the unterminated tail is discarded.
    pub async fn readuntil(&self, delimiter: &[u8], timeout: Option<Duration>) -> Result<Bytes> {
        self.ensure_open(true).await?;
        let read = self.read_frame(|buffer| buffer.take_until(delimiter));
        self.timed("readuntil", timeout, read).await
    }

    /// Read exactly `n` bytes.
    pub async fn readexactly(&self, n: usize, timeout: Option<Duration>) -> Result<Bytes> {
        self.ensure_open(true).await?;
        let read = self.read_frame(|buffer| buffer.take_exact(n));
        self.timed("readexactly", timeout, read).await
    }

    /// Read `count` lines.
    ///
    /// The batch completes as a whole: on EOF or timeout no line is
    /// returned, and on timeout none is consumed either.
    pub async fn readlines(&self, count: usize, timeout: Option<Duration>) -> Result<Vec<Bytes>> {
        self.ensure_open(true).await?;
        let read = self.read_frame(|buffer| buffer.take_lines(NEWLINE, count));
        self.timed("readlines", timeout, read).await
    }

    /// Write a request and read one reply line.
    pub async fn write_readline(&self, data: &[u8], timeout: Option<Duration>) -> Result<Bytes> {
        self.ensure_open(false).await?;
        let exchange = async {
            self.send(data).await?;
            self.read_frame(|buffer| buffer.take_until(NEWLINE)).await
        };
        self.timed("write_readline", timeout, exchange).await
    }

    /// Write a request and read `count` reply lines.
    pub async fn write_readlines(
        &self,
        data: &[u8],
        count: usize,
        timeout: Option<Duration>,
    ) -> Result<Vec<Bytes>> {
        self.ensure_open(false).await?;
        let exchange = async {
            self.send(data).await?;
            self.read_frame(|buffer| buffer.take_lines(NEWLINE, count))
                .await
        };
        self.timed("write_readlines", timeout, exchange).await
    }

    /// Write several requests at once and read their replies.
    ///
    /// `count` defaults to the number of requests.
    pub async fn writelines_readlines<I>(
        &self,
        lines: I,
        count: Option<usize>,
        timeout: Option<Duration>,
    ) -> Result<Vec<Bytes>>
    where
        I: IntoIterator,
        I::Item: AsRef<[u8]>,
    {
        let mut requests = 0;
        let data = join(lines.into_iter().inspect(|_| requests += 1));
        let count = count.unwrap_or(requests);

        self.ensure_open(false).await?;
        let exchange = async {
            self.send(&data).await?;
            self.read_frame(|buffer| buffer.take_lines(NEWLINE, count))
                .await
        };
        self.timed("writelines_readlines", timeout, exchange).await
    }

    /// Iterate over incoming lines until the peer closes the stream.
    pub fn lines(&self) -> LineStream<'_> {
        LineStream::new(self)
    }

    /// Iterate over incoming `size`-byte blocks until the peer closes the stream.
    pub fn blocks(&self, size: usize) -> BlockStream<'_> {
        BlockStream::new(self, size)
    }
}

impl std::fmt::Debug for TcpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.shared.inner.lock();
        f.debug_struct("TcpClient")
            .field("address", &self.shared.address)
            .field("state", &inner.state)
            .field("connection_counter", &inner.connection_counter)
            .finish()
    }
}

fn join<I>(lines: I) -> BytesMut
where
    I: IntoIterator,
    I::Item: AsRef<[u8]>,
{
    let mut data = BytesMut::new();
    for line in lines {
        data.extend_from_slice(line.as_ref());
    }
    data
}

/// Classify a failed connect attempt.
fn connect_error(address: &str, err: io::Error) -> SocketError {
    match err.kind() {
        io::ErrorKind::TimedOut => {
            SocketError::ConnectionTimeout(format!("connect call timeout on '{address}'"))
        }
        _ => SocketError::ConnectionRefused(format!("{address}: {err}")),
    }
}
