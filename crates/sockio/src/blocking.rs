//! Synchronous facade over [`TcpClient`].
//!
//! An [`EventLoop`] runs a current-thread tokio runtime on a dedicated
//! background thread. [`BlockingTcpClient`] drives a [`TcpClient`] on such a
//! loop and blocks the calling thread until each operation completes, so the
//! client can be used from plain synchronous code.
//!
//! ```ignore
//! use sockio::blocking::BlockingTcpClient;
//! use sockio::TcpClientConfig;
//!
//! let client = BlockingTcpClient::new(TcpClientConfig::new("192.168.1.20", 5025))?;
//! let idn = client.write_readline(b"*idn?\n", None)?;
//! for line in &client {
//!     println!("{:?}", line?);
//! }
//! ```
//!
//! None of these methods may be called from inside an async context; they
//! panic there, as `tokio::runtime::Handle::block_on` does.

use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle};
use tokio::sync::oneshot;

use crate::callback::Callbacks;
use crate::client::TcpClient;
use crate::config::TcpClientConfig;
use crate::error::{Result, SocketError};
use crate::state::ConnectionState;

static GLOBAL_LOOP: OnceLock<EventLoop> = OnceLock::new();

struct LoopThread {
    handle: Handle,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for LoopThread {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.get_mut().take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.get_mut().take()
            && thread.thread().id() != std::thread::current().id()
        {
            let _ = thread.join();
        }
    }
}

/// A tokio event loop on its own thread.
///
/// Cloning shares the loop; the thread stops when the last clone is dropped.
#[derive(Clone)]
pub struct EventLoop {
    inner: Arc<LoopThread>,
}

impl EventLoop {
    /// Get the process-wide loop, starting it on first use.
    pub fn global() -> Result<&'static EventLoop> {
        if let Some(event_loop) = GLOBAL_LOOP.get() {
            return Ok(event_loop);
        }
        // Losing a race here drops the extra loop and uses the winner.
        let _ = GLOBAL_LOOP.set(EventLoop::new()?);
        GLOBAL_LOOP
            .get()
            .ok_or_else(|| SocketError::Connection("global event loop unavailable".into()))
    }

    /// Start a new loop thread.
    pub fn new() -> Result<Self> {
        let (handle_tx, handle_rx) = std::sync::mpsc::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let thread = std::thread::Builder::new()
            .name("sockio-loop".to_string())
            .spawn(move || {
                let runtime = match Builder::new_current_thread().enable_all().build() {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = handle_tx.send(Err(e.to_string()));
                        return;
                    }
                };
                let _ = handle_tx.send(Ok(runtime.handle().clone()));

                runtime.block_on(async {
                    let _ = shutdown_rx.await;
                });
                tracing::debug!("event loop stopped");
            })
            .map_err(|e| SocketError::Connection(format!("cannot start event loop: {e}")))?;

        let handle = handle_rx
            .recv()
            .map_err(|_| SocketError::Connection("event loop thread exited".into()))?
            .map_err(|e| SocketError::Connection(format!("cannot start event loop: {e}")))?;

        Ok(Self {
            inner: Arc::new(LoopThread {
                handle,
                shutdown_tx: Mutex::new(Some(shutdown_tx)),
                thread: Mutex::new(Some(thread)),
            }),
        })
    }

    /// Get a handle to the loop's runtime.
    pub fn handle(&self) -> &Handle {
        &self.inner.handle
    }

    /// Block the calling thread until `future` completes.
    ///
    /// I/O and timers are driven by the loop thread; spawned tasks run there.
    pub fn run<F: Future>(&self, future: F) -> F::Output {
        self.inner.handle.block_on(future)
    }

    /// Spawn `future` onto the loop thread without waiting for it.
    pub fn spawn<F>(&self, future: F) -> tokio::task::JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.inner.handle.spawn(future)
    }

    /// Create a blocking client bound to this loop.
    pub fn tcp(&self, config: TcpClientConfig) -> BlockingTcpClient {
        self.tcp_with_callbacks(config, Callbacks::default())
    }

    /// Create a blocking client with lifecycle hooks bound to this loop.
    pub fn tcp_with_callbacks(
        &self,
        config: TcpClientConfig,
        callbacks: Callbacks,
    ) -> BlockingTcpClient {
        BlockingTcpClient {
            client: TcpClient::with_callbacks(config, callbacks),
            event_loop: self.clone(),
        }
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop").finish_non_exhaustive()
    }
}

/// A [`TcpClient`] with blocking methods.
///
/// Semantics match the async methods of the same name.
#[derive(Clone, Debug)]
pub struct BlockingTcpClient {
    client: TcpClient,
    event_loop: EventLoop,
}

impl BlockingTcpClient {
    /// Create a client on the process-wide event loop.
    pub fn new(config: TcpClientConfig) -> Result<Self> {
        Ok(EventLoop::global()?.tcp(config))
    }

    /// Create a client with lifecycle hooks on the process-wide event loop.
    pub fn with_callbacks(config: TcpClientConfig, callbacks: Callbacks) -> Result<Self> {
        Ok(EventLoop::global()?.tcp_with_callbacks(config, callbacks))
    }

    /// Get the wrapped async client.
    pub fn client(&self) -> &TcpClient {
        &self.client
    }

    /// Get the loop this client runs on.
    pub fn event_loop(&self) -> &EventLoop {
        &self.event_loop
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.client.state()
    }

    /// Whether a transport is currently open.
    pub fn connected(&self) -> bool {
        self.client.connected()
    }

    /// Number of successful opens so far.
    pub fn connection_counter(&self) -> u64 {
        self.client.connection_counter()
    }

    /// Bytes received but not yet consumed.
    pub fn in_waiting(&self) -> usize {
        self.client.in_waiting()
    }

    /// Connect, failing if already connected or connecting.
    pub fn open(&self, timeout: Option<Duration>) -> Result<()> {
        self.event_loop.run(self.client.open(timeout))
    }

    /// Close the connection. Does nothing when already closed.
    pub fn close(&self) {
        self.event_loop.run(self.client.close())
    }

    /// Send `data`, reconnecting first if needed.
    pub fn write(&self, data: &[u8], timeout: Option<Duration>) -> Result<()> {
        self.event_loop.run(self.client.write(data, timeout))
    }

    /// Send each line in order.
    pub fn writelines<I>(&self, lines: I, timeout: Option<Duration>) -> Result<()>
    where
        I: IntoIterator,
        I::Item: AsRef<[u8]>,
    {
        self.event_loop.run(self.client.writelines(lines, timeout))
    }

    /// Read up to `max` bytes, waiting for at least one.
    pub fn read(&self, max: usize, timeout: Option<Duration>) -> Result<Bytes> {
        self.event_loop.run(self.client.read(max, timeout))
    }

    /// Read until the peer closes the stream.
    pub fn read_to_end(&self, timeout: Option<Duration>) -> Result<Bytes> {
        self.event_loop.run(self.client.read_to_end(timeout))
    }

    /// Read one `\n`-terminated line.
    pub fn readline(&self, timeout: Option<Duration>) -> Result<Bytes> {
        self.event_loop.run(self.client.readline(timeout))
    }

    /// Read up to and including `delimiter`.
    pub fn readuntil(&self, delimiter: &[u8], timeout: Option<Duration>) -> Result<Bytes> {
        self.event_loop.run(self.client.readuntil(delimiter, timeout))
    }

    /// Read exactly `n` bytes.
    pub fn readexactly(&self, n: usize, timeout: Option<Duration>) -> Result<Bytes> {
        self.event_loop.run(self.client.readexactly(n, timeout))
    }

    /// Read `count` lines at once.
    pub fn readlines(&self, count: usize, timeout: Option<Duration>) -> Result<Vec<Bytes>> {
        self.event_loop.run(self.client.readlines(count, timeout))
    }

    /// Send `data` and read one reply line.
    pub fn write_readline(&self, data: &[u8], timeout: Option<Duration>) -> Result<Bytes> {
        self.event_loop.run(self.client.write_readline(data, timeout))
    }

    /// Send `data` and read `count` reply lines.
    pub fn write_readlines(
        &self,
        data: &[u8],
        count: usize,
        timeout: Option<Duration>,
    ) -> Result<Vec<Bytes>> {
        self.event_loop
            .run(self.client.write_readlines(data, count, timeout))
    }

    /// Send each line and read the replies, one per line unless `count` is given.
    pub fn writelines_readlines<I>(
        &self,
        lines: I,
        count: Option<usize>,
        timeout: Option<Duration>,
    ) -> Result<Vec<Bytes>>
    where
        I: IntoIterator,
        I::Item: AsRef<[u8]>,
    {
        self.event_loop
            .run(self.client.writelines_readlines(lines, count, timeout))
    }

    /// Iterate over incoming lines until the peer closes the stream.
    pub fn lines(&self) -> Lines<'_> {
        Lines {
            client: self,
            done: false,
        }
    }
}

impl<'a> IntoIterator for &'a BlockingTcpClient {
    type Item = Result<Bytes>;
    type IntoIter = Lines<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.lines()
    }
}

/// Blocking line iterator. Ends when the peer closes the stream.
#[derive(Debug)]
pub struct Lines<'a> {
    client: &'a BlockingTcpClient,
    done: bool,
}

impl Iterator for Lines<'_> {
    type Item = Result<Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.client.readline(None) {
            Ok(line) => Some(Ok(line)),
            Err(SocketError::ConnectionEof) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_drives_timers_on_the_loop() {
        let event_loop = EventLoop::new().unwrap();
        let value = event_loop.run(async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            42
        });
        assert_eq!(value, 42);
    }

    #[test]
    fn spawned_task_completes() {
        let event_loop = EventLoop::new().unwrap();
        let task = event_loop.spawn(async { "done" });
        assert_eq!(event_loop.run(task).unwrap(), "done");
    }

    #[test]
    fn global_loop_is_shared() {
        let a = EventLoop::global().unwrap();
        let b = EventLoop::global().unwrap();
        assert!(std::ptr::eq(a, b));
    }

    #[test]
    fn disconnected_client_without_reconnect() {
        let event_loop = EventLoop::new().unwrap();
        let client = event_loop.tcp(TcpClientConfig::new("127.0.0.1", 1).auto_reconnect(false));
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(matches!(
            client.readline(None).unwrap_err(),
            SocketError::NotConnected
        ));
        client.close();
        assert_eq!(client.connection_counter(), 0);
    }
}
