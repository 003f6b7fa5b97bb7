//! The abstract byte-stream session under the transport.
//!
//! The session core never touches sockets: it hands encoded packets to an
//! [`IoSession`] and receives arriving bytes through
//! [`Session::data_received`]. [`TcpIoSession`] adapts a tokio
//! [`TcpStream`] with a dedicated writer task, and [`run_session`] pumps
//! reads and periodic ticks. [`LoopbackIoSession`] is a queue-backed
//! transport for tests and in-process wiring.
//!
//! [`Session::data_received`]: crate::ssh::session::Session::data_received

use crate::ssh::buffer::Buffer;
use crate::ssh::future::{completed_write, failed_write, WriteFuture};
use crate::ssh::session::Session;
use skiff_platform::{SkiffError, SkiffResult};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Read buffer size for the TCP pump.
const READ_BUFFER_SIZE: usize = 32 * 1024;

/// Interval between session maintenance ticks (timeouts, rekey).
const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// An established byte stream the session writes to.
pub trait IoSession: Send + Sync {
    /// Queues the buffer's readable bytes for transmission.
    ///
    /// The returned future completes when the bytes reached the peer-facing
    /// layer (or failed to).
    fn write(&self, buffer: Buffer) -> Arc<WriteFuture>;

    /// Closes the stream.
    fn close(&self);

    /// Whether the stream is still open.
    fn is_open(&self) -> bool;
}

enum WriteCommand {
    Data(Vec<u8>, Arc<WriteFuture>),
    Shutdown,
}

/// Tokio TCP adapter with an ordered writer task.
pub struct TcpIoSession {
    tx: mpsc::UnboundedSender<WriteCommand>,
    open: Arc<AtomicBool>,
}

impl TcpIoSession {
    /// Wraps the write half of a stream; spawns the writer task on the
    /// current runtime.
    pub fn new(mut write_half: OwnedWriteHalf) -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<WriteCommand>();
        let open = Arc::new(AtomicBool::new(true));
        let open_flag = Arc::clone(&open);

        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                match command {
                    WriteCommand::Data(data, future) => {
                        match write_half.write_all(&data).await {
                            Ok(()) => {
                                future.complete(());
                            }
                            Err(err) => {
                                warn!(%err, "Write failed, stopping writer");
                                future.fail(SkiffError::Io(err));
                                break;
                            }
                        }
                    }
                    WriteCommand::Shutdown => break,
                }
            }
            open_flag.store(false, Ordering::Release);
            let _ = write_half.shutdown().await;
            debug!("Writer task stopped");
        });

        Arc::new(Self { tx, open })
    }
}

impl IoSession for TcpIoSession {
    fn write(&self, buffer: Buffer) -> Arc<WriteFuture> {
        let future = WriteFuture::new();
        if !self.is_open() {
            future.fail(SkiffError::Closed("Connection closed".to_string()));
            return future;
        }
        let data = buffer.to_payload();
        if self
            .tx
            .send(WriteCommand::Data(data, Arc::clone(&future)))
            .is_err()
        {
            future.fail(SkiffError::Closed("Connection closed".to_string()));
        }
        future
    }

    fn close(&self) {
        self.open.store(false, Ordering::Release);
        let _ = self.tx.send(WriteCommand::Shutdown);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

/// Attaches a [`Session`] to a connected TCP stream and pumps it until the
/// connection or the session ends.
///
/// Creates the session with `make_session` (typically a closure around
/// [`Session::new`]), then loops reads into
/// [`Session::data_received`] and fires [`Session::tick`] every second.
///
/// [`Session::tick`]: crate::ssh::session::Session::tick
pub async fn run_session<F>(stream: TcpStream, make_session: F) -> SkiffResult<()>
where
    F: FnOnce(Arc<dyn IoSession>) -> SkiffResult<Arc<Session>>,
{
    let (mut read_half, write_half) = stream.into_split();
    let io = TcpIoSession::new(write_half);
    let session = make_session(io.clone() as Arc<dyn IoSession>)?;

    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut ticker = tokio::time::interval(TICK_INTERVAL);
    loop {
        tokio::select! {
            read = read_half.read(&mut buf) => {
                match read {
                    Ok(0) => {
                        debug!("Peer closed the connection");
                        session.close(true);
                        return Ok(());
                    }
                    Ok(n) => {
                        if let Err(err) = session.data_received(&buf[..n]) {
                            return Err(err);
                        }
                    }
                    Err(err) => {
                        session.close(true);
                        return Err(SkiffError::Io(err));
                    }
                }
            }
            _ = ticker.tick() => {
                session.tick()?;
            }
        }
        if session.is_closing() {
            return Ok(());
        }
    }
}

/// Queue-backed transport: writes land in a local queue the test (or
/// embedding) drains and delivers to the peer session itself.
///
/// Write futures complete at enqueue time; wire order is the queue order.
pub struct LoopbackIoSession {
    queue: Mutex<VecDeque<Vec<u8>>>,
    open: AtomicBool,
}

impl LoopbackIoSession {
    /// Creates an open loopback transport.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
            open: AtomicBool::new(true),
        })
    }

    /// Removes and returns the oldest written datagram.
    pub fn pop(&self) -> Option<Vec<u8>> {
        self.queue.lock().expect("loopback poisoned").pop_front()
    }

    /// Drains everything written so far into one byte vector.
    pub fn drain(&self) -> Vec<u8> {
        let mut queue = self.queue.lock().expect("loopback poisoned");
        let mut all = Vec::new();
        while let Some(chunk) = queue.pop_front() {
            all.extend_from_slice(&chunk);
        }
        all
    }

    /// Number of queued writes.
    pub fn len(&self) -> usize {
        self.queue.lock().expect("loopback poisoned").len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl IoSession for LoopbackIoSession {
    fn write(&self, buffer: Buffer) -> Arc<WriteFuture> {
        if !self.is_open() {
            return failed_write(SkiffError::Closed("Connection closed".to_string()));
        }
        self.queue
            .lock()
            .expect("loopback poisoned")
            .push_back(buffer.to_payload());
        completed_write()
    }

    fn close(&self) {
        self.open.store(false, Ordering::Release);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}
