use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::select;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::IngestError;
use crate::listener::{SourceEvent, SourceListener};

/// Line channel capacity between the reader task and the batch loop
const LINE_CHANNEL_CAPACITY: usize = 10_000;

/// How long `close` waits for the reader task before aborting it
const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(2);

/// A source of newline-delimited text records
#[async_trait]
pub trait LineSource: Send {
    /// Human-readable identity, e.g. `localhost:9000`
    fn name(&self) -> &str;

    /// Register a listener for error/stop events. Must be called before `connect`.
    fn add_listener(&mut self, listener: Arc<dyn SourceListener>);

    /// Open the source and start reading on a separate task
    async fn connect(&mut self) -> Result<(), IngestError>;

    /// Take the receiving end of the line stream. Returns `None` after the first call.
    fn lines(&mut self) -> Option<mpsc::Receiver<String>>;

    /// Whether the reader is currently attached to the source
    fn is_connected(&self) -> bool {
        self.connected_handle().load(Ordering::SeqCst)
    }

    /// Shared connection flag, for readiness checks
    fn connected_handle(&self) -> Arc<AtomicBool>;

    /// Stop the reader task, interrupting it if it does not finish in time
    async fn close(&mut self);
}

/// Reads lines from a plain TCP connection
pub struct TcpLineSource {
    addr: String,
    listeners: Vec<Arc<dyn SourceListener>>,
    tx: Option<mpsc::Sender<String>>,
    rx: Option<mpsc::Receiver<String>>,
    reader: Option<JoinHandle<()>>,
    stop: CancellationToken,
    connected: Arc<AtomicBool>,
    stop_grace: Duration,
}

impl TcpLineSource {
    pub fn new(addr: impl Into<String>) -> Self {
        let (tx, rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
        Self {
            addr: addr.into(),
            listeners: Vec::new(),
            tx: Some(tx),
            rx: Some(rx),
            reader: None,
            stop: CancellationToken::new(),
            connected: Arc::new(AtomicBool::new(false)),
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }
}

#[async_trait]
impl LineSource for TcpLineSource {
    fn name(&self) -> &str {
        &self.addr
    }

    fn add_listener(&mut self, listener: Arc<dyn SourceListener>) {
        self.listeners.push(listener);
    }

    async fn connect(&mut self) -> Result<(), IngestError> {
        let tx = self.tx.take().ok_or(IngestError::AlreadyStarted)?;

        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| IngestError::ConnectionFailed {
                addr: self.addr.clone(),
                reason: e.to_string(),
            })?;

        info!(addr = %self.addr, "Connected to line source");
        self.connected.store(true, Ordering::SeqCst);

        let reader = LineReader {
            addr: self.addr.clone(),
            listeners: self.listeners.clone(),
            stop: self.stop.clone(),
            connected: Arc::clone(&self.connected),
        };
        self.reader = Some(tokio::spawn(reader.run(stream, tx)));

        Ok(())
    }

    fn lines(&mut self) -> Option<mpsc::Receiver<String>> {
        self.rx.take()
    }

    fn connected_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.connected)
    }

    async fn close(&mut self) {
        self.stop.cancel();
        self.tx = None;

        if let Some(mut handle) = self.reader.take() {
            match tokio::time::timeout(self.stop_grace, &mut handle).await {
                Ok(_) => debug!(addr = %self.addr, "Reader task finished"),
                Err(_) => {
                    warn!(addr = %self.addr, "Reader task did not stop in time, aborting");
                    handle.abort();
                }
            }
        }
        self.connected.store(false, Ordering::SeqCst);
    }
}

/// State moved into the spawned reader task
struct LineReader {
    addr: String,
    listeners: Vec<Arc<dyn SourceListener>>,
    stop: CancellationToken,
    connected: Arc<AtomicBool>,
}

enum ReadEnd {
    Stopped,
    Failed(String),
}

impl LineReader {
    async fn run(self, stream: TcpStream, tx: mpsc::Sender<String>) {
        let end = self.pump(stream, tx).await;
        self.connected.store(false, Ordering::SeqCst);

        match end {
            ReadEnd::Stopped => {
                let event = SourceEvent::Stopped {
                    source: self.addr.clone(),
                };
                for listener in &self.listeners {
                    listener.on_stopped(&event);
                }
            }
            ReadEnd::Failed(message) => {
                let event = SourceEvent::Error {
                    source: self.addr.clone(),
                    message,
                };
                for listener in &self.listeners {
                    listener.on_error(&event);
                }
            }
        }
    }

    async fn pump(&self, stream: TcpStream, tx: mpsc::Sender<String>) -> ReadEnd {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();

        loop {
            buf.clear();
            let read = select! {
                _ = self.stop.cancelled() => return ReadEnd::Stopped,
                read = reader.read_until(b'\n', &mut buf) => read,
            };

            match read {
                Ok(0) => {
                    info!(addr = %self.addr, "Line source closed by peer");
                    return ReadEnd::Stopped;
                }
                Ok(_) => {
                    let line = decode_line(&buf);
                    select! {
                        _ = self.stop.cancelled() => return ReadEnd::Stopped,
                        sent = tx.send(line) => {
                            if sent.is_err() {
                                return ReadEnd::Stopped;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(addr = %self.addr, error = %e, "Read from line source failed");
                    return ReadEnd::Failed(e.to_string());
                }
            }
        }
    }
}

/// Strip the line terminator; invalid UTF-8 is replaced rather than rejected
fn decode_line(buf: &[u8]) -> String {
    let mut end = buf.len();
    if end > 0 && buf[end - 1] == b'\n' {
        end -= 1;
    }
    if end > 0 && buf[end - 1] == b'\r' {
        end -= 1;
    }
    String::from_utf8_lossy(&buf[..end]).into_owned()
}
