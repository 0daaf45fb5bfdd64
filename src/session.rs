//! Per-connection session: a command handler paired with a status broadcaster.
//!
//! Both halves share the connection's write side behind an async mutex so a
//! broadcast line never interleaves with a command reply. When the handler
//! stops reading, the broadcaster is cancelled and joined before the
//! connection is released.

use crate::protocol::{format_status, ProtocolError, Request, StatusLine, ERROR_REPLY, MAX_LINE_LEN};
use crate::simulation::{Simulation, Snapshot};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

const MIN_STATUS_INTERVAL: Duration = Duration::from_millis(1);

// A full line plus "\r\n".
const LINE_READ_LIMIT: u64 = (MAX_LINE_LEN + 2) as u64;

type SharedWriter<W> = Arc<Mutex<W>>;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("connection I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitLine,
    Processing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reply {
    Status(Snapshot),
    Error,
}

impl Reply {
    pub fn to_line(&self) -> Result<StatusLine, ProtocolError> {
        match self {
            Reply::Status(snapshot) => format_status(snapshot),
            Reply::Error => {
                let mut line = StatusLine::new();
                line.push_str(ERROR_REPLY);
                Ok(line)
            }
        }
    }
}

/// Applies one inbound line to the simulation and builds the reply.
pub fn respond(sim: &Simulation, raw: &str) -> Result<Reply, ProtocolError> {
    match raw.parse::<Request>()? {
        Request::Control(mode) => {
            sim.set_mode(mode);
            Ok(Reply::Status(sim.snapshot()))
        }
        Request::Status => Ok(Reply::Status(sim.snapshot())),
    }
}

pub struct Session {
    sim: Arc<Simulation>,
    peer: SocketAddr,
    status_interval: Duration,
    state: SessionState,
}

impl Session {
    pub fn new(sim: Arc<Simulation>, peer: SocketAddr, status_interval: Duration) -> Self {
        Self {
            sim,
            peer,
            status_interval: status_interval.max(MIN_STATUS_INTERVAL),
            state: SessionState::AwaitLine,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub async fn serve(self, stream: TcpStream) -> Result<(), SessionError> {
        let (reader, writer) = stream.into_split();
        self.run(reader, writer).await
    }

    /// Drives the session until the peer disconnects or I/O fails.
    pub async fn run<R, W>(mut self, reader: R, writer: W) -> Result<(), SessionError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let writer = Arc::new(Mutex::new(writer));
        let broadcaster = tokio::spawn(broadcast_status(
            Arc::clone(&self.sim),
            Arc::clone(&writer),
            self.status_interval,
            self.peer,
        ));

        let result = self.handle_lines(reader, &writer).await;
        self.state = SessionState::Closed;

        broadcaster.abort();
        if let Err(e) = broadcaster.await {
            if !e.is_cancelled() {
                warn!(peer = %self.peer, "status broadcaster failed: {}", e);
            }
        }

        match &result {
            Ok(()) => info!(peer = %self.peer, "has disconnected"),
            Err(e) => warn!(peer = %self.peer, "session closed: {}", e),
        }
        result
    }

    async fn handle_lines<R, W>(
        &mut self,
        reader: R,
        writer: &SharedWriter<W>,
    ) -> Result<(), SessionError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();

        loop {
            self.state = SessionState::AwaitLine;
            let inbound = read_line_bounded(&mut reader, &mut buf).await?;

            self.state = SessionState::Processing;
            let reply = match inbound {
                Inbound::Eof => return Ok(()),
                Inbound::Line => {
                    let raw = String::from_utf8_lossy(&buf);
                    debug!(peer = %self.peer, "<< {}", raw.trim_end());
                    match respond(&self.sim, &raw) {
                        Ok(reply) => reply,
                        Err(e) => {
                            warn!(peer = %self.peer, "{}", e);
                            Reply::Error
                        }
                    }
                }
                Inbound::Overlong => {
                    warn!(peer = %self.peer, "{}", ProtocolError::MessageTooLarge(buf.len()));
                    Reply::Error
                }
            };

            let line = reply.to_line()?;
            write_line(writer, &line).await?;
            debug!(peer = %self.peer, ">> {}", line);

            if inbound == Inbound::Overlong {
                skip_rest_of_line(&mut reader).await?;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Inbound {
    Eof,
    Line,
    /// The line limit was reached without a terminator.
    Overlong,
}

/// Reads one line into `buf`, never buffering more than [`LINE_READ_LIMIT`]
/// bytes.
async fn read_line_bounded<R>(reader: &mut R, buf: &mut Vec<u8>) -> io::Result<Inbound>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let read = (&mut *reader).take(LINE_READ_LIMIT).read_until(b'\n', buf).await?;
    if read == 0 {
        Ok(Inbound::Eof)
    } else if buf.last() == Some(&b'\n') || (read as u64) < LINE_READ_LIMIT {
        Ok(Inbound::Line)
    } else {
        Ok(Inbound::Overlong)
    }
}

/// Discards input up to and including the next newline.
async fn skip_rest_of_line<R>(reader: &mut R) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let (used, done) = {
            let available = reader.fill_buf().await?;
            if available.is_empty() {
                return Ok(());
            }
            match available.iter().position(|&b| b == b'\n') {
                Some(pos) => (pos + 1, true),
                None => (available.len(), false),
            }
        };
        reader.consume(used);
        if done {
            return Ok(());
        }
    }
}

async fn write_line<W>(writer: &SharedWriter<W>, line: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut guard = writer.lock().await;
    guard.write_all(line.as_bytes()).await?;
    guard.write_all(b"\n").await?;
    guard.flush().await
}

/// Pushes a status line every `interval` until a write fails.
async fn broadcast_status<W>(
    sim: Arc<Simulation>,
    writer: SharedWriter<W>,
    interval: Duration,
    peer: SocketAddr,
) where
    W: AsyncWrite + Unpin,
{
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let line = match format_status(&sim.snapshot()) {
            Ok(line) => line,
            Err(e) => {
                warn!(%peer, "cannot format status: {}", e);
                continue;
            }
        };
        if let Err(e) = write_line(&writer, &line).await {
            warn!(%peer, "error sending status: {}", e);
            break;
        }
        debug!(%peer, ">> {}", line);
    }
}
