//! Newline-delimited JSON framing
//!
//! The dispatcher only sees [`MessageStream`]; `LineTransport` implements
//! it over any tokio reader/writer pair (stdio, sockets, pipes, duplex).
//! The two halves are also usable on their own, which is how the backend
//! process channel drives a child's stdout and stdin from separate tasks.

use crate::protocol::{InvalidMessage, Message, RpcError};
use async_trait::async_trait;
use serde::Serialize;
use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// One inbound line: a classified message, or the error to answer it with
pub type Frame = Result<Message, InvalidMessage>;

/// Bidirectional message stream consumed by the protocol server
#[async_trait]
pub trait MessageStream: Send {
    /// Next inbound frame, `Ok(None)` at end of input
    async fn recv(&mut self) -> io::Result<Option<Frame>>;

    /// Write one message as a single line and flush
    async fn send(&mut self, message: &Message) -> io::Result<()>;

    /// Flush and close the outbound side. Safe to call more than once.
    async fn close(&mut self) -> io::Result<()>;
}

/// Reading half: one JSON value per line
pub struct LineReader<R> {
    reader: R,
    buf: Vec<u8>,
}

impl<R: AsyncBufRead + Unpin + Send> LineReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::new(),
        }
    }

    /// Read the next non-blank line and classify it. A line that is not
    /// valid UTF-8 JSON yields a ParseError frame; reading continues with
    /// the following line on the next call.
    pub async fn next_frame(&mut self) -> io::Result<Option<Frame>> {
        loop {
            self.buf.clear();
            let n = self.reader.read_until(b'\n', &mut self.buf).await?;
            if n == 0 {
                return Ok(None);
            }

            let line = match std::str::from_utf8(&self.buf) {
                Ok(line) => line.trim(),
                Err(e) => {
                    return Ok(Some(Err(InvalidMessage {
                        id: None,
                        error: RpcError::parse_error(e),
                    })));
                }
            };
            if line.is_empty() {
                continue;
            }

            let frame = match serde_json::from_str::<serde_json::Value>(line) {
                Ok(value) => Message::from_value(value),
                Err(e) => Err(InvalidMessage {
                    id: None,
                    error: RpcError::parse_error(e),
                }),
            };
            return Ok(Some(frame));
        }
    }
}

/// Writing half: serializes one value per line
pub struct LineWriter<W> {
    writer: W,
    closed: bool,
}

impl<W: AsyncWrite + Unpin + Send> LineWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            closed: false,
        }
    }

    pub async fn write<T: Serialize + ?Sized>(&mut self, value: &T) -> io::Result<()> {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "transport closed"));
        }
        let mut line = serde_json::to_vec(value)?;
        line.push(b'\n');
        self.writer.write_all(&line).await?;
        self.writer.flush().await
    }

    pub async fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.writer.flush().await?;
        self.writer.shutdown().await
    }
}

/// [`MessageStream`] over a reader/writer pair
pub struct LineTransport<R, W> {
    reader: LineReader<R>,
    writer: LineWriter<W>,
}

impl<R, W> LineTransport<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: LineReader::new(reader),
            writer: LineWriter::new(writer),
        }
    }
}

/// Transport over the process's own stdin/stdout
pub fn stdio() -> LineTransport<BufReader<tokio::io::Stdin>, tokio::io::Stdout> {
    LineTransport::new(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
}

#[async_trait]
impl<R, W> MessageStream for LineTransport<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn recv(&mut self) -> io::Result<Option<Frame>> {
        self.reader.next_frame().await
    }

    async fn send(&mut self, message: &Message) -> io::Result<()> {
        self.writer.write(message).await
    }

    async fn close(&mut self) -> io::Result<()> {
        self.writer.close().await
    }
}
