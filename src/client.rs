//! A client for the broker's socket protocol.
//!
//! Used by the auxiliary tools (status collector, calibrator) and by the
//! test suite. One request is a single newline-terminated command; the
//! reply is the device's envelope streamed back verbatim.

use std::path::Path;

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        unix::{OwnedReadHalf, OwnedWriteHalf},
        UnixStream,
    },
};
use tracing::warn;

use crate::error::Error;

/// A parsed reply envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// False when the reply was tagged `#ERROR`, i.e. the request failed
    /// and the body (if any) is error detail.
    pub ok: bool,

    /// Body lines, with line endings stripped.
    pub body: Vec<String>,
}

/// A connection to a running broker.
///
/// Requests may be pipelined; replies come back in submission order.
#[derive(Debug)]
pub struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Client {
    /// Connect to the broker listening at `socket`.
    pub async fn connect<P: AsRef<Path>>(socket: P) -> Result<Self, Error> {
        let stream = UnixStream::connect(socket.as_ref()).await?;
        let (read_half, writer) = stream.into_split();

        Ok(Self {
            reader: BufReader::new(read_half),
            writer,
        })
    }

    /// Send one command and read back its full reply.
    ///
    /// The newline terminator is appended here; `command` itself must
    /// fit the 63 byte request limit.
    pub async fn send(&mut self, command: &str) -> Result<Reply, Error> {
        self.writer.write_all(command.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;

        self.read_reply().await
    }

    /// Read one reply envelope off the wire.
    pub async fn read_reply(&mut self) -> Result<Reply, Error> {
        let mut ok = true;
        let mut received_header = false;
        let mut body = Vec::new();

        loop {
            let mut line = String::new();
            if self.reader.read_line(&mut line).await? == 0 {
                return Err(Error::Io(std::io::ErrorKind::UnexpectedEof.into()));
            }

            // Lines come `\r\n`-terminated off the wire.
            let line = line.trim_end_matches(|c| c == '\r' || c == '\n');

            match line {
                "#START" => received_header = true,
                "#ERROR" => {
                    received_header = true;
                    ok = false;
                }
                "#STOP" => break,
                body_line => {
                    if !received_header {
                        warn!("Received response line before header start: {body_line}");
                        continue;
                    }

                    body.push(body_line.to_owned());
                }
            }
        }

        Ok(Reply { ok, body })
    }
}
