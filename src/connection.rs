//! One task per connected client.
//!
//! The task owns the socket: it splits client bytes into commands and
//! submits them to the broker, and writes back whatever reply bytes the
//! broker routes to this connection.

use bytes::BytesMut;
use futures::StreamExt;
use tokio::{io::AsyncWriteExt, net::UnixStream, sync::mpsc};
use tokio_util::codec::{Decoder, FramedRead};
use tracing::{info, warn};

use crate::broker::{BrokerHandle, ConnectionId};

/// A command may grow to this many bytes, newline included. A client
/// reaching the limit with no newline in sight is violating the
/// protocol.
pub(crate) const MAX_COMMAND_LENGTH: usize = 64;

/// Splits the client byte stream into commands.
///
/// A command is any prefix terminated by `\n`. The newline stays in the
/// yielded frame, since the device expects it on the wire.
#[derive(Debug, Default)]
pub(crate) struct CommandCodec {
    /// How far we have looked for a newline into the buffer.
    cursor: usize,
}

/// Raised by [`CommandCodec`] when a client breaks framing.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CommandError {
    /// The command accumulator filled up without a terminator.
    #[error("Protocol error, command too long")]
    TooLong,

    /// Underlying IO problem.
    #[error("Underlying IO problem")]
    Io(#[from] std::io::Error),
}

impl Decoder for CommandCodec {
    type Item = Vec<u8>;
    type Error = CommandError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let look_at = &src[self.cursor..];

        if let Some(position) = look_at.iter().position(|&byte| byte == b'\n') {
            // The position within the whole buffer, since we might have
            // started looking past the start.
            let terminator = self.cursor + position;
            self.cursor = 0;

            if terminator + 1 > MAX_COMMAND_LENGTH {
                return Err(CommandError::TooLong);
            }

            let command = src.split_to(terminator + 1);

            Ok(Some(command[..].to_vec()))
        } else {
            // No full command yet; remember not to re-scan these bytes.
            self.cursor = src.len();

            if src.len() >= MAX_COMMAND_LENGTH {
                return Err(CommandError::TooLong);
            }

            Ok(None)
        }
    }
}

/// Attach a freshly accepted client to the broker.
///
/// The spawned task lives until EOF, a socket error, a protocol
/// violation, or until the broker drops the reply channel.
pub(crate) fn spawn(id: ConnectionId, stream: UnixStream, broker: BrokerHandle) {
    let (replies_tx, replies_rx) = mpsc::unbounded_channel();

    broker.register(id, replies_tx);

    tokio::spawn(run(id, stream, broker, replies_rx));
}

async fn run(
    id: ConnectionId,
    stream: UnixStream,
    broker: BrokerHandle,
    mut replies: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut commands = FramedRead::new(read_half, CommandCodec::default());

    loop {
        tokio::select! {
            frame = commands.next() => match frame {
                Some(Ok(command)) => broker.submit(id, command),
                Some(Err(e)) => {
                    warn!(%id, "{e}, closing connection");
                    break;
                }
                None => {
                    info!(%id, "Connection closed");
                    break;
                }
            },
            reply = replies.recv() => match reply {
                Some(bytes) => {
                    if write_half.write_all(&bytes).await.is_err() {
                        info!(%id, "Connection closed while replying");
                        break;
                    }
                }
                // The broker dropped us.
                None => break,
            },
        }
    }

    broker.disconnected(id);
}
