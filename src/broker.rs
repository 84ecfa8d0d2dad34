//! The broker owns the serial port and decides whose command is on the
//! wire.
//!
//! Exactly one command is in flight at any time; further submissions
//! queue in FIFO order across all connections. Reply bytes stream
//! verbatim to the connection whose command is active, and the
//! `\r\n#STOP\r\n` trailer hands the wire to the next queued command.
//! A reply not finished within [`RESPONSE_TIMEOUT`] fails the active
//! command with a synthesized `#ERROR\r\n#STOP\r\n` envelope and resets
//! the device.

use std::{
    collections::{HashMap, VecDeque},
    fmt::Display,
    path::PathBuf,
    time::Duration,
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    process::Command,
    sync::mpsc,
    time::Instant,
};
use tracing::{debug, error, info, warn};

use crate::{
    device::{DeviceLink, DeviceStream},
    envelope::{ResponseAccumulator, ERROR_REPLY},
    error::Error,
};

/// How long the device may take to finish a reply.
pub(crate) const RESPONSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Safety cap on commands waiting for the wire. A connection pushing the
/// queue past this is treated as violating the protocol and dropped.
pub(crate) const MAX_PENDING_COMMANDS: usize = 1024;

/// Handle naming one accepted client connection.
///
/// The broker resolves handles through its connection table; a handle
/// whose connection has closed simply no longer resolves, and whatever
/// was owed to it is discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn new(id: u64) -> Self {
        Self(id)
    }
}

impl Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "client#{}", self.0)
    }
}

/// A command waiting for the wire.
#[derive(Debug)]
struct PendingCommand {
    /// Who gets the reply.
    connection: ConnectionId,

    /// The command bytes, newline included.
    command: Vec<u8>,
}

#[derive(Debug)]
enum BrokerMessage {
    /// A connection was accepted; its replies go into the sender.
    Register {
        id: ConnectionId,
        replies: mpsc::UnboundedSender<Vec<u8>>,
    },

    /// A connection submitted one complete command.
    Submit { id: ConnectionId, command: Vec<u8> },

    /// A connection is gone (EOF, error or protocol violation).
    Disconnected { id: ConnectionId },
}

/// Cloneable handle reaching the broker task.
#[derive(Debug, Clone)]
pub(crate) struct BrokerHandle(mpsc::UnboundedSender<BrokerMessage>);

impl BrokerHandle {
    /// Open the device through `link` and spawn the broker task.
    pub(crate) fn new(
        mut link: Box<dyn DeviceLink>,
        reset_hook: Option<PathBuf>,
    ) -> Result<Self, Error> {
        let port = link.open()?;

        let (tx, rx) = mpsc::unbounded_channel();

        let mut broker = Broker {
            messages: rx,
            connections: HashMap::new(),
            active: None,
            queue: VecDeque::new(),
            response: ResponseAccumulator::default(),
            port: Some(port),
            link,
            reset_hook,
            deadline: None,
            unsolicited_warned: false,
        };

        tokio::spawn(async move { broker.run().await });

        Ok(BrokerHandle(tx))
    }

    /// Tell the broker about an accepted connection.
    pub(crate) fn register(&self, id: ConnectionId, replies: mpsc::UnboundedSender<Vec<u8>>) {
        self.send(BrokerMessage::Register { id, replies });
    }

    /// Submit one complete command on behalf of a connection.
    pub(crate) fn submit(&self, id: ConnectionId, command: Vec<u8>) {
        self.send(BrokerMessage::Submit { id, command });
    }

    /// Tell the broker a connection is gone.
    pub(crate) fn disconnected(&self, id: ConnectionId) {
        self.send(BrokerMessage::Disconnected { id });
    }

    fn send(&self, message: BrokerMessage) {
        self.0.send(message).expect("Broker should be alive");
    }
}

/// What woke the broker up.
enum Tick {
    Message(Option<BrokerMessage>),
    Serial(std::io::Result<Vec<u8>>),
    Timeout,
}

struct Broker {
    messages: mpsc::UnboundedReceiver<BrokerMessage>,

    /// Live connections. A reply routed to an id not in here goes
    /// nowhere.
    connections: HashMap<ConnectionId, mpsc::UnboundedSender<Vec<u8>>>,

    /// The connection owed the reply currently in flight.
    active: Option<ConnectionId>,

    /// Commands waiting for the wire, oldest first.
    queue: VecDeque<PendingCommand>,

    /// Reply bytes seen so far, for end-of-message detection.
    response: ResponseAccumulator,

    /// The open port. None only while a failed reset has left the
    /// device closed; the response timer retries the reset.
    port: Option<DeviceStream>,

    /// How to reopen the device.
    link: Box<dyn DeviceLink>,

    /// Executable run between closing and reopening the device.
    reset_hook: Option<PathBuf>,

    /// Response deadline. Set iff a command is in flight.
    deadline: Option<Instant>,

    unsolicited_warned: bool,
}

/// Read whatever is ready on the port.
///
/// Pends forever while the port is closed, so the select loop simply
/// ignores the device until a reset brings it back.
async fn read_port(port: Option<&mut DeviceStream>) -> std::io::Result<Vec<u8>> {
    let Some(port) = port else {
        return futures::future::pending().await;
    };

    let mut buffer = vec![0u8; 512];
    let n = port.read(&mut buffer).await?;

    if n == 0 {
        return Err(std::io::ErrorKind::UnexpectedEof.into());
    }

    buffer.truncate(n);
    Ok(buffer)
}

/// The one-shot response timer. Pends forever while no command is in
/// flight.
async fn response_timer(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => futures::future::pending().await,
    }
}

impl Broker {
    async fn run(&mut self) {
        info!("Entering dispatch loop");

        loop {
            let tick = {
                let deadline = self.deadline;

                tokio::select! {
                    message = self.messages.recv() => Tick::Message(message),
                    bytes = read_port(self.port.as_mut()) => Tick::Serial(bytes),
                    _ = response_timer(deadline) => Tick::Timeout,
                }
            };

            match tick {
                Tick::Message(Some(message)) => self.handle_message(message).await,
                Tick::Message(None) => {
                    // Every handle is gone, so is the listener.
                    debug!("All broker handles dropped, stopping");
                    break;
                }
                Tick::Serial(Ok(bytes)) => self.handle_reply_bytes(&bytes).await,
                Tick::Serial(Err(e)) => {
                    error!("Error event detected on serial port: {e}");
                    self.fail_and_reset().await;
                }
                Tick::Timeout => {
                    warn!("Response timeout, resetting device");
                    self.fail_and_reset().await;
                }
            }
        }
    }

    async fn handle_message(&mut self, message: BrokerMessage) {
        match message {
            BrokerMessage::Register { id, replies } => {
                info!(%id, "Accepted new connection");
                self.connections.insert(id, replies);
            }
            BrokerMessage::Submit { id, command } => self.submit(id, command).await,
            BrokerMessage::Disconnected { id } => {
                // The active slot and the queue keep their handles; a
                // handle that no longer resolves routes its reply
                // nowhere.
                self.connections.remove(&id);
            }
        }
    }

    /// Send a command to the device, or queue it while another command
    /// is being processed.
    async fn submit(&mut self, id: ConnectionId, command: Vec<u8>) {
        if self.active.is_some() {
            if self.queue.len() >= MAX_PENDING_COMMANDS {
                error!(%id, "Pending command queue full, dropping connection");
                self.connections.remove(&id);
                return;
            }

            self.queue.push_back(PendingCommand {
                connection: id,
                command,
            });

            debug!(%id, "Command queued");
        } else {
            self.dispatch(id, &command).await;
        }
    }

    /// Put a command on the wire and open its response window.
    async fn dispatch(&mut self, id: ConnectionId, command: &[u8]) {
        self.active = Some(id);
        self.deadline = Some(Instant::now() + RESPONSE_TIMEOUT);
        self.unsolicited_warned = false;

        let written = match self.port.as_mut() {
            Some(port) => port.write_all(command).await,
            None => Err(std::io::ErrorKind::NotConnected.into()),
        };

        match written {
            Ok(()) => debug!(%id, "Command sent to device"),
            Err(e) => {
                error!(%id, "Could not write to device: {e}");
                // Fold the failed write into the timeout path: the
                // submitter gets its error envelope and the device gets
                // recovered there, without recursing through the
                // scheduler.
                self.deadline = Some(Instant::now());
            }
        }
    }

    /// Bytes arrived from the device.
    async fn handle_reply_bytes(&mut self, bytes: &[u8]) {
        let Some(active) = self.active else {
            // Nothing was requested; discard.
            if !self.unsolicited_warned {
                warn!("Message received but not requested!");
                self.unsolicited_warned = true;
            }
            return;
        };

        // Simply pipe the output to the currently active connection. A
        // closed connection no longer resolves and its reply goes
        // nowhere.
        if let Some(replies) = self.connections.get(&active) {
            let _ = replies.send(bytes.to_vec());
        }

        if self.response.push(bytes) {
            debug!("Received end of message from device");
            self.complete().await;
        }
    }

    /// Finish the active command and hand the wire to the next queued
    /// one, if any.
    async fn complete(&mut self) {
        self.response.clear();
        self.deadline = None;
        self.active = None;

        if let Some(next) = self.queue.pop_front() {
            self.dispatch(next.connection, &next.command).await;
        }
    }

    /// Abort the in-flight command: synthesize its error envelope,
    /// recover the device, and drain the queue.
    async fn fail_and_reset(&mut self) {
        if let Some(active) = self.active {
            if let Some(replies) = self.connections.get(&active) {
                let _ = replies.send(ERROR_REPLY.to_vec());
            }
        }

        match self.reset_port().await {
            Ok(()) => self.complete().await,
            Err(e) => {
                error!("Device reset failed: {e}");
                // Leave the slot occupied and re-arm the window; its
                // expiry retries the reset.
                self.deadline = Some(Instant::now() + RESPONSE_TIMEOUT);
            }
        }
    }

    /// Close the device, run the reset hook, reopen and reconfigure.
    async fn reset_port(&mut self) -> Result<(), Error> {
        // Dropping the stream closes the descriptor.
        self.port = None;

        if let Some(hook) = &self.reset_hook {
            info!(hook = %hook.display(), "Running reset hook");

            // The hook is expected to be brief, e.g. toggling a power
            // line; waiting for it inline is accepted.
            match Command::new(hook).status().await {
                Ok(status) => info!("Reset hook exited with {status}"),
                Err(e) => warn!("Reset hook could not run: {e}"),
            }
        }

        self.port = Some(self.link.open()?);

        info!("Device reopened after reset");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MockLink;

    struct Setup {
        broker: BrokerHandle,
        device: tokio::io::DuplexStream,
        replies: mpsc::UnboundedReceiver<Vec<u8>>,
    }

    async fn setup_with_one_connection(id: u64) -> Setup {
        let (link, mut opened) = MockLink::new();
        let broker = BrokerHandle::new(Box::new(link), None).unwrap();

        let device = opened.recv().await.unwrap();

        let (replies_tx, replies) = mpsc::unbounded_channel();
        broker.register(ConnectionId::new(id), replies_tx);

        Setup {
            broker,
            device,
            replies,
        }
    }

    async fn read_command(device: &mut tokio::io::DuplexStream) -> Vec<u8> {
        let mut buffer = vec![0u8; 64];
        let n = device.read(&mut buffer).await.unwrap();
        buffer.truncate(n);
        buffer
    }

    #[tokio::test]
    async fn reply_is_piped_to_the_submitter() {
        let mut setup = setup_with_one_connection(1).await;

        setup.broker.submit(ConnectionId::new(1), b"PING\n".to_vec());
        assert_eq!(read_command(&mut setup.device).await, b"PING\n");

        setup
            .device
            .write_all(b"#START\r\nok\r\n#STOP\r\n")
            .await
            .unwrap();

        assert_eq!(
            setup.replies.recv().await.unwrap(),
            b"#START\r\nok\r\n#STOP\r\n"
        );
    }

    #[tokio::test]
    async fn second_command_waits_for_the_first_reply() {
        let mut setup = setup_with_one_connection(1).await;

        setup.broker.submit(ConnectionId::new(1), b"one\n".to_vec());
        setup.broker.submit(ConnectionId::new(1), b"two\n".to_vec());

        assert_eq!(read_command(&mut setup.device).await, b"one\n");

        setup
            .device
            .write_all(b"#START\r\n1\r\n#STOP\r\n")
            .await
            .unwrap();

        // Only after the first reply completes is the second command
        // put on the wire.
        assert_eq!(read_command(&mut setup.device).await, b"two\n");
    }

    #[tokio::test]
    async fn unsolicited_bytes_are_discarded() {
        let mut setup = setup_with_one_connection(1).await;

        setup.device.write_all(b"junk\r\n").await.unwrap();

        // Let the broker consume the junk while no command is active.
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Nothing may have reached the connection; a well-formed
        // exchange still works afterwards.
        setup.broker.submit(ConnectionId::new(1), b"PING\n".to_vec());
        assert_eq!(read_command(&mut setup.device).await, b"PING\n");

        setup
            .device
            .write_all(b"#START\r\nok\r\n#STOP\r\n")
            .await
            .unwrap();

        assert_eq!(
            setup.replies.recv().await.unwrap(),
            b"#START\r\nok\r\n#STOP\r\n"
        );
    }
}
