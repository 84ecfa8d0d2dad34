#![allow(dead_code)]

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use color_eyre::{eyre::eyre, Result};
use koruza_control::{
    client::Client,
    config::{Config, Hooks},
    device::MockLink,
    server,
};
use tempfile::TempDir;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, DuplexStream},
    net::UnixStream,
    sync::mpsc,
    time::timeout,
};

/// Upper bound on any single await in a test.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// A broker running against a mock device link on a scratch socket.
pub struct TestBroker {
    /// Where the broker listens.
    pub socket: PathBuf,

    /// Scratch directory holding the socket (and hook artifacts).
    pub dir: TempDir,

    opened: mpsc::UnboundedReceiver<DuplexStream>,
}

pub async fn start_broker() -> Result<TestBroker> {
    start_broker_with_hook(None).await
}

pub async fn start_broker_with_hook(reset_hook: Option<PathBuf>) -> Result<TestBroker> {
    let dir = tempfile::tempdir()?;
    let socket = dir.path().join("koruza.sock");

    let config = Config {
        device: "mock".into(),
        baudrate: 115_200,
        socket: socket.clone(),
        hooks: Hooks { reset: reset_hook },
    };

    let (link, opened) = MockLink::new();

    tokio::spawn(server::run_with_link(config, Box::new(link)));

    wait_for_socket(&socket).await?;

    Ok(TestBroker {
        socket,
        dir,
        opened,
    })
}

async fn wait_for_socket(socket: &Path) -> Result<()> {
    for _ in 0..100 {
        if socket.exists() {
            return Ok(());
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    Err(eyre!("Broker did not create its socket"))
}

impl TestBroker {
    /// The device half of the most recent link open.
    ///
    /// Called once after startup, and once more after every reset.
    pub async fn device(&mut self) -> Result<MockDevice> {
        let stream = timeout(TEST_TIMEOUT, self.opened.recv())
            .await?
            .ok_or_else(|| eyre!("Device link closed"))?;

        Ok(MockDevice { stream })
    }

    /// Connect a raw client.
    pub async fn connect(&self) -> Result<UnixStream> {
        Ok(UnixStream::connect(&self.socket).await?)
    }

    /// Connect an envelope-parsing client.
    pub async fn client(&self) -> Result<Client> {
        Ok(Client::connect(&self.socket).await?)
    }
}

/// The device end of the mock link; scripts what the "hardware" does.
pub struct MockDevice {
    stream: DuplexStream,
}

impl MockDevice {
    /// Read one newline-terminated command off the wire and assert it
    /// is `expected`.
    pub async fn expect_command(&mut self, expected: &str) -> Result<()> {
        let mut received = Vec::new();
        let mut byte = [0u8; 1];

        while !received.ends_with(b"\n") {
            timeout(TEST_TIMEOUT, self.stream.read_exact(&mut byte)).await??;
            received.push(byte[0]);
        }

        pretty_assertions::assert_eq!(expected.as_bytes(), &received[..]);

        Ok(())
    }

    /// Put reply bytes on the wire.
    pub async fn reply(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream.write_all(bytes).await?;

        Ok(())
    }
}

/// Read exactly `n` bytes from a raw client connection.
pub async fn read_exact(stream: &mut UnixStream, n: usize) -> Result<Vec<u8>> {
    let mut buffer = vec![0u8; n];

    timeout(TEST_TIMEOUT, stream.read_exact(&mut buffer)).await??;

    Ok(buffer)
}

/// Assert nothing (more) arrives on a raw client connection.
pub async fn assert_no_data(stream: &mut UnixStream) -> Result<()> {
    let mut buffer = [0u8; 1];

    match timeout(Duration::from_millis(100), stream.read(&mut buffer)).await {
        // Nothing came, good.
        Err(_elapsed) => Ok(()),
        Ok(Ok(0)) => Err(eyre!("Connection closed unexpectedly")),
        Ok(Ok(_)) => Err(eyre!("Unexpected data: {:?}", buffer[0] as char)),
        Ok(Err(e)) => Err(e.into()),
    }
}

/// Give the broker a moment to process something we cannot otherwise
/// observe, e.g. a queued submission or a disconnect.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
