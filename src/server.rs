//! Code relating to setting up the server: the device link, the client
//! listener and the accept loop gluing clients to the broker.

use std::path::Path;

use tokio::net::UnixListener;
use tracing::info;

use crate::{
    broker::{BrokerHandle, ConnectionId},
    config::Config,
    connection,
    device::{DeviceLink, SerialLink},
    error::Error,
};

/// Run the broker against the serial device named by the configuration.
///
/// Only returns on a startup or listener failure.
pub async fn run(config: Config) -> Result<(), Error> {
    let link = SerialLink::new(&config.device, config.baudrate);

    run_with_link(config, Box::new(link)).await
}

/// Run the broker over an arbitrary device link.
///
/// [`run`] uses this with the real serial node; tests hand in a
/// [`crate::device::MockLink`].
pub async fn run_with_link(config: Config, link: Box<dyn DeviceLink>) -> Result<(), Error> {
    config.validate()?;

    let device = link.describe();
    let broker = BrokerHandle::new(link, config.hooks.reset.clone())?;

    info!("KORUZA control daemon starting up");
    info!("Connected to device '{device}'");

    let listener = bind_listener(&config.socket)?;

    info!(socket = %config.socket.display(), "Listening for clients");

    let mut next_id = 0;
    loop {
        let (stream, _address) = listener.accept().await?;

        next_id += 1;
        connection::spawn(ConnectionId::new(next_id), stream, broker.clone());
    }
}

/// Bind the client listener, replacing any stale socket file first.
fn bind_listener(path: &Path) -> Result<UnixListener, Error> {
    if path.exists() {
        std::fs::remove_file(path).map_err(|source| Error::Bind {
            path: path.to_path_buf(),
            source,
        })?;
    }

    UnixListener::bind(path).map_err(|source| Error::Bind {
        path: path.to_path_buf(),
        source,
    })
}
