//! How the broker reaches its device.
//!
//! The broker opens its device through a [`DeviceLink`] once at startup
//! and again every time the reset procedure replaces the port. The real
//! link is a serial node in raw mode; tests use [`MockLink`] to stand in
//! a plain in-memory pipe.

use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::sync::mpsc;
use tokio_serial::SerialPortBuilderExt;
use tracing::info;

use crate::error::Error;

/// Combined I/O bound for device byte streams.
pub trait DeviceIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> DeviceIo for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// A byte stream to the device, as produced by a [`DeviceLink`].
///
/// Dropping it closes the underlying descriptor.
pub type DeviceStream = Box<dyn DeviceIo>;

/// Something the broker can (re)open a device byte stream through.
pub trait DeviceLink: Send {
    /// Open a fresh byte stream to the device.
    fn open(&mut self) -> Result<DeviceStream, Error>;

    /// Where the link goes, for logs.
    fn describe(&self) -> String;
}

/// Link to a real serial device node.
#[derive(Debug)]
pub struct SerialLink {
    path: String,
    baud: u32,
}

impl SerialLink {
    /// A link to the node at `path`, driven at `baud`.
    ///
    /// The baud rate must already have been validated against
    /// [`crate::config::ALLOWED_BAUD_RATES`].
    pub fn new(path: &str, baud: u32) -> Self {
        Self {
            path: path.to_string(),
            baud,
        }
    }
}

impl DeviceLink for SerialLink {
    fn open(&mut self) -> Result<DeviceStream, Error> {
        // Raw 8-N-1, no flow control; the descriptor comes back in
        // non-blocking mode.
        let stream = tokio_serial::new(&self.path, self.baud)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|source| Error::Device {
                path: self.path.clone(),
                source,
            })?;

        info!(path = %self.path, baud = self.baud, "Serial device opened");

        Ok(Box::new(stream))
    }

    fn describe(&self) -> String {
        self.path.clone()
    }
}

/// In-memory device link, useful to test the broker without the actual
/// serial ports.
///
/// Every `open` creates a fresh duplex pipe and hands the device half to
/// whoever holds the receiver, so a test also observes the reopen done
/// by the reset procedure.
#[derive(Debug)]
pub struct MockLink {
    opened: mpsc::UnboundedSender<DuplexStream>,
}

impl MockLink {
    /// Create the link together with the stream of device-side halves.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DuplexStream>) {
        let (tx, rx) = mpsc::unbounded_channel();

        (Self { opened: tx }, rx)
    }
}

impl DeviceLink for MockLink {
    fn open(&mut self) -> Result<DeviceStream, Error> {
        let (broker_half, device_half) = tokio::io::duplex(4096);

        self.opened
            .send(device_half)
            .map_err(|_| Error::Link("mock device went away".to_string()))?;

        Ok(Box::new(broker_half))
    }

    fn describe(&self) -> String {
        "mock".to_string()
    }
}
