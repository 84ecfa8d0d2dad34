use std::{io, path::PathBuf};

use thiserror::Error;

/// Any error this crate might encounter.
#[derive(Debug, Error)]
pub enum Error {
    /// The configuration document could not be used.
    #[error("Bad configuration: {0}")]
    BadConfig(String),

    /// The serial device could not be opened or configured.
    #[error("Failed to set up the serial device `{path}`: {source}")]
    Device {
        /// Path of the device node.
        path: String,
        /// What the serial layer reported.
        #[source]
        source: tokio_serial::Error,
    },

    /// A device link could not produce a byte stream.
    #[error("Device link unavailable: {0}")]
    Link(String),

    /// The client listener socket could not be set up.
    #[error("Could not create socket listener at `{path}`: {source}")]
    Bind {
        /// Path of the socket file.
        path: PathBuf,
        /// What binding it reported.
        #[source]
        source: io::Error,
    },

    /// Underlying IO problem.
    #[error("Underlying IO problem")]
    Io(#[from] io::Error),
}
