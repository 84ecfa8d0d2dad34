use std::{
    fmt,
    path::{Path, PathBuf},
};

use serde::{
    de::{self, IgnoredAny, MapAccess, Visitor},
    Deserialize, Deserializer, Serialize,
};

use crate::error::Error;

/// A map key deserialized as a RON struct-field identifier rather than a
/// string value, so field names inside `(...)` tables are recognized.
struct Key(String);

impl<'de> Deserialize<'de> for Key {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct KeyVisitor;

        impl<'de> Visitor<'de> for KeyVisitor {
            type Value = Key;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a field identifier")
            }

            fn visit_str<E>(self, v: &str) -> Result<Key, E>
            where
                E: de::Error,
            {
                Ok(Key(v.to_owned()))
            }

            fn visit_bytes<E>(self, v: &[u8]) -> Result<Key, E>
            where
                E: de::Error,
            {
                Ok(Key(String::from_utf8_lossy(v).into_owned()))
            }
        }

        deserializer.deserialize_identifier(KeyVisitor)
    }
}

/// The discrete baud rates the serial device may be driven at.
/// Anything else is a configuration error.
pub const ALLOWED_BAUD_RATES: [u32; 18] = [
    50, 75, 110, 134, 150, 200, 300, 600, 1200, 1800, 2400, 4800, 9600, 19200, 38400, 57600,
    115_200, 230_400,
];

/// External executables the broker may invoke.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Hooks {
    /// Executable run during device reset, typically to power-cycle the
    /// link head before the serial node is reopened.
    pub reset: Option<PathBuf>,
}

/// The configuration used for running the broker.
///
/// Keys are matched case-insensitively. Unrecognized keys are ignored,
/// since the same document is shared with the auxiliary tools.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// Path to the serial device node.
    pub device: String,

    /// Baud rate for the device, one of [`ALLOWED_BAUD_RATES`].
    pub baudrate: u32,

    /// Filesystem path the client listener binds to.
    pub socket: PathBuf,

    /// Hook executables. See [`Hooks`].
    pub hooks: Hooks,
}

impl<'de> Deserialize<'de> for Hooks {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct HooksVisitor;

        impl<'de> Visitor<'de> for HooksVisitor {
            type Value = Hooks;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a table of hook executables")
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut reset = None;

                while let Some(key) = map.next_key::<Key>()?.map(|k| k.0) {
                    if key.eq_ignore_ascii_case("reset") {
                        reset = map.next_value()?;
                    } else {
                        map.next_value::<IgnoredAny>()?;
                    }
                }

                Ok(Hooks { reset })
            }
        }

        deserializer.deserialize_struct("Hooks", &["reset"], HooksVisitor)
    }
}

impl<'de> Deserialize<'de> for Config {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ConfigVisitor;

        impl<'de> Visitor<'de> for ConfigVisitor {
            type Value = Config;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a broker configuration table")
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut device = None;
                let mut baudrate = None;
                let mut socket = None;
                let mut hooks = None;

                while let Some(key) = map.next_key::<Key>()?.map(|k| k.0) {
                    match key.to_ascii_lowercase().as_str() {
                        "device" => device = Some(map.next_value()?),
                        "baudrate" => baudrate = Some(map.next_value()?),
                        "socket" => socket = Some(map.next_value()?),
                        "hooks" => hooks = Some(map.next_value()?),
                        _ => {
                            map.next_value::<IgnoredAny>()?;
                        }
                    }
                }

                Ok(Config {
                    device: device.ok_or_else(|| de::Error::missing_field("device"))?,
                    baudrate: baudrate.ok_or_else(|| de::Error::missing_field("baudrate"))?,
                    socket: socket.ok_or_else(|| de::Error::missing_field("socket"))?,
                    hooks: hooks.unwrap_or_default(),
                })
            }
        }

        deserializer.deserialize_struct(
            "Config",
            &["device", "baudrate", "socket", "hooks"],
            ConfigVisitor,
        )
    }
}

impl Config {
    fn ron() -> ron::Options {
        ron::Options::default()
            .with_default_extension(ron::extensions::Extensions::IMPLICIT_SOME)
            .with_default_extension(ron::extensions::Extensions::UNWRAP_NEWTYPES)
    }

    /// Deserialize a configuration document.
    pub fn deserialize(input: &str) -> Result<Self, Error> {
        Self::ron()
            .from_str(input)
            .map_err(|e| Error::BadConfig(format!("Could not parse configuration: {e}")))
    }

    /// Load a configuration from a file.
    pub fn new_from_path<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();

        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::BadConfig(format!(
                "Could not read configuration file `{}`: {e}",
                path.display()
            ))
        })?;

        Self::deserialize(&contents)
    }

    /// An example configuration with all fields filled in.
    pub fn example() -> Self {
        Self {
            device: "/dev/ttyUSB0".into(),
            baudrate: 115_200,
            socket: "/var/run/koruza.sock".into(),
            hooks: Hooks {
                reset: Some("/usr/lib/koruza/reset-device".into()),
            },
        }
    }

    /// Serialize the configuration in a "pretty" (i.e. non-compact) fashion.
    pub fn serialize_pretty(&self) -> String {
        Self::ron()
            .to_string_pretty(self, ron::ser::PrettyConfig::default())
            .unwrap()
    }

    /// Check the fields the broker depends on.
    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.device.is_empty() {
            return Err(Error::BadConfig("'device' must not be empty".into()));
        }

        if !ALLOWED_BAUD_RATES.contains(&self.baudrate) {
            return Err(Error::BadConfig(format!(
                "Invalid baudrate {} specified, allowed rates are {ALLOWED_BAUD_RATES:?}",
                self.baudrate
            )));
        }

        if self.socket.as_os_str().is_empty() {
            return Err(Error::BadConfig("'socket' must not be empty".into()));
        }

        Ok(())
    }
}
