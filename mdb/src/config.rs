use crate::key::AdbKey;
use std::time::Duration;

/// Everything an `adbd` connection needs that this crate does not invent
/// itself: identity keys, the device address, timeouts, and the feature
/// set we advertise in the CNXN banner.
pub struct ConnectOptions {
    pub(crate) keys: Vec<AdbKey>,
    pub(crate) connect_timeout: Option<Duration>,
    pub(crate) handshake_timeout: Option<Duration>,
    pub(crate) read_timeout: Option<Duration>,
    pub(crate) write_timeout: Option<Duration>,
    pub(crate) features: Vec<String>,
    pub(crate) name: String,
}

impl ConnectOptions {
    pub fn new(primary_key: AdbKey) -> Self {
        let name = primary_key.name().to_string();
        Self {
            keys: vec![primary_key],
            connect_timeout: Some(Duration::from_secs(10)),
            handshake_timeout: None,
            read_timeout: None,
            write_timeout: None,
            features: vec!["shell_v2".into(), "cmd".into(), "abb_exec".into()],
            name,
        }
    }

    pub fn extra_key(mut self, key: AdbKey) -> Self {
        self.keys.push(key);
        self
    }

    pub fn connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Bounds the wait for the device to confirm a new, unrecognised key.
    /// Defaults to no timeout, matching real `adb`'s "check your device"
    /// prompt having no deadline.
    pub fn handshake_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn write_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn feature(mut self, feature: impl Into<String>) -> Self {
        self.features.push(feature.into());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub(crate) fn banner(&self) -> String {
        format!("host::features={}", self.features.join(","))
    }
}

/// Host/port, pairing code and identity key needed to run the C7 pairing
/// exchange.
pub struct PairingOptions {
    pub host: String,
    pub port: u16,
    pub pairing_code: String,
    pub key: AdbKey,
}

impl PairingOptions {
    pub fn new(host: impl Into<String>, port: u16, pairing_code: impl Into<String>, key: AdbKey) -> Self {
        Self {
            host: host.into(),
            port,
            pairing_code: pairing_code.into(),
            key,
        }
    }
}
