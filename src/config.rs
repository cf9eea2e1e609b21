//! Configuration records for send/receive sessions.
//!
//! These mirror the JSON accepted by embedding applications, so every
//! field carries its wire name and a sensible default: a caller may
//! supply as little as a file list or an output directory.

use std::fmt;
use std::time::Duration;

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A duration that round-trips through JSON as a human-readable string
/// ("10s", "1m30s", "250ms"). Bare numbers are taken as nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dur(pub Duration);

impl Dur {
    pub const fn from_secs(secs: u64) -> Self {
        Dur(Duration::from_secs(secs))
    }

    pub fn get(self) -> Duration {
        self.0
    }
}

impl fmt::Display for Dur {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let nanos = self.0.as_nanos();
        if nanos == 0 {
            return write!(f, "0s");
        }
        if nanos % 1_000_000_000 == 0 {
            let mut secs = self.0.as_secs();
            let hours = secs / 3600;
            secs %= 3600;
            let mins = secs / 60;
            secs %= 60;
            if hours > 0 {
                write!(f, "{}h", hours)?;
            }
            if mins > 0 {
                write!(f, "{}m", mins)?;
            }
            if secs > 0 || (hours == 0 && mins == 0) {
                write!(f, "{}s", secs)?;
            }
            Ok(())
        } else if nanos % 1_000_000 == 0 {
            write!(f, "{}ms", nanos / 1_000_000)
        } else if nanos % 1_000 == 0 {
            write!(f, "{}us", nanos / 1_000)
        } else {
            write!(f, "{}ns", nanos)
        }
    }
}

/// Parse a Go-style duration: a sequence of decimal numbers with unit
/// suffixes, e.g. "1h30m", "2.5s", "300ms".
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let num_end = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(rest.len());
        if num_end == 0 {
            return None;
        }
        let value: f64 = rest[..num_end].parse().ok()?;
        rest = &rest[num_end..];

        let (scale, unit_len) = if rest.starts_with("ns") {
            (1.0, 2)
        } else if rest.starts_with("us") || rest.starts_with("µs") {
            (1e3, if rest.starts_with("µs") { "µs".len() } else { 2 })
        } else if rest.starts_with("ms") {
            (1e6, 2)
        } else if rest.starts_with('s') {
            (1e9, 1)
        } else if rest.starts_with('m') {
            (60e9, 1)
        } else if rest.starts_with('h') {
            (3600e9, 1)
        } else {
            return None;
        };
        rest = &rest[unit_len..];
        total += Duration::from_nanos((value * scale) as u64);
    }
    Some(total)
}

impl Serialize for Dur {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Dur {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct DurVisitor;

        impl<'de> de::Visitor<'de> for DurVisitor {
            type Value = Dur;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a duration string like \"10s\" or nanoseconds as a number")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Dur, E> {
                parse_duration(v)
                    .map(Dur)
                    .ok_or_else(|| E::custom(format!("invalid duration: {:?}", v)))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<Dur, E> {
                Ok(Dur(Duration::from_nanos(v)))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> std::result::Result<Dur, E> {
                Ok(Dur(Duration::from_nanos(v as u64)))
            }
        }

        deserializer.deserialize_any(DurVisitor)
    }
}

/// Tunables for ICE and the data channel.
///
/// The ICE values follow the agent defaults: `disconnected_timeout` is
/// the duration without network activity before the agent is considered
/// disconnected, `failed_timeout` before it is considered failed, and
/// `keep_alive_interval` is how often extra traffic is sent when idle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Timeouts {
    pub disconnected_timeout: Dur,
    pub failed_timeout: Dur,
    pub keep_alive_interval: Dur,
    /// How long to wait for data channel buffers to drain on close.
    pub close_timeout: Dur,
    /// Deadline for individual reads/writes on the data channel.
    pub rw_timeout: Dur,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            disconnected_timeout: Dur::from_secs(5),
            failed_timeout: Dur::from_secs(10),
            keep_alive_interval: Dur::from_secs(2),
            close_timeout: Dur::from_secs(10),
            rw_timeout: Dur::from_secs(10),
        }
    }
}

/// Options shared by send and receive sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BaseArg {
    /// Bearer token for the signalling server, if it requires one.
    pub bearer: String,
    /// Wormhole code; empty means allocate a new slot and password.
    pub code: String,
    /// Password length in bytes when generating a code.
    pub secret_length: usize,
    /// Render a progress bar on the terminal.
    pub progress: bool,
    /// Signalling server URL.
    pub sigserv: String,
    pub timeouts: Timeouts,
    /// How many times to attempt the whole bring-up and transfer.
    pub retry_times: u32,
    /// Path or HTTP URL progress snapshots are written to.
    pub result_file: String,
    /// Minimum interval between progress snapshots.
    pub result_interval: Dur,
    /// Free-form sender identification shown to the receiver.
    pub whoami: String,
}

impl Default for BaseArg {
    fn default() -> Self {
        Self {
            bearer: String::new(),
            code: String::new(),
            secret_length: 2,
            progress: false,
            sigserv: String::new(),
            timeouts: Timeouts::default(),
            retry_times: 10,
            result_file: String::new(),
            result_interval: Dur::from_secs(1),
            whoami: String::new(),
        }
    }
}

impl BaseArg {
    pub fn validate(&self) -> Result<()> {
        if self.secret_length == 0 {
            return Err(Error::Config("secretLength must be at least 1".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SendFilesArg {
    #[serde(flatten)]
    pub base: BaseArg,
    /// Paths of the files to offer.
    pub files: Vec<String>,
}

impl SendFilesArg {
    pub fn validate(&self) -> Result<()> {
        self.base.validate()?;
        if self.files.is_empty() {
            return Err(Error::Config("no files to send".into()));
        }
        for f in &self.files {
            if !std::path::Path::new(f).is_file() {
                return Err(Error::Config(format!("not a file: {}", f)));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReceiveFilesArg {
    #[serde(flatten)]
    pub base: BaseArg,
    /// Directory downloaded files are written into.
    pub dir: String,
    /// Resume database path; empty disables persistent resume state.
    pub data_source_name: String,
}

impl Default for ReceiveFilesArg {
    fn default() -> Self {
        Self {
            base: BaseArg::default(),
            dir: ".".into(),
            data_source_name: "burrow.db".into(),
        }
    }
}

impl ReceiveFilesArg {
    pub fn validate(&self) -> Result<()> {
        self.base.validate()?;
        if !std::path::Path::new(&self.dir).is_dir() {
            return Err(Error::Config(format!("not a directory: {}", self.dir)));
        }
        Ok(())
    }
}
