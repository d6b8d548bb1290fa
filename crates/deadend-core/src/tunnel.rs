//! Tunnel descriptors.
//!
//! A device advertises its reverse tunnel in one of two places: the status
//! sub-record (`status.tunnel.{active, port}`), written by the device side, or
//! the legacy `tunnel` field of the secret bundle, written by operators. The
//! status sub-record wins when present.
//!
//! A descriptor without a usable port is always closed. When no usable port
//! is recorded a fresh one is drawn from the ephemeral range so the caller has
//! something to request.

use rand::Rng;
use serde::de::IgnoredAny;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::debug;

use crate::secret::{decode_secret, encode_secret};

/// Lowest port a device may be asked to bind on the broker.
pub const MIN_TUNNEL_PORT: u16 = 1024;

/// Highest port a device may be asked to bind on the broker.
pub const MAX_TUNNEL_PORT: u16 = 65535;

/// Legacy tunnel value meaning "closed".
pub const CLOSED_SENTINEL: &str = "NA";

/// Current reachability of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelDescriptor {
    /// Broker-side port of the reverse tunnel.
    pub port: Option<u16>,
    /// Whether the device has been told to keep the tunnel up.
    pub open: bool,
}

impl TunnelDescriptor {
    /// An open tunnel on `port`.
    #[must_use]
    pub const fn open(port: u16) -> Self {
        Self {
            port: Some(port),
            open: true,
        }
    }

    /// A closed tunnel, optionally carrying the port to request.
    #[must_use]
    pub const fn closed(port: Option<u16>) -> Self {
        Self { port, open: false }
    }

    /// Whether the tunnel can be used right now.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.open && self.port.is_some()
    }
}

/// Tunnel state as reported in the device status sub-record.
///
/// Devices write this record themselves, so values of the wrong type are
/// read as absent instead of failing the whole record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TunnelStatus {
    /// Whether the device reports the tunnel as up.
    #[serde(default, deserialize_with = "lenient_flag")]
    pub active: bool,
    /// The port the device bound, if any.
    #[serde(default, deserialize_with = "lenient_port")]
    pub port: Option<i64>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawPort {
    Number(i64),
    Text(String),
    Other(IgnoredAny),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawFlag {
    Flag(bool),
    Other(IgnoredAny),
}

fn lenient_port<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
    Ok(match Option::<RawPort>::deserialize(deserializer)? {
        Some(RawPort::Number(port)) => Some(port),
        Some(RawPort::Text(text)) => text.trim().parse().ok(),
        Some(RawPort::Other(_)) | None => None,
    })
}

fn lenient_flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    Ok(matches!(RawFlag::deserialize(deserializer)?, RawFlag::Flag(true)))
}

/// Interpretation of a decoded legacy tunnel value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegacyTunnel {
    /// A valid port: the tunnel has been requested.
    Port(u16),
    /// The closed sentinel.
    Closed,
    /// Absent, non-numeric or out of range.
    Unusable,
}

/// Check that a port lies in the ephemeral range.
#[must_use]
pub fn valid_tunnel_port(port: i64) -> Option<u16> {
    u16::try_from(port)
        .ok()
        .filter(|p| *p >= MIN_TUNNEL_PORT)
}

/// Draw a random port from the ephemeral range.
pub fn allocate_port<R: Rng + ?Sized>(rng: &mut R) -> u16 {
    rng.gen_range(MIN_TUNNEL_PORT..=MAX_TUNNEL_PORT)
}

/// Interpret a plain-text legacy tunnel value.
#[must_use]
pub fn parse_legacy(decoded: &str) -> LegacyTunnel {
    let value = decoded.trim();
    if value == CLOSED_SENTINEL {
        return LegacyTunnel::Closed;
    }
    value
        .parse::<i64>()
        .ok()
        .and_then(valid_tunnel_port)
        .map_or(LegacyTunnel::Unusable, LegacyTunnel::Port)
}

/// Interpret a base64-encoded legacy tunnel value as stored on the record.
#[must_use]
pub fn decode_legacy(encoded: Option<&str>) -> LegacyTunnel {
    match encoded.map(decode_secret) {
        Some(Ok(decoded)) => parse_legacy(&decoded),
        Some(Err(e)) => {
            debug!(error = %e, "Legacy tunnel value is not decodable");
            LegacyTunnel::Unusable
        }
        None => LegacyTunnel::Unusable,
    }
}

/// Encode a port as a legacy tunnel value.
#[must_use]
pub fn encode_port(port: u16) -> String {
    encode_secret(&port.to_string())
}

/// Encode the closed sentinel as a legacy tunnel value.
#[must_use]
pub fn encode_closed() -> String {
    encode_secret(CLOSED_SENTINEL)
}

/// The descriptor exactly as recorded, without allocating a port.
///
/// `status` takes precedence over `legacy`.
#[must_use]
pub fn recorded(status: Option<&TunnelStatus>, legacy: Option<&str>) -> TunnelDescriptor {
    if let Some(status) = status {
        return match status.port.and_then(valid_tunnel_port) {
            Some(port) if status.active => TunnelDescriptor::open(port),
            port => TunnelDescriptor::closed(port),
        };
    }

    match decode_legacy(legacy) {
        LegacyTunnel::Port(port) => TunnelDescriptor::open(port),
        LegacyTunnel::Closed | LegacyTunnel::Unusable => TunnelDescriptor::closed(None),
    }
}

/// Resolve the effective descriptor of a device.
///
/// Like [`recorded`], but whenever no usable port is recorded the result is
/// closed and carries a freshly allocated port.
pub fn resolve<R: Rng + ?Sized>(
    status: Option<&TunnelStatus>,
    legacy: Option<&str>,
    rng: &mut R,
) -> TunnelDescriptor {
    let desc = recorded(status, legacy);
    match desc.port {
        Some(_) => desc,
        None => TunnelDescriptor::closed(Some(allocate_port(rng))),
    }
}
