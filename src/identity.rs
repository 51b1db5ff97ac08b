//! Device identity: one-way hashes and the clientId grammar.
//!
//! Plaintext serials and MACs never reach the store; devices are keyed by
//! `hex(SHA-256(serial + "|" + mac))`. The clientId encodes just enough of
//! both to route a session: `IOT` + last 4 of the serial + first 6 hex digits
//! of the MAC, optionally followed by a suffix for auxiliary sessions.

use anyhow::{anyhow, Result};
use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

/// Exact clientId of the single command controller.
pub const CONTROLLER_CLIENT_ID: &str = "controller-cmd";

/// ClientId prefix granting admin rights.
pub const ADMIN_PREFIX: &str = "ADMIN_";

/// ClientId prefix of device sessions.
pub const DEVICE_PREFIX: &str = "IOT";

/// Serial prefix reconstructed from a device clientId tail.
pub const SERIAL_PREFIX: &str = "IOT-2025-";

const SERIAL_TAIL_LEN: usize = 4;
const MAC_PREFIX_LEN: usize = 6;

/// `hex(SHA-256(utf8(s)))`. Pure, no salt; the point is a stable, one-way
/// identifier that can be indexed.
pub fn hash(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

/// Registry key for a device: the hash of `serial|mac`.
pub fn hash_composite(serial: &str, mac: &str) -> String {
    hash(&format!("{}|{}", serial, mac))
}

fn mac_regex() -> &'static Regex {
    static MAC_RE: OnceLock<Regex> = OnceLock::new();
    MAC_RE.get_or_init(|| {
        Regex::new(r"^[0-9A-Fa-f]{2}([:-][0-9A-Fa-f]{2}){5}$").unwrap()
    })
}

/// `XX:XX:XX:XX:XX:XX`, case-insensitive, `:` or `-` separators.
pub fn is_valid_mac(mac: &str) -> bool {
    mac_regex().is_match(mac)
}

/// Canonical MAC form used for hashing: uppercase, colon-separated.
pub fn normalize_mac(mac: &str) -> Result<String> {
    if !is_valid_mac(mac) {
        return Err(anyhow!("invalid MAC address format: '{}'", mac));
    }
    Ok(mac.to_uppercase().replace('-', ":"))
}

// -------------------- ClientId grammar --------------------

/// The device-identifying parts encoded in an `IOT…` clientId.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceClientId {
    /// Last four digits of the device serial.
    pub serial_tail: String,
    /// First six hex digits of the MAC, uppercase, no separators.
    pub mac_prefix: String,
    /// Optional suffix distinguishing auxiliary sessions.
    pub suffix: Option<String>,
}

impl DeviceClientId {
    /// Nominal serial reconstructed from the tail. The MAC is only partially
    /// encoded and must be confirmed from the registration payload.
    pub fn nominal_serial(&self) -> String {
        format!("{}{}", SERIAL_PREFIX, self.serial_tail)
    }
}

/// Role class of a broker session, decided purely from the clientId.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientClass {
    /// Exactly `controller-cmd`.
    Controller,
    /// Any `ADMIN_` prefix.
    Admin,
    /// A well-formed `IOT…` device id.
    Device(DeviceClientId),
    /// `IOT…` prefix but the tail does not satisfy the grammar.
    MalformedDevice,
    /// Holds a valid TLS cert but no recognized role; may connect, gets no
    /// ACL rights.
    Unauthenticated,
}

/// Classify a clientId into its role class.
pub fn classify_client_id(client_id: &str) -> ClientClass {
    if client_id == CONTROLLER_CLIENT_ID {
        return ClientClass::Controller;
    }
    if client_id.starts_with(ADMIN_PREFIX) {
        return ClientClass::Admin;
    }
    if client_id.starts_with(DEVICE_PREFIX) {
        return match parse_device_client_id(client_id) {
            Ok(id) => ClientClass::Device(id),
            Err(_) => ClientClass::MalformedDevice,
        };
    }
    ClientClass::Unauthenticated
}

/// Parse an `IOT…` clientId with a strict length check: anything shorter
/// than prefix + 4-digit tail + 6-hex MAC prefix is rejected.
pub fn parse_device_client_id(client_id: &str) -> Result<DeviceClientId> {
    let rest = client_id
        .strip_prefix(DEVICE_PREFIX)
        .ok_or_else(|| anyhow!("clientId '{}' lacks the {} prefix", client_id, DEVICE_PREFIX))?;

    if rest.len() < SERIAL_TAIL_LEN + MAC_PREFIX_LEN {
        return Err(anyhow!(
            "clientId '{}' too short: expected at least {} characters after the prefix",
            client_id,
            SERIAL_TAIL_LEN + MAC_PREFIX_LEN
        ));
    }

    let serial_tail = &rest[..SERIAL_TAIL_LEN];
    let mac_prefix = &rest[SERIAL_TAIL_LEN..SERIAL_TAIL_LEN + MAC_PREFIX_LEN];
    let suffix = &rest[SERIAL_TAIL_LEN + MAC_PREFIX_LEN..];

    if !serial_tail.bytes().all(|b| b.is_ascii_digit()) {
        return Err(anyhow!(
            "clientId '{}' serial tail '{}' is not numeric",
            client_id,
            serial_tail
        ));
    }
    if !mac_prefix.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(anyhow!(
            "clientId '{}' MAC prefix '{}' is not hex",
            client_id,
            mac_prefix
        ));
    }

    Ok(DeviceClientId {
        serial_tail: serial_tail.to_string(),
        mac_prefix: mac_prefix.to_uppercase(),
        suffix: if suffix.is_empty() {
            None
        } else {
            Some(suffix.to_string())
        },
    })
}

/// Device-side clientId derivation: `IOT` + last 4 of serial + first 6 hex of
/// the MAC, no separators.
pub fn derive_client_id(serial: &str, mac: &str) -> Result<String> {
    if !serial.is_ascii() {
        return Err(anyhow!("serial '{}' must be ASCII", serial));
    }
    if serial.len() < SERIAL_TAIL_LEN {
        return Err(anyhow!("serial '{}' shorter than {} characters", serial, SERIAL_TAIL_LEN));
    }
    let tail = &serial[serial.len() - SERIAL_TAIL_LEN..];
    let hex_digits: String = normalize_mac(mac)?
        .chars()
        .filter(|c| c.is_ascii_hexdigit())
        .take(MAC_PREFIX_LEN)
        .collect();
    if hex_digits.len() < MAC_PREFIX_LEN {
        return Err(anyhow!("MAC '{}' yields fewer than {} hex digits", mac, MAC_PREFIX_LEN));
    }
    Ok(format!("{}{}{}", DEVICE_PREFIX, tail, hex_digits))
}

/// First six hex digits of a MAC, as they appear in a clientId.
pub fn mac_client_prefix(mac: &str) -> Result<String> {
    let hex_digits: String = normalize_mac(mac)?
        .chars()
        .filter(|c| c.is_ascii_hexdigit())
        .take(MAC_PREFIX_LEN)
        .collect();
    Ok(hex_digits)
}
