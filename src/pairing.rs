//! Transient pairing codes: short uppercase tokens, five-minute TTL,
//! consumable once. Process memory only; nothing here is durable.

use rand::Rng;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub const DEFAULT_PAIRING_TTL: Duration = Duration::from_secs(5 * 60);

const CODE_LEN: usize = 8;
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

struct PairingEntry {
    subject: String,
    issued_at: Instant,
}

/// Concurrent map of outstanding pairing codes.
pub struct PairingCodes {
    ttl: Duration,
    codes: Mutex<HashMap<String, PairingEntry>>,
}

impl PairingCodes {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            codes: Mutex::new(HashMap::new()),
        }
    }

    /// Issue a fresh code bound to `subject` (typically a client UUID).
    pub fn generate(&self, subject: &str) -> String {
        let mut rng = rand::thread_rng();
        let mut codes = match self.codes.lock() {
            Ok(codes) => codes,
            Err(poisoned) => poisoned.into_inner(),
        };
        loop {
            let code: String = (0..CODE_LEN)
                .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
                .collect();
            if codes.contains_key(&code) {
                continue;
            }
            codes.insert(
                code.clone(),
                PairingEntry {
                    subject: subject.to_string(),
                    issued_at: Instant::now(),
                },
            );
            return code;
        }
    }

    /// Consume a code, returning its subject. A code can be consumed once;
    /// expired codes are treated as absent.
    pub fn consume(&self, code: &str) -> Option<String> {
        let mut codes = match self.codes.lock() {
            Ok(codes) => codes,
            Err(poisoned) => poisoned.into_inner(),
        };
        let entry = codes.remove(code)?;
        if entry.issued_at.elapsed() > self.ttl {
            log::debug!("pairing code expired before use");
            return None;
        }
        Some(entry.subject)
    }

    /// Drop expired entries. Called opportunistically by the owner.
    pub fn purge_expired(&self) {
        let mut codes = match self.codes.lock() {
            Ok(codes) => codes,
            Err(poisoned) => poisoned.into_inner(),
        };
        codes.retain(|_, entry| entry.issued_at.elapsed() <= self.ttl);
    }

    pub fn outstanding(&self) -> usize {
        match self.codes.lock() {
            Ok(codes) => codes.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

impl Default for PairingCodes {
    fn default() -> Self {
        Self::new(DEFAULT_PAIRING_TTL)
    }
}
