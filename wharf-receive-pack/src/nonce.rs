//! HMAC-bound nonces proving freshness of signed pushes.
//!
//! A nonce is `<unix-ts>-<hex(HMAC-SHA1(seed, <unix-ts>))>`. One is issued
//! per advertisement and consumed once per certificate. Stateless
//! multi-frontend deployments verify nonces issued by sibling frontends
//! within a configurable slop window.

use std::time::{SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use sha1::Sha1;

type HmacSha1 = Hmac<Sha1>;

/// The outcome of verifying a received nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceStatus {
    /// The nonce matches the one we sent.
    Ok,
    /// The nonce is malformed, forged, or outside the slop window.
    Bad,
    /// We sent a nonce but the certificate carries none.
    Missing,
    /// The certificate carries a nonce but we never sent one.
    Unsolicited,
    /// The nonce was issued by a sibling frontend within the slop window;
    /// accepted.
    Slop,
}

impl NonceStatus {
    /// Whether a certificate with this status may proceed to validation.
    pub fn is_accepted(self) -> bool {
        matches!(self, NonceStatus::Ok | NonceStatus::Slop)
    }
}

/// Issues and verifies HMAC nonces for one process-wide seed.
#[derive(Clone)]
pub struct NonceGenerator {
    seed: Vec<u8>,
}

impl NonceGenerator {
    /// Create a generator over the process-wide secret seed.
    pub fn new(seed: impl Into<Vec<u8>>) -> Self {
        Self { seed: seed.into() }
    }

    /// Generate a nonce for the current time.
    pub fn generate(&self) -> String {
        self.generate_at(unix_now())
    }

    /// Generate the nonce for a specific timestamp.
    pub fn generate_at(&self, timestamp: i64) -> String {
        format!("{timestamp}-{}", self.hmac_hex(timestamp))
    }

    /// Verify `received` against the nonce we `sent`, allowing sibling
    /// frontends' nonces within `slop_seconds` when `allow_slop` is set.
    pub fn verify(&self, received: &str, sent: &str, allow_slop: bool, slop_seconds: i64) -> NonceStatus {
        self.verify_at(received, sent, allow_slop, slop_seconds, unix_now())
    }

    /// Like [`verify`](Self::verify) with an explicit current time.
    pub fn verify_at(
        &self,
        received: &str,
        sent: &str,
        allow_slop: bool,
        slop_seconds: i64,
        now: i64,
    ) -> NonceStatus {
        if sent.is_empty() {
            return if received.is_empty() {
                NonceStatus::Missing
            } else {
                NonceStatus::Unsolicited
            };
        }
        if received.is_empty() {
            return NonceStatus::Missing;
        }

        let Some((ts, mac)) = received.split_once('-') else {
            return NonceStatus::Bad;
        };
        let Ok(ts) = ts.parse::<i64>() else {
            return NonceStatus::Bad;
        };
        if !constant_time_eq(mac, &self.hmac_hex(ts)) {
            return NonceStatus::Bad;
        }
        if received == sent {
            return NonceStatus::Ok;
        }
        if allow_slop && (now - ts).abs() <= slop_seconds {
            return NonceStatus::Slop;
        }
        NonceStatus::Bad
    }

    fn hmac_hex(&self, timestamp: i64) -> String {
        let mut mac = HmacSha1::new_from_slice(&self.seed).expect("hmac accepts any key length");
        mac.update(timestamp.to_string().as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
