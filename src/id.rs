//! Identifier and clock utilities for runsched
//!
//! Store sessions get a random holder id so advisory locks can be attributed
//! and released per session. Timestamps are persisted as milliseconds since
//! the Unix epoch.

use chrono::{DateTime, TimeZone, Utc};
use rand::Rng;

/// Get current timestamp in milliseconds since Unix epoch
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Convert a stored millisecond timestamp back into a UTC datetime.
///
/// Out-of-range values collapse to the epoch rather than failing the read.
pub fn from_ms(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

/// Generate a session holder id
///
/// Format: `ses-{timestamp_ms}-{random_hex}`
/// Example: `ses-1738300800123-a1b2c3d4`
pub fn generate_session_id() -> String {
    let timestamp = now_ms();
    let random: u32 = rand::rng().random();
    format!("ses-{}-{:08x}", timestamp, random)
}
