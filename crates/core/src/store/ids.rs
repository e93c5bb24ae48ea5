//! Document identifier generation.

use std::sync::atomic::{AtomicU64, Ordering};

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Generate a collision-resistant document id.
///
/// Layout is hex of `millis | sequence | random`: ids from one process sort
/// in generation order, and the random tail keeps tabs that start in the
/// same millisecond apart.
pub fn generate_id() -> String {
    let millis = u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0);
    let sequence = SEQUENCE.fetch_add(1, Ordering::Relaxed) & 0xffff;
    let salt = rand::random::<u32>() & 0x00ff_ffff;
    format!("{millis:011x}{sequence:04x}{salt:06x}")
}
