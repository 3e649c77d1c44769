//! Command identifier generation.

use std::sync::atomic::{AtomicU64, Ordering};

use rand::rngs::OsRng;
use rand::RngCore;

/// Prefix shared by every command identifier.
pub const COMMAND_ID_PREFIX: &str = "cmd_";

static FALLBACK_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generates a new command identifier of the form `cmd_<hex>`.
///
/// The hex body is a v4 UUID drawn from the OS random source. If that source
/// is unavailable the id falls back to `<millis hex><nanos^counter hex>`,
/// which is unique within this process but offers far weaker collision
/// resistance across processes. The fallback is logged at `warn`.
pub fn new_command_id() -> String {
    let mut bytes = [0u8; 16];
    match OsRng.try_fill_bytes(&mut bytes) {
        Ok(()) => {
            let id = uuid::Builder::from_random_bytes(bytes).into_uuid();
            format!("{}{}", COMMAND_ID_PREFIX, id.simple())
        }
        Err(e) => {
            tracing::warn!(error = %e, "OS random source unavailable, using weak command id");
            fallback_command_id()
        }
    }
}

fn fallback_command_id() -> String {
    let now = chrono::Utc::now();
    let millis = now.timestamp_millis().max(0) as u64;
    let counter = FALLBACK_COUNTER.fetch_add(1, Ordering::Relaxed);
    let suffix = u64::from(now.timestamp_subsec_nanos()) ^ counter.rotate_left(32);
    format!("{}{:x}{:x}", COMMAND_ID_PREFIX, millis, suffix)
}

/// Returns true if `id` has the `cmd_<hex>` shape and is safe to embed in a path.
pub fn is_command_id(id: &str) -> bool {
    id.strip_prefix(COMMAND_ID_PREFIX)
        .map(|body| !body.is_empty() && body.chars().all(|c| c.is_ascii_hexdigit()))
        .unwrap_or(false)
}
