//! Wall-clock timestamp helpers for the wire model.
//!
//! Every message and bulk on the wire carries its construction time as
//! fractional unix seconds.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time as fractional unix seconds.
///
/// Falls back to `0.0` if the system clock reports a pre-epoch time; the
/// wire model treats timestamps as informational, so a broken clock must
/// not take down a connection.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
