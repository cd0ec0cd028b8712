//! # Utility Functions
//!
//! Small helpers shared by the driver and its tests.

use chrono::Utc;

/// Byte used to fill message bodies.
pub const FILLER_BYTE: u8 = b'x';

/// Current wall-clock time as milliseconds since the Unix epoch.
///
/// Sender and receiver timestamps are compared across processes and must
/// share a clock.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Build a message body of `size` filler bytes.
///
/// ```rust
/// # use quiver_arrow::utils::filler_body;
/// assert_eq!(filler_body(3), b"xxx".to_vec());
/// ```
pub fn filler_body(size: usize) -> Vec<u8> {
    vec![FILLER_BYTE; size]
}
