use std::time::SystemTime;
use std::time::UNIX_EPOCH;

/// return second
pub fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// return second as u32, the resolution of cluster time
pub fn now_secs_u32() -> u32 {
    now_secs() as u32
}

/// Lower bound of a ttl window ending now.
pub fn ttl_floor(ttl_secs: u64) -> u32 {
    now_secs_u32().saturating_sub(ttl_secs as u32)
}
