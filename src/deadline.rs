//! Expiry arithmetic for the in-process stores.
//!
//! TTLs and windows come from configuration and callers, so `now + ttl` can
//! overflow `Instant`. Store deadlines are capped at [`MAX_TTL`].

use std::time::Duration;

use tokio::time::Instant;

/// Longest lifetime any in-process entry is given (one year)
pub const MAX_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// `now + ttl`, with `ttl` capped at [`MAX_TTL`]
pub fn expires_after(now: Instant, ttl: Duration) -> Instant {
    let ttl = ttl.min(MAX_TTL);
    now.checked_add(ttl).unwrap_or(now)
}

/// `now + ttl`, or `None` when the deadline is not representable
pub fn checked_expiry(now: Instant, ttl: Duration) -> Option<Instant> {
    now.checked_add(ttl)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_huge_ttl_is_capped() {
        let now = Instant::now();
        assert_eq!(expires_after(now, Duration::MAX), now + MAX_TTL);
        assert_eq!(
            expires_after(now, Duration::from_secs(u64::MAX)),
            now + MAX_TTL
        );
    }

    #[test]
    fn test_ordinary_ttl_unchanged() {
        let now = Instant::now();
        let ttl = Duration::from_secs(60);
        assert_eq!(expires_after(now, ttl), now + ttl);
        assert_eq!(checked_expiry(now, ttl), Some(now + ttl));
    }

    #[test]
    fn test_unrepresentable_expiry() {
        assert_eq!(checked_expiry(Instant::now(), Duration::MAX), None);
    }
}
