//! Per-client connection limiter.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;

/// Bounds the number of concurrent connections per remote IP.
#[derive(Debug)]
pub struct ClientLimiter {
    max: usize,
    counts: Mutex<HashMap<IpAddr, usize>>,
}

impl ClientLimiter {
    pub fn new(max: usize) -> Self {
        Self {
            max,
            counts: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a connection from `ip`. Returns `true` when the connection
    /// must be rejected because the client is already at the limit.
    pub fn inc(&self, ip: IpAddr) -> bool {
        let mut counts = self.counts.lock();
        let current = counts.entry(ip).or_insert(0);
        if *current >= self.max {
            return true;
        }
        *current += 1;
        false
    }

    /// Unregisters a connection from `ip`. Entries that reach zero are
    /// removed rather than kept around.
    pub fn dec(&self, ip: IpAddr) {
        let mut counts = self.counts.lock();
        if let Some(current) = counts.get_mut(&ip) {
            if *current <= 1 {
                counts.remove(&ip);
            } else {
                *current -= 1;
            }
        }
    }

    /// Current count for one client.
    pub fn count(&self, ip: IpAddr) -> usize {
        self.counts.lock().get(&ip).copied().unwrap_or(0)
    }

    /// Number of distinct clients currently tracked.
    pub fn clients(&self) -> usize {
        self.counts.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([10, 0, 0, last])
    }

    #[test]
    fn test_limit_enforced() {
        let limiter = ClientLimiter::new(2);
        assert!(!limiter.inc(ip(1)));
        assert!(!limiter.inc(ip(1)));
        assert!(limiter.inc(ip(1)), "third connection must be rejected");
        assert_eq!(limiter.count(ip(1)), 2);

        // A different client is unaffected.
        assert!(!limiter.inc(ip(2)));
    }

    #[test]
    fn test_dec_frees_slot() {
        let limiter = ClientLimiter::new(1);
        assert!(!limiter.inc(ip(1)));
        assert!(limiter.inc(ip(1)));
        limiter.dec(ip(1));
        assert!(!limiter.inc(ip(1)));
    }

    #[test]
    fn test_zero_count_removes_entry() {
        let limiter = ClientLimiter::new(5);
        limiter.inc(ip(1));
        limiter.inc(ip(1));
        limiter.dec(ip(1));
        assert_eq!(limiter.clients(), 1);
        limiter.dec(ip(1));
        assert_eq!(limiter.clients(), 0);
    }

    #[test]
    fn test_dec_unknown_ip_is_noop() {
        let limiter = ClientLimiter::new(1);
        limiter.dec(ip(9));
        assert_eq!(limiter.clients(), 0);
    }
}
