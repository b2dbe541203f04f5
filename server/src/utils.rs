use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

// Wall clock in unix seconds, used for ban expiry
pub fn unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_secs()
}

// Milliseconds elapsed since `start`, the master's internal clock
pub fn millis_since(start: Instant) -> u64 {
    let millis = start.elapsed().as_millis();
    millis.min(u64::MAX as u128) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unix_time_is_after_2020() {
        assert!(unix_time() > 1_577_836_800);
    }

    #[test]
    fn test_millis_since_is_monotonic() {
        let start = Instant::now();
        let first = millis_since(start);
        std::thread::sleep(Duration::from_millis(5));
        assert!(millis_since(start) >= first + 5);
    }
}
