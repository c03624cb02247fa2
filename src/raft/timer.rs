use rand::Rng;
use std::time::Duration;

/// Random election timeout in `[min_ms, max_ms]`, so that candidates rarely collide.
pub fn random_election_timeout(min_ms: u64, max_ms: u64) -> Duration {
    if min_ms >= max_ms {
        return Duration::from_millis(min_ms);
    }
    Duration::from_millis(rand::thread_rng().gen_range(min_ms..=max_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_stays_in_range() {
        for _ in 0..100 {
            let t = random_election_timeout(150, 300);
            assert!(t >= Duration::from_millis(150) && t <= Duration::from_millis(300));
        }
        assert_eq!(random_election_timeout(80, 80), Duration::from_millis(80));
    }
}
