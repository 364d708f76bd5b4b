use time::OffsetDateTime;

/// Wall-clock seam; tests pin it for deterministic snapshot naming.
pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;

    fn epoch(&self) -> u64 {
        let ts = self.now().unix_timestamp();
        u64::try_from(ts).unwrap_or(0)
    }
}

#[derive(Default, Clone)]
pub struct SystemClock;

impl SystemClock {
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FixedClock;
    use super::*;

    #[test]
    fn fixed_clock_is_deterministic() {
        let c = FixedClock::at_epoch(1_700_000_000);
        assert_eq!(c.epoch(), 1_700_000_000);
        assert_eq!(c.epoch(), 1_700_000_000);
    }

    #[test]
    fn system_clock_moves() {
        assert!(SystemClock::new().epoch() > 1_600_000_000);
    }
}
