/// Running totals across every result written in this session. Never reset.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    /// Non-zero map entries seen
    pub tuples: u64,
    /// Sum of all non-zero counter values
    pub total: u64,
    /// Highest single counter value
    pub highest: u8,
}

impl Stats {
    pub fn record(&mut self, count: u8) {
        if count == 0 {
            return;
        }

        self.tuples += 1;
        self.total += u64::from(count);
        self.highest = self.highest.max(count);
    }
}

#[test]
fn test_stats_accumulate() {
    let mut stats = Stats::default();
    for &c in &[0u8, 3, 0, 8, 1] {
        stats.record(c);
    }
    assert_eq!(stats.tuples, 3);
    assert_eq!(stats.total, 12);
    assert_eq!(stats.highest, 8);

    stats.record(2);
    assert_eq!(stats.tuples, 4);
    assert_eq!(stats.highest, 8);
}
