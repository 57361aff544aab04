//! Event and shadow-cell counters.
//!
//! Each thread counts into its own `Stats` (no synchronization on the hot
//! path); the engine merges them into the process-wide totals when the
//! thread finishes and prints the table at finalize when
//! `Options::collect_stats` is set.

#[derive(Debug, Default, Clone)]
pub struct Stats {
    pub mop: u64,
    pub mop_read: u64,
    pub mop_write: u64,
    /// Indexed by size log: accesses of 1, 2, 4, 8 bytes.
    pub mop_size: [u64; 4],
    pub mop_same: u64,
    pub mop_range: u64,
    pub shadow_processed: u64,
    pub shadow_zero: u64,
    pub shadow_same_size: u64,
    pub shadow_intersect: u64,
    pub shadow_not_intersect: u64,
    pub shadow_same_thread: u64,
    pub shadow_another_thread: u64,
    pub shadow_replace: u64,
    pub func_enter: u64,
    pub func_exit: u64,
    pub events: u64,
}

impl Stats {
    pub fn merge(&mut self, other: &Stats) {
        self.mop += other.mop;
        self.mop_read += other.mop_read;
        self.mop_write += other.mop_write;
        for (d, s) in self.mop_size.iter_mut().zip(other.mop_size.iter()) {
            *d += *s;
        }
        self.mop_same += other.mop_same;
        self.mop_range += other.mop_range;
        self.shadow_processed += other.shadow_processed;
        self.shadow_zero += other.shadow_zero;
        self.shadow_same_size += other.shadow_same_size;
        self.shadow_intersect += other.shadow_intersect;
        self.shadow_not_intersect += other.shadow_not_intersect;
        self.shadow_same_thread += other.shadow_same_thread;
        self.shadow_another_thread += other.shadow_another_thread;
        self.shadow_replace += other.shadow_replace;
        self.func_enter += other.func_enter;
        self.func_exit += other.func_exit;
        self.events += other.events;
    }

    /// Human-readable table in the order the counters nest.
    pub fn render(&self) -> String {
        let rows: [(&str, u64); 19] = [
            ("Memory accesses", self.mop),
            ("  Including reads", self.mop_read),
            ("            writes", self.mop_write),
            ("  Including size 1", self.mop_size[0]),
            ("            size 2", self.mop_size[1]),
            ("            size 4", self.mop_size[2]),
            ("            size 8", self.mop_size[3]),
            ("  Including same-range", self.mop_same),
            ("Range accesses", self.mop_range),
            ("Shadow words processed", self.shadow_processed),
            ("  Including empty", self.shadow_zero),
            ("            intersect", self.shadow_intersect),
            ("            not intersect", self.shadow_not_intersect),
            ("  Including same thread", self.shadow_same_thread),
            ("            another thread", self.shadow_another_thread),
            ("  Including evicted", self.shadow_replace),
            ("Function entries", self.func_enter),
            ("Function exits", self.func_exit),
            ("Events collected", self.events),
        ];
        let mut out = String::from("Statistics:\n");
        for (name, val) in rows {
            out.push_str(&format!("{name:<30}: {val}\n"));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_sums_counters() {
        let mut a = Stats {
            mop: 10,
            mop_read: 6,
            mop_write: 4,
            mop_size: [1, 2, 3, 4],
            ..Stats::default()
        };
        let b = Stats {
            mop: 5,
            mop_read: 5,
            mop_size: [4, 3, 2, 1],
            func_enter: 7,
            ..Stats::default()
        };
        a.merge(&b);
        assert_eq!(a.mop, 15);
        assert_eq!(a.mop_read, 11);
        assert_eq!(a.mop_write, 4);
        assert_eq!(a.mop_size, [5, 5, 5, 5]);
        assert_eq!(a.func_enter, 7);
    }

    #[test]
    fn test_render_contains_rows() {
        let stats = Stats {
            mop: 123,
            func_enter: 9,
            ..Stats::default()
        };
        let out = stats.render();
        assert!(out.contains("Memory accesses"));
        assert!(out.contains("123"));
        assert!(out.contains("Function entries"));
    }
}
