use std::{
    fmt::Write,
    sync::atomic::{AtomicU64, Ordering},
};

use bytecode::Op;

use crate::dispatch::DispatchStats;

/// Execution counters of a domain.
#[derive(Debug)]
pub struct InterpStats {
    pub transforms: AtomicU64,
    pub calls: AtomicU64,
    pub exceptions: AtomicU64,
    pub dispatch: DispatchStats,
    /// Executions per opcode byte, collected with the `count-ops` option.
    op_counts: Box<[AtomicU64]>,
}

impl Default for InterpStats {
    fn default() -> Self {
        Self {
            transforms: AtomicU64::new(0),
            calls: AtomicU64::new(0),
            exceptions: AtomicU64::new(0),
            dispatch: DispatchStats::default(),
            op_counts: (0..Op::COUNT).map(|_| AtomicU64::new(0)).collect(),
        }
    }
}

impl InterpStats {
    #[inline]
    pub(crate) fn count_op(&self, byte: u8) {
        if let Some(counter) = self.op_counts.get(byte as usize) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn transforms(&self) -> u64 {
        self.transforms.load(Ordering::Relaxed)
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    pub fn exceptions(&self) -> u64 {
        self.exceptions.load(Ordering::Relaxed)
    }

    pub fn op_count(&self, op: Op) -> u64 {
        self.op_counts[op as usize].load(Ordering::Relaxed)
    }

    /// Opcodes that ran at least once, most frequent first.
    pub fn op_counts(&self) -> Vec<(Op, u64)> {
        let mut counts: Vec<(Op, u64)> = self
            .op_counts
            .iter()
            .enumerate()
            .filter_map(|(byte, counter)| {
                let count = counter.load(Ordering::Relaxed);
                let op = Op::try_from(byte as u8).ok()?;
                (count > 0).then_some((op, count))
            })
            .collect();
        counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| (a.0 as u8).cmp(&(b.0 as u8))));
        counts
    }

    pub fn report(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "transforms:          {}", self.transforms());
        let _ = writeln!(out, "calls:               {}", self.calls());
        let _ = writeln!(out, "exceptions:          {}", self.exceptions());
        let _ = writeln!(out, "dispatch resolutions: {}", self.dispatch.resolutions());
        let _ = writeln!(out, "dispatch cache hits: {}", self.dispatch.cache_hits());
        let counts = self.op_counts();
        if !counts.is_empty() {
            let total: u64 = counts.iter().map(|(_, n)| n).sum();
            let _ = writeln!(out, "opcodes executed:    {total}");
            for (op, count) in counts {
                let share = count as f64 * 100.0 / total as f64;
                let _ = writeln!(out, "  {:<20} {count:>12} {share:>6.2}%", format!("{op:?}"));
            }
        }
        out
    }
}
