// Kahan-compensated floating point accumulation. Both consumers sum millions
// of payloads; naive summation drifts enough to fail the cross-check between
// the aggregator and the recorder.

use std::sync::atomic::{AtomicU64, Ordering};

/// Plain compensated accumulator for single-thread use.
#[derive(Debug, Default, Clone, Copy)]
pub struct KahanSum {
    sum: f64,
    compensation: f64,
}

impl KahanSum {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, value: f64) {
        let y = value - self.compensation;
        let t = self.sum + y;
        self.compensation = (t - self.sum) - y;
        self.sum = t;
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }
}

/// Compensated accumulator readable from other threads.
///
/// The sum and compensation are stored as f64 bit patterns in atomics so the
/// driver thread can read or reset while a worker owns the arithmetic.
/// Only one thread may call `add` at a time; within the aggregator that is
/// the live loop in a normal epoch and the recovering thread while the live
/// loop is parked.
#[derive(Debug, Default)]
pub(crate) struct AtomicKahanSum {
    sum_bits: AtomicU64,
    compensation_bits: AtomicU64,
}

impl AtomicKahanSum {
    pub fn add(&self, value: f64) {
        let sum = f64::from_bits(self.sum_bits.load(Ordering::Relaxed));
        let compensation = f64::from_bits(self.compensation_bits.load(Ordering::Relaxed));
        let y = value - compensation;
        let t = sum + y;
        self.compensation_bits
            .store(((t - sum) - y).to_bits(), Ordering::Relaxed);
        self.sum_bits.store(t.to_bits(), Ordering::Release);
    }

    pub fn sum(&self) -> f64 {
        f64::from_bits(self.sum_bits.load(Ordering::Acquire))
    }

    pub fn reset(&self) {
        self.sum_bits.store(0f64.to_bits(), Ordering::Release);
        self.compensation_bits.store(0f64.to_bits(), Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kahan_recovers_small_terms() {
        // 1.0 followed by many terms below f64 epsilon relative to the
        // running sum: naive addition loses them all.
        let mut kahan = KahanSum::new();
        let mut naive = 0.0f64;
        kahan.add(1.0);
        naive += 1.0;
        for _ in 0..10_000_000 {
            kahan.add(1e-16);
            naive += 1e-16;
        }
        let exact = 1.0 + 1e-16 * 10_000_000.0;
        assert!((kahan.sum() - exact).abs() < 1e-12);
        assert!((naive - exact).abs() > (kahan.sum() - exact).abs());
    }

    #[test]
    fn atomic_variant_matches_plain() {
        let atomic = AtomicKahanSum::default();
        let mut plain = KahanSum::new();
        for i in 0..1000 {
            let x = (i as f64) * 0.1;
            atomic.add(x);
            plain.add(x);
        }
        assert_eq!(atomic.sum(), plain.sum());
        atomic.reset();
        assert_eq!(atomic.sum(), 0.0);
    }
}
