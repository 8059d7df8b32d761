//! memtester test routines.
//!
//! Every test except `StuckAddress` treats the region as two equal halves,
//! writes identical values into both and then compares them word by word.
//! A flaky cell, a coupling fault or a bus error makes the halves disagree.
//! `StuckAddress` writes each word's own address (or its complement) across
//! the whole region to catch broken address lines.
//!
//! Tests reach memory only through [`TestMemory`], so a region with injected
//! faults can stand in for real RAM.

use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};

const UL_LEN: u32 = u64::BITS;
const WORD_BYTES: usize = std::mem::size_of::<u64>();
const CHECKERBOARD1: u64 = 0x5555_5555_5555_5555;
const CHECKERBOARD2: u64 = 0xAAAA_AAAA_AAAA_AAAA;

/// Upper bound on mismatches kept per test; the rest are only counted.
pub const MAX_SAMPLES: usize = 16;

/// Word-addressed memory under test.
pub trait TestMemory {
    /// Number of 64-bit words.
    fn len(&self) -> usize;

    fn read(&self, index: usize) -> u64;

    fn write(&mut self, index: usize, value: u64);

    /// The bus address of word `index`.
    fn address(&self, index: usize) -> u64;

    /// Writes byte `lane` of word `index`, in native byte order.
    fn write_u8(&mut self, index: usize, lane: usize, value: u8) {
        let mut bytes = self.read(index).to_ne_bytes();
        bytes[lane] = value;
        self.write(index, u64::from_ne_bytes(bytes));
    }

    /// Writes 16-bit `lane` of word `index`, in native byte order.
    fn write_u16(&mut self, index: usize, lane: usize, value: u16) {
        let mut bytes = self.read(index).to_ne_bytes();
        bytes[lane * 2..lane * 2 + 2].copy_from_slice(&value.to_ne_bytes());
        self.write(index, u64::from_ne_bytes(bytes));
    }
}

impl TestMemory for [u64] {
    fn len(&self) -> usize {
        <[u64]>::len(self)
    }

    #[inline]
    fn read(&self, index: usize) -> u64 {
        // SAFETY: the indexed element is a valid, aligned reference.
        unsafe { std::ptr::read_volatile(&self[index]) }
    }

    #[inline]
    fn write(&mut self, index: usize, value: u64) {
        // SAFETY: the indexed element is a valid, aligned, exclusive reference.
        unsafe { std::ptr::write_volatile(&mut self[index], value) }
    }

    fn address(&self, index: usize) -> u64 {
        &self[index] as *const u64 as u64
    }

    fn write_u8(&mut self, index: usize, lane: usize, value: u8) {
        assert!(lane < WORD_BYTES);
        let word: *mut u64 = &mut self[index];
        // SAFETY: lane < 8 keeps the byte inside the word.
        unsafe { std::ptr::write_volatile((word as *mut u8).add(lane), value) }
    }

    fn write_u16(&mut self, index: usize, lane: usize, value: u16) {
        assert!(lane < WORD_BYTES / 2);
        let word: *mut u64 = &mut self[index];
        // SAFETY: lane < 4 keeps the halfword inside the word, and a u64
        // address is always 2-byte aligned.
        unsafe { std::ptr::write_volatile((word as *mut u16).add(lane), value) }
    }
}

/// The memtester test suite, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemTest {
    StuckAddress,
    RandomValue,
    CompareXor,
    CompareSub,
    CompareMul,
    CompareDiv,
    CompareOr,
    CompareAnd,
    SequentialIncrement,
    SolidBits,
    BlockSequential,
    Checkerboard,
    BitSpread,
    BitFlip,
    WalkingOnes,
    WalkingZeros,
    EightBitWrites,
    SixteenBitWrites,
}

/// A word that read back different from what was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mismatch {
    /// Byte offset from the start of the half (or region, for stuck address).
    pub offset: usize,
    pub expected: u64,
    pub actual: u64,
}

/// Result of running one test over a region.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestOutcome {
    /// Total mismatching words seen, across all passes.
    pub failures: u64,
    /// The first few mismatches, capped at [`MAX_SAMPLES`].
    pub samples: Vec<Mismatch>,
    /// The test gave up early because a stop was requested.
    pub interrupted: bool,
}

impl TestOutcome {
    pub fn is_ok(&self) -> bool {
        self.failures == 0
    }

    fn record(&mut self, mismatch: Mismatch) {
        self.failures += 1;
        if self.samples.len() < MAX_SAMPLES {
            self.samples.push(mismatch);
        }
    }

    fn merge(&mut self, pass: TestOutcome) {
        self.failures += pass.failures;
        let room = MAX_SAMPLES.saturating_sub(self.samples.len());
        self.samples.extend(pass.samples.into_iter().take(room));
    }
}

impl MemTest {
    /// Returns every test in the order memtester runs them.
    pub fn all() -> Vec<Self> {
        vec![
            Self::StuckAddress,
            Self::RandomValue,
            Self::CompareXor,
            Self::CompareSub,
            Self::CompareMul,
            Self::CompareDiv,
            Self::CompareOr,
            Self::CompareAnd,
            Self::SequentialIncrement,
            Self::SolidBits,
            Self::BlockSequential,
            Self::Checkerboard,
            Self::BitSpread,
            Self::BitFlip,
            Self::WalkingOnes,
            Self::WalkingZeros,
            Self::EightBitWrites,
            Self::SixteenBitWrites,
        ]
    }

    /// Returns the human-readable name of this test.
    pub fn name(&self) -> &'static str {
        match self {
            Self::StuckAddress => "Stuck Address",
            Self::RandomValue => "Random Value",
            Self::CompareXor => "Compare XOR",
            Self::CompareSub => "Compare SUB",
            Self::CompareMul => "Compare MUL",
            Self::CompareDiv => "Compare DIV",
            Self::CompareOr => "Compare OR",
            Self::CompareAnd => "Compare AND",
            Self::SequentialIncrement => "Sequential Increment",
            Self::SolidBits => "Solid Bits",
            Self::BlockSequential => "Block Sequential",
            Self::Checkerboard => "Checkerboard",
            Self::BitSpread => "Bit Spread",
            Self::BitFlip => "Bit Flip",
            Self::WalkingOnes => "Walking Ones",
            Self::WalkingZeros => "Walking Zeros",
            Self::EightBitWrites => "8-bit Writes",
            Self::SixteenBitWrites => "16-bit Writes",
        }
    }

    /// Returns true for the test that checks address lines rather than cells.
    pub fn is_address_test(&self) -> bool {
        matches!(self, Self::StuckAddress)
    }

    /// Runs this test over `mem`.
    ///
    /// Comparison tests split `mem` into two halves; an odd trailing word
    /// is left untouched. The compare-op tests (XOR, SUB, ...) mutate whatever
    /// the halves already hold, so they rely on the halves being equal on
    /// entry, which the preceding test in [`MemTest::all`] guarantees.
    pub fn run<M, R>(&self, mem: &mut M, rng: &mut R, should_stop: &AtomicBool) -> TestOutcome
    where
        M: TestMemory + ?Sized,
        R: Rng,
    {
        let half = mem.len() / 2;

        match self {
            Self::StuckAddress => stuck_address(mem, should_stop),
            Self::RandomValue => {
                fill_pair(mem, half, |_| rng.gen());
                compare_halves(mem, half)
            }
            Self::CompareXor => compare_op(mem, half, rng.gen(), |v, q| v ^ q),
            Self::CompareSub => compare_op(mem, half, rng.gen(), |v, q| v.wrapping_sub(q)),
            Self::CompareMul => compare_op(mem, half, rng.gen(), |v, q| v.wrapping_mul(q)),
            Self::CompareDiv => {
                let q: u64 = rng.gen();
                compare_op(mem, half, q.max(1), |v, q| v / q)
            }
            Self::CompareOr => compare_op(mem, half, rng.gen(), |v, q| v | q),
            Self::CompareAnd => compare_op(mem, half, rng.gen(), |v, q| v & q),
            Self::SequentialIncrement => {
                let q: u64 = rng.gen();
                fill_pair(mem, half, |i| (i as u64).wrapping_add(q));
                compare_halves(mem, half)
            }
            Self::SolidBits => passes(mem, half, 0..64, should_stop, |j, i| {
                let q = if j % 2 == 0 { u64::MAX } else { 0 };
                alternate(i, q)
            }),
            Self::BlockSequential => {
                passes(mem, half, 0..256, should_stop, |j, _| byte_fill(j as u8))
            }
            Self::Checkerboard => passes(mem, half, 0..64, should_stop, |j, i| {
                let q = if j % 2 == 0 {
                    CHECKERBOARD1
                } else {
                    CHECKERBOARD2
                };
                alternate(i, q)
            }),
            Self::BitSpread => passes(mem, half, 0..UL_LEN * 2, should_stop, |j, i| {
                let bits = bit_spread(j);
                alternate(i, bits)
            }),
            Self::BitFlip => passes(mem, half, 0..UL_LEN * 8, should_stop, |step, i| {
                let (k, j) = (step / 8, step % 8);
                // q is inverted once per inner step, starting from 1 << k.
                let q = if j % 2 == 0 { !(1u64 << k) } else { 1u64 << k };
                alternate(i, q)
            }),
            Self::WalkingOnes => {
                passes(mem, half, 0..UL_LEN * 2, should_stop, |j, _| walking_bit(j))
            }
            Self::WalkingZeros => {
                passes(mem, half, 0..UL_LEN * 2, should_stop, |j, _| !walking_bit(j))
            }
            Self::EightBitWrites => narrow_random(mem, half, rng, should_stop, write_bytes),
            Self::SixteenBitWrites => narrow_random(mem, half, rng, should_stop, write_halfwords),
        }
    }
}

/// Compares the two halves word by word, recording every mismatch.
fn compare_halves<M: TestMemory + ?Sized>(mem: &M, half: usize) -> TestOutcome {
    let mut outcome = TestOutcome::default();
    for i in 0..half {
        let (expected, actual) = (mem.read(i), mem.read(half + i));
        if expected != actual {
            outcome.record(Mismatch {
                offset: i * WORD_BYTES,
                expected,
                actual,
            });
        }
    }
    outcome
}

fn fill_pair<M: TestMemory + ?Sized>(mem: &mut M, half: usize, mut value: impl FnMut(usize) -> u64) {
    for i in 0..half {
        let v = value(i);
        mem.write(i, v);
        mem.write(half + i, v);
    }
}

fn compare_op<M: TestMemory + ?Sized>(
    mem: &mut M,
    half: usize,
    q: u64,
    op: impl Fn(u64, u64) -> u64,
) -> TestOutcome {
    for i in 0..half {
        let va = op(mem.read(i), q);
        mem.write(i, va);
        let vb = op(mem.read(half + i), q);
        mem.write(half + i, vb);
    }
    compare_halves(mem, half)
}

/// Runs one fill/compare pass per step, accumulating mismatches.
fn passes<M: TestMemory + ?Sized>(
    mem: &mut M,
    half: usize,
    steps: std::ops::Range<u32>,
    should_stop: &AtomicBool,
    value: impl Fn(u32, usize) -> u64,
) -> TestOutcome {
    let mut total = TestOutcome::default();
    for step in steps {
        if should_stop.load(Ordering::Relaxed) {
            total.interrupted = true;
            break;
        }
        fill_pair(mem, half, |i| value(step, i));
        total.merge(compare_halves(mem, half));
    }
    total
}

/// Fills one half with full-word stores and the other through `write_narrow`,
/// then swaps the roles for a second attempt.
fn narrow_random<M, R>(
    mem: &mut M,
    half: usize,
    rng: &mut R,
    should_stop: &AtomicBool,
    write_narrow: fn(&mut M, usize, u64),
) -> TestOutcome
where
    M: TestMemory + ?Sized,
    R: Rng,
{
    let mut total = TestOutcome::default();
    for attempt in 0..2 {
        if should_stop.load(Ordering::Relaxed) {
            total.interrupted = true;
            break;
        }
        let (narrow, wide) = if attempt % 2 == 1 { (0, half) } else { (half, 0) };
        for i in 0..half {
            let value: u64 = rng.gen();
            mem.write(wide + i, value);
            write_narrow(mem, narrow + i, value);
        }
        total.merge(compare_halves(mem, half));
    }
    total
}

fn write_bytes<M: TestMemory + ?Sized>(mem: &mut M, index: usize, value: u64) {
    for (lane, byte) in value.to_ne_bytes().into_iter().enumerate() {
        mem.write_u8(index, lane, byte);
    }
}

fn write_halfwords<M: TestMemory + ?Sized>(mem: &mut M, index: usize, value: u64) {
    let bytes = value.to_ne_bytes();
    for (lane, pair) in bytes.chunks_exact(2).enumerate() {
        mem.write_u16(index, lane, u16::from_ne_bytes([pair[0], pair[1]]));
    }
}

fn alternate(i: usize, q: u64) -> u64 {
    if i % 2 == 0 {
        q
    } else {
        !q
    }
}

/// The byte `b` repeated in every byte of a word.
fn byte_fill(b: u8) -> u64 {
    u64::from_ne_bytes([b; 8])
}

/// A single set bit walking up the word and then back down.
fn walking_bit(j: u32) -> u64 {
    if j < UL_LEN {
        1u64 << j
    } else {
        1u64 << (UL_LEN * 2 - j - 1)
    }
}

/// Two set bits two positions apart, walking up and back down.
fn bit_spread(j: u32) -> u64 {
    let shl = |n: u32| 1u64.checked_shl(n).unwrap_or(0);
    if j < UL_LEN {
        shl(j) | shl(j + 2)
    } else {
        let down = UL_LEN * 2 - 1 - j;
        shl(down) | shl(down + 2)
    }
}

fn stuck_address<M: TestMemory + ?Sized>(mem: &mut M, should_stop: &AtomicBool) -> TestOutcome {
    let address_pattern = |addr: u64, j: usize, i: usize| {
        if (j + i) % 2 == 0 {
            addr
        } else {
            !addr
        }
    };

    let mut outcome = TestOutcome::default();
    for j in 0..16 {
        if should_stop.load(Ordering::Relaxed) {
            outcome.interrupted = true;
            break;
        }
        for i in 0..mem.len() {
            let value = address_pattern(mem.address(i), j, i);
            mem.write(i, value);
        }
        for i in 0..mem.len() {
            let expected = address_pattern(mem.address(i), j, i);
            let actual = mem.read(i);
            if actual != expected {
                // A broken address line corrupts the whole sweep; stop at the first.
                outcome.record(Mismatch {
                    offset: i * WORD_BYTES,
                    expected,
                    actual,
                });
                return outcome;
            }
        }
    }
    outcome
}


#[cfg(test)]
mod tests {
    use super::fault_injection::StuckBits;
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    const TEST_WORDS: usize = 1024;

    fn run_on<M: TestMemory + ?Sized>(test: MemTest, mem: &mut M, seed: u64) -> TestOutcome {
        let mut rng = StdRng::seed_from_u64(seed);
        test.run(mem, &mut rng, &AtomicBool::new(false))
    }

    #[test]
    fn test_all_tests_count() {
        assert_eq!(MemTest::all().len(), 18);
        assert_eq!(MemTest::all()[0], MemTest::StuckAddress);
        assert_eq!(MemTest::all()[17], MemTest::SixteenBitWrites);
    }

    #[test]
    fn test_names() {
        assert_eq!(MemTest::StuckAddress.name(), "Stuck Address");
        assert_eq!(MemTest::CompareXor.name(), "Compare XOR");
        assert_eq!(MemTest::SequentialIncrement.name(), "Sequential Increment");
        assert_eq!(MemTest::WalkingZeros.name(), "Walking Zeros");
        assert_eq!(MemTest::EightBitWrites.name(), "8-bit Writes");
    }

    #[test]
    fn test_only_stuck_address_is_address_test() {
        let address_tests: Vec<_> = MemTest::all()
            .into_iter()
            .filter(|t| t.is_address_test())
            .collect();
        assert_eq!(address_tests, vec![MemTest::StuckAddress]);
    }

    #[test]
    fn test_every_test_passes_on_healthy_memory() {
        let mut region = vec![0u64; TEST_WORDS];
        let mut rng = StdRng::seed_from_u64(42);
        let stop = AtomicBool::new(false);

        for test in MemTest::all() {
            let outcome = test.run(&mut region[..], &mut rng, &stop);
            assert!(outcome.is_ok(), "{} failed: {:?}", test.name(), outcome);
            assert!(!outcome.interrupted);
        }
    }

    #[test]
    fn test_every_test_finds_a_stuck_word() {
        let half = 64;
        let bad = 5;

        for test in MemTest::all() {
            let mut mem = StuckBits::word(2 * half, half + bad);
            let outcome = run_on(test, &mut mem, 11);

            let expected_offset = if test.is_address_test() {
                (half + bad) * 8
            } else {
                bad * 8
            };
            assert!(outcome.failures > 0, "{} missed the fault", test.name());
            assert!(
                outcome.samples.iter().all(|m| m.offset == expected_offset),
                "{} reported {:?}",
                test.name(),
                outcome.samples
            );
        }
    }

    #[test]
    fn test_stuck_address_reports_first_bad_word() {
        let mut mem = StuckBits::new(32, 20, 1 << 4, 0);
        let outcome = run_on(MemTest::StuckAddress, &mut mem, 0);

        assert_eq!(outcome.failures, 1);
        let mismatch = outcome.samples[0];
        assert_eq!(mismatch.offset, 20 * 8);
        assert_eq!(mismatch.expected ^ mismatch.actual, 1 << 4);
    }

    #[test]
    fn test_bit_flip_finds_single_stuck_bit() {
        let mut mem = StuckBits::new(16, 8 + 5, 1 << 3, 0);
        let outcome = run_on(MemTest::BitFlip, &mut mem, 0);

        assert!(outcome.failures > 1);
        assert_eq!(outcome.samples.len(), MAX_SAMPLES);
        assert!(outcome.samples.iter().all(|m| m.offset == 40));
        assert!(outcome.samples.iter().all(|m| m.expected & (1 << 3) != 0));
    }

    #[test]
    fn test_walking_zeros_finds_stuck_high_bit() {
        let mut mem = StuckBits::new(16, 8, 1 << 63, 1 << 63);
        let outcome = run_on(MemTest::WalkingZeros, &mut mem, 0);

        // Bit 63 is low exactly once on the way up and once on the way down.
        assert_eq!(outcome.failures, 2);
        assert_eq!(outcome.samples[0].offset, 0);
    }

    #[test]
    fn test_compare_halves_reports_offset() {
        let mut region = vec![0u64; 128];
        region[64 + 10] = 0xDEAD;

        let outcome = compare_halves(&region[..], 64);
        assert_eq!(outcome.failures, 1);
        assert_eq!(
            outcome.samples[0],
            Mismatch {
                offset: 80,
                expected: 0,
                actual: 0xDEAD
            }
        );
    }

    #[test]
    fn test_compare_halves_caps_samples() {
        let mut region = vec![0u64; 128];
        region[64..].fill(1);

        let outcome = compare_halves(&region[..], 64);
        assert_eq!(outcome.failures, 64);
        assert_eq!(outcome.samples.len(), MAX_SAMPLES);
    }

    #[test]
    fn test_compare_op_detects_unequal_halves() {
        // Halves disagree on entry, so the XOR test must see it.
        let mut region = vec![0u64; TEST_WORDS];
        region[TEST_WORDS / 2 + 3] = 1;

        let outcome = run_on(MemTest::CompareXor, &mut region[..], 1);
        assert_eq!(outcome.failures, 1);
        assert_eq!(outcome.samples[0].offset, 3 * 8);
    }

    #[test]
    fn test_compare_div_never_divides_by_zero() {
        let mut region = vec![u64::MAX; 8];
        let mut rng = StdRng::seed_from_u64(0);
        for _ in 0..100 {
            let outcome = MemTest::CompareDiv.run(&mut region[..], &mut rng, &AtomicBool::new(false));
            assert!(outcome.is_ok());
        }
    }

    #[test]
    fn test_stuck_address_leaves_address_pattern() {
        let mut region = vec![0u64; 32];
        let outcome = run_on(MemTest::StuckAddress, &mut region[..], 0);
        assert!(outcome.is_ok());

        // Last sweep is j = 15, so even words hold the complement.
        let addr0 = &region[0] as *const u64 as u64;
        let addr1 = &region[1] as *const u64 as u64;
        assert_eq!(region[0], !addr0);
        assert_eq!(region[1], addr1);
    }

    #[test]
    fn test_odd_region_ignores_trailing_word() {
        let mut region = vec![0u64; 9];
        region[8] = 0x1234;

        let outcome = run_on(MemTest::SolidBits, &mut region[..], 3);
        assert!(outcome.is_ok());
        assert_eq!(region[8], 0x1234);
    }

    #[test]
    fn test_multi_pass_test_stops_when_requested() {
        let mut region = vec![0u64; TEST_WORDS];
        let mut rng = StdRng::seed_from_u64(3);
        let stop = AtomicBool::new(true);

        let outcome = MemTest::BitFlip.run(&mut region[..], &mut rng, &stop);
        assert!(outcome.interrupted);
        assert!(outcome.is_ok());

        let outcome = MemTest::EightBitWrites.run(&mut region[..], &mut rng, &stop);
        assert!(outcome.interrupted);
    }

    #[test]
    fn test_sequential_increment_fills_both_halves() {
        let mut region = vec![0u64; 16];
        let outcome = run_on(MemTest::SequentialIncrement, &mut region[..], 9);
        assert!(outcome.is_ok());
        assert_eq!(&region[..8], &region[8..]);
        assert_eq!(region[1].wrapping_sub(region[0]), 1);
    }

    #[test]
    fn test_narrow_writes_land_in_the_right_lanes() {
        let mut region = vec![0u64; 2];
        write_bytes(&mut region[..], 0, 0x0102_0304_0506_0708);
        write_halfwords(&mut region[..], 1, 0x1122_3344_5566_7788);
        assert_eq!(region[0], 0x0102_0304_0506_0708);
        assert_eq!(region[1], 0x1122_3344_5566_7788);
    }

    #[test]
    fn test_default_narrow_writes_match_slice_writes() {
        let mut mem = StuckBits::new(2, 0, 0, 0);
        write_bytes(&mut mem, 1, 0xA1B2_C3D4_E5F6_0718);
        write_halfwords(&mut mem, 0, 0x0F1E_2D3C_4B5A_6978);
        assert_eq!(mem.read(1), 0xA1B2_C3D4_E5F6_0718);
        assert_eq!(mem.read(0), 0x0F1E_2D3C_4B5A_6978);
    }

    #[test]
    fn test_walking_bit_sequence() {
        assert_eq!(walking_bit(0), 1);
        assert_eq!(walking_bit(63), 1 << 63);
        assert_eq!(walking_bit(64), 1 << 63);
        assert_eq!(walking_bit(127), 1);
    }

    #[test]
    fn test_bit_spread_drops_bits_past_the_top() {
        assert_eq!(bit_spread(0), 0b101);
        assert_eq!(bit_spread(62), 1 << 62);
        assert_eq!(bit_spread(64), 1 << 63);
        assert_eq!(bit_spread(127), 0b101);
    }

    #[test]
    fn test_byte_fill() {
        assert_eq!(byte_fill(0), 0);
        assert_eq!(byte_fill(0xAB), 0xABAB_ABAB_ABAB_ABAB);
        assert_eq!(byte_fill(0xFF), u64::MAX);
    }

    #[test]
    fn test_checkerboard_final_pass_alternates() {
        let mut region = vec![0u64; 8];
        run_on(MemTest::Checkerboard, &mut region[..], 0);

        // Pass 63 is odd, so the pass value is CHECKERBOARD2.
        assert_eq!(region[0], CHECKERBOARD2);
        assert_eq!(region[1], CHECKERBOARD1);
        assert_eq!(region[0] ^ region[1], u64::MAX);
    }
}
