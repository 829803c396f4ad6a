//! Benchmark utilities and helpers.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Generates a deterministic sequence of page-count requests between
/// `min_pages` and `max_pages`.
pub fn generate_page_requests(count: usize, min_pages: usize, max_pages: usize) -> Vec<usize> {
    let mut rng = StdRng::seed_from_u64(42);
    (0..count).map(|_| rng.gen_range(min_pages..=max_pages)).collect()
}

/// Generates a deterministic sequence of byte-size requests spanning the
/// malloc, size-class, and contiguous routing buckets.
pub fn generate_byte_requests(count: usize, max_bytes: usize) -> Vec<usize> {
    let mut rng = StdRng::seed_from_u64(42);
    (0..count).map(|_| rng.gen_range(1..=max_bytes)).collect()
}

/// Generates power-of-two sizes up to `1 << upper_bound_log2`.
pub fn generate_pow_two_sizes(count: usize, upper_bound_log2: u32) -> Vec<usize> {
    let mut rng = StdRng::seed_from_u64(42);
    (0..count)
        .map(|_| 1usize << rng.gen_range(0..=upper_bound_log2))
        .collect()
}
