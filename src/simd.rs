//! # SIMD Fixed-Width Equality Scan
//!
//! An optional fast path for equality scans over fixed-width byte fields
//! embedded in row-major records (dates in `yyyyMMdd` form, padded name
//! fields, interned id words). On x86_64 with AVX2, 32 bytes are compared
//! per vector op; everywhere else a scalar byte comparison produces
//! identical results. This path is never correctness-bearing - callers get
//! the same matches either way, only faster.
//!
//! ## Thread Safety
//!
//! All functions are pure over borrowed data and safe to call from
//! concurrent scan workers.

/// Compares two equal-length byte fields, dispatching to AVX2 when the CPU
/// supports it and the field is wide enough to benefit.
#[inline]
pub fn bytes_equal(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    #[cfg(target_arch = "x86_64")]
    if a.len() >= 32 && is_x86_feature_detected!("avx2") {
        // SAFETY: AVX2 support was just detected, and both slices are at
        // least 32 bytes long.
        return unsafe { bytes_equal_avx2(a, b) };
    }

    a == b
}

// Requires x86_64 with AVX2 (checked by the caller via feature detection).
#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
unsafe fn bytes_equal_avx2(a: &[u8], b: &[u8]) -> bool {
    use std::arch::x86_64::*;

    debug_assert_eq!(a.len(), b.len());
    debug_assert!(a.len() >= 32);

    let len = a.len();
    let mut at = 0;

    while at + 32 <= len {
        // SAFETY: at + 32 <= len bounds both unaligned 32-byte loads.
        let va = _mm256_loadu_si256(a.as_ptr().add(at) as *const __m256i);
        let vb = _mm256_loadu_si256(b.as_ptr().add(at) as *const __m256i);
        let eq = _mm256_cmpeq_epi8(va, vb);
        if _mm256_movemask_epi8(eq) as u32 != 0xFFFF_FFFF {
            return false;
        }
        at += 32;
    }

    // Tail shorter than a vector: re-compare the last 32 bytes, which
    // overlaps already-verified bytes and is always in bounds.
    if at < len {
        let va = _mm256_loadu_si256(a.as_ptr().add(len - 32) as *const __m256i);
        let vb = _mm256_loadu_si256(b.as_ptr().add(len - 32) as *const __m256i);
        let eq = _mm256_cmpeq_epi8(va, vb);
        if _mm256_movemask_epi8(eq) as u32 != 0xFFFF_FFFF {
            return false;
        }
    }

    true
}

/// Scans row-major `data` of `record_size`-byte records and returns the
/// indices of records whose field at `field_offset` equals `target`.
/// A field range that does not fit inside a record matches nothing.
pub fn scan_fixed(data: &[u8], record_size: usize, field_offset: usize, target: &[u8]) -> Vec<u64> {
    let mut hits = Vec::new();
    let Some(field_end) = field_offset.checked_add(target.len()) else {
        return hits;
    };
    if record_size == 0 || field_end > record_size || data.len() < record_size {
        return hits;
    }

    let count = data.len() / record_size;
    for idx in 0..count {
        let at = idx * record_size + field_offset;
        if bytes_equal(&data[at..at + target.len()], target) {
            hits.push(idx as u64);
        }
    }
    hits
}
