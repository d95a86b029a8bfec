//! Distance kernels used by clustering and search.
//!
//! Every kernel has a portable scalar reference and accelerated variants
//! (AVX2 and SSE2 on x86, NEON on aarch64). The variant is picked by a
//! [`DistanceBackend`] value detected once per process; callers normally go
//! through the free functions, which dispatch on [`DistanceBackend::active`].

use std::sync::OnceLock;

/// Strategy value selecting which kernel implementation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DistanceBackend {
    /// Single-pass scalar accumulation; the numeric reference.
    Scalar,
    /// 4-lane SSE2 accumulation.
    Sse2,
    /// 8-lane AVX2 accumulation.
    Avx2,
    /// 4-lane NEON accumulation.
    Neon,
}

impl DistanceBackend {
    /// Probe the CPU for the widest supported backend.
    pub fn detect() -> Self {
        #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
        {
            if is_x86_feature_detected!("avx2") {
                return DistanceBackend::Avx2;
            }
            if is_x86_feature_detected!("sse2") {
                return DistanceBackend::Sse2;
            }
        }

        #[cfg(target_arch = "aarch64")]
        {
            if std::arch::is_aarch64_feature_detected!("neon") {
                return DistanceBackend::Neon;
            }
        }

        DistanceBackend::Scalar
    }

    /// The backend used by the free kernel functions, detected on first use.
    pub fn active() -> Self {
        static ACTIVE: OnceLock<DistanceBackend> = OnceLock::new();
        *ACTIVE.get_or_init(|| {
            let backend = DistanceBackend::detect();
            tracing::debug!(?backend, "selected distance backend");
            backend
        })
    }

    /// Whether this backend can run on the current CPU.
    pub fn is_supported(self) -> bool {
        match self {
            DistanceBackend::Scalar => true,
            #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
            DistanceBackend::Sse2 => is_x86_feature_detected!("sse2"),
            #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
            DistanceBackend::Avx2 => is_x86_feature_detected!("avx2"),
            #[cfg(target_arch = "aarch64")]
            DistanceBackend::Neon => std::arch::is_aarch64_feature_detected!("neon"),
            _ => false,
        }
    }

    /// All backends that can run on the current CPU.
    pub fn supported() -> Vec<Self> {
        [
            DistanceBackend::Scalar,
            DistanceBackend::Sse2,
            DistanceBackend::Avx2,
            DistanceBackend::Neon,
        ]
        .into_iter()
        .filter(|backend| backend.is_supported())
        .collect()
    }

    /// Squared Euclidean distance. Unsupported backends fall back to scalar.
    #[inline]
    pub fn l2_distance_sqr(self, a: &[f32], b: &[f32]) -> f32 {
        assert_eq!(a.len(), b.len());

        match self {
            #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
            DistanceBackend::Avx2 if is_x86_feature_detected!("avx2") => {
                // SAFETY: the guard checked that AVX2 is available on this CPU.
                unsafe { x86::l2_distance_sqr_avx2(a, b) }
            }
            #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
            DistanceBackend::Sse2 if is_x86_feature_detected!("sse2") => {
                // SAFETY: the guard checked that SSE2 is available on this CPU.
                unsafe { x86::l2_distance_sqr_sse2(a, b) }
            }
            #[cfg(target_arch = "aarch64")]
            DistanceBackend::Neon => {
                // SAFETY: NEON is part of the aarch64 baseline.
                unsafe { neon::l2_distance_sqr_neon(a, b) }
            }
            _ => l2_distance_sqr_scalar(a, b),
        }
    }

    /// Inner product. Unsupported backends fall back to scalar.
    #[inline]
    pub fn dot(self, a: &[f32], b: &[f32]) -> f32 {
        assert_eq!(a.len(), b.len());

        match self {
            #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
            DistanceBackend::Avx2 if is_x86_feature_detected!("avx2") => {
                // SAFETY: the guard checked that AVX2 is available on this CPU.
                unsafe { x86::dot_avx2(a, b) }
            }
            #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
            DistanceBackend::Sse2 if is_x86_feature_detected!("sse2") => {
                // SAFETY: the guard checked that SSE2 is available on this CPU.
                unsafe { x86::dot_sse2(a, b) }
            }
            #[cfg(target_arch = "aarch64")]
            DistanceBackend::Neon => {
                // SAFETY: NEON is part of the aarch64 baseline.
                unsafe { neon::dot_neon(a, b) }
            }
            _ => dot_scalar(a, b),
        }
    }

    /// Squared L2 norm.
    #[inline]
    pub fn l2_norm_sqr(self, v: &[f32]) -> f32 {
        self.dot(v, v)
    }
}

/// Compute the dot product between two vectors.
#[inline]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    DistanceBackend::active().dot(a, b)
}

/// Compute the squared L2 norm of a vector.
#[inline]
pub fn l2_norm_sqr(v: &[f32]) -> f32 {
    DistanceBackend::active().l2_norm_sqr(v)
}

/// Compute the squared Euclidean distance between two vectors.
#[inline]
pub fn l2_distance_sqr(a: &[f32], b: &[f32]) -> f32 {
    DistanceBackend::active().l2_distance_sqr(a, b)
}

/// Euclidean distance, the square root of [`l2_distance_sqr`].
#[inline]
pub fn l2_distance(a: &[f32], b: &[f32]) -> f32 {
    l2_distance_sqr(a, b).sqrt()
}

#[inline]
fn dot_scalar(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

#[inline]
fn l2_distance_sqr_scalar(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let diff = x - y;
            diff * diff
        })
        .sum()
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
use std::arch::is_x86_feature_detected;

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
mod x86 {
    #[cfg(target_arch = "x86")]
    use core::arch::x86::*;
    #[cfg(target_arch = "x86_64")]
    use core::arch::x86_64::*;

    use super::{dot_scalar, l2_distance_sqr_scalar};

    const AVX_LANES: usize = 8;
    const SSE_LANES: usize = 4;

    #[inline]
    #[target_feature(enable = "avx2")]
    pub unsafe fn dot_avx2(a: &[f32], b: &[f32]) -> f32 {
        let lhs = a.chunks_exact(AVX_LANES);
        let rhs = b.chunks_exact(AVX_LANES);
        let tail = dot_scalar(lhs.remainder(), rhs.remainder());

        let mut acc = _mm256_setzero_ps();
        for (x, y) in lhs.zip(rhs) {
            let product = _mm256_mul_ps(_mm256_loadu_ps(x.as_ptr()), _mm256_loadu_ps(y.as_ptr()));
            acc = _mm256_add_ps(acc, product);
        }
        reduce_256(acc) + tail
    }

    #[inline]
    #[target_feature(enable = "sse2")]
    pub unsafe fn dot_sse2(a: &[f32], b: &[f32]) -> f32 {
        let lhs = a.chunks_exact(SSE_LANES);
        let rhs = b.chunks_exact(SSE_LANES);
        let tail = dot_scalar(lhs.remainder(), rhs.remainder());

        let mut acc = _mm_setzero_ps();
        for (x, y) in lhs.zip(rhs) {
            acc = _mm_add_ps(acc, _mm_mul_ps(_mm_loadu_ps(x.as_ptr()), _mm_loadu_ps(y.as_ptr())));
        }
        reduce_128(acc) + tail
    }

    /// Two independent accumulators over 16-float blocks, then one 8-float step.
    #[inline]
    #[target_feature(enable = "avx2")]
    pub unsafe fn l2_distance_sqr_avx2(a: &[f32], b: &[f32]) -> f32 {
        let lhs = a.chunks_exact(2 * AVX_LANES);
        let rhs = b.chunks_exact(2 * AVX_LANES);
        let (rest_a, rest_b) = (lhs.remainder(), rhs.remainder());

        let mut even = _mm256_setzero_ps();
        let mut odd = _mm256_setzero_ps();
        for (x, y) in lhs.zip(rhs) {
            let low = _mm256_sub_ps(_mm256_loadu_ps(x.as_ptr()), _mm256_loadu_ps(y.as_ptr()));
            let high = _mm256_sub_ps(
                _mm256_loadu_ps(x.as_ptr().add(AVX_LANES)),
                _mm256_loadu_ps(y.as_ptr().add(AVX_LANES)),
            );
            even = _mm256_add_ps(even, _mm256_mul_ps(low, low));
            odd = _mm256_add_ps(odd, _mm256_mul_ps(high, high));
        }

        let (rest_a, rest_b) = if rest_a.len() >= AVX_LANES {
            let diff =
                _mm256_sub_ps(_mm256_loadu_ps(rest_a.as_ptr()), _mm256_loadu_ps(rest_b.as_ptr()));
            even = _mm256_add_ps(even, _mm256_mul_ps(diff, diff));
            (&rest_a[AVX_LANES..], &rest_b[AVX_LANES..])
        } else {
            (rest_a, rest_b)
        };
        reduce_256(_mm256_add_ps(even, odd)) + l2_distance_sqr_scalar(rest_a, rest_b)
    }

    #[inline]
    #[target_feature(enable = "sse2")]
    pub unsafe fn l2_distance_sqr_sse2(a: &[f32], b: &[f32]) -> f32 {
        let lhs = a.chunks_exact(SSE_LANES);
        let rhs = b.chunks_exact(SSE_LANES);
        let tail = l2_distance_sqr_scalar(lhs.remainder(), rhs.remainder());

        let mut acc = _mm_setzero_ps();
        for (x, y) in lhs.zip(rhs) {
            let diff = _mm_sub_ps(_mm_loadu_ps(x.as_ptr()), _mm_loadu_ps(y.as_ptr()));
            acc = _mm_add_ps(acc, _mm_mul_ps(diff, diff));
        }
        reduce_128(acc) + tail
    }

    #[inline]
    #[target_feature(enable = "avx2")]
    unsafe fn reduce_256(acc: __m256) -> f32 {
        let halves = _mm_add_ps(_mm256_castps256_ps128(acc), _mm256_extractf128_ps(acc, 1));
        reduce_128(halves)
    }

    #[inline]
    #[target_feature(enable = "sse2")]
    unsafe fn reduce_128(acc: __m128) -> f32 {
        let pairs = _mm_add_ps(acc, _mm_movehl_ps(acc, acc));
        let total = _mm_add_ss(pairs, _mm_shuffle_ps(pairs, pairs, 0b01));
        _mm_cvtss_f32(total)
    }
}

#[cfg(target_arch = "aarch64")]
mod neon {
    use core::arch::aarch64::*;

    #[inline]
    #[target_feature(enable = "neon")]
    pub unsafe fn dot_neon(a: &[f32], b: &[f32]) -> f32 {
        let len = a.len();
        let mut acc = vdupq_n_f32(0.0);
        let mut i = 0usize;
        let chunks = len / 4;
        let a_ptr = a.as_ptr();
        let b_ptr = b.as_ptr();

        while i < chunks * 4 {
            let va = vld1q_f32(a_ptr.add(i));
            let vb = vld1q_f32(b_ptr.add(i));
            acc = vfmaq_f32(acc, va, vb);
            i += 4;
        }

        let mut sum = if chunks > 0 { vaddvq_f32(acc) } else { 0.0f32 };
        while i < len {
            sum += *a_ptr.add(i) * *b_ptr.add(i);
            i += 1;
        }
        sum
    }

    #[inline]
    #[target_feature(enable = "neon")]
    pub unsafe fn l2_distance_sqr_neon(a: &[f32], b: &[f32]) -> f32 {
        let len = a.len();
        let mut acc = vdupq_n_f32(0.0);
        let mut i = 0usize;
        let chunks = len / 4;
        let a_ptr = a.as_ptr();
        let b_ptr = b.as_ptr();

        while i < chunks * 4 {
            let va = vld1q_f32(a_ptr.add(i));
            let vb = vld1q_f32(b_ptr.add(i));
            let diff = vsubq_f32(va, vb);
            acc = vfmaq_f32(acc, diff, diff);
            i += 4;
        }

        let mut sum = if chunks > 0 { vaddvq_f32(acc) } else { 0.0f32 };
        while i < len {
            let diff = *a_ptr.add(i) - *b_ptr.add(i);
            sum += diff * diff;
            i += 1;
        }
        sum
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn approx_eq(a: f32, b: f32) -> bool {
        let scale = a.abs().max(b.abs()).max(1.0);
        (a - b).abs() <= 1e-4 * scale
    }

    #[test]
    fn known_values() {
        let a = [1.0, 2.0, 3.0];
        let b = [4.0, 5.0, 6.0];
        assert!((l2_distance_sqr(&a, &b) - 27.0).abs() < 1e-5);
        assert!((dot(&a, &b) - 32.0).abs() < 1e-5);
        assert!((l2_norm_sqr(&a) - 14.0).abs() < 1e-5);
        assert!((l2_distance(&a, &b) - 27.0f32.sqrt()).abs() < 1e-5);
    }

    #[test]
    fn empty_vectors_have_zero_distance() {
        for backend in DistanceBackend::supported() {
            assert_eq!(backend.l2_distance_sqr(&[], &[]), 0.0);
            assert_eq!(backend.dot(&[], &[]), 0.0);
        }
    }

    #[test]
    fn scalar_is_always_supported() {
        assert!(DistanceBackend::Scalar.is_supported());
        assert!(DistanceBackend::active().is_supported());
        assert!(DistanceBackend::supported().contains(&DistanceBackend::active()));
    }

    #[test]
    #[should_panic]
    fn mismatched_lengths_panic() {
        l2_distance_sqr(&[1.0, 2.0], &[1.0]);
    }

    #[test]
    fn every_block_and_tail_length_agrees_exactly() {
        // Small integers keep every partial sum exact whatever the lane order.
        for len in 0..=40 {
            let x: Vec<f32> = (0..len).map(|i| (i % 7) as f32).collect();
            let y: Vec<f32> = (0..len).map(|i| (i % 5) as f32 - 2.0).collect();
            let l2 = DistanceBackend::Scalar.l2_distance_sqr(&x, &y);
            let dot = DistanceBackend::Scalar.dot(&x, &y);
            for backend in DistanceBackend::supported() {
                assert_eq!(backend.l2_distance_sqr(&x, &y), l2, "{backend:?} at {len}");
                assert_eq!(backend.dot(&x, &y), dot, "{backend:?} at {len}");
            }
        }
    }

    proptest! {
        #[test]
        fn self_distance_is_zero(x in prop::collection::vec(-1000.0f32..1000.0, 0..67)) {
            for backend in DistanceBackend::supported() {
                prop_assert_eq!(backend.l2_distance_sqr(&x, &x), 0.0);
            }
        }

        #[test]
        fn distance_is_symmetric(
            pair in (0usize..67).prop_flat_map(|n| (
                prop::collection::vec(-100.0f32..100.0, n),
                prop::collection::vec(-100.0f32..100.0, n),
            ))
        ) {
            let (x, y) = pair;
            for backend in DistanceBackend::supported() {
                prop_assert_eq!(backend.l2_distance_sqr(&x, &y), backend.l2_distance_sqr(&y, &x));
            }
        }

        #[test]
        fn backends_match_scalar_reference(
            pair in (0usize..67).prop_flat_map(|n| (
                prop::collection::vec(-10.0f32..10.0, n),
                prop::collection::vec(-10.0f32..10.0, n),
            ))
        ) {
            let (x, y) = pair;
            let reference_l2 = DistanceBackend::Scalar.l2_distance_sqr(&x, &y);
            let reference_dot = DistanceBackend::Scalar.dot(&x, &y);
            for backend in DistanceBackend::supported() {
                prop_assert!(approx_eq(backend.l2_distance_sqr(&x, &y), reference_l2));
                let tolerance = 1e-3 * (1.0 + reference_dot.abs()) + 1e-2;
                prop_assert!((backend.dot(&x, &y) - reference_dot).abs() <= tolerance);
            }
        }
    }
}
