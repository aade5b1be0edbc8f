//! SIMD width query.
//!
//! The batch integrator accepts any width; these helpers only pick a
//! default that matches the native vector registers of the host.

use crate::float::Float;

/// Number of `F` lanes in the widest native vector register, or 0 when the
/// target is scalar-only.
pub fn vector_width_for<F: Float>() -> u32 {
    let lane_bytes = std::mem::size_of::<F>() as u32;
    #[cfg(target_arch = "x86_64")]
    {
        if is_x86_feature_detected!("avx512f") {
            return 64 / lane_bytes;
        }
        if is_x86_feature_detected!("avx") {
            return 32 / lane_bytes;
        }
        if is_x86_feature_detected!("sse2") {
            return 16 / lane_bytes;
        }
        0
    }
    #[cfg(target_arch = "aarch64")]
    {
        16 / lane_bytes
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        let _ = lane_bytes;
        0
    }
}

/// Suggested batch size for a batch integrator: the native width, or 1 on
/// scalar-only targets.
pub fn recommended_batch_size<F: Float>() -> usize {
    vector_width_for::<F>().max(1) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recommended_size_is_positive() {
        assert!(recommended_batch_size::<f64>() >= 1);
        assert!(recommended_batch_size::<f32>() >= 1);
        // Twice as many f32 lanes as f64 lanes whenever vectors exist.
        let w64 = vector_width_for::<f64>();
        let w32 = vector_width_for::<f32>();
        assert_eq!(w32, w64 * 2);
    }
}
