//! Vector similarity for embedding comparison.

/// Compute cosine similarity between two vectors.
///
/// Vectors of differing length are compared over the shorter prefix.
/// Returns 0.0 when either side has zero magnitude, otherwise a value in
/// [-1.0, 1.0] where 1.0 = identical direction. Sums accumulate in f64.
/// Non-finite components yield 0.0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;

    for (&x, &y) in a.iter().zip(b) {
        let (x, y) = (f64::from(x), f64::from(y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    let sim = dot / (norm_a.sqrt() * norm_b.sqrt());
    if sim.is_finite() {
        sim.clamp(-1.0, 1.0) as f32
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical() {
        let sim = cosine_similarity(&[1.0, 0.0, 0.0], &[1.0, 0.0, 0.0]);
        assert!((sim - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_orthogonal() {
        let sim = cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]);
        assert!(sim.abs() < 1e-6);
    }

    #[test]
    fn test_opposite() {
        let sim = cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]);
        assert!((sim + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_zero_and_empty_vectors() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[]), 0.0);
    }

    #[test]
    fn test_differing_lengths_truncate() {
        let sim = cosine_similarity(&[1.0, 0.0, 0.0], &[1.0, 0.0]);
        assert!((sim - 1.0).abs() < 1e-6);
        // Only the shared prefix counts; the trailing 5.0 is ignored.
        let sim = cosine_similarity(&[0.0, 1.0], &[0.0, 1.0, 5.0]);
        assert!((sim - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_tiny_magnitudes_are_not_zero() {
        let sim = cosine_similarity(&[1e-4, 0.0], &[1e-4, 0.0]);
        assert!((sim - 1.0).abs() < 1e-6);
        let sim = cosine_similarity(&[1e-30, 1e-30], &[-1e-30, -1e-30]);
        assert!((sim + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_huge_magnitudes_stay_bounded() {
        let sim = cosine_similarity(&[1e20, 1e20], &[1e20, 1e20]);
        assert!((sim - 1.0).abs() < 1e-6);
        let sim = cosine_similarity(&[f32::MAX, 0.0], &[f32::MAX, f32::MAX]);
        assert!((sim - std::f32::consts::FRAC_1_SQRT_2).abs() < 1e-6);
    }

    #[test]
    fn test_non_finite_components() {
        assert_eq!(cosine_similarity(&[f32::NAN, 1.0], &[1.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[f32::INFINITY, 1.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn test_symmetric_and_bounded() {
        let pairs: [(&[f32], &[f32]); 3] = [
            (&[0.1, 0.2, 0.3, 0.4], &[0.4, 0.3, 0.2, 0.1]),
            (&[3.0, -1.0], &[-2.0, 7.5]),
            (&[1e-3, 1e3, 0.5], &[1e3, 1e-3, 0.5]),
        ];
        for (a, b) in pairs {
            let ab = cosine_similarity(a, b);
            let ba = cosine_similarity(b, a);
            assert!((ab - ba).abs() < 1e-6);
            assert!((-1.0..=1.0).contains(&ab));
        }
    }
}
