//! Similarity scores in `[0, 1]` for fingerprints and descriptors.

use crate::core::fingerprint::Fingerprint;

/// `(width - hamming) / width`. Absent inputs or mismatched widths score 0.
pub fn fingerprint_similarity(a: Option<&Fingerprint>, b: Option<&Fingerprint>) -> f32 {
    let (Some(a), Some(b)) = (a, b) else {
        return 0.0;
    };

    let width = a.bit_width();
    if width == 0 {
        return 0.0;
    }

    match a.hamming_distance(b) {
        Some(distance) => (width - distance) as f32 / width as f32,
        None => 0.0,
    }
}

/// Cosine similarity clamped into `[0, 1]`.
///
/// Empty, zero-norm or length-mismatched inputs score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }

    let mut dot: f64 = 0.0;
    let mut na: f64 = 0.0;
    let mut nb: f64 = 0.0;
    for (&x, &y) in a.iter().zip(b.iter()) {
        let x = x as f64;
        let y = y as f64;
        dot += x * y;
        na += x * x;
        nb += y * y;
    }

    let denom = na.sqrt() * nb.sqrt();
    if denom == 0.0 || !denom.is_finite() {
        return 0.0;
    }

    ((dot / denom) as f32).clamp(0.0, 1.0)
}

pub fn descriptor_similarity(a: Option<&[f32]>, b: Option<&[f32]>) -> f32 {
    match (a, b) {
        (Some(a), Some(b)) => cosine_similarity(a, b),
        _ => 0.0,
    }
}

/// Scale to unit length in place. Zero vectors are left untouched.
pub fn l2_normalize(v: &mut [f32]) {
    let norm = v
        .iter()
        .map(|&x| (x as f64) * (x as f64))
        .sum::<f64>()
        .sqrt();

    if norm > 0.0 {
        let scale = (1.0 / norm) as f32;
        for x in v.iter_mut() {
            *x *= scale;
        }
    }
}

/// Dot product of two unit vectors, clamped into `[0, 1]`.
pub(crate) fn unit_cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    dot.clamp(0.0, 1.0)
}
