//! Path quantization: a storage-locality aid, not a search index.
//!
//! A fixed, deterministic projection matrix reduces a model-dimensional
//! embedding to 64-D; each of 4 consecutive 16-D groups contributes 2
//! bits (the sign of its first two components after projection),
//! yielding a 4-segment directory path such as `"2a/0c/31/1f"`.
//! Collisions are expected and tolerated — the per-file JSON payload
//! carries the true vector ID, so this only has to spread files evenly
//! across directories, not uniquely identify them.

const PROJECTED_DIMS: usize = 64;
const SEGMENTS: usize = 4;
const DIMS_PER_SEGMENT: usize = PROJECTED_DIMS / SEGMENTS;

/// A deterministic pseudo-random projection matrix, seeded once per
/// process (or loaded from config) so the same embedding always
/// quantizes to the same path. Generated with a simple linear
/// congruential sequence rather than pulled from an RNG crate, since it
/// only needs to be stable and roughly uniform, not cryptographically
/// sound.
pub struct Projection {
    /// `PROJECTED_DIMS` rows, each `input_dims` long.
    matrix: Vec<Vec<f32>>,
}

impl Projection {
    /// Deterministically derive a `PROJECTED_DIMS x input_dims` matrix
    /// from `seed`. Same seed + same `input_dims` always yields the same
    /// matrix, so the quantized path of a given embedding never changes
    /// across restarts.
    pub fn new(input_dims: usize, seed: u64) -> Self {
        let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
        let mut next = || {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
            // Map to roughly [-1.0, 1.0].
            ((state >> 33) as f32 / u32::MAX as f32) * 2.0 - 1.0
        };
        let matrix = (0..PROJECTED_DIMS)
            .map(|_| (0..input_dims).map(|_| next()).collect())
            .collect();
        Self { matrix }
    }

    /// Project `embedding` down to `PROJECTED_DIMS` dimensions. Returns a
    /// zero vector if `embedding`'s length doesn't match what this
    /// projection was built for, rather than panicking — callers treat
    /// that as "no locality hint available".
    pub fn project(&self, embedding: &[f32]) -> [f32; PROJECTED_DIMS] {
        let mut out = [0.0f32; PROJECTED_DIMS];
        for (row, slot) in self.matrix.iter().zip(out.iter_mut()) {
            if row.len() != embedding.len() {
                return [0.0; PROJECTED_DIMS];
            }
            *slot = row.iter().zip(embedding).map(|(w, x)| w * x).sum();
        }
        out
    }

    /// Quantize an embedding to a 4-segment directory path, each segment
    /// a 2-character lowercase hex byte (4 bits encoding 2 sign bits
    /// padded into a nibble pair for filesystem-friendly naming).
    pub fn quantize_path(&self, embedding: &[f32]) -> String {
        let projected = self.project(embedding);
        let segments: Vec<String> = projected
            .chunks(DIMS_PER_SEGMENT)
            .map(|segment| {
                let bit0 = segment[0] >= 0.0;
                let bit1 = segment[1] >= 0.0;
                let value = (bit0 as u8) | ((bit1 as u8) << 1);
                format!("{value:02x}")
            })
            .collect();
        segments.join("/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_input_yields_same_path() {
        let proj = Projection::new(8, 42);
        let v = vec![0.1, -0.2, 0.3, -0.4, 0.5, -0.6, 0.7, -0.8];
        assert_eq!(proj.quantize_path(&v), proj.quantize_path(&v));
    }

    #[test]
    fn path_has_four_segments() {
        let proj = Projection::new(8, 42);
        let v = vec![0.1; 8];
        let path = proj.quantize_path(&v);
        assert_eq!(path.split('/').count(), SEGMENTS);
    }

    #[test]
    fn different_seed_differs_with_high_probability() {
        let a = Projection::new(16, 1);
        let b = Projection::new(16, 2);
        let v: Vec<f32> = (0..16).map(|i| i as f32 * 0.3 - 1.0).collect();
        assert_ne!(a.quantize_path(&v), b.quantize_path(&v));
    }

    #[test]
    fn mismatched_dims_is_handled_not_panicking() {
        let proj = Projection::new(8, 7);
        let v = vec![0.1, 0.2];
        let path = proj.quantize_path(&v);
        assert_eq!(path, "00/00/00/00");
    }
}
