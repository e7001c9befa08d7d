use crate::error::{invalid_argument, FirestoreResult};

/// The backend caps embedding vectors at 2048 dimensions.
pub const MAX_VECTOR_DIMENSIONS: usize = 2048;

/// A fixed-length numeric embedding stored on a document field.
#[derive(Clone, Debug, PartialEq)]
pub struct VectorValue {
    values: Vec<f64>,
}

impl VectorValue {
    pub fn new(values: Vec<f64>) -> FirestoreResult<Self> {
        if values.len() > MAX_VECTOR_DIMENSIONS {
            return Err(invalid_argument(format!(
                "Vector values must not exceed {MAX_VECTOR_DIMENSIONS} dimensions (got {})",
                values.len()
            )));
        }
        Ok(Self { values })
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn dimensions(&self) -> usize {
        self.values.len()
    }

    pub fn euclidean_distance(&self, other: &VectorValue) -> f64 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b) * (a - b))
            .sum::<f64>()
            .sqrt()
    }

    pub fn dot_product(&self, other: &VectorValue) -> f64 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| a * b)
            .sum()
    }

    /// Cosine distance: `1 - cos(angle)`. A zero-magnitude operand yields a
    /// NaN distance, which sorts last and never passes a threshold.
    pub fn cosine_distance(&self, other: &VectorValue) -> f64 {
        let dot = self.dot_product(other);
        let magnitude = self.magnitude() * other.magnitude();
        1.0 - dot / magnitude
    }

    fn magnitude(&self) -> f64 {
        self.values.iter().map(|v| v * v).sum::<f64>().sqrt()
    }
}
