use thiserror::Error;

/// Failures surfaced by the acceleration-structure builders. Traversal never
/// fails; a miss is reported through the hit record's sentinel.
#[derive(Debug, Error, Clone, Copy, PartialEq)]
pub enum BuildError {
    #[error("grid density must be a positive finite value, got {0}")]
    InvalidDensity(f32),

    #[error("builder cost must be a positive finite value, got {0}")]
    InvalidCost(f32),

    #[error("node count exceeds the 30-bit node index capacity")]
    TooManyNodes,

    #[error("object reference count exceeds the 30-bit reference capacity")]
    TooManyRefs,

    #[error("object set bounds are not finite")]
    InvalidBounds,
}
