//! Contrastive batch structure: relation masks and global similarities

pub mod relation;
pub mod similarity;

pub use relation::{PairIndex, Relation, RelationTensor};
pub use similarity::{SimilarityMatrix, COSINE_TOLERANCE};
