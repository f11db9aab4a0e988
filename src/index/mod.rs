//! The two retrieval indices (§4.3/§4.4): dense vectors in LanceDB and
//! hand-rolled BM25 lexical search, both partitioned per tenant.

pub mod lexical;
pub mod vector;

pub use lexical::LexicalIndex;
pub use vector::{LanceVectorIndex, VectorIndex};
