//! Retrievable content: ingestion, embeddings, similarity search, image
//! selection and factoids.

pub mod embedding;
pub mod factoids;
pub mod images;
pub mod ingest;
pub mod search;
pub mod types;

pub use embedding::{Embedder, LocalEmbedder, cosine_similarity};
pub use images::{ImageSelection, ImageSource};
pub use search::RetrievedContext;
pub use types::{Chunk, Document, Factoid, ImageLink, Provenance};
