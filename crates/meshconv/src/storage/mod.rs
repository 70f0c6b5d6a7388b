pub mod filesystem;

pub use filesystem::{Artifact, ArtifactKind, ArtifactStore, OUTPUT_EXTENSION};
