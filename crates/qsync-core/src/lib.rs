//! Core shared types for query sync.
//!
//! This crate is intentionally small: canonical identifiers for targets, packages and files,
//! the structured target records produced by the query layer, and the resolver that maps
//! logical file roots onto the local filesystem.

mod digest;
mod file_ref;
mod label;
mod resolver;
mod target;

pub use crate::{
    digest::{ArtifactDigest, DigestError},
    file_ref::{FileRef, FileRefError, FileRoot},
    label::{Label, LabelError, PackagePath},
    resolver::{PathResolver, ResolveError},
    target::{ArtifactKind, ArtifactRef, TargetKind, TargetRecord},
};

/// Best-effort extraction of a panic payload message.
pub fn panic_payload_to_str(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "<non-string panic payload>"
    }
}
