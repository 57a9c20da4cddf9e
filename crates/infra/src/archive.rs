//! Packaging of generated files into a gzip-compressed tar archive.

use std::io::Write;
use std::path::{Component, Path};

use flate2::Compression;
use flate2::write::GzEncoder;

use forgegen_core::{JobId, OwnerId, ProjectId};
use forgegen_jobs::GeneratedFile;

pub const CONTENT_TYPE: &str = "application/gzip";

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("invalid file path in generated output: {0:?}")]
    InvalidPath(String),

    #[error("duplicate file path in generated output: {0:?}")]
    DuplicatePath(String),

    #[error("archive io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Blob key of the archive for one job.
pub fn artifact_key(owner_id: OwnerId, project_id: ProjectId, job_id: JobId) -> String {
    format!("generated/{owner_id}/{project_id}/{job_id}.tar.gz")
}

/// Paths must be relative and made only of normal components.
fn validate_path(path: &str) -> Result<(), ArchiveError> {
    let p = Path::new(path);
    let normal = p.components().all(|c| matches!(c, Component::Normal(_)));
    if path.is_empty() || !normal || p.components().next().is_none() {
        return Err(ArchiveError::InvalidPath(path.to_string()));
    }
    Ok(())
}

/// Build a `.tar.gz` containing every file, in the given order.
pub fn pack(files: &[GeneratedFile]) -> Result<Vec<u8>, ArchiveError> {
    let mut seen = std::collections::HashSet::new();
    for file in files {
        validate_path(&file.path)?;
        if !seen.insert(file.path.as_str()) {
            return Err(ArchiveError::DuplicatePath(file.path.clone()));
        }
    }

    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for file in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(file.content.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(0);
        builder.append_data(&mut header, &file.path, file.content.as_bytes())?;
    }

    let mut encoder = builder.into_inner()?;
    encoder.flush()?;
    Ok(encoder.finish()?)
}
