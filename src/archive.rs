use std::fs;
use std::path::{Component, Path};

use camino::{Utf8Path, Utf8PathBuf};
use tar::{Archive, Builder};

use crate::error::SdkError;
use crate::scratch::{GENOTYPE_ARCHIVE, GENOTYPE_DIR};

pub fn pack_genotype(individual_dir: &Utf8Path) -> Result<Utf8PathBuf, SdkError> {
    let source = individual_dir.join(GENOTYPE_DIR);
    if !source.as_std_path().is_dir() {
        return Err(SdkError::Archive(format!("missing genotype directory {source}")));
    }
    let archive_path = individual_dir.join(GENOTYPE_ARCHIVE);
    let file = fs::File::create(archive_path.as_std_path())
        .map_err(|err| SdkError::Archive(format!("create {archive_path}: {err}")))?;

    let mut builder = Builder::new(file);
    builder.follow_symlinks(false);
    builder
        .append_dir_all(GENOTYPE_DIR, source.as_std_path())
        .map_err(|err| SdkError::Archive(format!("pack {source}: {err}")))?;
    builder
        .into_inner()
        .and_then(|file| file.sync_all())
        .map_err(|err| SdkError::Archive(format!("finish {archive_path}: {err}")))?;
    Ok(archive_path)
}

// The archive is removed whatever the outcome.
pub fn unpack_genotype(archive: &Utf8Path, individual_dir: &Utf8Path) -> Result<(), SdkError> {
    let result = extract(archive, individual_dir);
    if let Err(err) = fs::remove_file(archive.as_std_path()) {
        if err.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %archive, error = %err, "failed to remove genotype archive");
        }
    }
    result
}

fn extract(archive_path: &Utf8Path, target_dir: &Utf8Path) -> Result<(), SdkError> {
    let file = fs::File::open(archive_path.as_std_path())
        .map_err(|err| SdkError::Archive(format!("open {archive_path}: {err}")))?;
    let mut archive = Archive::new(file);
    let entries = archive
        .entries()
        .map_err(|err| SdkError::Archive(err.to_string()))?;

    let mut found_genotype = false;
    for entry in entries {
        let mut entry = entry.map_err(|err| SdkError::Archive(err.to_string()))?;
        let path = entry
            .path()
            .map_err(|err| SdkError::Archive(err.to_string()))?
            .into_owned();
        if !is_enclosed(&path) {
            return Err(SdkError::Archive(
                "archive entry path traversal detected".to_string(),
            ));
        }
        if path.starts_with(GENOTYPE_DIR) {
            found_genotype = true;
        }
        entry
            .unpack_in(target_dir.as_std_path())
            .map_err(|err| SdkError::Archive(format!("unpack {}: {err}", path.display())))?;
    }

    if !found_genotype {
        return Err(SdkError::Archive(
            "`genotype/` directory not found in archive".to_string(),
        ));
    }
    Ok(())
}

fn is_enclosed(path: &Path) -> bool {
    path.components()
        .all(|component| matches!(component, Component::Normal(_) | Component::CurDir))
}
