use std::fs::File;
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use zip::ZipArchive;

use crate::error::{Error, Result};

/// Archive formats the emulator release may be published in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    SevenZip,
    Zip,
    TarGz,
}

impl ArchiveKind {
    /// Picks the format from a file name or URL (query string ignored).
    pub fn detect(name: &str) -> Option<Self> {
        let name = name.split(['?', '#']).next().unwrap_or(name).to_lowercase();
        if name.ends_with(".7z") {
            Some(ArchiveKind::SevenZip)
        } else if name.ends_with(".zip") {
            Some(ArchiveKind::Zip)
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(ArchiveKind::TarGz)
        } else {
            None
        }
    }
}

// Accept only relative, "normal" components; strip any leading "./".
fn sanitize_rel_path(p: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for c in p.components() {
        match c {
            Component::CurDir => continue,
            Component::Normal(s) => out.push(s),
            _ => return None,
        }
    }
    if out.as_os_str().is_empty() {
        None
    } else {
        Some(out)
    }
}

/// Extracts `archive` into `dest_dir`, reporting `(done_entries, total_entries)`
/// where the format allows it.
pub fn extract<F>(kind: ArchiveKind, archive: &Path, dest_dir: &Path, on_progress: F) -> Result<()>
where
    F: FnMut(u64, u64),
{
    std::fs::create_dir_all(dest_dir)?;
    match kind {
        ArchiveKind::SevenZip => extract_7z(archive, dest_dir),
        ArchiveKind::Zip => extract_zip_with_progress(archive, dest_dir, on_progress),
        ArchiveKind::TarGz => extract_tar_gz(archive, dest_dir),
    }
}

fn extract_7z(archive: &Path, dest_dir: &Path) -> Result<()> {
    sevenz_rust::decompress_file(archive, dest_dir).map_err(|e| Error::Archive(e.to_string()))
}

/// Uses `enclosed_name()` so entries cannot escape `dest_dir`.
fn extract_zip_with_progress<F>(zip_path: &Path, dest_dir: &Path, mut on_progress: F) -> Result<()>
where
    F: FnMut(u64, u64),
{
    let file = File::open(zip_path)?;
    let mut archive = ZipArchive::new(file).map_err(|e| Error::Archive(e.to_string()))?;

    let total = archive.len() as u64;
    let mut done: u64 = 0;
    on_progress(0, total);

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| Error::Archive(e.to_string()))?;

        let Some(safe_rel) = entry.enclosed_name() else {
            log::warn!("Skipped unsafe zip path: {}", entry.name());
            done = done.saturating_add(1);
            on_progress(done, total);
            continue;
        };
        let out_path = dest_dir.join(safe_rel);

        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)?;
        } else {
            if let Some(parent) = out_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut out_file = File::create(&out_path)?;
            std::io::copy(&mut entry, &mut out_file)?;
        }

        done = done.saturating_add(1);
        on_progress(done, total);
    }

    Ok(())
}

fn extract_tar_gz(archive: &Path, dest_dir: &Path) -> Result<()> {
    let f = File::open(archive)?;
    let mut tar = tar::Archive::new(GzDecoder::new(f));

    // Entries are unpacked one by one so paths can be sanitized.
    for entry in tar.entries()? {
        let mut entry = entry?;
        let raw_path = entry.path()?.to_path_buf();
        let Some(rel) = sanitize_rel_path(&raw_path) else {
            log::warn!("Skipped unsafe tar path: {}", raw_path.to_string_lossy());
            continue;
        };

        let out_path = dest_dir.join(&rel);
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        entry.unpack(&out_path)?;
    }
    Ok(())
}
