use std::fs::File;
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;

use crate::error::{Error, Result};
use crate::platform::ArchiveFormat;

pub fn extract(archive: &Path, format: ArchiveFormat, out_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(out_dir)
        .map_err(|e| Error::io(format!("create_dir_all {}", out_dir.display()), e))?;
    match format {
        ArchiveFormat::TarGz => extract_tar_gz(archive, out_dir),
        ArchiveFormat::Zip => extract_zip(archive, out_dir),
    }
}

fn extraction_err(archive: &Path, message: impl Into<String>) -> Error {
    Error::Extraction {
        archive: archive.to_path_buf(),
        message: message.into(),
    }
}

fn extract_tar_gz(path: &Path, out_dir: &Path) -> Result<()> {
    let f = File::open(path).map_err(|e| extraction_err(path, format!("open: {e}")))?;
    let mut ar = tar::Archive::new(GzDecoder::new(f));
    ar.set_preserve_permissions(true);
    let entries = ar
        .entries()
        .map_err(|e| extraction_err(path, format!("read tar entries: {e}")))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| extraction_err(path, format!("tar entry: {e}")))?;
        let entry_path = entry
            .path()
            .map_err(|e| extraction_err(path, format!("tar entry path: {e}")))?
            .to_path_buf();
        sanitize_rel_path(&entry_path).map_err(|m| extraction_err(path, m))?;
        entry
            .unpack_in(out_dir)
            .map_err(|e| extraction_err(path, format!("unpack {}: {e}", entry_path.display())))?;
    }
    Ok(())
}

fn extract_zip(path: &Path, out_dir: &Path) -> Result<()> {
    let f = File::open(path).map_err(|e| extraction_err(path, format!("open: {e}")))?;
    let mut z =
        zip::ZipArchive::new(f).map_err(|e| extraction_err(path, format!("open zip: {e}")))?;
    for i in 0..z.len() {
        let mut file = z
            .by_index(i)
            .map_err(|e| extraction_err(path, format!("zip entry {i}: {e}")))?;
        let name = file.name().to_string();
        let rel = sanitize_rel_path(Path::new(&name)).map_err(|m| extraction_err(path, m))?;
        let out_path = out_dir.join(rel);
        if file.is_dir() {
            std::fs::create_dir_all(&out_path)
                .map_err(|e| Error::io(format!("create_dir_all {}", out_path.display()), e))?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::io(format!("create_dir_all {}", parent.display()), e))?;
        }
        let mut out = File::create(&out_path)
            .map_err(|e| Error::io(format!("create {}", out_path.display()), e))?;
        std::io::copy(&mut file, &mut out)
            .map_err(|e| extraction_err(path, format!("write {}: {e}", out_path.display())))?;
        #[cfg(unix)]
        if let Some(mode) = file.unix_mode() {
            use std::os::unix::fs::PermissionsExt as _;
            std::fs::set_permissions(&out_path, std::fs::Permissions::from_mode(mode)).map_err(
                |source| Error::Permission {
                    path: out_path.clone(),
                    source,
                },
            )?;
        }
    }
    Ok(())
}

fn sanitize_rel_path(path: &Path) -> std::result::Result<PathBuf, String> {
    let mut out = PathBuf::new();
    for c in path.components() {
        match c {
            Component::Prefix(_) | Component::RootDir => {
                return Err(format!("invalid archive path (absolute): {}", path.display()))
            }
            Component::ParentDir => {
                return Err(format!("invalid archive path (..): {}", path.display()))
            }
            Component::CurDir => {}
            Component::Normal(p) => out.push(p),
        }
    }
    Ok(out)
}
