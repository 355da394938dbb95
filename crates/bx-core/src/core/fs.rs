use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Component, Path};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

const REMOVE_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Best-effort recursive chmod so read-only extractions can be deleted.
#[cfg(unix)]
pub(crate) fn make_writable_recursive(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let Ok(meta) = fs::symlink_metadata(path) else {
        return;
    };
    if meta.file_type().is_symlink() {
        return;
    }
    let mode = if meta.is_dir() { 0o755 } else { 0o644 };
    let _ = fs::set_permissions(path, fs::Permissions::from_mode(mode));
    if meta.is_dir() {
        if let Ok(entries) = fs::read_dir(path) {
            for entry in entries.flatten() {
                make_writable_recursive(&entry.path());
            }
        }
    }
}

#[cfg(not(unix))]
pub(crate) fn make_writable_recursive(path: &Path) {
    let Ok(meta) = fs::symlink_metadata(path) else {
        return;
    };
    if meta.file_type().is_symlink() {
        return;
    }
    let mut perms = meta.permissions();
    if perms.readonly() {
        perms.set_readonly(false);
        let _ = fs::set_permissions(path, perms);
    }
    if meta.is_dir() {
        if let Ok(entries) = fs::read_dir(path) {
            for entry in entries.flatten() {
                make_writable_recursive(&entry.path());
            }
        }
    }
}

/// Delete a directory tree, retrying once after a short pause.
///
/// Mapped native libraries can keep files busy for a moment after their
/// last user goes away; a missing tree counts as removed.
pub(crate) fn remove_dir_all_with_retry(path: &Path) -> Result<()> {
    match try_remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "retrying directory removal");
            thread::sleep(REMOVE_RETRY_DELAY);
            try_remove_dir_all(path).with_context(|| format!("failed to remove {}", path.display()))
        }
    }
}

fn try_remove_dir_all(path: &Path) -> io::Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };
    if meta.file_type().is_symlink() || !meta.is_dir() {
        return fs::remove_file(path);
    }
    make_writable_recursive(path);
    match fs::remove_dir_all(path) {
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Read a single-line scalar file; `None` when the file does not exist.
pub(crate) fn read_scalar(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(Some(
            contents.lines().next().unwrap_or_default().to_string(),
        )),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("failed to read {}", path.display())),
    }
}

/// Replace a scalar file atomically so readers never see a partial value.
pub(crate) fn write_scalar(path: &Path, value: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    let mut tmp = NamedTempFile::new_in(parent)
        .with_context(|| format!("failed to create temp file in {}", parent.display()))?;
    tmp.write_all(value.as_bytes())
        .with_context(|| format!("failed to write {}", path.display()))?;
    tmp.persist(path)
        .with_context(|| format!("failed to persist {}", path.display()))?;
    Ok(())
}

/// Copy a stream into `dest` through a temp file in the same directory.
pub(crate) fn copy_stream_to_file(
    reader: &mut dyn Read,
    dest: &Path,
    buffer_size: usize,
) -> Result<u64> {
    let parent = dest
        .parent()
        .with_context(|| format!("{} has no parent directory", dest.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create {}", parent.display()))?;
    let tmp = NamedTempFile::new_in(parent)
        .with_context(|| format!("failed to create temp file in {}", parent.display()))?;
    let mut writer = BufWriter::with_capacity(buffer_size, tmp);
    let mut buf = vec![0u8; buffer_size.max(1)];
    let mut total = 0u64;
    loop {
        let read = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read content for {}", dest.display()))
            }
        };
        writer
            .write_all(&buf[..read])
            .with_context(|| format!("failed to write {}", dest.display()))?;
        total += read as u64;
    }
    let tmp = writer
        .into_inner()
        .map_err(io::IntoInnerError::into_error)
        .with_context(|| format!("failed to flush {}", dest.display()))?;
    tmp.persist(dest)
        .with_context(|| format!("failed to persist {}", dest.display()))?;
    debug!(path = %dest.display(), bytes = total, "copied stream");
    Ok(total)
}

pub(crate) fn copy_file(src: &Path, dest: &Path, buffer_size: usize) -> Result<u64> {
    let mut file = File::open(src).with_context(|| format!("failed to open {}", src.display()))?;
    copy_stream_to_file(&mut file, dest, buffer_size)
}

/// Entry names may not escape the directory they are resolved against.
pub(crate) fn is_contained(name: &str) -> bool {
    let path = Path::new(name);
    !path.has_root()
        && path
            .components()
            .all(|component| matches!(component, Component::Normal(_) | Component::CurDir))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalars_round_trip_and_missing_reads_none() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("bundle.state");
        assert_eq!(read_scalar(&path)?, None);
        write_scalar(&path, "active")?;
        assert_eq!(read_scalar(&path)?.as_deref(), Some("active"));
        fs::write(&path, "42\nignored")?;
        assert_eq!(read_scalar(&path)?.as_deref(), Some("42"));
        Ok(())
    }

    #[test]
    fn copy_uses_small_buffers() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let dest = temp.path().join("nested").join("out.bin");
        let payload: Vec<u8> = (0..=255).cycle().take(10_000).collect();
        let copied = copy_stream_to_file(&mut payload.as_slice(), &dest, 7)?;
        assert_eq!(copied, 10_000);
        assert_eq!(fs::read(&dest)?, payload);
        Ok(())
    }

    #[test]
    fn removal_tolerates_missing_and_read_only_trees() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let root = temp.path().join("tree");
        fs::create_dir_all(root.join("a"))?;
        let file = root.join("a").join("lib.so");
        fs::write(&file, b"x")?;
        let mut perms = fs::metadata(&file)?.permissions();
        perms.set_readonly(true);
        fs::set_permissions(&file, perms)?;
        remove_dir_all_with_retry(&root)?;
        assert!(!root.exists());
        remove_dir_all_with_retry(&root)?;
        Ok(())
    }

    #[test]
    fn containment_rejects_escapes() {
        assert!(is_contained("lib/x.jar"));
        assert!(is_contained("./a"));
        assert!(!is_contained("../x"));
        assert!(!is_contained("a/../../x"));
        assert!(!is_contained("/etc/passwd"));
    }
}
