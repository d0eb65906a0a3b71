//! Metadata tree copies
//!
//! Recursive copies run on the blocking pool. Symlinks are recreated, not
//! followed; file permissions are preserved.

use crate::error::{Error, Result};
use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

/// Copy `src` to the not yet existing `dst`
pub async fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    let (src, dst) = (src.to_path_buf(), dst.to_path_buf());
    blocking(move || {
        if dst.exists() {
            return Err(Error::DestinationExists { path: dst });
        }
        copy_dir(&src, &dst, &[])
    })
    .await
}

/// Replace the contents of `dst` with those of `src`
///
/// Top-level entries of `dst` named in `keep` survive; top-level entries of
/// `src` named in `skip` are not copied.
pub async fn mirror_into(src: &Path, dst: &Path, keep: &[&str], skip: &[&str]) -> Result<()> {
    let (src, dst) = (src.to_path_buf(), dst.to_path_buf());
    let keep: Vec<String> = keep.iter().map(|s| s.to_string()).collect();
    let skip: Vec<String> = skip.iter().map(|s| s.to_string()).collect();
    blocking(move || {
        for entry in fs::read_dir(&dst)? {
            let entry = entry?;
            if keep.iter().any(|k| entry.file_name() == k.as_str()) {
                continue;
            }
            remove_entry(&entry.path())?;
        }
        let skip: Vec<&str> = skip.iter().map(String::as_str).collect();
        copy_contents(&src, &dst, &skip)
    })
    .await
}

async fn blocking<F>(work: F) -> Result<()>
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| Error::Internal(format!("tree copy task failed: {}", e)))?
}

fn copy_dir(src: &Path, dst: &Path, skip: &[&str]) -> Result<()> {
    fs::create_dir(dst)?;
    fs::set_permissions(dst, fs::metadata(src)?.permissions())?;
    copy_contents(src, dst, skip)
}

fn copy_contents(src: &Path, dst: &Path, skip: &[&str]) -> Result<()> {
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let name = entry.file_name();
        if skip.iter().any(|s| name == *s) {
            continue;
        }
        let from = entry.path();
        let to: PathBuf = dst.join(&name);
        let file_type = entry.file_type()?;
        if file_type.is_symlink() {
            symlink(fs::read_link(&from)?, &to)?;
        } else if file_type.is_dir() {
            copy_dir(&from, &to, &[])?;
        } else {
            fs::copy(&from, &to)?;
        }
    }
    Ok(())
}

fn remove_entry(path: &Path) -> Result<()> {
    let file_type = fs::symlink_metadata(path)?.file_type();
    if file_type.is_dir() {
        fs::remove_dir_all(path)?;
    } else {
        fs::remove_file(path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    fn populate(root: &Path) {
        fs::create_dir_all(root.join("0/1")).unwrap();
        fs::write(root.join("rid.settings"), "[resource 1501]\nrid = 1501\n").unwrap();
        fs::write(root.join("0/1/alloc"), b"\x00\x01\x02").unwrap();
        symlink("rid.settings", root.join("current")).unwrap();
    }

    #[tokio::test]
    async fn test_copy_tree() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        populate(&src);

        copy_tree(&src, &dst).await.unwrap();
        assert_eq!(fs::read(dst.join("0/1/alloc")).unwrap(), b"\x00\x01\x02");
        assert_eq!(fs::read_link(dst.join("current")).unwrap(), PathBuf::from("rid.settings"));

        let err = copy_tree(&src, &dst).await.unwrap_err();
        assert_matches!(err, Error::DestinationExists { .. });
    }

    #[tokio::test]
    async fn test_mirror_into_keeps_and_skips() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        populate(&src);
        fs::write(src.join("import"), "/depot/import/md-1501\n").unwrap();
        fs::create_dir_all(dst.join("lost+found")).unwrap();
        fs::write(dst.join("stale"), "old").unwrap();

        mirror_into(&src, &dst, &["lost+found"], &["import"]).await.unwrap();

        assert!(dst.join("lost+found").is_dir());
        assert!(!dst.join("stale").exists());
        assert!(!dst.join("import").exists());
        assert!(dst.join("0/1/alloc").is_file());
    }
}
