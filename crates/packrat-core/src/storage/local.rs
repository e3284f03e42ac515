use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{PackratError, Result};
use crate::platform;
use crate::storage::StorageBackend;

/// Suffix of the scratch file used for atomic writes.
const TEMP_SUFFIX: &str = "-temp";

/// Storage backend for local filesystems using `std::fs` directly.
pub struct LocalBackend;

impl LocalBackend {
    pub fn new() -> Self {
        LocalBackend
    }
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageBackend for LocalBackend {
    fn join(&self, dir: &str, name: &str) -> String {
        if dir.is_empty() {
            return name.to_string();
        }
        format!("{}/{}", dir.trim_end_matches('/'), name)
    }

    fn list(&self, dir: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(Path::new(dir))? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        Ok(names)
    }

    fn list2(&self, dir: &str, f: &mut dyn FnMut(&str, &str)) -> Result<()> {
        for entry in fs::read_dir(Path::new(dir))? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let sub = entry.file_name().to_string_lossy().into_owned();
            // An unreadable subdirectory is skipped, matching the tolerant
            // enumeration semantics of the chunk index load.
            let Ok(children) = fs::read_dir(entry.path()) else {
                continue;
            };
            for child in children {
                let child = child?;
                if child.file_type()?.is_file() {
                    f(&sub, &child.file_name().to_string_lossy());
                }
            }
        }
        Ok(())
    }

    fn exists(&self, path: &str) -> Result<bool> {
        match fs::symlink_metadata(Path::new(path)) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn mkdir_all(&self, dir: &str) -> Result<()> {
        platform::create_dir_all(Path::new(dir))?;
        Ok(())
    }

    fn read(&self, path: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(Path::new(path)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        let temp = PathBuf::from(format!("{path}{TEMP_SUFFIX}"));
        let publish = || -> std::io::Result<()> {
            let mut out = platform::create_scratch_file(&temp)?;
            out.write_all(data)?;
            out.sync_all()?;
            drop(out);
            fs::rename(&temp, Path::new(path))
        };
        publish().map_err(|e| {
            let _ = fs::remove_file(&temp);
            e.into()
        })
    }

    fn delete(&self, path: &str) -> Result<()> {
        fs::remove_file(Path::new(path))?;
        Ok(())
    }

    fn write_lock(&self, path: &str) -> Result<()> {
        let mut opts = fs::OpenOptions::new();
        opts.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(platform::DEFAULT_FILE_PERM);
        }
        match opts.open(Path::new(path)) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(PackratError::Locked(path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn remove_lock(&self, path: &str) -> Result<()> {
        fs::remove_file(Path::new(path))?;
        Ok(())
    }
}
