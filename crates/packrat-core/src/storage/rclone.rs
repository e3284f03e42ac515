use std::io::Write;
use std::process::{Command, Stdio};

use rand::Rng;
use serde::Deserialize;

use crate::error::{PackratError, Result};
use crate::storage::StorageBackend;

/// Storage backend that shells out to an rclone binary, one subprocess per
/// call. Remote object stores have no exclusive-create primitive, so the
/// lock protocol is write-then-read-back with a random token.
pub struct RcloneBackend {
    binary: String,
}

/// One record of `rclone lsjson` output. Only the path is consumed.
#[derive(Debug, Deserialize)]
struct LsRecord {
    #[serde(rename = "Path")]
    path: String,
}

impl RcloneBackend {
    pub fn new(binary: &str) -> Self {
        RcloneBackend {
            binary: binary.to_string(),
        }
    }

    fn run(&self, args: &[&str], stdin: Option<&[u8]>) -> Result<Vec<u8>> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| PackratError::Storage(format!("cannot spawn {}: {e}", self.binary)))?;
        if let Some(data) = stdin {
            // The pipe was requested above, so take() cannot fail.
            let mut pipe = child.stdin.take().unwrap();
            pipe.write_all(data)?;
        }
        let output = child.wait_with_output()?;
        if !output.status.success() {
            return Err(PackratError::Storage(format!(
                "{} {} failed: {}",
                self.binary,
                args.first().unwrap_or(&""),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output.stdout)
    }

    fn lsjson(&self, path: &str, max_depth: &str) -> Result<Vec<LsRecord>> {
        let out = self.run(
            &[
                "lsjson",
                "--no-modtime",
                "--no-mimetype",
                "--fast-list",
                "--max-depth",
                max_depth,
                "--files-only",
                path,
            ],
            None,
        )?;
        serde_json::from_slice(&out)
            .map_err(|e| PackratError::Storage(format!("bad lsjson output: {e}")))
    }
}

impl StorageBackend for RcloneBackend {
    fn join(&self, dir: &str, name: &str) -> String {
        format!("{dir}/{name}")
    }

    fn list(&self, dir: &str) -> Result<Vec<String>> {
        Ok(self
            .lsjson(dir, "1")?
            .into_iter()
            .map(|r| r.path)
            .collect())
    }

    fn list2(&self, dir: &str, f: &mut dyn FnMut(&str, &str)) -> Result<()> {
        for rec in self.lsjson(dir, "2")? {
            if let Some((sub, name)) = rec.path.split_once('/') {
                if !name.contains('/') {
                    f(sub, name);
                }
            }
        }
        Ok(())
    }

    fn exists(&self, path: &str) -> Result<bool> {
        let Some((_, base)) = path.rsplit_once('/') else {
            return Err(PackratError::Storage(format!("invalid path: {path}")));
        };
        Ok(self.lsjson(path, "1")?.iter().any(|r| r.path == base))
    }

    fn mkdir_all(&self, _dir: &str) -> Result<()> {
        // Object stores have no directories to create.
        Ok(())
    }

    fn read(&self, path: &str) -> Result<Option<Vec<u8>>> {
        if !self.exists(path)? {
            return Ok(None);
        }
        Ok(Some(self.run(&["cat", path], None)?))
    }

    fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        self.run(&["rcat", path], Some(data))?;
        Ok(())
    }

    fn delete(&self, path: &str) -> Result<()> {
        self.run(&["deletefile", path], None)?;
        Ok(())
    }

    fn write_lock(&self, path: &str) -> Result<()> {
        if self.exists(path)? {
            return Err(PackratError::Locked(path.to_string()));
        }
        let token = format!(
            "{}\n{}\n",
            chrono::Utc::now().to_rfc3339(),
            rand::thread_rng().gen::<i64>()
        );
        self.write(path, token.as_bytes())?;
        // No exclusive create on remotes: read back and make sure our token
        // won, not a concurrent writer's.
        match self.read(path)? {
            Some(back) if back == token.as_bytes() => Ok(()),
            _ => Err(PackratError::Locked(path.to_string())),
        }
    }

    fn remove_lock(&self, path: &str) -> Result<()> {
        if !self.exists(path)? {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("lock file {path} does not exist"),
            )
            .into());
        }
        self.delete(path)
    }
}
