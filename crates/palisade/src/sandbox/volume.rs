//! Ephemeral sandbox volumes.
//!
//! A volume is a private directory under the runtime root with three
//! subdirectories: `work` (the action's working directory), `home` and `tmp`.
//! The owner marker lives beside them so actions cannot rewrite it.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use tempfile::TempDir;

use crate::action::AgentId;
use crate::error::SandboxError;

const OWNER_MARKER: &str = ".owner";
const SUBDIRS: [&str; 3] = ["work", "home", "tmp"];

/// A throwaway directory tree. Dropping it deletes everything.
#[derive(Debug)]
pub(crate) struct Volume {
    dir: TempDir,
    owner: Option<AgentId>,
}

impl Volume {
    /// Create a fresh volume under `root`.
    pub(crate) fn create(root: &Path) -> io::Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("sandbox-")
            .tempdir_in(root)?;
        for sub in SUBDIRS {
            fs::create_dir(dir.path().join(sub))?;
        }
        Ok(Self { dir, owner: None })
    }

    pub(crate) fn path(&self) -> &Path {
        self.dir.path()
    }

    pub(crate) fn work_dir(&self) -> PathBuf {
        self.dir.path().join("work")
    }

    pub(crate) fn home_dir(&self) -> PathBuf {
        self.dir.path().join("home")
    }

    pub(crate) fn tmp_dir(&self) -> PathBuf {
        self.dir.path().join("tmp")
    }

    pub(crate) fn owner(&self) -> Option<&AgentId> {
        self.owner.as_ref()
    }

    /// Bind the volume to an agent. A volume that belonged to someone else
    /// must have been wiped first.
    pub(crate) fn claim(&mut self, owner: &AgentId) -> io::Result<()> {
        if let Some(current) = &self.owner {
            if current != owner {
                return Err(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    format!("volume still owned by {current}"),
                ));
            }
        }
        fs::write(self.dir.path().join(OWNER_MARKER), owner.as_str())?;
        self.owner = Some(owner.clone());
        Ok(())
    }

    /// Delete every file and release the owner binding.
    pub(crate) fn wipe(&mut self) -> io::Result<()> {
        for sub in SUBDIRS {
            let path = self.dir.path().join(sub);
            if path.exists() {
                fs::remove_dir_all(&path)?;
            }
            fs::create_dir(&path)?;
        }
        let marker = self.dir.path().join(OWNER_MARKER);
        if marker.exists() {
            fs::remove_file(marker)?;
        }
        self.owner = None;
        Ok(())
    }

    /// Bytes stored in the volume. Symlinks are not followed.
    pub(crate) fn disk_usage(&self) -> io::Result<u64> {
        SUBDIRS
            .iter()
            .map(|sub| dir_size(&self.dir.path().join(sub)))
            .sum()
    }

    /// Map a relative path onto the work directory, refusing anything that
    /// could land outside it, including through symlinks that already exist.
    pub(crate) fn resolve(&self, relative: &str) -> Result<PathBuf, SandboxError> {
        let escape = || SandboxError::Io(io::Error::new(
            io::ErrorKind::PermissionDenied,
            format!("path `{relative}` escapes the sandbox volume"),
        ));
        let rel = Path::new(relative);
        if relative.is_empty()
            || rel
                .components()
                .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(escape());
        }

        let work = self.work_dir().canonicalize()?;
        let target = work.join(rel);
        // the deepest existing ancestor must still be inside the volume
        let mut existing = target.as_path();
        while !existing.exists() {
            match existing.parent() {
                Some(parent) => existing = parent,
                None => break,
            }
        }
        let real = existing.canonicalize()?;
        if !real.starts_with(&work) {
            return Err(escape());
        }
        Ok(target)
    }
}

fn dir_size(path: &Path) -> io::Result<u64> {
    let mut total = 0;
    let mut stack = vec![path.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        for entry in entries {
            let entry = entry?;
            let meta = entry.path().symlink_metadata()?;
            if meta.is_dir() {
                stack.push(entry.path());
            } else {
                total += meta.len();
            }
        }
    }
    Ok(total)
}
