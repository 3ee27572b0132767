#![forbid(unsafe_code)]

//! Shared security helpers: the storage containment check and the start-up
//! refusal to run as root.

use std::{
    io,
    path::{Component, Path, PathBuf},
};

use anyhow::{Result, bail};
use nix::unistd::Uid;

use crate::error::{PipelineError, PipelineResult};

/// Fails fast when a binary is started as root. Downloads are written by an
/// external tool, so the process should never hold more rights than needed.
pub fn ensure_not_root(process: &str) -> Result<()> {
    ensure_not_root_for(Uid::current(), process)
}

fn ensure_not_root_for(uid: Uid, process: &str) -> Result<()> {
    if uid.is_root() {
        bail!(
            "{process} must not be run as root; use a regular user or a dedicated service account"
        );
    }
    Ok(())
}

/// Containment check for caller-supplied file names.
///
/// Only bare file names are accepted. Anything that could address another
/// directory is rejected before the filesystem is touched.
#[derive(Debug, Clone)]
pub struct PathGuard {
    root: PathBuf,
}

impl PathGuard {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Purely lexical half of the check.
    pub fn check_name(name: &str) -> PipelineResult<()> {
        let has_separator = name.contains(['/', '\\', '\0']);
        let single_normal = {
            let mut components = Path::new(name).components();
            matches!(
                (components.next(), components.next()),
                (Some(Component::Normal(first)), None) if first == name
            )
        };
        if name.is_empty() || name.starts_with('.') || has_separator || !single_normal {
            return Err(PipelineError::PathTraversalAttempt);
        }
        Ok(())
    }

    /// Returns the canonical path of an existing entry under the root.
    ///
    /// Traversal is reported before existence so probing names outside the
    /// root tells the caller nothing.
    pub fn resolve(&self, name: &str) -> PipelineResult<PathBuf> {
        Self::check_name(name)?;
        let candidate = self.root.join(name);
        let canonical = match candidate.canonicalize() {
            Ok(path) => path,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(PipelineError::FileNotFound);
            }
            Err(err) => return Err(err.into()),
        };
        let root = match self.root.canonicalize() {
            Ok(path) => path,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(PipelineError::FileNotFound);
            }
            Err(err) => return Err(err.into()),
        };
        if canonical.parent() != Some(root.as_path()) {
            return Err(PipelineError::PathTraversalAttempt);
        }
        Ok(canonical)
    }
}
