//! Scoped hive mounting
//!
//! Editing the registry of a running machine goes through a privileged helper
//! that loads a hive file under a temporary key and unloads it afterwards.
//! [`HiveMounter`] is that helper's interface; [`MountedHive`] ties one load to
//! a scope so the hive is unloaded on every exit path.

use std::fmt;
use std::path::Path;
use tracing::{debug, warn};

use crate::error::Result;

/// Opaque handle to a loaded hive
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MountRef(String);

impl MountRef {
    /// Wrap a helper-specific token
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The helper-specific token
    pub fn token(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MountRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Loads hive files into a live registry
pub trait HiveMounter: Send + Sync {
    /// Load `hive_file` and return a reference to the mounted key
    fn load(&self, hive_file: &Path) -> Result<MountRef>;

    /// Unload a hive previously returned by [`load`](Self::load)
    fn unload(&self, mount: &MountRef) -> Result<()>;
}

/// A loaded hive that is unloaded when dropped
pub struct MountedHive<'a> {
    mounter: &'a dyn HiveMounter,
    mount: Option<MountRef>,
}

impl<'a> MountedHive<'a> {
    /// Load `hive_file` through `mounter`
    pub fn load(mounter: &'a dyn HiveMounter, hive_file: &Path) -> Result<Self> {
        let mount = mounter.load(hive_file)?;
        debug!("Mounted {:?} as {}", hive_file, mount);
        Ok(Self { mounter, mount: Some(mount) })
    }

    /// Reference to the mounted key
    pub fn mount_ref(&self) -> Option<&MountRef> {
        self.mount.as_ref()
    }

    /// Unload now, reporting any failure
    pub fn unload(mut self) -> Result<()> {
        match self.mount.take() {
            Some(mount) => self.mounter.unload(&mount),
            None => Ok(()),
        }
    }
}

impl Drop for MountedHive<'_> {
    fn drop(&mut self) {
        if let Some(mount) = self.mount.take() {
            if let Err(e) = self.mounter.unload(&mount) {
                warn!("Failed to unload hive {}: {}", mount, e);
            }
        }
    }
}
