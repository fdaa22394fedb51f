//! Offline edits of a Windows disk image
//!
//! [`OfflineEditor`] reads and writes files and registry values on an image
//! that is not running. Machine values are addressed by a data path whose
//! first segment names the hive file (`SOFTWARE\Microsoft\...\Value`); user
//! values are addressed relative to the user's `NTUSER.DAT`. A trailing `\`
//! names the key's default value.
//!
//! ```rust,no_run
//! use vhdiff::editor::OfflineEditor;
//! use vhdiff::registry::RegValue;
//! use vhdiff::BackendRegistry;
//! use std::path::Path;
//!
//! # fn main() -> vhdiff::Result<()> {
//! let backends = BackendRegistry::new();
//! let editor = OfflineEditor::open(&backends, Path::new("win.vhd"), true)?;
//! let name = editor.read_machine_value(r"SOFTWARE\Microsoft\Windows NT\CurrentVersion\ProductName")?;
//! println!("{}", name);
//! editor.write_machine_value(r"SYSTEM\CurrentControlSet\Control\Vhdiff\Stamp", RegValue::dword(1))?;
//! # Ok(())
//! # }
//! ```

use std::path::Path;
use tracing::{debug, info, instrument};

use crate::backend::BackendRegistry;
use crate::disk::DiskImage;
use crate::error::{Result, VhdiffError};
use crate::fs::{self, SharedFileSystem};
use crate::layout::{self, CONFIG_DIR};
use crate::registry::hive::{join_key_path, split_path};
use crate::registry::{Hive, RegValue, RegistryKey};

/// Edits files and registry values on an at-rest disk image
pub struct OfflineEditor<'a> {
    backends: &'a BackendRegistry,
    image: DiskImage,
    writable: bool,
}

impl std::fmt::Debug for OfflineEditor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineEditor")
            .field("image", &self.image)
            .field("writable", &self.writable)
            .finish()
    }
}

/// A data path split into hive, key path and value name
#[derive(Debug, Clone, PartialEq, Eq)]
struct DataPath {
    hive: Option<String>,
    key_path: String,
    value_name: String,
}

fn strip_root<'p>(path: &'p str, roots: &[&str]) -> &'p str {
    for root in roots {
        let matches = path.get(..root.len()).is_some_and(|head| head.eq_ignore_ascii_case(root));
        if matches {
            let tail = &path[root.len()..];
            if tail.is_empty() || tail.starts_with('\\') {
                return tail.trim_start_matches('\\');
            }
        }
    }
    path
}

fn split_value(path: &str) -> Result<(String, String)> {
    let (key, value) = match path.rfind('\\') {
        Some(i) => (&path[..i], &path[i + 1..]),
        None => ("", path),
    };
    if key.is_empty() && value.is_empty() {
        return Err(VhdiffError::InvalidRegistryPath(path.to_string()));
    }
    Ok((split_path(key).collect::<Vec<_>>().join("\\"), value.to_string()))
}

fn parse_machine_path(path: &str) -> Result<DataPath> {
    let path = strip_root(path, &["HKEY_LOCAL_MACHINE", "HKLM"]);
    let (hive, rest) = path
        .split_once('\\')
        .ok_or_else(|| VhdiffError::InvalidRegistryPath(path.to_string()))?;
    let hive = layout::SYSTEM_HIVES
        .iter()
        .find(|h| !h.contains('/') && h.eq_ignore_ascii_case(hive))
        .ok_or_else(|| VhdiffError::InvalidRegistryPath(format!("unknown hive '{}'", hive)))?;
    let (key_path, value_name) = split_value(rest)?;
    Ok(DataPath { hive: Some(hive.to_string()), key_path, value_name })
}

fn parse_user_path(path: &str) -> Result<DataPath> {
    let path = strip_root(path, &["HKEY_CURRENT_USER", "HKCU"]);
    let (key_path, value_name) = split_value(path)?;
    Ok(DataPath { hive: None, key_path, value_name })
}

/// Replace a leading `CurrentControlSet` with the set `Select\Current` names
fn resolve_control_set(root: &RegistryKey, key_path: &str) -> String {
    let mut segments = split_path(key_path);
    match segments.next() {
        Some(first) if first.eq_ignore_ascii_case("CurrentControlSet") => {
            let current = root
                .open_path("Select")
                .and_then(|k| k.value("Current"))
                .and_then(RegValue::as_dword)
                .unwrap_or(1);
            let mut resolved = format!("ControlSet{:03}", current);
            for segment in segments {
                resolved = join_key_path(&resolved, segment);
            }
            debug!("Resolved {} to {}", key_path, resolved);
            resolved
        }
        _ => key_path.to_string(),
    }
}

impl<'a> OfflineEditor<'a> {
    /// Open an image for inspection, or for edits when `writable`
    pub fn open(backends: &'a BackendRegistry, path: &Path, writable: bool) -> Result<Self> {
        let image = backends.open_disk(path, writable)?;
        if !image.is_partitioned() {
            return Err(VhdiffError::NotPartitioned(path.to_path_buf()));
        }
        Ok(Self { backends, image, writable })
    }

    /// The opened image
    pub fn image(&self) -> &DiskImage {
        &self.image
    }

    fn volume(&self, partition: usize) -> Result<SharedFileSystem> {
        self.backends.open_filesystem(&self.image, partition, self.writable)
    }

    /// Index of the first partition holding a Windows installation
    #[instrument(skip(self))]
    pub fn locate_windows(&self) -> Result<usize> {
        for index in 0..self.image.partitions().len() {
            let Ok(volume) = self.volume(index) else {
                continue;
            };
            let has = |hive: &str| {
                fs::resolve_case(volume.as_ref(), &fs::join(CONFIG_DIR, hive))
                    .ok()
                    .flatten()
                    .is_some()
            };
            if has("SYSTEM") && has("SOFTWARE") {
                debug!("Windows found on partition {}", index);
                return Ok(index);
            }
        }
        Err(VhdiffError::WindowsNotFound(self.image.path().to_path_buf()))
    }

    /// Contents of a file on a partition
    pub fn read_file(&self, partition: usize, path: &str) -> Result<Vec<u8>> {
        let volume = self.volume(partition)?;
        let resolved = fs::resolve_case(volume.as_ref(), path)?.unwrap_or_else(|| fs::normalize(path));
        fs::read_to_vec(volume.as_ref(), &resolved)
    }

    /// Create or overwrite a file on a partition
    #[instrument(skip(self, data), fields(len = data.len()))]
    pub fn write_file(&self, partition: usize, path: &str, data: &[u8]) -> Result<u64> {
        let written = {
            let volume = self.volume(partition)?;
            let resolved = fs::resolve_case(volume.as_ref(), path)?.unwrap_or_else(|| fs::normalize(path));
            let written = fs::write_all(volume.as_ref(), &resolved, data)?;
            volume.flush()?;
            written
        };
        self.image.flush()?;
        info!("Wrote {} bytes to {}", written, path);
        Ok(written)
    }

    fn hive_file(&self, data: &DataPath, user: Option<&str>, volume: &SharedFileSystem) -> Result<String> {
        let path = match (&data.hive, user) {
            (Some(hive), _) => fs::join(CONFIG_DIR, hive),
            (None, Some(user)) => layout::user_hives(volume.as_ref())?
                .into_iter()
                .find(|(name, _)| fs::names_equal(name, user, false))
                .map(|(_, path)| path)
                .ok_or_else(|| VhdiffError::KeyNotFound(format!("no profile for user '{}'", user)))?,
            (None, None) => return Err(VhdiffError::internal("user hive requested without a user")),
        };
        fs::resolve_case(volume.as_ref(), &path)?.ok_or_else(|| VhdiffError::KeyNotFound(path))
    }

    fn read_value(&self, data: DataPath, user: Option<&str>) -> Result<RegValue> {
        let partition = self.locate_windows()?;
        let volume = self.volume(partition)?;
        let hive_path = self.hive_file(&data, user, &volume)?;
        let hive = Hive::load(volume.as_ref(), &hive_path)?;
        let key_path = resolve_control_set(hive.root(), &data.key_path);
        let key = hive
            .root()
            .open_path(&key_path)
            .ok_or_else(|| VhdiffError::KeyNotFound(key_path.clone()))?;
        key.value(&data.value_name)
            .cloned()
            .ok_or_else(|| VhdiffError::ValueNotFound(format!("{}\\{}", key_path, data.value_name)))
    }

    fn write_value(&self, data: DataPath, user: Option<&str>, value: RegValue) -> Result<()> {
        let partition = self.locate_windows()?;
        {
            let volume = self.volume(partition)?;
            fs::ensure_writable(volume.as_ref())?;
            let hive_path = self.hive_file(&data, user, &volume)?;
            let mut hive = Hive::load(volume.as_ref(), &hive_path)?;
            let key_path = resolve_control_set(hive.root(), &data.key_path);
            hive.root_mut().create_path(&key_path)?.set_value(&data.value_name, value);
            hive.save(volume.as_ref(), &hive_path)?;
            volume.flush()?;
            info!("Set {}\\{} in {}", key_path, data.value_name, hive_path);
        }
        self.image.flush()
    }

    /// Read a machine value such as `SOFTWARE\Microsoft\Windows NT\CurrentVersion\ProductName`
    pub fn read_machine_value(&self, data_path: &str) -> Result<RegValue> {
        self.read_value(parse_machine_path(data_path)?, None)
    }

    /// Set a machine value, creating missing keys
    #[instrument(skip(self, value))]
    pub fn write_machine_value(&self, data_path: &str, value: RegValue) -> Result<()> {
        self.write_value(parse_machine_path(data_path)?, None, value)
    }

    /// Read a value from `user`'s hive
    pub fn read_user_value(&self, user: &str, data_path: &str) -> Result<RegValue> {
        self.read_value(parse_user_path(data_path)?, Some(user))
    }

    /// Set a value in `user`'s hive, creating missing keys
    #[instrument(skip(self, value))]
    pub fn write_user_value(&self, user: &str, data_path: &str, value: RegValue) -> Result<()> {
        self.write_value(parse_user_path(data_path)?, Some(user), value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_machine_path() {
        let parsed = parse_machine_path(r"HKLM\software\Microsoft\Windows NT\CurrentVersion\ProductName").unwrap();
        assert_eq!(parsed.hive.as_deref(), Some("SOFTWARE"));
        assert_eq!(parsed.key_path, r"Microsoft\Windows NT\CurrentVersion");
        assert_eq!(parsed.value_name, "ProductName");

        let default = parse_machine_path(r"SYSTEM\Setup\").unwrap();
        assert_eq!(default.key_path, "Setup");
        assert_eq!(default.value_name, "");

        assert!(parse_machine_path(r"NOTAHIVE\Key\Value").is_err());
        assert!(parse_machine_path("SOFTWARE").is_err());
    }

    #[test]
    fn test_parse_user_path() {
        let parsed = parse_user_path(r"HKCU\Control Panel\Desktop\Wallpaper").unwrap();
        assert_eq!(parsed.hive, None);
        assert_eq!(parsed.key_path, r"Control Panel\Desktop");
        assert_eq!(parsed.value_name, "Wallpaper");
        assert_eq!(parse_user_path("TopLevel").unwrap().key_path, "");
    }

    #[test]
    fn test_current_control_set() {
        let mut root = RegistryKey::new("SYSTEM");
        root.create_path("Select").unwrap().set_value("Current", RegValue::dword(2));
        assert_eq!(
            resolve_control_set(&root, r"CurrentControlSet\Control\ComputerName"),
            r"ControlSet002\Control\ComputerName"
        );
        assert_eq!(resolve_control_set(&root, r"Setup"), "Setup");
        assert_eq!(
            resolve_control_set(&RegistryKey::new("SYSTEM"), "currentcontrolset"),
            "ControlSet001"
        );
    }
}
