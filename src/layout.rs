//! Where things live: hive files on a Windows volume and the regions of a diff
//!
//! A diff partition has three top-level regions:
//!
//! - `FILES/<path>`: changed or added files, verbatim
//! - `REGISTRY/SYSTEM/<path of hive>`: one container per changed system hive
//! - `REGISTRY/USERS/<user>/<hive file name>`: one container per changed user hive

use globset::{Glob, GlobBuilder, GlobSet, GlobSetBuilder};

use crate::error::Result;
use crate::fs::{self, FileSystem};

/// Verbatim file region
pub const FILES_DIR: &str = "FILES";
/// Registry regions root
pub const REGISTRY_DIR: &str = "REGISTRY";
/// System hive containers
pub const SYSTEM_DIR: &str = "REGISTRY/SYSTEM";
/// Per-user hive containers
pub const USERS_DIR: &str = "REGISTRY/USERS";
/// Directory holding the system hives
pub const CONFIG_DIR: &str = "Windows/System32/config";

/// System hive files relative to [`CONFIG_DIR`]
pub const SYSTEM_HIVES: &[&str] = &[
    "BCD-TEMPLATE",
    "COMPONENTS",
    "DEFAULT",
    "DRIVERS",
    "FP",
    "SAM",
    "SECURITY",
    "SOFTWARE",
    "SYSTEM",
    "systemprofile/NTUSER.DAT",
];

/// Directories whose children are user profiles
pub const PROFILE_ROOTS: &[&str] = &["Users", "Documents and Settings"];

/// User hive file name inside a profile
pub const USER_HIVE: &str = "NTUSER.DAT";

/// What a hive file is
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HiveClass {
    /// One of the machine hives
    System,
    /// A profile's hive, with the captured user name
    User(String),
}

fn glob(pattern: &str) -> Result<Glob> {
    Ok(GlobBuilder::new(pattern)
        .case_insensitive(true)
        .literal_separator(true)
        .build()?)
}

/// Recognizes hive files by path
#[derive(Debug, Clone)]
pub struct HiveLayout {
    system: GlobSet,
    user: GlobSet,
    config: GlobSet,
}

impl HiveLayout {
    /// Layout for Windows volumes
    pub fn new() -> Result<Self> {
        let mut system = GlobSetBuilder::new();
        for hive in SYSTEM_HIVES {
            system.add(glob(&format!("{}/{}", CONFIG_DIR, hive))?);
        }
        let mut user = GlobSetBuilder::new();
        for root in PROFILE_ROOTS {
            user.add(glob(&format!("{}/*/{}", root, USER_HIVE))?);
        }
        let mut config = GlobSetBuilder::new();
        config.add(glob(&format!("{}/**", CONFIG_DIR))?);
        Ok(Self {
            system: system.build()?,
            user: user.build()?,
            config: config.build()?,
        })
    }

    /// Classify a `/`-separated path relative to the partition root
    pub fn classify(&self, path: &str) -> Option<HiveClass> {
        if self.system.is_match(path) {
            return Some(HiveClass::System);
        }
        if self.user.is_match(path) {
            return path.split('/').nth(1).map(|user| HiveClass::User(user.to_string()));
        }
        None
    }

    /// A file under the hive directory that is not itself a hive
    ///
    /// Transaction logs and backups there change whenever a hive is touched
    /// and are never carried as files.
    pub fn is_config_companion(&self, path: &str) -> bool {
        self.config.is_match(path) && !self.system.is_match(path)
    }
}

/// Path of a changed file inside the files region
pub fn files_path(path: &str) -> String {
    fs::join(FILES_DIR, path)
}

/// Container path for a system hive
pub fn system_container_path(hive_path: &str) -> String {
    fs::join(SYSTEM_DIR, hive_path)
}

/// Container path for a user hive
pub fn user_container_path(user: &str, hive_path: &str) -> String {
    format!("{}/{}/{}", USERS_DIR, user, fs::file_name(hive_path))
}

/// Every user hive on a volume as `(user, path)`, in listing order
///
/// Profiles without a hive file are skipped, as are missing profile roots.
pub fn user_hives(volume: &dyn FileSystem) -> Result<Vec<(String, String)>> {
    let mut found = Vec::new();
    for root in PROFILE_ROOTS {
        let Some(root_path) = fs::resolve_case(volume, root)? else {
            continue;
        };
        for profile in volume.list_dir(&root_path)? {
            if !profile.stat.is_dir {
                continue;
            }
            let profile_path = fs::join(&root_path, &profile.name);
            if let Some(hive) = fs::resolve_case(volume, &fs::join(&profile_path, USER_HIVE))? {
                if fs::is_file(volume, &hive)? {
                    found.push((profile.name, hive));
                }
            }
        }
    }
    Ok(found)
}

/// Every file below `dir` on a volume, as paths relative to `dir`
pub fn list_files(volume: &dyn FileSystem, dir: &str) -> Result<Vec<String>> {
    let mut files = Vec::new();
    let mut pending = vec![String::new()];
    while let Some(rel) = pending.pop() {
        for entry in volume.list_dir(&fs::join(dir, &rel))? {
            let child = fs::join(&rel, &entry.name);
            if entry.stat.is_dir {
                pending.push(child);
            } else {
                files.push(child);
            }
        }
    }
    files.sort();
    Ok(files)
}
