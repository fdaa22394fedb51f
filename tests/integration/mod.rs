//! End-to-end tests over real disk images
//!
//! Every scenario builds small FAT-formatted images with a Windows-like
//! layout, derives a target from a copy of the base, and runs the full
//! create/apply cycle against them.

use ::vhdiff::*;
use ::vhdiff::disk::mbr::TYPE_FAT32_LBA;
use ::vhdiff::disk::DiskFormat;
use ::vhdiff::editor::OfflineEditor;
use ::vhdiff::fs::{self, FileSystem, FileSystemKind};
use ::vhdiff::registry::{Hive, HiveComparator, RegDiff, RegValue};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::info;

/// Size of every partition the fixtures create
pub const PARTITION_SIZE: u64 = 16 * 1024 * 1024;

pub const SOFTWARE: &str = "Windows/System32/config/SOFTWARE";
pub const SYSTEM: &str = "Windows/System32/config/SYSTEM";
pub const ALICE: &str = "Users/alice/NTUSER.DAT";

/// Scratch directory plus helpers for building and inspecting images
pub struct DiskFixture {
    pub dir: TempDir,
    pub backends: BackendRegistry,
}

impl DiskFixture {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
            backends: BackendRegistry::new(),
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Create an image with `partitions` empty FAT partitions
    pub fn create_image(&self, name: &str, format: DiskFormat, partitions: usize) -> PathBuf {
        let path = self.path(name);
        let capacity = (1 << 20) + partitions as u64 * (PARTITION_SIZE + (1 << 20));
        let mut image = self.backends.create_disk(&path, format, capacity, 512 * 1024).unwrap();
        image.initialize_partition_table().unwrap();
        for _ in 0..partitions {
            let index = image.create_partition(TYPE_FAT32_LBA, PARTITION_SIZE).unwrap();
            self.backends.format_filesystem(&image, index, FileSystemKind::Fat).unwrap();
        }
        image.flush().unwrap();
        path
    }

    /// Copy an image file under a new name
    pub fn copy_image(&self, from: &Path, name: &str) -> PathBuf {
        let path = self.path(name);
        std::fs::copy(from, &path).unwrap();
        path
    }

    /// Run `f` on a writable mount of one partition and persist the result
    pub fn with_volume<R>(&self, image: &Path, partition: usize, f: impl FnOnce(&dyn FileSystem) -> R) -> R {
        let image = self.backends.open_disk(image, true).unwrap();
        let result = {
            let volume = self.backends.open_filesystem(&image, partition, true).unwrap();
            let result = f(volume.as_ref());
            volume.flush().unwrap();
            result
        };
        image.flush().unwrap();
        result
    }

    /// Contents of a file, or `None` when it does not exist
    pub fn read(&self, image: &Path, partition: usize, path: &str) -> Option<Vec<u8>> {
        let image = self.backends.open_disk(image, false).unwrap();
        let volume = self.backends.open_filesystem(&image, partition, false).unwrap();
        let resolved = fs::resolve_case(volume.as_ref(), path).unwrap()?;
        Some(fs::read_to_vec(volume.as_ref(), &resolved).unwrap())
    }

    /// Parse a hive stored on an image
    pub fn hive(&self, image: &Path, partition: usize, path: &str) -> Hive {
        Hive::parse(&self.read(image, partition, path).unwrap()).unwrap()
    }
}

/// Write a minimal Windows installation onto a volume
pub fn seed_windows(volume: &dyn FileSystem) {
    let mut system = Hive::new("ROOT");
    system.root_mut().create_path("Select").unwrap().set_value("Current", RegValue::dword(1));
    system
        .root_mut()
        .create_path(r"ControlSet001\Control\ComputerName\ComputerName")
        .unwrap()
        .set_value("ComputerName", RegValue::sz("BASE-PC"));
    system.save(volume, SYSTEM).unwrap();

    let mut software = Hive::new("ROOT");
    let version = software
        .root_mut()
        .create_path(r"Microsoft\Windows NT\CurrentVersion")
        .unwrap();
    version.set_value("ProductName", RegValue::sz("Windows 10 Pro"));
    version.set_value("CurrentBuild", RegValue::sz("19045"));
    software.save(volume, SOFTWARE).unwrap();

    let mut alice = Hive::new("ROOT");
    alice
        .root_mut()
        .create_path(r"Control Panel\Desktop")
        .unwrap()
        .set_value("Wallpaper", RegValue::sz(r"C:\Windows\Web\img0.jpg"));
    alice.save(volume, ALICE).unwrap();

    fs::write_all(volume, "Windows/System32/config/SOFTWARE.LOG1", b"log").unwrap();
    fs::write_all(volume, "Windows/win.ini", b"[fonts]\r\n").unwrap();
    fs::write_all(volume, "Users/alice/Documents/notes.txt", b"base notes").unwrap();
}

/// Change files and registry values the way an installer would
pub fn install_app(volume: &dyn FileSystem) {
    let mut rng = StdRng::seed_from_u64(7);
    let payload: Vec<u8> = (0..200_000).map(|_| rng.random()).collect();
    fs::write_all(volume, "Program Files/App/app.exe", &payload).unwrap();
    fs::write_all(volume, "Windows/win.ini", b"[fonts]\r\n[app]\r\nenabled=1\r\n").unwrap();
    fs::write_all(volume, "Windows/System32/config/SOFTWARE.LOG1", b"log, longer now").unwrap();

    let mut software = Hive::load(volume, SOFTWARE).unwrap();
    software
        .root_mut()
        .create_path(r"Microsoft\Windows NT\CurrentVersion")
        .unwrap()
        .set_value("CurrentBuild", RegValue::sz("19046"));
    software
        .root_mut()
        .create_path(r"Vendor\App")
        .unwrap()
        .set_value("InstallDir", RegValue::sz(r"C:\Program Files\App"));
    software.save(volume, SOFTWARE).unwrap();

    let mut alice = Hive::load(volume, ALICE).unwrap();
    alice
        .root_mut()
        .create_path(r"Software\App")
        .unwrap()
        .set_value("FirstRun", RegValue::dword(0));
    alice.save(volume, ALICE).unwrap();
}

/// Base and target images where the target has [`install_app`] applied
pub fn base_and_target(fixture: &DiskFixture, format: DiskFormat) -> (PathBuf, PathBuf) {
    let ext = format.to_string().to_lowercase();
    let base = fixture.create_image(&format!("base.{}", ext), format, 1);
    fixture.with_volume(&base, 0, seed_windows);
    let target = fixture.copy_image(&base, &format!("target.{}", ext));
    fixture.with_volume(&target, 0, install_app);
    (base, target)
}

pub fn full_compare() -> Vhdiff {
    VhdiffBuilder::new()
        .style(ComparisonStyle::Full)
        .parallel_workers(4)
        .build()
        .unwrap()
}

#[test]
fn test_create_diff_contents() {
    let fixture = DiskFixture::new();
    let (base, target) = base_and_target(&fixture, DiskFormat::Vhd);
    let output = fixture.path("diff.vhd");

    let report = full_compare().create_diff(&base, &target, &output).unwrap();
    info!("Create report: {:?}", report);
    assert!(report.is_complete(), "failures: {:?}", report.failures().collect::<Vec<_>>());
    assert_eq!(report.partitions.len(), 1);

    let part = &report.partitions[0];
    assert_eq!(part.files_copied, 2);
    assert_eq!(part.system_hives, vec![SOFTWARE.to_string()]);
    assert_eq!(part.user_hives, vec!["alice".to_string()]);
    assert_eq!(part.suppressed, 1);
    assert_eq!(report.hives_diffed(), 2);

    // Changed files land verbatim under FILES/
    let app = fixture.read(&output, 0, "FILES/Program Files/App/app.exe").unwrap();
    assert_eq!(app, fixture.read(&target, 0, "Program Files/App/app.exe").unwrap());
    assert!(fixture.read(&output, 0, "FILES/Windows/win.ini").is_some());
    // Unchanged files, hives and hive logs do not
    assert!(fixture.read(&output, 0, "FILES/Users/alice/Documents/notes.txt").is_none());
    assert!(fixture.read(&output, 0, &format!("FILES/{}", SOFTWARE)).is_none());
    assert!(fixture.read(&output, 0, "FILES/Windows/System32/config/SOFTWARE.LOG1").is_none());
    assert!(fixture.read(&output, 0, &format!("REGISTRY/SYSTEM/{}", SYSTEM)).is_none());

    let software = RegDiff::deserialize(&fixture.read(&output, 0, &format!("REGISTRY/SYSTEM/{}", SOFTWARE)).unwrap());
    assert_eq!(software.len(), 2);
    assert_eq!(
        software.get(r"Microsoft\Windows NT\CurrentVersion", "CurrentBuild"),
        Some(&RegValue::sz("19046"))
    );
    assert_eq!(
        software.get(r"Vendor\App", "InstallDir"),
        Some(&RegValue::sz(r"C:\Program Files\App"))
    );

    let alice = RegDiff::deserialize(&fixture.read(&output, 0, "REGISTRY/USERS/alice/NTUSER.DAT").unwrap());
    assert_eq!(alice.len(), 1);
    assert_eq!(alice.get(r"Software\App", "FirstRun"), Some(&RegValue::dword(0)));
}

#[test]
fn test_apply_to_copy_reproduces_target() {
    let fixture = DiskFixture::new();
    let (base, target) = base_and_target(&fixture, DiskFormat::Vhd);
    let output = fixture.path("diff.vhd");
    let vhdiff = full_compare();
    vhdiff.create_diff(&base, &target, &output).unwrap();

    let base_bytes = std::fs::read(&base).unwrap();
    let patched = fixture.path("patched.vhd");
    let report = vhdiff
        .apply_diff(&output, &base, ApplyMode::CopyTo(patched.clone()))
        .unwrap();
    assert!(report.is_complete(), "{:?}", report);
    assert_eq!(report.target, patched);
    assert_eq!(report.files_written(), 2);
    assert_eq!(report.values_written(), 3);
    assert_eq!(report.partitions[0].system_hives, vec![SOFTWARE.to_string()]);
    assert_eq!(report.partitions[0].users_applied, vec!["alice".to_string()]);
    assert_eq!(std::fs::read(&base).unwrap(), base_bytes, "base must be untouched");

    for path in ["Program Files/App/app.exe", "Windows/win.ini", "Users/alice/Documents/notes.txt"] {
        assert_eq!(fixture.read(&patched, 0, path), fixture.read(&target, 0, path), "{}", path);
    }
    for hive in [SOFTWARE, SYSTEM, ALICE] {
        let comparison = HiveComparator::new()
            .compare(
                Some(fixture.hive(&patched, 0, hive).root()),
                Some(fixture.hive(&target, 0, hive).root()),
            )
            .unwrap();
        assert!(comparison.is_unchanged(), "{} differs: {:?}", hive, comparison.changed().collect::<Vec<_>>());
    }
    // The log companion is never carried
    assert_eq!(
        fixture.read(&patched, 0, "Windows/System32/config/SOFTWARE.LOG1").unwrap(),
        b"log"
    );
}

#[test]
fn test_apply_twice_is_idempotent() {
    let fixture = DiskFixture::new();
    let (base, target) = base_and_target(&fixture, DiskFormat::Raw);
    let output = fixture.path("diff.img");
    let vhdiff = VhdiffBuilder::new()
        .style(ComparisonStyle::Full)
        .output_format(DiskFormat::Raw)
        .build()
        .unwrap();
    vhdiff.create_diff(&base, &target, &output).unwrap();

    let once = fixture.copy_image(&base, "once.img");
    vhdiff.apply_diff(&output, &once, ApplyMode::InPlace).unwrap();
    let twice = fixture.copy_image(&once, "twice.img");
    let second = vhdiff.apply_diff(&output, &twice, ApplyMode::InPlace).unwrap();
    assert!(second.is_complete());

    for path in ["Program Files/App/app.exe", "Windows/win.ini"] {
        assert_eq!(fixture.read(&once, 0, path), fixture.read(&twice, 0, path));
    }
    for hive in [SOFTWARE, ALICE] {
        let comparison = HiveComparator::new()
            .compare(Some(fixture.hive(&once, 0, hive).root()), Some(fixture.hive(&twice, 0, hive).root()))
            .unwrap();
        assert!(comparison.is_unchanged());
    }
}

#[test]
fn test_identical_images_give_empty_diff() {
    let fixture = DiskFixture::new();
    let base = fixture.create_image("base.vhd", DiskFormat::Vhd, 1);
    fixture.with_volume(&base, 0, seed_windows);
    let target = fixture.copy_image(&base, "target.vhd");
    let output = fixture.path("diff.vhd");

    let report = full_compare().create_diff(&base, &target, &output).unwrap();
    let part = &report.partitions[0];
    assert_eq!(part.files_copied, 0);
    assert!(part.system_hives.is_empty());
    assert!(part.user_hives.is_empty());
    assert_eq!(part.counts.surfaced(), 0);
    assert!(part.counts.same > 0);
}

#[test]
fn test_new_hive_is_copied_whole() {
    let fixture = DiskFixture::new();
    let base = fixture.create_image("base.vhd", DiskFormat::Vhd, 1);
    fixture.with_volume(&base, 0, seed_windows);
    let target = fixture.copy_image(&base, "target.vhd");
    fixture.with_volume(&target, 0, |volume| {
        let mut bob = Hive::new("ROOT");
        bob.root_mut().create_path("Environment").unwrap().set_value("TEMP", RegValue::expand_sz("%USERPROFILE%\\Temp"));
        bob.save(volume, "Users/bob/NTUSER.DAT").unwrap();
    });
    let output = fixture.path("diff.vhd");
    let vhdiff = full_compare();

    let report = vhdiff.create_diff(&base, &target, &output).unwrap();
    assert_eq!(report.partitions[0].files_copied, 1);
    assert!(report.partitions[0].user_hives.is_empty());
    assert!(fixture.read(&output, 0, "FILES/Users/bob/NTUSER.DAT").is_some());

    let patched = fixture.path("patched.vhd");
    vhdiff.apply_diff(&output, &base, ApplyMode::CopyTo(patched.clone())).unwrap();
    let bob = fixture.hive(&patched, 0, "Users/bob/NTUSER.DAT");
    assert_eq!(
        bob.root().open_path("Environment").unwrap().value("TEMP"),
        Some(&RegValue::expand_sz("%USERPROFILE%\\Temp"))
    );
}

#[test]
fn test_user_missing_on_base_is_skipped() {
    let fixture = DiskFixture::new();
    let (base, target) = base_and_target(&fixture, DiskFormat::Vhd);
    let output = fixture.path("diff.vhd");
    let vhdiff = full_compare();
    vhdiff.create_diff(&base, &target, &output).unwrap();

    // A second base with Windows but no profile for alice
    let other = fixture.create_image("other.vhd", DiskFormat::Vhd, 1);
    fixture.with_volume(&other, 0, |volume| {
        seed_windows(volume);
        volume.remove_file(ALICE).unwrap();
    });

    let report = vhdiff.apply_diff(&output, &other, ApplyMode::InPlace).unwrap();
    assert_eq!(report.partitions[0].users_skipped, vec!["alice".to_string()]);
    assert!(report.partitions[0].users_applied.is_empty());
    assert!(fixture.read(&other, 0, ALICE).is_none());
    assert_eq!(report.values_written(), 2);
}

#[test]
fn test_missing_system_hive_is_created() {
    let fixture = DiskFixture::new();
    let (base, target) = base_and_target(&fixture, DiskFormat::Vhd);
    let output = fixture.path("diff.vhd");
    let vhdiff = full_compare();
    vhdiff.create_diff(&base, &target, &output).unwrap();

    let bare = fixture.create_image("bare.vhd", DiskFormat::Vhd, 1);
    let report = vhdiff.apply_diff(&output, &bare, ApplyMode::InPlace).unwrap();
    assert!(report.is_complete());
    let software = fixture.hive(&bare, 0, SOFTWARE);
    assert_eq!(
        software.root().open_path(r"Vendor\App").unwrap().value("InstallDir"),
        Some(&RegValue::sz(r"C:\Program Files\App"))
    );
    assert_eq!(software.root().open_path(r"Microsoft\Windows NT\CurrentVersion").unwrap().value_count(), 1);
}

#[test]
fn test_apply_through_differencing_child() {
    let fixture = DiskFixture::new();
    let (base, target) = base_and_target(&fixture, DiskFormat::Vhd);
    let output = fixture.path("diff.vhd");
    let vhdiff = full_compare();
    vhdiff.create_diff(&base, &target, &output).unwrap();

    let base_bytes = std::fs::read(&base).unwrap();
    let child = fixture.path("child.vhd");
    let report = vhdiff
        .apply_diff(&output, &base, ApplyMode::DifferencingChild(child.clone()))
        .unwrap();
    assert!(report.is_complete());
    assert_eq!(std::fs::read(&base).unwrap(), base_bytes);
    assert_eq!(
        fixture.read(&child, 0, "Program Files/App/app.exe"),
        fixture.read(&target, 0, "Program Files/App/app.exe")
    );
    assert!(fixture.read(&base, 0, "Program Files/App/app.exe").is_none());
}

#[test]
fn test_exclusions_keep_files_out() {
    let fixture = DiskFixture::new();
    let base = fixture.create_image("base.vhd", DiskFormat::Vhd, 1);
    fixture.with_volume(&base, 0, seed_windows);
    let target = fixture.copy_image(&base, "target.vhd");
    fixture.with_volume(&target, 0, |volume| {
        fs::write_all(volume, "pagefile.sys", &[0u8; 4096]).unwrap();
        fs::write_all(volume, "Temp/setup.tmp", b"scratch").unwrap();
        fs::write_all(volume, "Temp/keep.txt", b"keep").unwrap();
    });
    let output = fixture.path("diff.vhd");

    let mut patterns: Vec<String> = DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect();
    patterns.push("*.tmp".to_string());
    let vhdiff = VhdiffBuilder::new()
        .style(ComparisonStyle::Full)
        .exclude_patterns(patterns)
        .build()
        .unwrap();
    let report = vhdiff.create_diff(&base, &target, &output).unwrap();

    assert_eq!(report.files_copied(), 1);
    assert!(fixture.read(&output, 0, "FILES/Temp/keep.txt").is_some());
    assert!(fixture.read(&output, 0, "FILES/Temp/setup.tmp").is_none());
    assert!(fixture.read(&output, 0, "FILES/pagefile.sys").is_none());
}

#[test]
fn test_partition_preconditions() {
    let fixture = DiskFixture::new();
    let one = fixture.create_image("one.vhd", DiskFormat::Vhd, 1);
    let two = fixture.create_image("two.vhd", DiskFormat::Vhd, 2);
    fixture.with_volume(&two, 1, |volume| {
        fs::write_all(volume, "data/only-here.txt", b"second partition").unwrap();
    });
    let vhdiff = full_compare();
    let output = fixture.path("diff.vhd");

    let err = vhdiff.create_diff(&one, &two, &output).unwrap_err();
    assert!(matches!(err, VhdiffError::PartitionCountMismatch { left: 1, right: 2 }));
    assert!(!output.exists());

    // An explicit pair lifts the count check
    let report = vhdiff
        .create_diff_with(&one, &two, &output, PartitionSelection::Pair(0, 1))
        .unwrap();
    assert_eq!(report.partitions[0].right_index, 1);
    assert!(fixture.read(&output, 0, "FILES/data/only-here.txt").is_some());

    // The output now exists
    let err = vhdiff.create_diff(&one, &one, &output).unwrap_err();
    assert!(matches!(err, VhdiffError::OutputExists(_)));

    let blank = fixture.path("blank.img");
    std::fs::write(&blank, vec![0u8; 1 << 20]).unwrap();
    let err = vhdiff.create_diff(&blank, &one, &fixture.path("other.vhd")).unwrap_err();
    assert!(matches!(err, VhdiffError::NotPartitioned(_)));

    let err = vhdiff.apply_diff(&output, &two, ApplyMode::InPlace).unwrap_err();
    assert!(matches!(err, VhdiffError::PartitionCountMismatch { .. }));
}

#[test]
fn test_unmountable_partition_fails_alone() {
    let fixture = DiskFixture::new();
    let base = fixture.create_image("base.raw", DiskFormat::Raw, 2);
    let target = fixture.copy_image(&base, "target.raw");
    for partition in 0..2 {
        fixture.with_volume(&target, partition, |volume| {
            fs::write_all(volume, "data/new.txt", b"added").unwrap();
        });
    }
    let first_only = fixture.copy_image(&base, "first-only.raw");
    fixture.with_volume(&first_only, 0, |volume| {
        fs::write_all(volume, "data/first.txt", b"first").unwrap();
    });
    let vhdiff = full_compare();
    let diff = fixture.path("diff.vhd");
    vhdiff.create_diff(&base, &target, &diff).unwrap();
    let first_diff = fixture.path("first.vhd");
    vhdiff.create_diff(&base, &first_only, &first_diff).unwrap();

    // Wipe the second partition's boot sector so it no longer mounts
    let offset = fixture.backends.open_disk(&base, false).unwrap().partition(1).unwrap().offset(512) as usize;
    let mut bytes = std::fs::read(&base).unwrap();
    bytes[offset..offset + 512].fill(0);
    std::fs::write(&base, bytes).unwrap();

    let report = vhdiff.apply_diff(&diff, &base, ApplyMode::InPlace).unwrap();
    assert!(!report.is_complete());
    assert_eq!(report.partitions.len(), 2);
    assert!(report.partitions[0].error.is_none());
    assert_eq!(report.partitions[0].files_written, 1);
    assert!(report.partitions[1].error.is_some());
    assert_eq!(report.partitions[1].files_written, 0);
    assert_eq!(fixture.read(&base, 0, "data/new.txt").unwrap(), b"added");

    // Nothing to apply on the broken partition is not a failure
    let report = vhdiff.apply_diff(&first_diff, &base, ApplyMode::InPlace).unwrap();
    assert!(report.is_complete());
    assert!(report.partitions[1].error.is_none());
    assert_eq!(fixture.read(&base, 0, "data/first.txt").unwrap(), b"first");
}

#[test]
fn test_output_aliasing_an_input_is_refused() {
    let fixture = DiskFixture::new();
    let (base, target) = base_and_target(&fixture, DiskFormat::Vhd);
    let original = std::fs::read(&base).unwrap();
    let vhdiff = VhdiffBuilder::new().style(ComparisonStyle::Full).force(true).build().unwrap();

    let dotted = fixture.dir.path().join(".").join("base.vhd");
    let err = vhdiff.create_diff(&base, &target, &dotted).unwrap_err();
    assert!(matches!(err, VhdiffError::InvalidConfiguration(_)));

    let roundabout = fixture.dir.path().join("sub").join("..").join("target.vhd");
    std::fs::create_dir(fixture.path("sub")).unwrap();
    let err = vhdiff.create_diff(&base, &target, &roundabout).unwrap_err();
    assert!(matches!(err, VhdiffError::InvalidConfiguration(_)));

    #[cfg(unix)]
    {
        let link = fixture.path("link.vhd");
        std::os::unix::fs::symlink(&base, &link).unwrap();
        let err = vhdiff.create_diff(&base, &target, &link).unwrap_err();
        assert!(matches!(err, VhdiffError::InvalidConfiguration(_)));
    }

    let diff = fixture.path("diff.vhd");
    vhdiff.create_diff(&base, &target, &diff).unwrap();
    let err = vhdiff.apply_diff(&diff, &base, ApplyMode::CopyTo(dotted)).unwrap_err();
    assert!(matches!(err, VhdiffError::InvalidConfiguration(_)));

    assert_eq!(std::fs::read(&base).unwrap(), original);
}

#[test]
fn test_force_overwrites_output() {
    let fixture = DiskFixture::new();
    let (base, target) = base_and_target(&fixture, DiskFormat::Vhd);
    let output = fixture.path("diff.vhd");
    std::fs::write(&output, b"stale").unwrap();

    let vhdiff = VhdiffBuilder::new().style(ComparisonStyle::Full).force(true).build().unwrap();
    let report = vhdiff.create_diff(&base, &target, &output).unwrap();
    assert_eq!(report.files_copied(), 2);
    assert!(std::fs::metadata(&output).unwrap().len() > 5);
}

#[test]
fn test_progress_is_reported() {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    let fixture = DiskFixture::new();
    let (base, target) = base_and_target(&fixture, DiskFormat::Vhd);
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let vhdiff = VhdiffBuilder::new()
        .style(ComparisonStyle::Full)
        .progress_callback(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        }))
        .build()
        .unwrap();
    vhdiff.create_diff(&base, &target, &fixture.path("diff.vhd")).unwrap();
    assert!(calls.load(Ordering::Relaxed) > 0);
}

#[test]
fn test_offline_editor() {
    let fixture = DiskFixture::new();
    let image = fixture.create_image("win.vhd", DiskFormat::Vhd, 2);
    fixture.with_volume(&image, 1, seed_windows);

    {
        let editor = OfflineEditor::open(&fixture.backends, &image, true).unwrap();
        assert_eq!(editor.locate_windows().unwrap(), 1);
        assert_eq!(
            editor
                .read_machine_value(r"HKLM\SOFTWARE\Microsoft\Windows NT\CurrentVersion\ProductName")
                .unwrap(),
            RegValue::sz("Windows 10 Pro")
        );
        assert_eq!(
            editor
                .read_machine_value(r"SYSTEM\CurrentControlSet\Control\ComputerName\ComputerName\ComputerName")
                .unwrap()
                .as_string()
                .unwrap(),
            "BASE-PC"
        );
        editor
            .write_machine_value(r"SYSTEM\CurrentControlSet\Services\Demo\Start", RegValue::dword(3))
            .unwrap();
        editor
            .write_user_value("ALICE", r"HKCU\Software\Demo\", RegValue::sz("default"))
            .unwrap();
        editor.write_file(1, "Windows/Temp/marker.txt", b"edited offline").unwrap();

        assert!(matches!(
            editor.read_machine_value(r"SOFTWARE\No\Such\Value"),
            Err(VhdiffError::KeyNotFound(_))
        ));
        assert!(matches!(
            editor.read_machine_value(r"SOFTWARE\Microsoft\Windows NT\CurrentVersion\Missing"),
            Err(VhdiffError::ValueNotFound(_))
        ));
        assert!(editor.read_user_value("nobody", r"Software\X").is_err());
    }

    let system = fixture.hive(&image, 1, SYSTEM);
    assert_eq!(
        system.root().open_path(r"ControlSet001\Services\Demo").unwrap().value("Start"),
        Some(&RegValue::dword(3))
    );
    let editor = OfflineEditor::open(&fixture.backends, &image, false).unwrap();
    assert_eq!(
        editor.read_user_value("alice", r"Software\Demo\").unwrap(),
        RegValue::sz("default")
    );
    assert_eq!(editor.read_file(1, "windows/temp/MARKER.TXT").unwrap(), b"edited offline");
}

#[test]
fn test_editor_without_windows() {
    let fixture = DiskFixture::new();
    let image = fixture.create_image("data.vhd", DiskFormat::Vhd, 1);
    let editor = OfflineEditor::open(&fixture.backends, &image, false).unwrap();
    assert!(matches!(editor.locate_windows(), Err(VhdiffError::WindowsNotFound(_))));
}
