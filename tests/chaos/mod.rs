//! Chaos testing for vhdiff
//!
//! Damages hives, registry containers and disk images in controlled ways and
//! checks that every layer degrades to a reported failure instead of a panic
//! or an aborted run.

use ::vhdiff::disk::DiskFormat;
use ::vhdiff::fs;
use ::vhdiff::registry::{Hive, HiveComparator, RegDiff, RegValue, RegistryKey};
use ::vhdiff::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use tracing::{info, warn};

use crate::integration::{base_and_target, full_compare, seed_windows, DiskFixture, ALICE, SOFTWARE};

/// Seeded source of damage
pub struct ChaosEngine {
    rng: StdRng,
}

impl ChaosEngine {
    pub fn new(seed: u64) -> Self {
        Self { rng: StdRng::seed_from_u64(seed) }
    }

    /// Overwrite `count` random bytes at or after `from`
    pub fn flip_bytes(&mut self, data: &mut [u8], from: usize, count: usize) {
        if data.len() <= from {
            return;
        }
        for _ in 0..count {
            let at = self.rng.random_range(from..data.len());
            data[at] = self.rng.random();
        }
    }

    /// Cut `data` at a random length
    pub fn truncate(&mut self, data: &mut Vec<u8>) {
        let len = self.rng.random_range(0..data.len().max(1));
        data.truncate(len);
    }
}

fn sample_hive() -> Hive {
    let mut hive = Hive::new("ROOT");
    for i in 0..40 {
        let key = hive
            .root_mut()
            .create_path(&format!(r"Software\Vendor{}\Product\Settings", i % 7))
            .unwrap();
        key.set_value(&format!("Value{}", i), RegValue::dword(i));
        key.set_value(&format!("Name{}", i), RegValue::sz(&format!("entry number {}", i)));
        key.set_value(&format!("Blob{}", i), RegValue::binary(vec![i as u8; 64 + i as usize * 10]));
    }
    hive
}

#[test]
fn test_damaged_hives_never_panic() {
    let clean = sample_hive().to_bytes().unwrap();
    let mut chaos = ChaosEngine::new(0xC0FFEE);
    let mut parsed = 0;
    let mut rejected = 0;

    for round in 0..200 {
        let mut data = clean.clone();
        if round % 5 == 0 {
            chaos.truncate(&mut data);
        } else {
            // Skip the base block so most rounds exercise the cell walker.
            chaos.flip_bytes(&mut data, 4096, 1 + round % 16);
        }
        match Hive::parse(&data) {
            Ok(hive) => {
                parsed += 1;
                let comparison = HiveComparator::new().compare(Some(hive.root()), None).unwrap();
                if hive.is_incomplete() {
                    assert!(!comparison.is_complete());
                }
            }
            Err(e) => {
                rejected += 1;
                warn!("Round {} rejected: {}", round, e);
            }
        }
        // Containers never fail to read
        let _ = RegDiff::deserialize(&data);
    }
    info!("Parsed {} damaged hives, rejected {}", parsed, rejected);
    assert_eq!(parsed + rejected, 200);
}

#[test]
fn test_concurrent_hive_comparisons_agree() {
    let base = sample_hive();
    let mut target = base.clone();
    target
        .root_mut()
        .create_path(r"Software\Vendor3\Product\Settings")
        .unwrap()
        .set_value("Value3", RegValue::dword(999));
    let base = Arc::new(base.into_root());
    let target = Arc::new(target.into_root());

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let base = base.clone();
            let target = target.clone();
            std::thread::spawn(move || {
                let comparator = HiveComparator::new().with_parallel_workers(1 + i % 4);
                let comparison = comparator.compare(Some(&base), Some(&target)).unwrap();
                comparison.changed().map(|e| e.key()).collect::<Vec<_>>()
            })
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    for result in &results {
        assert_eq!(result, &vec![r"Software\Vendor3\Product\Settings::Value3".to_string()]);
    }
}

#[test]
fn test_unparseable_target_hive_is_copied_and_reported() {
    let fixture = DiskFixture::new();
    let base = fixture.create_image("base.vhd", DiskFormat::Vhd, 1);
    fixture.with_volume(&base, 0, seed_windows);
    let target = fixture.copy_image(&base, "target.vhd");
    fixture.with_volume(&target, 0, |volume| {
        fs::write_all(volume, SOFTWARE, b"regf but not really a hive at all").unwrap();
    });
    let output = fixture.path("diff.vhd");

    let report = full_compare().create_diff(&base, &target, &output).unwrap();
    let part = &report.partitions[0];
    assert!(!report.is_complete());
    assert_eq!(part.failures.len(), 1);
    assert_eq!(part.failures[0].path, SOFTWARE);
    assert!(part.system_hives.is_empty());
    assert_eq!(
        fixture.read(&output, 0, &format!("FILES/{}", SOFTWARE)).unwrap(),
        b"regf but not really a hive at all"
    );
}

#[test]
fn test_corrupt_container_applies_as_empty() {
    let fixture = DiskFixture::new();
    let (base, target) = base_and_target(&fixture, DiskFormat::Vhd);
    let output = fixture.path("diff.vhd");
    let vhdiff = full_compare();
    vhdiff.create_diff(&base, &target, &output).unwrap();

    let container = format!("REGISTRY/SYSTEM/{}", SOFTWARE);
    let mut chaos = ChaosEngine::new(17);
    fixture.with_volume(&output, 0, |volume| {
        let mut bytes = fs::read_to_vec(volume, &container).unwrap();
        chaos.flip_bytes(&mut bytes, 0, 64);
        bytes.truncate(100);
        fs::write_all(volume, &container, &bytes).unwrap();
    });

    let patched = fixture.path("patched.vhd");
    let report = vhdiff
        .apply_diff(&output, &base, ApplyMode::CopyTo(patched.clone()))
        .unwrap();
    // Files and the intact user container still go through
    assert_eq!(report.files_written(), 2);
    assert_eq!(report.values_written(), 1);
    assert!(report.partitions[0].system_hives.is_empty());
    let software = fixture.hive(&patched, 0, SOFTWARE);
    assert!(software.root().open_path(r"Vendor\App").is_none());
    let alice = fixture.hive(&patched, 0, ALICE);
    assert_eq!(
        alice.root().open_path(r"Software\App").unwrap().value("FirstRun"),
        Some(&RegValue::dword(0))
    );
}

#[test]
fn test_unparseable_base_hive_fails_only_that_hive() {
    let fixture = DiskFixture::new();
    let (base, target) = base_and_target(&fixture, DiskFormat::Vhd);
    let output = fixture.path("diff.vhd");
    let vhdiff = full_compare();
    vhdiff.create_diff(&base, &target, &output).unwrap();

    let broken = fixture.copy_image(&base, "broken.vhd");
    fixture.with_volume(&broken, 0, |volume| {
        fs::write_all(volume, SOFTWARE, &[0xAB; 8192]).unwrap();
    });
    let report = vhdiff.apply_diff(&output, &broken, ApplyMode::InPlace).unwrap();
    assert!(!report.is_complete());
    let part = &report.partitions[0];
    assert!(part.failures.iter().any(|f| f.path == SOFTWARE));
    assert_eq!(part.users_applied, vec!["alice".to_string()]);
    assert_eq!(part.files_written, 2);
    // The damaged hive is left as it was
    assert_eq!(fixture.read(&broken, 0, SOFTWARE).unwrap(), vec![0xAB; 8192]);
}

#[test]
fn test_damaged_images_are_rejected() {
    let fixture = DiskFixture::new();
    let image = fixture.create_image("disk.vhd", DiskFormat::Vhd, 1);
    let mut chaos = ChaosEngine::new(99);

    for round in 0..10 {
        let mut bytes = std::fs::read(&image).unwrap();
        chaos.truncate(&mut bytes);
        let path = fixture.path(&format!("cut{}.vhd", round));
        std::fs::write(&path, &bytes).unwrap();
        // Whatever the cut, opening and walking either works or errors.
        if let Ok(disk) = fixture.backends.open_disk(&path, false) {
            for index in 0..disk.partitions().len() {
                if let Ok(volume) = fixture.backends.open_filesystem(&disk, index, false) {
                    let _ = volume.list_dir("");
                }
            }
        }
    }

    let empty = fixture.path("empty.vhd");
    std::fs::write(&empty, b"").unwrap();
    let vhdiff = Vhdiff::new().unwrap();
    assert!(vhdiff.create_diff(&empty, &image, &fixture.path("out.vhd")).is_err());
    assert!(!fixture.path("out.vhd").exists());
}

#[test]
fn test_apply_with_invalid_key_names() {
    let mut diff = RegDiff::new();
    diff.insert(r"Good\Key", "ok", RegValue::dword(1));
    diff.insert("Bad\u{1}Key", "nope", RegValue::dword(2));
    diff.insert(&"x".repeat(300), "long", RegValue::dword(3));

    let mut root = RegistryKey::new("ROOT");
    let outcome = diff.apply_to(&mut root);
    assert_eq!(outcome.applied, 1);
    assert_eq!(outcome.failures.len(), 2);
    assert_eq!(root.open_path(r"Good\Key").unwrap().value("ok"), Some(&RegValue::dword(1)));
}
