//! Creating and applying disk diffs
//!
//! [`Vhdiff`] is the entry point for whole-image work. It owns the backend
//! registry, the thread pool and the configured comparison style, and runs
//! the two top-level operations:
//!
//! - [`Vhdiff::create_diff`] compares a base image with a target image and
//!   writes a new image holding only what the target adds or changes
//! - [`Vhdiff::apply_diff`] replays such an image onto a base
//!
//! Every precondition is checked before the output is touched. After that,
//! per-file and per-value failures are collected into the returned report
//! instead of aborting the run.

use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::backend::BackendRegistry;
use crate::copy_queue::CopyQueue;
use crate::disk::mbr::{output_partition_type, ALIGNMENT_SECTORS};
use crate::disk::{DiskFormat, DiskImage, MIN_OUTPUT_BLOCK_SIZE, SECTOR_SIZE};
use crate::error::{Result, VhdiffError};
use crate::fs::{self, FileSystem, FileSystemKind, SharedFileSystem};
use crate::layout::{self, HiveClass, HiveLayout, FILES_DIR, SYSTEM_DIR, USERS_DIR};
use crate::registry::{Hive, HiveComparator, HiveComparison, RegDiff};
use crate::tree::{ExcludeSet, TreeComparator, TreeComparison};
use crate::types::{
    ApplyMode, ApplyReport, ComparisonStyle, CopyReport, CreateReport, FailedEntry, PartitionApplyReport,
    PartitionDiffReport, ProgressCallback, ProgressInfo, Side, TreeEntry, VhdiffConfig,
};

/// Queued copies that trigger an opportunistic drain during a walk
const DRAIN_BATCH: usize = 64;

/// Root key name given to hives created on the base during apply
const NEW_HIVE_ROOT: &str = "ROOT";

/// Sectors of slack reserved at the start of a created image
const HEADER_SECTORS: u64 = 64;

/// Which partitions of the two inputs are diffed against each other
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PartitionSelection {
    /// Pair partitions by index; both disks must have the same count
    #[default]
    All,
    /// Diff one explicit pair `(base index, target index)`
    Pair(usize, usize),
}

impl From<usize> for PartitionSelection {
    fn from(index: usize) -> Self {
        PartitionSelection::Pair(index, index)
    }
}

impl From<(usize, usize)> for PartitionSelection {
    fn from((left, right): (usize, usize)) -> Self {
        PartitionSelection::Pair(left, right)
    }
}

/// A changed hive found during a tree walk
#[derive(Debug, Clone)]
struct HiveCandidate {
    path: String,
    class: HiveClass,
    in_base: bool,
}

/// One validated partition pair of a create run
#[derive(Debug, Clone, Copy)]
struct PairPlan {
    left: usize,
    right: usize,
    output_type: u8,
    size: u64,
}

/// Creates and applies disk diffs
///
/// Build one with [`VhdiffBuilder`].
///
/// # Examples
///
/// ```rust,no_run
/// use vhdiff::{VhdiffBuilder, ComparisonStyle};
/// use vhdiff::types::ApplyMode;
/// use std::path::Path;
///
/// # fn main() -> vhdiff::Result<()> {
/// let vhdiff = VhdiffBuilder::new()
///     .style(ComparisonStyle::Full)
///     .parallel_workers(4)
///     .build()?;
///
/// let report = vhdiff.create_diff(Path::new("base.vhd"), Path::new("target.vhd"), Path::new("diff.vhd"))?;
/// println!("{} files, {} hives", report.files_copied(), report.hives_diffed());
///
/// vhdiff.apply_diff(Path::new("diff.vhd"), Path::new("base.vhd"), ApplyMode::CopyTo("patched.vhd".into()))?;
/// # Ok(())
/// # }
/// ```
pub struct Vhdiff {
    config: VhdiffConfig,
    backends: BackendRegistry,
    excludes: ExcludeSet,
    layout: HiveLayout,
    pool: rayon::ThreadPool,
    progress: Option<ProgressCallback>,
}

impl std::fmt::Debug for Vhdiff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vhdiff")
            .field("config", &self.config)
            .field("excludes", &self.excludes)
            .finish()
    }
}

impl Vhdiff {
    /// Instance with the default configuration and built-in backends
    pub fn new() -> Result<Self> {
        VhdiffBuilder::new().build()
    }

    /// Active configuration
    pub fn config(&self) -> &VhdiffConfig {
        &self.config
    }

    /// Registered disk and filesystem backends
    pub fn backends(&self) -> &BackendRegistry {
        &self.backends
    }

    fn tree_comparator(&self) -> TreeComparator {
        let comparator = TreeComparator::new(self.config.style)
            .with_excludes(self.excludes.clone())
            .with_parallel_workers(self.config.parallel_workers);
        match &self.progress {
            Some(progress) => comparator.with_progress(progress.clone()),
            None => comparator,
        }
    }

    fn report_progress(&self, operation: &str, item: Option<String>, processed: usize, total: Option<usize>) {
        if let Some(progress) = &self.progress {
            progress(ProgressInfo {
                operation: operation.to_string(),
                current_item: item,
                processed,
                total,
            });
        }
    }

    /// Compare two mounted trees on this instance's pool
    pub fn compare_trees(&self, left: &SharedFileSystem, right: &SharedFileSystem) -> Result<TreeComparison> {
        let comparator = self.tree_comparator();
        self.pool.install(|| comparator.compare_with(left, right, |_| {}))
    }

    /// Compare two hives on this instance's pool
    pub fn compare_hives(&self, left: &Hive, right: &Hive) -> HiveComparison {
        let comparator = HiveComparator::new().with_parallel_workers(self.config.parallel_workers);
        self.pool
            .install(|| comparator.compare_in_current_pool(Some(left.root()), Some(right.root())))
    }

    /// Diff every partition of `base` against `target` into a new image at `output`
    pub fn create_diff(&self, base: &Path, target: &Path, output: &Path) -> Result<CreateReport> {
        self.create_diff_with(base, target, output, PartitionSelection::All)
    }

    /// Diff the selected partitions of `base` against `target` into `output`
    ///
    /// The output gets one FAT-formatted partition per diffed pair, sized to
    /// the larger of the two inputs. Inside it, changed files land under
    /// `FILES/`, and changed hives are stored as registry diff containers
    /// under `REGISTRY/` instead of being copied whole.
    ///
    /// FAT caps a file at 4 GiB minus one byte, so a changed file larger than
    /// that cannot be stored in the output. It is recorded as a failed entry
    /// of its partition report and the rest of the diff is still written.
    ///
    /// # Errors
    ///
    /// Fails before writing anything when the output exists (unless `force`),
    /// the output resolves to one of the inputs, an input is missing or
    /// unpartitioned, the partition counts differ without an explicit pair,
    /// or a pair has different filesystem types.
    #[instrument(skip(self, selection), fields(style = %self.config.style))]
    pub fn create_diff_with(
        &self,
        base: &Path,
        target: &Path,
        output: &Path,
        selection: PartitionSelection,
    ) -> Result<CreateReport> {
        let start = Instant::now();
        info!("Creating diff of {:?} against {:?}", target, base);

        if output.exists() && !self.config.force {
            return Err(VhdiffError::OutputExists(output.to_path_buf()));
        }
        if same_path(output, base) || same_path(output, target) {
            return Err(VhdiffError::InvalidConfiguration(format!(
                "output {:?} would overwrite an input",
                output
            )));
        }
        let left = self.backends.open_disk(base, false)?;
        let right = self.backends.open_disk(target, false)?;
        for image in [&left, &right] {
            if !image.is_partitioned() {
                return Err(VhdiffError::NotPartitioned(image.path().to_path_buf()));
            }
        }
        let plans = self.plan_pairs(&left, &right, selection)?;

        if output.exists() {
            warn!("Overwriting existing output {:?}", output);
            std::fs::remove_file(output)?;
        }
        let mut image = self.allocate_output(&left, &right, &plans, output)?;
        let mut outputs = Vec::with_capacity(plans.len());
        for plan in &plans {
            let index = image.create_partition(plan.output_type, plan.size)?;
            self.backends.format_filesystem(&image, index, FileSystemKind::Fat)?;
            outputs.push(index);
        }

        let mut partitions = Vec::with_capacity(plans.len());
        for (plan, output_index) in plans.iter().zip(outputs) {
            let report = self.diff_partition(&left, &right, &image, *plan, output_index)?;
            partitions.push(report);
        }
        image.flush()?;
        drop(image);

        let report = CreateReport {
            output: output.to_path_buf(),
            partitions,
            duration_ms: start.elapsed().as_millis() as u64,
        };
        info!(
            "Created diff {:?}: {} files, {} hives in {:?}",
            output,
            report.files_copied(),
            report.hives_diffed(),
            start.elapsed()
        );
        Ok(report)
    }

    fn plan_pairs(&self, left: &DiskImage, right: &DiskImage, selection: PartitionSelection) -> Result<Vec<PairPlan>> {
        let pairs: Vec<(usize, usize)> = match selection {
            PartitionSelection::All => {
                let (l, r) = (left.partitions().len(), right.partitions().len());
                if l != r {
                    return Err(VhdiffError::PartitionCountMismatch { left: l, right: r });
                }
                (0..l).map(|i| (i, i)).collect()
            }
            PartitionSelection::Pair(l, r) => vec![(l, r)],
        };

        let left_bps = left.geometry().bytes_per_sector as u64;
        let right_bps = right.geometry().bytes_per_sector as u64;
        let mut plans = Vec::with_capacity(pairs.len());
        for (l, r) in pairs {
            let lp = left.partition(l)?;
            let rp = right.partition(r)?;
            let mismatch = || VhdiffError::FilesystemMismatch {
                left_index: l,
                right_index: r,
                left_type: lp.bios_type,
                right_type: rp.bios_type,
            };
            let output_type = output_partition_type(rp.bios_type)?;
            // An explicit pair vouches for the type tags; only the detected filesystems must agree.
            if selection == PartitionSelection::All && output_partition_type(lp.bios_type)? != output_type {
                return Err(mismatch());
            }
            if self.backends.detect_filesystem(left, l)? != self.backends.detect_filesystem(right, r)? {
                return Err(mismatch());
            }
            let size = lp.len(left_bps).max(rp.len(right_bps));
            plans.push(PairPlan { left: l, right: r, output_type, size });
        }
        Ok(plans)
    }

    fn allocate_output(&self, left: &DiskImage, right: &DiskImage, plans: &[PairPlan], output: &Path) -> Result<DiskImage> {
        let left_geometry = left.geometry();
        let right_geometry = right.geometry();
        let bps = left_geometry.bytes_per_sector.max(right_geometry.bytes_per_sector) as u64;
        let alignment = ALIGNMENT_SECTORS * SECTOR_SIZE as u64;
        let capacity = HEADER_SECTORS * bps
            + plans
                .iter()
                .map(|p| alignment + p.size.div_ceil(SECTOR_SIZE as u64) * SECTOR_SIZE as u64)
                .sum::<u64>();
        let block_size = self
            .config
            .block_size
            .unwrap_or_else(|| right_geometry.block_size.max(MIN_OUTPUT_BLOCK_SIZE));
        let format = self.config.output_format;
        debug!("Allocating {} output of {} bytes, block size {}", format, capacity, block_size);

        let mut image = self.backends.create_disk(output, format, capacity, block_size)?;
        image.initialize_partition_table()?;
        Ok(image)
    }

    #[instrument(skip(self, left, right, image, plan), fields(left = plan.left, right = plan.right))]
    fn diff_partition(
        &self,
        left: &DiskImage,
        right: &DiskImage,
        image: &DiskImage,
        plan: PairPlan,
        output_index: usize,
    ) -> Result<PartitionDiffReport> {
        let left_fs = self.backends.open_filesystem(left, plan.left, false)?;
        let right_fs = self.backends.open_filesystem(right, plan.right, false)?;
        let output_fs = self.backends.open_filesystem(image, output_index, true)?;
        info!("Diffing partition {} ({}) against {}", plan.right, right_fs.kind(), plan.left);

        let mut report = PartitionDiffReport {
            left_index: plan.left,
            right_index: plan.right,
            output_index,
            filesystem: right_fs.kind().to_string(),
            ..Default::default()
        };

        let queue = CopyQueue::new(output_fs.clone());
        let copied = Mutex::new(CopyReport::default());
        let hives = Mutex::new(Vec::new());
        let suppressed = AtomicUsize::new(0);

        let comparator = self.tree_comparator();
        let visit = |entry: &TreeEntry| {
            if !entry.condition.is_surfaced() {
                return;
            }
            if let Some(class) = self.layout.classify(&entry.path) {
                hives.lock().push(HiveCandidate {
                    path: entry.path.clone(),
                    class,
                    in_base: entry.left.is_some(),
                });
            } else if self.layout.is_config_companion(&entry.path) {
                suppressed.fetch_add(1, Ordering::Relaxed);
            } else {
                queue.enqueue(right_fs.clone(), entry.path.clone(), layout::files_path(&entry.path));
                if queue.pending() >= DRAIN_BATCH {
                    if let Some(drained) = queue.try_drain() {
                        copied.lock().merge(drained);
                    }
                }
            }
        };
        let comparison = self
            .pool
            .install(|| comparator.compare_with(&left_fs, &right_fs, visit))?;
        copied.lock().merge(queue.drain());

        report.counts = comparison.counts;
        report.failures = comparison.failures;
        report.suppressed = suppressed.into_inner();

        let mut hives = hives.into_inner();
        hives.sort_by(|a, b| a.path.cmp(&b.path));
        for (done, candidate) in hives.iter().enumerate() {
            self.report_progress("Diffing registry", Some(candidate.path.clone()), done, Some(hives.len()));
            self.diff_hive(candidate, &left_fs, &right_fs, &output_fs, &queue, &mut report)?;
        }
        // Hives that could not be diffed were queued as plain files.
        copied.lock().merge(queue.drain());

        let copied = copied.into_inner();
        report.files_copied = copied.files_copied;
        report.bytes_copied = copied.bytes_copied;
        report.failures.extend(copied.failures);

        drop(queue);
        output_fs.flush()?;
        drop(output_fs);
        debug!(
            "Partition {}: {} files, {} system hives, {} user hives, {} failures",
            plan.right,
            report.files_copied,
            report.system_hives.len(),
            report.user_hives.len(),
            report.failures.len()
        );
        Ok(report)
    }

    fn diff_hive(
        &self,
        candidate: &HiveCandidate,
        left_fs: &SharedFileSystem,
        right_fs: &SharedFileSystem,
        output_fs: &SharedFileSystem,
        queue: &CopyQueue,
        report: &mut PartitionDiffReport,
    ) -> Result<()> {
        let path = &candidate.path;
        let base_path = if candidate.in_base {
            fs::resolve_case(left_fs.as_ref(), path)?
        } else {
            None
        };
        let Some(base_path) = base_path else {
            debug!("Hive {} is new, copying it whole", path);
            queue.enqueue(right_fs.clone(), path.clone(), layout::files_path(path));
            return Ok(());
        };

        let loaded = Hive::load(left_fs.as_ref(), &base_path)
            .and_then(|l| Hive::load(right_fs.as_ref(), path).map(|r| (l, r)));
        let (base_hive, target_hive) = match loaded {
            Ok(pair) => pair,
            Err(e) => {
                warn!("Cannot parse hive {}, copying it whole: {}", path, e);
                report.failures.push(FailedEntry::new(path.clone(), &e));
                queue.enqueue(right_fs.clone(), path.clone(), layout::files_path(path));
                return Ok(());
            }
        };

        let comparison = self.compare_hives(&base_hive, &target_hive);
        if !comparison.is_complete() {
            warn!("Hive {} was only partly readable: {:?}", path, comparison.incomplete_paths);
            report.incomplete_hives.push(path.clone());
        }
        let diff = RegDiff::from_comparison(&comparison, Side::Right);
        if diff.is_empty() {
            debug!("Hive {} changed on disk but holds no new values", path);
            report.unchanged_hives.push(path.clone());
            return Ok(());
        }

        let container = match &candidate.class {
            HiveClass::System => layout::system_container_path(path),
            HiveClass::User(user) => layout::user_container_path(user, path),
        };
        let written = diff
            .serialize()
            .and_then(|bytes| fs::write_all(output_fs.as_ref(), &container, &bytes));
        match written {
            Ok(bytes) => {
                debug!("Stored {} values of {} in {} ({} bytes)", diff.len(), path, container, bytes);
                match &candidate.class {
                    HiveClass::System => report.system_hives.push(path.clone()),
                    HiveClass::User(user) => report.user_hives.push(user.clone()),
                }
            }
            Err(e) => {
                warn!("Cannot write registry diff {}: {}", container, e);
                report.failures.push(FailedEntry::new(container, &e));
            }
        }
        Ok(())
    }

    /// Replay the diff image at `diff` onto `base`
    ///
    /// Files under `FILES/` overwrite their counterparts; registry containers
    /// are merged into the matching hives, creating system hives that do not
    /// exist yet. User containers whose profile is missing on the base are
    /// skipped. Applying the same diff twice leaves the same result.
    ///
    /// # Arguments
    ///
    /// * `diff` - Image produced by [`create_diff`](Self::create_diff)
    /// * `base` - Image the diff was created against
    /// * `mode` - Modify `base` itself, a copy of it, or a differencing child
    ///
    /// # Errors
    ///
    /// Fails before writing when an image is missing or unpartitioned, or the
    /// partition counts differ. A base partition that cannot be mounted for
    /// writing (an NTFS volume, for instance) does not stop the others: its
    /// report carries the error, unless the diff has nothing for it.
    #[instrument(skip(self, mode))]
    pub fn apply_diff(&self, diff: &Path, base: &Path, mode: ApplyMode) -> Result<ApplyReport> {
        let start = Instant::now();
        info!("Applying {:?} to {:?}", diff, base);

        let diff_image = self.backends.open_disk(diff, false)?;
        if !diff_image.is_partitioned() {
            return Err(VhdiffError::NotPartitioned(diff.to_path_buf()));
        }
        if !base.is_file() {
            return Err(VhdiffError::InputNotFound(base.to_path_buf()));
        }
        let target = self.prepare_apply_target(base, &mode)?;
        let target_image = self.backends.open_disk(&target, true)?;
        if !target_image.is_partitioned() {
            return Err(VhdiffError::NotPartitioned(target.clone()));
        }
        let (d, b) = (diff_image.partitions().len(), target_image.partitions().len());
        if d != b {
            return Err(VhdiffError::PartitionCountMismatch { left: b, right: d });
        }

        let mut volumes = Vec::with_capacity(d);
        for index in 0..d {
            let source = self.backends.open_filesystem(&diff_image, index, false)?;
            let dest = self
                .backends
                .open_filesystem(&target_image, index, true)
                .and_then(|dest| fs::ensure_writable(dest.as_ref()).map(|()| dest));
            volumes.push((source, dest));
        }

        let mut partitions = Vec::with_capacity(d);
        for (index, (source, dest)) in volumes.into_iter().enumerate() {
            let dest = match dest {
                Ok(dest) => dest,
                Err(e) => {
                    partitions.push(unwritable_partition(index, source.as_ref(), &e)?);
                    continue;
                }
            };
            let report = self.apply_partition(index, &source, &dest)?;
            dest.flush()?;
            drop(dest);
            partitions.push(report);
        }
        target_image.flush()?;

        let report = ApplyReport {
            target,
            partitions,
            duration_ms: start.elapsed().as_millis() as u64,
        };
        info!(
            "Applied {:?}: {} files, {} values in {:?}",
            diff,
            report.files_written(),
            report.values_written(),
            start.elapsed()
        );
        Ok(report)
    }

    fn prepare_apply_target(&self, base: &Path, mode: &ApplyMode) -> Result<PathBuf> {
        let target = mode.target(base).to_path_buf();
        if same_path(&target, base) {
            if !matches!(mode, ApplyMode::InPlace) {
                return Err(VhdiffError::InvalidConfiguration(format!(
                    "apply target {:?} is the base image",
                    target
                )));
            }
            return Ok(target);
        }
        if target.exists() {
            if !self.config.force {
                return Err(VhdiffError::OutputExists(target));
            }
            std::fs::remove_file(&target)?;
        }
        match mode {
            ApplyMode::InPlace => {}
            ApplyMode::CopyTo(path) => {
                let bytes = std::fs::copy(base, path)?;
                debug!("Copied base to {:?} ({} bytes)", path, bytes);
            }
            ApplyMode::DifferencingChild(path) => {
                let child = self.backends.create_differencing(path, base)?;
                child.flush()?;
                debug!("Created differencing child {:?}", path);
            }
        }
        Ok(target)
    }

    #[instrument(skip(self, source, dest))]
    fn apply_partition(&self, index: usize, source: &SharedFileSystem, dest: &SharedFileSystem) -> Result<PartitionApplyReport> {
        let mut report = PartitionApplyReport { index, ..Default::default() };

        if let Some(files_dir) = fs::resolve_case(source.as_ref(), FILES_DIR)? {
            let files = layout::list_files(source.as_ref(), &files_dir)?;
            let queue = CopyQueue::new(dest.clone());
            for (done, rel) in files.iter().enumerate() {
                self.report_progress("Applying files", Some(rel.clone()), done, Some(files.len()));
                let dest_path = fs::resolve_case(dest.as_ref(), rel)?.unwrap_or_else(|| rel.clone());
                queue.enqueue(source.clone(), fs::join(&files_dir, rel), dest_path);
            }
            let copied = queue.drain();
            report.files_written = copied.files_copied;
            report.bytes_written = copied.bytes_copied;
            report.failures.extend(copied.failures);
        }

        if let Some(system_dir) = fs::resolve_case(source.as_ref(), SYSTEM_DIR)? {
            for rel in layout::list_files(source.as_ref(), &system_dir)? {
                let container = fs::join(&system_dir, &rel);
                let existing = fs::resolve_case(dest.as_ref(), &rel)?;
                let hive_path = existing.as_deref().unwrap_or(&rel);
                if self.apply_container(source, &container, dest, hive_path, existing.is_some(), &mut report) {
                    report.system_hives.push(rel);
                }
            }
        }

        if let Some(users_dir) = fs::resolve_case(source.as_ref(), USERS_DIR)? {
            let base_users = layout::user_hives(dest.as_ref())?;
            for user in source.list_dir(&users_dir)?.into_iter().filter(|e| e.stat.is_dir) {
                let Some((_, hive_path)) = base_users
                    .iter()
                    .find(|(name, _)| fs::names_equal(name, &user.name, false))
                else {
                    info!("User {} has no profile on the base, skipping", user.name);
                    report.users_skipped.push(user.name);
                    continue;
                };
                let user_dir = fs::join(&users_dir, &user.name);
                let mut applied = false;
                for container in layout::list_files(source.as_ref(), &user_dir)? {
                    let container = fs::join(&user_dir, &container);
                    applied |= self.apply_container(source, &container, dest, hive_path, true, &mut report);
                }
                if applied {
                    report.users_applied.push(user.name);
                }
            }
        }
        Ok(report)
    }

    /// Merge one container into the hive at `hive_path`; returns whether it was saved
    fn apply_container(
        &self,
        source: &SharedFileSystem,
        container: &str,
        dest: &SharedFileSystem,
        hive_path: &str,
        exists: bool,
        report: &mut PartitionApplyReport,
    ) -> bool {
        let diff = match fs::read_to_vec(source.as_ref(), container) {
            Ok(bytes) => RegDiff::deserialize(&bytes),
            Err(e) => {
                warn!("Cannot read registry diff {}: {}", container, e);
                report.failures.push(FailedEntry::new(container, &e));
                return false;
            }
        };
        if diff.is_empty() {
            debug!("Registry diff {} is empty", container);
            return false;
        }

        let hive = if exists {
            Hive::load(dest.as_ref(), hive_path)
        } else {
            info!("Creating hive {}", hive_path);
            Ok(Hive::new(NEW_HIVE_ROOT))
        };
        let mut hive = match hive {
            Ok(hive) => hive,
            Err(e) => {
                warn!("Cannot load hive {}: {}", hive_path, e);
                report.failures.push(FailedEntry::new(hive_path, &e));
                return false;
            }
        };

        let outcome = diff.apply_to(hive.root_mut());
        report.values_written += outcome.applied;
        report.failures.extend(outcome.failures);
        match hive.save(dest.as_ref(), hive_path) {
            Ok(bytes) => {
                debug!("Saved {} ({} bytes)", hive_path, bytes);
                true
            }
            Err(e) => {
                warn!("Cannot save hive {}: {}", hive_path, e);
                report.failures.push(FailedEntry::new(hive_path, &e));
                false
            }
        }
    }
}

/// Whether two paths name the same file once symlinks and `.`/`..` are resolved
///
/// A path that does not exist yet is resolved through its parent directory.
fn same_path(a: &Path, b: &Path) -> bool {
    fn resolve(path: &Path) -> PathBuf {
        if let Ok(resolved) = path.canonicalize() {
            return resolved;
        }
        let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
            return path.to_path_buf();
        };
        let parent = if parent.as_os_str().is_empty() { Path::new(".") } else { parent };
        parent.canonicalize().map(|p| p.join(name)).unwrap_or_else(|_| path.to_path_buf())
    }
    a == b || resolve(a) == resolve(b)
}

/// Report for a base partition that cannot take writes
///
/// Only an error when the diff partition has something to apply.
fn unwritable_partition(index: usize, source: &dyn FileSystem, cause: &VhdiffError) -> Result<PartitionApplyReport> {
    let mut report = PartitionApplyReport { index, ..Default::default() };
    if source.list_dir("")?.is_empty() {
        debug!("Partition {} is not writable but has nothing to apply: {}", index, cause);
    } else {
        warn!("Partition {} cannot be written: {}", index, cause);
        report.error = Some(cause.to_string());
    }
    Ok(report)
}

/// Builder for [`Vhdiff`]
///
/// # Examples
///
/// ```rust
/// use vhdiff::{VhdiffBuilder, ComparisonStyle};
/// use vhdiff::disk::DiskFormat;
///
/// let vhdiff = VhdiffBuilder::new()
///     .style(ComparisonStyle::BinaryOnly)
///     .exclude_patterns(vec!["/pagefile.sys".to_string(), "*.tmp".to_string()])
///     .output_format(DiskFormat::Raw)
///     .parallel_workers(2)
///     .build()
///     .unwrap();
/// assert_eq!(vhdiff.config().parallel_workers, 2);
/// ```
///
/// # Default Values
///
/// - `style`: `ComparisonStyle::DateTimeOnly`
/// - `exclude_patterns`: page, hibernation and swap files and `System Volume Information`
/// - `parallel_workers`: number of CPU cores
/// - `output_format`: `DiskFormat::Vhd`
/// - `block_size`: the target's block size, at least 512 KiB
/// - `force`: false
pub struct VhdiffBuilder {
    config: VhdiffConfig,
    backends: Option<BackendRegistry>,
    progress: Option<ProgressCallback>,
}

impl Default for VhdiffBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for VhdiffBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VhdiffBuilder").field("config", &self.config).finish()
    }
}

impl VhdiffBuilder {
    /// Builder with default settings
    pub fn new() -> Self {
        Self {
            config: VhdiffConfig::default(),
            backends: None,
            progress: None,
        }
    }

    /// Start from a loaded configuration
    pub fn from_config(config: VhdiffConfig) -> Self {
        Self { config, backends: None, progress: None }
    }

    /// Set the file comparison style
    ///
    /// # Arguments
    ///
    /// * `style` - How files present on both sides are judged equivalent
    pub fn style(mut self, style: ComparisonStyle) -> Self {
        self.config.style = style;
        self
    }

    /// Replace the exclusion patterns
    ///
    /// Patterns are globs matched case-insensitively against paths rooted at
    /// `/`. A pattern without a `/` matches a name at any depth. Excluding a
    /// directory excludes everything below it.
    ///
    /// # Arguments
    ///
    /// * `patterns` - Glob patterns to skip during tree comparison
    pub fn exclude_patterns(mut self, patterns: Vec<String>) -> Self {
        self.config.exclude_patterns = patterns;
        self
    }

    /// Set number of parallel workers (minimum 1)
    pub fn parallel_workers(mut self, count: usize) -> Self {
        self.config.parallel_workers = count.max(1);
        self
    }

    /// Image format of created diffs
    pub fn output_format(mut self, format: DiskFormat) -> Self {
        self.config.output_format = format;
        self
    }

    /// Fixed block size for created dynamic images
    pub fn block_size(mut self, block_size: u32) -> Self {
        self.config.block_size = Some(block_size);
        self
    }

    /// Overwrite existing outputs instead of failing
    pub fn force(mut self, force: bool) -> Self {
        self.config.force = force;
        self
    }

    /// Use a caller-assembled backend registry
    pub fn backends(mut self, backends: BackendRegistry) -> Self {
        self.backends = Some(backends);
        self
    }

    /// Receive progress updates from long-running operations
    ///
    /// The callback is invoked from worker threads.
    pub fn progress_callback(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    /// Validate the configuration and build the instance
    ///
    /// # Errors
    ///
    /// Fails on an invalid configuration, a malformed exclusion pattern or
    /// when the thread pool cannot be created.
    pub fn build(self) -> Result<Vhdiff> {
        self.config.validate()?;
        let excludes = ExcludeSet::new(&self.config.exclude_patterns)?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.parallel_workers)
            .thread_name(|i| format!("vhdiff-worker-{}", i))
            .build()?;
        debug!("Built vhdiff with {} workers", self.config.parallel_workers);
        Ok(Vhdiff {
            config: self.config,
            backends: self.backends.unwrap_or_default(),
            excludes,
            layout: HiveLayout::new()?,
            pool,
            progress: self.progress,
        })
    }
}
