//! Result directory management
//!
//! Layout of the results root: one `worker-<id>` partition per worker plus
//! whatever the external runner writes at the top level.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::Result;

/// Prefix of per-worker partitions
pub const WORKER_DIR_PREFIX: &str = "worker-";

/// Artifact extensions copied by [`merge_into`]
const MERGED_EXTENSIONS: &[&str] = &["json", "txt", "xml"];

/// Partition owned by one worker id
pub fn worker_dir(root: &Path, worker_id: usize) -> PathBuf {
    root.join(format!("{WORKER_DIR_PREFIX}{worker_id}"))
}

/// Resolve against the current directory so children started elsewhere
/// still write to the same place
pub fn absolutize(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(e) => {
            warn!("Cannot resolve current directory: {}", e);
            path.to_path_buf()
        }
    }
}

/// Delete the results root and recreate it empty
pub fn purge(root: &Path) -> Result<()> {
    if root.exists() {
        debug!("Removing stale results in {}", root.display());
        fs::remove_dir_all(root)?;
    }
    fs::create_dir_all(root)?;
    Ok(())
}

/// Purge the root and create partitions `worker-0..worker-{workers-1}`
pub fn prepare_partitions(root: &Path, workers: usize) -> Result<Vec<PathBuf>> {
    purge(root)?;
    let mut partitions = Vec::with_capacity(workers);
    for worker_id in 0..workers {
        let dir = worker_dir(root, worker_id);
        fs::create_dir_all(&dir)?;
        partitions.push(dir);
    }
    info!(
        "Prepared {} worker partition(s) under {}",
        workers,
        root.display()
    );
    Ok(partitions)
}

/// Outcome of [`merge_into`]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub copied: usize,
    pub renamed: usize,
    pub partitions: usize,
}

/// Copy artifacts from every worker partition into `dest`.
///
/// Name clashes get the partition name as prefix.
pub fn merge_into(root: &Path, dest: &Path) -> Result<MergeReport> {
    fs::create_dir_all(dest)?;
    let mut report = MergeReport::default();

    for partition in partitions(root)? {
        report.partitions += 1;
        let prefix = partition
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        for entry in WalkDir::new(&partition)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            let path = entry.path();
            let wanted = path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| MERGED_EXTENSIONS.contains(&ext))
                .unwrap_or(false);
            if !wanted {
                continue;
            }

            let name = entry.file_name().to_string_lossy().into_owned();
            let mut target = dest.join(&name);
            if target.exists() {
                target = dest.join(format!("{prefix}-{name}"));
                report.renamed += 1;
            }
            fs::copy(path, &target)?;
            report.copied += 1;
        }
    }

    info!(
        "Merged {} artifact(s) from {} partition(s) into {}",
        report.copied,
        report.partitions,
        dest.display()
    );
    Ok(report)
}

/// Remove zero-byte files below `root`, returning how many were removed
pub fn prune_empty(root: &Path) -> Result<usize> {
    if !root.exists() {
        return Ok(0);
    }

    let empty: Vec<PathBuf> = WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.metadata().map(|m| m.len() == 0).unwrap_or(false))
        .map(|e| e.into_path())
        .collect();

    for path in &empty {
        debug!("Pruning empty artifact {}", path.display());
        fs::remove_file(path)?;
    }
    Ok(empty.len())
}

/// Worker partitions present under `root`, sorted by name
pub fn partitions(root: &Path) -> Result<Vec<PathBuf>> {
    if !root.exists() {
        return Ok(Vec::new());
    }

    let mut dirs: Vec<PathBuf> = fs::read_dir(root)?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .filter(|e| {
            e.file_name()
                .to_string_lossy()
                .starts_with(WORKER_DIR_PREFIX)
        })
        .map(|e| e.path())
        .collect();
    dirs.sort();
    Ok(dirs)
}
