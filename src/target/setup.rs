//! Target preparation
//!
//! Creates and pre-fills target files ahead of the run and probes the
//! backing block device of every target for the report. Runs entirely on the
//! controller thread, before any worker exists.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Seek, SeekFrom, Write};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};

use anyhow::Context;
use tracing::{debug, info};

use crate::sysinfo;
use crate::target::Target;
use crate::util::buffer::FillPolicy;
use crate::Result;

const FILL_CHUNK: usize = 64 * 1024 * 1024;

/// Create and fill any targets marked for creation, then attach device
/// metadata to all of them.
pub fn prepare_targets(targets: &mut [Target]) -> Result<()> {
    for target in targets.iter_mut() {
        if target.create_file {
            layout_file(target)
                .with_context(|| format!("laying out target {}", target.path.display()))?;
        }
        probe_device(target)
            .with_context(|| format!("probing device of {}", target.path.display()))?;
    }
    Ok(())
}

/// Write a fresh target file: exactly `max_size` bytes, zeros or the
/// repeating ascending pattern depending on the buffer policy.
fn layout_file(target: &Target) -> Result<()> {
    info!(path = %target.path.display(), size = target.max_size, "laying out target file");

    match fs::remove_file(&target.path) {
        Ok(()) => debug!(path = %target.path.display(), "removed stale target file"),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e).context("removing stale target file"),
    }

    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o664)
        .custom_flags(libc::O_SYNC)
        .open(&target.path)
        .context("creating target file")?;

    file.seek(SeekFrom::Start(target.base_offset))?;

    let mut remaining = (target.max_size - target.base_offset) as usize;
    let chunk_size = remaining.min(FILL_CHUNK);
    let chunk: Vec<u8> = if matches!(target.fill, FillPolicy::Zero) {
        vec![0u8; chunk_size]
    } else {
        (0..chunk_size).map(|i| (i % 256) as u8).collect()
    };

    while remaining > 0 {
        let n = remaining.min(chunk.len());
        file.write_all(&chunk[..n]).context("filling target file")?;
        remaining -= n;
    }

    Ok(())
}

/// Record the backing block device and its scheduler. Both come up empty on
/// filesystems with no resolvable device; the report prints them as-is.
fn probe_device(target: &mut Target) -> Result<()> {
    let meta = fs::metadata(&target.path).context("stat on target")?;
    let dev = if meta.rdev() != 0 { meta.rdev() } else { meta.dev() };
    target.device = sysinfo::device_name(dev);
    target.scheduler = sysinfo::device_scheduler(&target.device);
    debug!(
        path = %target.path.display(),
        device = %target.device,
        scheduler = %target.scheduler,
        "probed target device"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn target_for(path: &std::path::Path, size: u64) -> Target {
        let mut t = Target::new(path);
        t.create_file = true;
        t.size = size;
        t.max_size = size;
        t
    }

    #[test]
    fn test_layout_creates_exact_size_with_pattern() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.dat");
        let mut targets = [target_for(&path, 128 * 1024)];

        prepare_targets(&mut targets).unwrap();

        let data = fs::read(&path).unwrap();
        assert_eq!(data.len(), 128 * 1024);
        for (i, &b) in data.iter().enumerate() {
            assert_eq!(b, (i % 256) as u8);
        }
    }

    #[test]
    fn test_layout_zero_fill() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("z.dat");
        let mut t = target_for(&path, 64 * 1024);
        t.fill = FillPolicy::Zero;
        let mut targets = [t];

        prepare_targets(&mut targets).unwrap();

        let data = fs::read(&path).unwrap();
        assert_eq!(data.len(), 64 * 1024);
        assert!(data.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_layout_replaces_existing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("old.dat");
        fs::write(&path, vec![0xFFu8; 4096]).unwrap();

        let mut targets = [target_for(&path, 8 * 1024)];
        prepare_targets(&mut targets).unwrap();

        let data = fs::read(&path).unwrap();
        assert_eq!(data.len(), 8 * 1024);
        assert_eq!(data[0], 0);
        assert_eq!(data[255], 255);
    }

    #[test]
    fn test_existing_target_is_probed_not_recreated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("keep.dat");
        fs::write(&path, vec![0xABu8; 4096]).unwrap();

        let mut t = Target::new(&path);
        t.create_file = false;
        t.size = 4096;
        t.max_size = 4096;
        let mut targets = [t];
        prepare_targets(&mut targets).unwrap();

        let data = fs::read(&path).unwrap();
        assert!(data.iter().all(|&b| b == 0xAB));
    }
}
