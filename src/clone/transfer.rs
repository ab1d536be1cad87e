//! Snapshot File Transfer
//!
//! Copies a remote snapshot directory into a local staging directory,
//! either one file per request or in bounded batches. The tablet header is
//! always copied last so a half-copied directory never looks loadable.

use std::path::Path;
use std::time::Instant;

use crate::config::CloneConfig;
use crate::error::{Error, Result};
use crate::http::{BatchFileEntry, HttpClient, SnapshotFileEndpoint};
use crate::storage::{fs, DataDir};
use crate::tablet::HEADER_SUFFIX;

/// Most files sent in one batch
pub const BATCH_FILE_NUM: usize = 64;
/// Size at which a batch is closed
pub const BATCH_FILE_SIZE: u64 = 64 << 20;

/// Outcome of one snapshot copy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    pub total_files: usize,
    pub total_bytes: u64,
    pub elapsed_ms: u64,
}

impl TransferStats {
    fn finish(total_files: usize, total_bytes: u64, started: Instant) -> Self {
        Self {
            total_files,
            total_bytes,
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    }

    /// Throughput in MB/s, zero for instant copies
    pub fn rate_mb_per_sec(&self) -> f64 {
        if self.elapsed_ms == 0 {
            return 0.0;
        }
        self.total_bytes as f64 / self.elapsed_ms as f64 / 1000.0
    }
}

/// Swap the first header entry with the last entry
pub fn move_header_last<T, F>(files: &mut [T], name: F)
where
    F: Fn(&T) -> &str,
{
    let len = files.len();
    if len < 2 {
        return;
    }
    if let Some(i) = (0..len - 1).find(|&i| name(&files[i]).ends_with(HEADER_SUFFIX)) {
        files.swap(i, len - 1);
    }
}

/// Split `files` into consecutive batches.
///
/// A batch closes once it holds `max_files` files or at least `max_bytes`
/// bytes. A trailing header file always gets a batch of its own.
pub fn plan_batches(
    files: &[BatchFileEntry],
    max_files: usize,
    max_bytes: u64,
) -> Vec<&[BatchFileEntry]> {
    let mut batches = Vec::new();
    let mut start = 0;
    while start < files.len() {
        let mut end = start;
        let mut size = 0;
        while end < files.len() {
            let count = end - start;
            let trailing_header = end + 1 == files.len() && files[end].name.ends_with(HEADER_SUFFIX);
            if count > 0 && (count >= max_files || size >= max_bytes || trailing_header) {
                break;
            }
            size += files[end].size;
            end += 1;
        }
        batches.push(&files[start..end]);
        start = end;
    }
    batches
}

fn check_capacity(data_dir: &DataDir, size: u64) -> Result<()> {
    if data_dir.reach_capacity_limit(size) {
        return Err(Error::ExceededLimit {
            path: data_dir.path().display().to_string(),
            size,
        });
    }
    Ok(())
}

fn check_file_name(name: &str) -> Result<()> {
    if !crate::http::is_plain_file_name(name) {
        return Err(Error::Network(format!(
            "remote listed an invalid file name: {}",
            name
        )));
    }
    Ok(())
}

/// Clear `local_dir` so files of an earlier source cannot mix in
fn reset_dir(local_dir: &Path) -> Result<()> {
    fs::delete_directory(local_dir)?;
    fs::create_directory(local_dir)
}

/// Copy every file of `remote_dir` with one request per file
pub fn download_files(
    data_dir: &DataDir,
    http: &HttpClient,
    endpoint: &SnapshotFileEndpoint,
    remote_dir: &str,
    local_dir: &Path,
    config: &CloneConfig,
) -> Result<TransferStats> {
    reset_dir(local_dir)?;
    data_dir.update_capacity()?;

    let list_url = endpoint.download_url(remote_dir)?;
    let mut names = http.list_remote_files(&list_url, config.list_remote_file_timeout())?;
    move_header_last(&mut names, |n| n.as_str());

    let started = Instant::now();
    let mut total_bytes = 0;
    for name in &names {
        check_file_name(name)?;
        let url = endpoint.download_url(&format!("{}{}", remote_dir, name))?;
        let file_size = http.get_length(&url, config.get_length_timeout())?;
        check_capacity(data_dir, file_size)?;

        let timeout = config.download_timeout(file_size);
        let local_path = local_dir.join(name);
        tracing::info!(
            file = %name,
            to = %local_path.display(),
            size = file_size,
            timeout_secs = timeout.as_secs(),
            "clone begin to download file"
        );

        http.execute_with_retry("download file", || {
            http.download(&url, &local_path, timeout)?;
            let local_size = fs::file_size(&local_path)?;
            if local_size != file_size {
                tracing::warn!(
                    file = %name,
                    file_size,
                    local_size,
                    "download file length error"
                );
                return Err(Error::Network(format!(
                    "downloaded size of {} is {}, expected {}",
                    name, local_size, file_size
                )));
            }
            fs::set_permission(&local_path, fs::PERMS_OWNER_RW)
        })?;
        total_bytes += file_size;
    }

    Ok(TransferStats::finish(names.len(), total_bytes, started))
}

/// Copy every file of `remote_dir` through the batched endpoint
pub fn batch_download_files(
    data_dir: &DataDir,
    http: &HttpClient,
    endpoint: &SnapshotFileEndpoint,
    remote_dir: &str,
    local_dir: &Path,
    config: &CloneConfig,
) -> Result<TransferStats> {
    reset_dir(local_dir)?;
    data_dir.update_capacity()?;

    let list_url = endpoint.batch_list_url(remote_dir)?;
    let mut files = http.list_batch(&list_url, config.list_remote_file_timeout())?;
    for file in &files {
        check_file_name(&file.name)?;
    }
    move_header_last(&mut files, |f| f.name.as_str());

    let download_url = endpoint.batch_download_url(remote_dir)?;
    let started = Instant::now();
    let mut total_bytes = 0;
    for batch in plan_batches(&files, BATCH_FILE_NUM, BATCH_FILE_SIZE) {
        let batch_size: u64 = batch.iter().map(|f| f.size).sum();
        check_capacity(data_dir, batch_size)?;

        let timeout = config.download_timeout(batch_size);
        tracing::debug!(files = batch.len(), size = batch_size, "downloading batch");
        http.execute_with_retry("download batch", || {
            http.download_batch(&download_url, batch, local_dir, timeout)
        })?;
        total_bytes += batch_size;
    }

    Ok(TransferStats::finish(files.len(), total_bytes, started))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(n: usize, size: u64) -> Vec<BatchFileEntry> {
        (0..n)
            .map(|i| BatchFileEntry {
                name: format!("0200000000000000010000000000000{:03}_0.dat", i),
                size,
            })
            .collect()
    }

    fn sizes(batches: &[&[BatchFileEntry]]) -> Vec<usize> {
        batches.iter().map(|b| b.len()).collect()
    }

    #[test]
    fn test_batches_are_count_bounded() {
        let files = entries(70, 1 << 20);
        let batches = plan_batches(&files, BATCH_FILE_NUM, BATCH_FILE_SIZE);
        assert_eq!(sizes(&batches), vec![64, 6]);
    }

    #[test]
    fn test_trailing_header_gets_own_batch() {
        let mut files = entries(69, 1 << 20);
        files.insert(
            3,
            BatchFileEntry {
                name: "15007.hdr".into(),
                size: 512,
            },
        );
        move_header_last(&mut files, |f| f.name.as_str());
        assert_eq!(files.last().unwrap().name, "15007.hdr");

        let batches = plan_batches(&files, BATCH_FILE_NUM, BATCH_FILE_SIZE);
        assert_eq!(sizes(&batches), vec![64, 5, 1]);
        assert_eq!(batches[2][0].name, "15007.hdr");

        let lone = vec![BatchFileEntry {
            name: "15007.hdr".into(),
            size: 1,
        }];
        assert_eq!(sizes(&plan_batches(&lone, 64, 64)), vec![1]);
    }

    #[test]
    fn test_batches_are_size_bounded() {
        let files = entries(10, 30 << 20);
        let batches = plan_batches(&files, BATCH_FILE_NUM, BATCH_FILE_SIZE);
        // a batch closes only after reaching the size cap
        assert_eq!(sizes(&batches), vec![3, 3, 3, 1]);

        // zero caps still make progress
        assert_eq!(sizes(&plan_batches(&files[..2], 0, 0)), vec![1, 1]);
    }

    #[test]
    fn test_move_header_last() {
        let mut names = vec!["1.hdr".to_string(), "a.dat".into(), "a.idx".into()];
        move_header_last(&mut names, |n| n.as_str());
        assert_eq!(names, vec!["a.idx", "a.dat", "1.hdr"]);

        let mut single = vec!["1.hdr".to_string()];
        move_header_last(&mut single, |n| n.as_str());
        assert_eq!(single, vec!["1.hdr"]);
    }

    #[test]
    fn test_transfer_rate() {
        let stats = TransferStats {
            total_files: 2,
            total_bytes: 4_000_000,
            elapsed_ms: 2000,
        };
        assert!((stats.rate_mb_per_sec() - 2.0).abs() < f64::EPSILON);
        assert_eq!(TransferStats::default().rate_mb_per_sec(), 0.0);
    }
}
