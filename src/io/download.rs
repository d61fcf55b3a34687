use crate::core::retry::RetryPolicy;
use crate::io::session::HttpTransport;
use crate::types::{DownloadSummary, DownloadTask, S2Error, S2Result, TaskFailure, TaskStatus};
use rayon::prelude::*;
use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Shared stop signal: set it and no new transfers start
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

enum Outcome {
    Succeeded,
    Skipped,
    Cancelled,
    Failed(TaskFailure),
}

/// Writer that counts bytes and hashes them on the way to disk
struct HashingWriter<W: Write> {
    inner: W,
    digest: md5::Context,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Self {
        Self { inner, digest: md5::Context::new(), written: 0 }
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.digest.consume(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Hex MD5 of a file on disk
pub fn file_md5(path: &Path) -> S2Result<String> {
    let mut file = File::open(path)?;
    let mut digest = md5::Context::new();
    let mut buf = vec![0u8; 1 << 16];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        digest.consume(&buf[..n]);
    }
    Ok(format!("{:x}", digest.compute()))
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".part");
    dest.with_file_name(name)
}

/// Runs download tasks on a fixed-size worker pool
pub struct DownloadManager {
    transport: Arc<dyn HttpTransport>,
    retry: RetryPolicy,
    cancel: CancelFlag,
}

impl DownloadManager {
    pub fn new(transport: Arc<dyn HttpTransport>, retry: RetryPolicy) -> Self {
        Self {
            transport,
            retry,
            cancel: CancelFlag::new(),
        }
    }

    /// Share a cancellation flag with the caller
    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Download every task with at most `max_workers` concurrent transfers.
    ///
    /// Only configuration problems are returned as errors; individual task
    /// failures are recorded in the summary.
    pub fn download(&self, tasks: Vec<DownloadTask>, max_workers: usize) -> S2Result<DownloadSummary> {
        if max_workers < 1 {
            return Err(S2Error::Configuration(format!(
                "max_workers must be at least 1 (got {})",
                max_workers
            )));
        }
        let tasks = Self::dedupe(tasks)?;
        if tasks.is_empty() {
            return Ok(DownloadSummary::default());
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(max_workers)
            .thread_name(|i| format!("s2-download-{}", i))
            .build()
            .map_err(|e| S2Error::Configuration(format!("Failed to build worker pool: {}", e)))?;

        log::info!("📥 Downloading {} file(s) with {} worker(s)", tasks.len(), max_workers);
        let summary = Mutex::new(DownloadSummary::default());

        pool.install(|| {
            tasks.into_par_iter().for_each(|task| {
                let outcome = self.run_task(task);
                let mut summary = match summary.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                match outcome {
                    Outcome::Succeeded => summary.succeeded += 1,
                    Outcome::Skipped => summary.skipped += 1,
                    Outcome::Cancelled => summary.cancelled += 1,
                    Outcome::Failed(failure) => {
                        summary.failed += 1;
                        summary.failures.push(failure);
                    }
                }
            });
        });

        let summary = summary.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner());
        log::info!(
            "Download finished: {} succeeded, {} skipped, {} failed, {} cancelled",
            summary.succeeded,
            summary.skipped,
            summary.failed,
            summary.cancelled
        );
        for failure in &summary.failures {
            log::warn!("  ❌ {}", failure);
        }
        Ok(summary)
    }

    /// Collapse repeated (product, band) pairs; distinct pairs must not share a destination
    fn dedupe(tasks: Vec<DownloadTask>) -> S2Result<Vec<DownloadTask>> {
        let mut seen = HashSet::new();
        let mut destinations: HashMap<PathBuf, (String, String)> = HashMap::new();
        let mut unique = Vec::with_capacity(tasks.len());
        for task in tasks {
            let key = task.key();
            if !seen.insert(key.clone()) {
                log::warn!("Ignoring duplicate task for {}/{}", key.0, key.1);
                continue;
            }
            if let Some(owner) = destinations.insert(task.destination_path.clone(), key.clone()) {
                return Err(S2Error::Configuration(format!(
                    "{}/{} and {}/{} share destination {}",
                    owner.0,
                    owner.1,
                    key.0,
                    key.1,
                    task.destination_path.display()
                )));
            }
            unique.push(task);
        }
        Ok(unique)
    }

    /// True if the destination already holds the expected file
    pub fn is_complete_on_disk(task: &DownloadTask) -> bool {
        let meta = match fs::metadata(&task.destination_path) {
            Ok(meta) if meta.is_file() => meta,
            _ => return false,
        };
        if let Some(size) = task.expected_size {
            if meta.len() != size {
                log::debug!(
                    "{} exists but has {} bytes, expected {}",
                    task.destination_path.display(),
                    meta.len(),
                    size
                );
                return false;
            }
        }
        if let Some(expected) = &task.expected_md5 {
            match file_md5(&task.destination_path) {
                Ok(actual) if actual.eq_ignore_ascii_case(expected) => {}
                _ => return false,
            }
        }
        true
    }

    fn run_task(&self, mut task: DownloadTask) -> Outcome {
        if self.cancel.is_cancelled() {
            return Outcome::Cancelled;
        }
        if Self::is_complete_on_disk(&task) {
            log::info!("⏭️  {} already present, skipping", task.destination_path.display());
            task.status = TaskStatus::Complete;
            return Outcome::Skipped;
        }

        let what = format!("download {}/{}", task.product_id, task.band);
        let result = self.retry.run(
            &what,
            |attempt| {
                if attempt > 1 {
                    task.transition(TaskStatus::Pending)?;
                }
                task.transition(TaskStatus::InProgress)?;
                match self.fetch_once(&task) {
                    Ok(bytes) => {
                        task.transition(TaskStatus::Complete)?;
                        Ok(bytes)
                    }
                    Err(e) => {
                        task.transition(TaskStatus::Failed)?;
                        Err(e)
                    }
                }
            },
            |e| e.is_transient() || matches!(e, S2Error::DownloadTask { .. }),
        );

        match result {
            Ok(bytes) => {
                log::info!("✅ {} ({} bytes)", task.destination_path.display(), bytes);
                Outcome::Succeeded
            }
            Err(e) => Outcome::Failed(TaskFailure {
                product_id: task.product_id.clone(),
                band: task.band.clone(),
                destination: task.destination_path.clone(),
                cause: e.to_string(),
            }),
        }
    }

    /// One transfer into `<dest>.part`, verified, then renamed into place
    fn fetch_once(&self, task: &DownloadTask) -> S2Result<u64> {
        let dest = &task.destination_path;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let part = part_path(dest);

        let result = (|| -> S2Result<u64> {
            let file = File::create(&part)?;
            let mut writer = HashingWriter::new(BufWriter::new(file));
            self.transport.download_to(&task.source_url, &mut writer)?;
            writer.flush()?;
            let HashingWriter { inner, digest, written } = writer;
            inner
                .into_inner()
                .map_err(|e| S2Error::Io(e.into_error()))?
                .sync_all()?;

            if let Some(size) = task.expected_size {
                if written != size {
                    return Err(S2Error::DownloadTask {
                        product_id: task.product_id.clone(),
                        band: task.band.clone(),
                        cause: format!("incomplete transfer: {} of {} bytes", written, size),
                    });
                }
            }
            if let Some(expected) = &task.expected_md5 {
                let actual = format!("{:x}", digest.compute());
                if !actual.eq_ignore_ascii_case(expected) {
                    return Err(S2Error::DownloadTask {
                        product_id: task.product_id.clone(),
                        band: task.band.clone(),
                        cause: format!("checksum mismatch: got {}, expected {}", actual, expected),
                    });
                }
            }
            fs::rename(&part, dest)?;
            Ok(written)
        })();

        if result.is_err() && part.exists() {
            let _ = fs::remove_file(&part);
        }
        result
    }
}
