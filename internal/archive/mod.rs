use crate::errors::{CoreError, CoreResult};
use crate::models::ArchiveOptions;
use chrono::Local;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

/// Called after each archived file with cumulative bytes, the pre-computed
/// uncompressed total, and the file's source-relative path.
pub type ArchiveProgressFn = dyn Fn(i64, i64, &str) + Send + Sync;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveOutput {
    pub archive_path: PathBuf,
    pub hash: String,
    pub size: i64,
}

/// Streams a directory tree into a tar(.gz) artifact, hashing the bytes as
/// they hit the output file.
pub struct ArchiveBuilder {
    source_path: PathBuf,
    output_dir: PathBuf,
    options: ArchiveOptions,
}

/// Tee sink: every byte written to the output file also feeds the digest.
struct HashingWriter {
    file: File,
    hasher: Sha256,
    written: i64,
}

impl HashingWriter {
    fn new(file: File) -> Self {
        Self {
            file,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    fn finish(self) -> (String, i64) {
        let digest = self.hasher.finalize();
        (format!("sha256:{}", hex::encode(digest)), self.written)
    }
}

impl Write for HashingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.file.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as i64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file.flush()
    }
}

impl ArchiveBuilder {
    pub fn new(
        source_path: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
        options: ArchiveOptions,
    ) -> Self {
        Self {
            source_path: source_path.into(),
            output_dir: output_dir.into(),
            options,
        }
    }

    /// Derive the archive filename from the configured pattern.
    pub fn generate_filename(&self, task_name: &str) -> String {
        let mut name = match self.options.name_pattern.as_deref() {
            Some(pattern) if !pattern.is_empty() => pattern.to_string(),
            _ => {
                if self.options.use_timestamp {
                    "{task}_{timestamp}.tar.gz".to_string()
                } else {
                    "{task}_latest.tar.gz".to_string()
                }
            }
        };

        name = name.replace("{task}", &sanitize_filename(task_name));

        if name.contains("{timestamp}") {
            if self.options.use_timestamp {
                let timestamp = Local::now().format("%Y%m%d_%H%M%S").to_string();
                name = name.replace("{timestamp}", &timestamp);
            } else {
                name = name
                    .replace("_{timestamp}", "")
                    .replace("{timestamp}_", "")
                    .replace("{timestamp}", "");
            }
        }

        if !name.ends_with(".tar.gz") && !name.ends_with(".tar") {
            name.push_str(".tar.gz");
        }
        name
    }

    /// Build the archive. The pipeline is file -> tar -> gzip -> tee(output,
    /// sha256); the reported digest and size cover the compressed bytes.
    pub async fn build(
        &self,
        task_name: &str,
        cancel: CancellationToken,
        progress: Option<Arc<ArchiveProgressFn>>,
    ) -> CoreResult<ArchiveOutput> {
        match self.options.format.as_str() {
            "tar.gz" | "tar" => {}
            other => {
                return Err(CoreError::Validation(format!(
                    "unsupported archive format: {other}"
                )))
            }
        }

        let filename = self.generate_filename(task_name);
        let archive_path = self.output_dir.join(&filename);
        let source_path = self.source_path.clone();
        let output_dir = self.output_dir.clone();
        let gzip = matches!(self.options.compression.as_str(), "gzip" | "");

        let result = tokio::task::spawn_blocking({
            let archive_path = archive_path.clone();
            move || {
                std::fs::create_dir_all(&output_dir)?;
                let (total_size, _file_count) = calculate_size(&source_path)?;
                let outcome = write_archive(
                    &source_path,
                    &archive_path,
                    gzip,
                    total_size,
                    &cancel,
                    progress.as_deref(),
                );
                if outcome.is_err() {
                    let _ = std::fs::remove_file(&archive_path);
                }
                outcome
            }
        })
        .await
        .map_err(|err| CoreError::Execution(format!("archive task panicked: {err}")))?;

        let (hash, size) = result?;
        Ok(ArchiveOutput {
            archive_path,
            hash,
            size,
        })
    }
}

fn write_archive(
    source_path: &Path,
    archive_path: &Path,
    gzip: bool,
    total_size: i64,
    cancel: &CancellationToken,
    progress: Option<&ArchiveProgressFn>,
) -> CoreResult<(String, i64)> {
    let file = File::create(archive_path)?;
    let tee = HashingWriter::new(file);

    let tee = if gzip {
        let encoder = GzEncoder::new(tee, Compression::default());
        let mut builder = tar::Builder::new(encoder);
        stream_tree(&mut builder, source_path, total_size, cancel, progress)?;
        let encoder = builder.into_inner()?;
        encoder.finish()?
    } else {
        let mut builder = tar::Builder::new(tee);
        stream_tree(&mut builder, source_path, total_size, cancel, progress)?;
        builder.into_inner()?
    };

    let mut tee = tee;
    tee.flush()?;
    Ok(tee.finish())
}

/// Walk the tree in filesystem order; directories contribute headers only,
/// files stream their contents. Cancellation is checked between entries.
fn stream_tree<W: Write>(
    builder: &mut tar::Builder<W>,
    source_path: &Path,
    total_size: i64,
    cancel: &CancellationToken,
    progress: Option<&ArchiveProgressFn>,
) -> CoreResult<()> {
    let mut bytes_processed: i64 = 0;
    for entry in WalkDir::new(source_path).min_depth(1) {
        if cancel.is_cancelled() {
            return Err(CoreError::Cancelled);
        }
        let entry = entry.map_err(|err| CoreError::Execution(format!("walk failed: {err}")))?;
        let rel = entry
            .path()
            .strip_prefix(source_path)
            .map_err(|err| CoreError::Execution(format!("relative path failed: {err}")))?
            .to_path_buf();
        if entry.file_type().is_dir() {
            builder.append_dir(&rel, entry.path())?;
            continue;
        }
        builder.append_path_with_name(entry.path(), &rel)?;
        let size = entry
            .metadata()
            .map(|meta| meta.len() as i64)
            .unwrap_or_default();
        bytes_processed += size;
        if let Some(progress) = progress {
            progress(bytes_processed, total_size, &rel.to_string_lossy());
        }
    }
    Ok(())
}

/// Pre-pass: total uncompressed file bytes and file count under `path`.
pub fn calculate_size(path: &Path) -> CoreResult<(i64, usize)> {
    let mut total: i64 = 0;
    let mut count = 0;
    for entry in WalkDir::new(path) {
        let entry = entry.map_err(|err| CoreError::Execution(format!("walk failed: {err}")))?;
        if entry.file_type().is_file() {
            total += entry
                .metadata()
                .map(|meta| meta.len() as i64)
                .unwrap_or_default();
            count += 1;
        }
    }
    Ok((total, count))
}

/// Make a task name safe for filenames: spaces become hyphens, everything is
/// lowercased, and anything outside `[a-z0-9._-]` is dropped.
pub fn sanitize_filename(name: &str) -> String {
    name.replace(' ', "-")
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{calculate_size, sanitize_filename, ArchiveBuilder};
    use crate::errors::CoreError;
    use crate::models::ArchiveOptions;
    use flate2::read::GzDecoder;
    use std::fs;
    use std::io::Read;
    use tempfile::tempdir;
    use tokio_util::sync::CancellationToken;

    fn options(pattern: Option<&str>, use_timestamp: bool) -> ArchiveOptions {
        ArchiveOptions {
            name_pattern: pattern.map(str::to_string),
            use_timestamp,
            ..ArchiveOptions::default()
        }
    }

    fn seed_source(dir: &std::path::Path) {
        fs::create_dir_all(dir.join("sub")).expect("mkdir");
        fs::write(dir.join("a.txt"), vec![b'a'; 100]).expect("write a");
        fs::write(dir.join("sub/b.bin"), vec![b'b'; 300]).expect("write b");
    }

    #[test]
    fn sanitize_is_idempotent_and_restricted() {
        let cases = [
            ("Daily DB", "daily-db"),
            ("a/b\\c:d*e?f\"g<h>i|j", "abcdefghij"),
            ("already-clean_1.2", "already-clean_1.2"),
            ("weird (copy) #2!", "weird-copy-2"),
        ];
        for (input, expected) in cases {
            let once = sanitize_filename(input);
            assert_eq!(once, expected);
            assert_eq!(sanitize_filename(&once), once);
            assert!(once
                .chars()
                .all(|c| c.is_ascii_lowercase()
                    || c.is_ascii_digit()
                    || matches!(c, '.' | '_' | '-')));
        }
    }

    #[test]
    fn filename_uses_default_timestamp_pattern() {
        let builder = ArchiveBuilder::new("/src", "/out", options(None, true));
        let name = builder.generate_filename("Daily DB");
        let stamp = name
            .strip_prefix("daily-db_")
            .and_then(|rest| rest.strip_suffix(".tar.gz"))
            .unwrap_or_else(|| panic!("unexpected name: {name}"));
        let (date, time) = stamp.split_once('_').expect("timestamp separator");
        assert_eq!(date.len(), 8);
        assert_eq!(time.len(), 6);
        assert!(date.chars().all(|c| c.is_ascii_digit()));
        assert!(time.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn filename_without_timestamp_is_static() {
        let builder = ArchiveBuilder::new("/src", "/out", options(None, false));
        assert_eq!(builder.generate_filename("Daily DB"), "daily-db_latest.tar.gz");
    }

    #[test]
    fn filename_drops_timestamp_placeholder_and_separator() {
        let builder = ArchiveBuilder::new(
            "/src",
            "/out",
            options(Some("{task}_{timestamp}.tar.gz"), false),
        );
        assert_eq!(builder.generate_filename("daily"), "daily.tar.gz");

        let leading = ArchiveBuilder::new(
            "/src",
            "/out",
            options(Some("{timestamp}_{task}"), false),
        );
        assert_eq!(leading.generate_filename("daily"), "daily.tar.gz");
    }

    #[test]
    fn filename_appends_extension_when_missing() {
        let builder = ArchiveBuilder::new("/src", "/out", options(Some("{task}"), false));
        assert_eq!(builder.generate_filename("daily"), "daily.tar.gz");

        let tar_only = ArchiveBuilder::new("/src", "/out", options(Some("{task}.tar"), false));
        assert_eq!(tar_only.generate_filename("daily"), "daily.tar");
    }

    #[tokio::test]
    async fn build_produces_hashed_gzip_archive() {
        let source = tempdir().expect("source");
        let output = tempdir().expect("output");
        seed_source(source.path());

        let builder = ArchiveBuilder::new(source.path(), output.path(), options(None, true));
        let mut seen_files = Vec::new();
        let progress_log = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let log_clone = progress_log.clone();
        let out = builder
            .build(
                "daily-db",
                CancellationToken::new(),
                Some(std::sync::Arc::new(move |current, total, file: &str| {
                    log_clone
                        .lock()
                        .expect("lock")
                        .push((current, total, file.to_string()));
                })),
            )
            .await
            .expect("build");

        assert!(out.archive_path.exists());
        assert_eq!(out.size, fs::metadata(&out.archive_path).expect("stat").len() as i64);
        assert!(out.hash.starts_with("sha256:"));
        assert_eq!(out.hash.len(), "sha256:".len() + 64);

        // Digest covers the compressed bytes on disk.
        let bytes = fs::read(&out.archive_path).expect("read archive");
        use sha2::Digest;
        let expected = format!("sha256:{}", hex::encode(sha2::Sha256::digest(&bytes)));
        assert_eq!(out.hash, expected);

        // The archive decompresses to a tar holding both files.
        let mut tar_bytes = Vec::new();
        GzDecoder::new(&bytes[..])
            .read_to_end(&mut tar_bytes)
            .expect("gunzip");
        let mut archive = tar::Archive::new(&tar_bytes[..]);
        for entry in archive.entries().expect("entries") {
            let entry = entry.expect("entry");
            seen_files.push(entry.path().expect("path").to_string_lossy().to_string());
        }
        assert!(seen_files.iter().any(|p| p == "a.txt"));
        assert!(seen_files.iter().any(|p| p == "sub/b.bin"));

        let log = progress_log.lock().expect("lock");
        assert!(!log.is_empty());
        let (final_current, final_total, _) = log.last().expect("final").clone();
        assert_eq!(final_total, 400);
        assert_eq!(final_current, 400);
        for window in log.windows(2) {
            assert!(window[0].0 <= window[1].0, "progress must be monotonic");
        }
    }

    #[tokio::test]
    async fn build_rejects_unknown_format() {
        let source = tempdir().expect("source");
        let output = tempdir().expect("output");
        let mut opts = options(None, true);
        opts.format = "zip".to_string();
        let builder = ArchiveBuilder::new(source.path(), output.path(), opts);
        let err = builder
            .build("daily", CancellationToken::new(), None)
            .await
            .expect_err("format");
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn cancelled_build_removes_partial_archive() {
        let source = tempdir().expect("source");
        let output = tempdir().expect("output");
        seed_source(source.path());

        let cancel = CancellationToken::new();
        cancel.cancel();
        let builder = ArchiveBuilder::new(source.path(), output.path(), options(None, false));
        let err = builder
            .build("daily", cancel, None)
            .await
            .expect_err("cancelled");
        assert!(matches!(err, CoreError::Cancelled));
        assert_eq!(
            fs::read_dir(output.path()).expect("read dir").count(),
            0,
            "partial archive must be cleaned up"
        );
    }

    #[tokio::test]
    async fn calculate_size_counts_files_only() {
        let source = tempdir().expect("source");
        seed_source(source.path());
        let (total, count) = calculate_size(source.path()).expect("size");
        assert_eq!(total, 400);
        assert_eq!(count, 2);
    }
}
