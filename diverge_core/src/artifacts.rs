use crate::config::FuzzOptions;
use crate::input::{hex_digest, is_ascii, sha1_digest};
use base64::Engine as _;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Units at or below this size get their bytes logged alongside the
/// artifact path.
pub const MAX_UNIT_SIZE_TO_PRINT: usize = 256;

/// Writes special inputs to disk: crash/timeout/oom/leak/diff artifacts,
/// the output corpus, and the differential progress log.
#[derive(Debug)]
pub struct ArtifactWriter {
    artifact_prefix: String,
    exact_artifact_path: Option<PathBuf>,
    save_artifacts: bool,
    only_ascii: bool,
    output_corpus: Option<PathBuf>,
    progress_log: Option<PathBuf>,
}

impl ArtifactWriter {
    pub fn from_options(options: &FuzzOptions) -> Self {
        Self {
            artifact_prefix: options.artifact_prefix.clone(),
            exact_artifact_path: options.exact_artifact_path.clone(),
            save_artifacts: options.save_artifacts,
            only_ascii: options.only_ascii,
            output_corpus: options.output_corpus.clone(),
            progress_log: options.progress_log.clone(),
        }
    }

    /// Writes `<artifact-prefix><prefix><hex-hash>` (or the exact artifact
    /// path when configured). Returns the path written, `None` when saving
    /// is disabled or the write failed.
    pub fn write_unit_to_file_with_prefix(&self, bytes: &[u8], prefix: &str) -> Option<PathBuf> {
        if !self.save_artifacts {
            return None;
        }
        let path = match &self.exact_artifact_path {
            Some(exact) => exact.clone(),
            None => PathBuf::from(format!(
                "{}{}{}",
                self.artifact_prefix,
                prefix,
                hex_digest(&sha1_digest(bytes))
            )),
        };
        if let Err(err) = fs::write(&path, bytes) {
            tracing::warn!("failed to write artifact {}: {err}", path.display());
            return None;
        }
        tracing::info!(
            "artifact_prefix='{}'; Test unit written to {}",
            self.artifact_prefix,
            path.display()
        );
        if bytes.len() <= MAX_UNIT_SIZE_TO_PRINT {
            tracing::info!(
                "Base64: {}",
                base64::engine::general_purpose::STANDARD.encode(bytes)
            );
        }
        Some(path)
    }

    /// Persists an interesting unit into the output corpus directory under
    /// its hex hash.
    pub fn write_to_output_corpus(&self, bytes: &[u8]) -> Option<PathBuf> {
        if self.only_ascii {
            debug_assert!(is_ascii(bytes), "non-ASCII unit with only-ascii set");
        }
        let dir = self.output_corpus.as_ref()?;
        if let Err(err) = fs::create_dir_all(dir) {
            tracing::warn!("failed to create output corpus {}: {err}", dir.display());
            return None;
        }
        let path = dir.join(hex_digest(&sha1_digest(bytes)));
        match fs::write(&path, bytes) {
            Ok(()) => {
                tracing::debug!("Written to {}", path.display());
                Some(path)
            }
            Err(err) => {
                tracing::warn!("failed to write {}: {err}", path.display());
                None
            }
        }
    }

    /// Appends one line to the progress log, if a sink is configured.
    /// Failures are operational: logged and dropped.
    pub fn append_progress(&self, line: &str) {
        let Some(path) = &self.progress_log else {
            return;
        };
        let result = fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .and_then(|mut file| writeln!(file, "{line}"));
        if let Err(err) = result {
            tracing::warn!("failed to append progress log {}: {err}", path.display());
        }
    }
}

/// Logs the bytes of a small unit in hex and ASCII, the way crash dumps
/// present the offending input.
pub fn print_unit(bytes: &[u8]) {
    if bytes.len() > MAX_UNIT_SIZE_TO_PRINT {
        return;
    }
    let hex: Vec<String> = bytes.iter().map(|b| format!("0x{b:02x}")).collect();
    tracing::info!("{}", hex.join(","));
    let ascii: String = bytes
        .iter()
        .map(|&b| {
            if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            }
        })
        .collect();
    tracing::info!("{ascii}");
}

/// Reads every regular file in `dir` (non-recursive) that was modified
/// after `modified_after`, clamping each to `max_size` bytes. Per-file
/// errors are logged and skipped. Returns the units and the newest
/// modification time observed (or `modified_after` when nothing was read).
pub fn read_dir_to_units(
    dir: &Path,
    max_size: usize,
    modified_after: Option<SystemTime>,
) -> (Vec<Vec<u8>>, SystemTime) {
    let mut units = Vec::new();
    let mut newest = modified_after.unwrap_or(SystemTime::UNIX_EPOCH);
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            tracing::warn!("failed to read directory {}: {err}", dir.display());
            return (units, newest);
        }
    };
    for entry in entries {
        let Ok(entry) = entry else { continue };
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let mtime = entry
            .metadata()
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        if let Some(after) = modified_after {
            if mtime <= after {
                continue;
            }
        }
        match fs::read(&path) {
            Ok(mut bytes) => {
                bytes.truncate(max_size);
                units.push(bytes);
                if mtime > newest {
                    newest = mtime;
                }
            }
            Err(err) => {
                tracing::warn!("failed to read {}: {err}", path.display());
            }
        }
    }
    (units, newest)
}
