//! Persistent line buffer
//!
//! Newline-delimited store of encoded frames. Lines are sent oldest first;
//! a line that was delivered gets the processed marker prefixed and is
//! dropped on the next compaction. Whole-store rewrites go through a
//! temporary file and a rename so a reset mid-write leaves either the old
//! or the new contents, never a mix.

use anyhow::Context;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Marker prefixed to lines that reached the server
pub const DEFAULT_MARKER: &str = "#ENVIADO ";

/// Unprocessed-line cap before the oldest line is dropped
pub const DEFAULT_MAX_UNPROCESSED: usize = 10;

/// Upper bound on lines examined per scan
pub const DEFAULT_MAX_LINES_TO_READ: usize = 50;

/// An unprocessed line and its position in the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferedLine {
    pub index: usize,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferStatus {
    pub total: usize,
    pub unprocessed: usize,
    pub processed: usize,
}

#[derive(Debug, Clone)]
pub struct PersistentBuffer {
    path: PathBuf,
    marker: String,
    max_unprocessed: usize,
}

impl PersistentBuffer {
    /// Mount the store, creating the directory and file if needed.
    ///
    /// An error here means nothing can be persisted this cycle.
    pub fn open(path: impl Into<PathBuf>, marker: &str, max_unprocessed: usize) -> anyhow::Result<Self> {
        let path = path.into();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create buffer directory {:?}", dir))?;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to mount buffer file {:?}", path))?;

        if marker.is_empty() {
            anyhow::bail!("processed marker must not be empty");
        }

        Ok(Self {
            path,
            marker: marker.to_string(),
            max_unprocessed: max_unprocessed.max(1),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_processed(&self, line: &str) -> bool {
        line.starts_with(&self.marker)
    }

    /// Append one line (open, write, sync, close)
    pub fn append_line(&self, text: &str) -> anyhow::Result<()> {
        validate_line(text)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open {:?} for append", self.path))?;
        file.write_all(format!("{}\n", text).as_bytes())
            .context("failed to append buffer line")?;
        file.sync_all().context("failed to sync buffer file")?;
        debug!("Buffered line ({} chars)", text.len());
        Ok(())
    }

    /// Append a line, first dropping the oldest unprocessed line if the
    /// unprocessed count is already at the cap.
    pub fn store_line(&self, text: &str) -> anyhow::Result<()> {
        validate_line(text)?;
        let mut lines = self.read_all()?;
        let unprocessed = lines.iter().filter(|l| !self.is_processed(l)).count();

        if unprocessed < self.max_unprocessed {
            return self.append_line(text);
        }

        if let Some(oldest) = lines.iter().position(|l| !self.is_processed(l)) {
            let dropped = lines.remove(oldest);
            warn!(
                "Buffer full ({} unprocessed), dropping oldest line: {}",
                unprocessed, dropped
            );
        }
        lines.push(text.to_string());
        self.rewrite(&lines)
    }

    /// First `max_lines` lines of the store, processed or not
    pub fn read_lines(&self, max_lines: usize) -> anyhow::Result<Vec<String>> {
        let mut lines = self.read_all()?;
        lines.truncate(max_lines);
        Ok(lines)
    }

    /// Unprocessed lines among the first `max_lines`, in store order
    pub fn read_unprocessed_lines(&self, max_lines: usize) -> anyhow::Result<Vec<BufferedLine>> {
        Ok(self
            .read_lines(max_lines)?
            .into_iter()
            .enumerate()
            .filter(|(_, text)| !self.is_processed(text))
            .map(|(index, text)| BufferedLine { index, text })
            .collect())
    }

    /// Prefix the marker to line `index`, keeping every other line in place
    pub fn mark_line_as_processed(&self, index: usize) -> anyhow::Result<()> {
        let mut lines = self.read_all()?;
        let total = lines.len();
        let line = lines.get_mut(index).ok_or_else(|| {
            anyhow::anyhow!("line index {} out of range ({} lines)", index, total)
        })?;
        if line.starts_with(&self.marker) {
            debug!("Line {} already marked processed", index);
            return Ok(());
        }
        line.insert_str(0, &self.marker);
        self.rewrite(&lines)
    }

    /// Compact the store down to its unprocessed lines, returning how many
    /// processed lines were removed.
    pub fn remove_processed_lines(&self) -> anyhow::Result<usize> {
        let lines = self.read_all()?;
        let before = lines.len();
        let kept: Vec<String> = lines
            .into_iter()
            .filter(|l| !self.is_processed(l))
            .collect();
        let removed = before - kept.len();
        if removed > 0 {
            self.rewrite(&kept)?;
            info!("Compacted buffer: removed {} processed line(s), {} left", removed, kept.len());
        }
        Ok(removed)
    }

    pub fn status(&self) -> anyhow::Result<BufferStatus> {
        let lines = self.read_all()?;
        let processed = lines.iter().filter(|l| self.is_processed(l)).count();
        Ok(BufferStatus {
            total: lines.len(),
            unprocessed: lines.len() - processed,
            processed,
        })
    }

    fn read_all(&self) -> anyhow::Result<Vec<String>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read buffer {:?}", self.path))
            }
        };
        Ok(content
            .lines()
            .map(|l| l.trim_end_matches('\r'))
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn rewrite(&self, lines: &[String]) -> anyhow::Result<()> {
        let tmp = self.path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)
                .with_context(|| format!("failed to create {:?}", tmp))?;
            for line in lines {
                file.write_all(line.as_bytes())?;
                file.write_all(b"\n")?;
            }
            file.sync_all().context("failed to sync temporary buffer")?;
        }
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace {:?}", self.path))?;
        Ok(())
    }
}

fn validate_line(text: &str) -> anyhow::Result<()> {
    if text.is_empty() {
        anyhow::bail!("refusing to buffer an empty line");
    }
    if text.contains(['\n', '\r']) {
        anyhow::bail!("buffer line must not contain line breaks");
    }
    Ok(())
}
