//! Local buffer export
//!
//! A request file dropped into the state directory asks the node to dump
//! its buffer on the next cold boot. The export is a single JSON document;
//! the request file is removed once the export is written.

use anyhow::Context;
use serde::Serialize;
use std::fs;
use std::path::Path;
use tracing::info;

use crate::buffer::PersistentBuffer;

#[derive(Debug, Serialize)]
struct BufferExport {
    exported_at: String,
    total: usize,
    unprocessed: usize,
    processed: usize,
    lines: Vec<ExportLine>,
}

#[derive(Debug, Serialize)]
struct ExportLine {
    index: usize,
    processed: bool,
    text: String,
}

/// Export the buffer if `request` exists; returns whether it did
pub fn export_if_requested(
    buffer: &PersistentBuffer,
    max_lines: usize,
    request: &Path,
    export: &Path,
) -> anyhow::Result<bool> {
    if !request.exists() {
        return Ok(false);
    }

    let status = buffer.status()?;
    let lines = buffer
        .read_lines(max_lines)?
        .into_iter()
        .enumerate()
        .map(|(index, text)| ExportLine {
            index,
            processed: buffer.is_processed(&text),
            text,
        })
        .collect();
    let doc = BufferExport {
        exported_at: chrono::Utc::now().to_rfc3339(),
        total: status.total,
        unprocessed: status.unprocessed,
        processed: status.processed,
        lines,
    };

    fs::write(export, serde_json::to_vec_pretty(&doc)?)
        .with_context(|| format!("failed to write export {:?}", export))?;
    fs::remove_file(request)
        .with_context(|| format!("failed to remove request {:?}", request))?;
    info!(
        "Exported {} buffered line(s) ({} unsent) to {:?}",
        status.total, status.unprocessed, export
    );
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::DEFAULT_MARKER;

    #[test]
    fn test_export_only_on_request() {
        let dir = std::env::temp_dir().join(format!("telemetry-node-export-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        let buffer = PersistentBuffer::open(dir.join("buffer.txt"), DEFAULT_MARKER, 10).unwrap();
        buffer.append_line("AAAA").unwrap();
        buffer.append_line("BBBB").unwrap();
        buffer.mark_line_as_processed(0).unwrap();

        let request = dir.join("provision.request");
        let export = dir.join("export.json");
        assert!(!export_if_requested(&buffer, 50, &request, &export).unwrap());
        assert!(!export.exists());

        fs::write(&request, "").unwrap();
        assert!(export_if_requested(&buffer, 50, &request, &export).unwrap());
        assert!(!request.exists());

        let doc: serde_json::Value = serde_json::from_slice(&fs::read(&export).unwrap()).unwrap();
        assert_eq!(doc["total"], 2);
        assert_eq!(doc["unprocessed"], 1);
        assert_eq!(doc["lines"][0]["processed"], true);
        assert_eq!(doc["lines"][1]["text"], "BBBB");
        fs::remove_dir_all(&dir).unwrap();
    }
}
