//! Copy-pasteable error blocks, appended to `<output_dir>/errors.log`.

use crate::params::TrackParams;
use chrono::Local;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

const RULE: &str = "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━";

#[derive(Debug, Clone)]
pub struct ErrorLog {
    path: PathBuf,
}

impl ErrorLog {
    pub fn new(output_dir: &Path) -> Self {
        Self {
            path: output_dir.join("errors.log"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Formats the block, appends it to the log and returns it.
    ///
    /// Never fails: a log that cannot be written is reported through tracing.
    pub fn record(
        &self,
        stage: &str,
        input: &str,
        params: Option<&TrackParams>,
        error: &str,
    ) -> String {
        let block = format_block(stage, input, params, error);
        if let Err(err) = self.append(&block) {
            warn!(path = %self.path.display(), "cannot write error log: {err}");
        }
        block
    }

    fn append(&self, block: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "\n[{}]\n{}", Local::now().to_rfc3339(), block)
    }
}

fn format_block(stage: &str, input: &str, params: Option<&TrackParams>, error: &str) -> String {
    let params = params
        .and_then(|p| serde_json::to_string_pretty(p).ok())
        .unwrap_or_else(|| "N/A".to_string());
    let system = format!(
        "{} · pmoradio {}",
        pmoutils::get_os_string(),
        env!("CARGO_PKG_VERSION")
    );
    format!(
        "{RULE}\n ERROR  stage: {stage}\n{RULE}\n System:   {system}\n Stage:    {stage}\n Input:    \"{input}\"\n Params:   {params}\n Error:    {error}\n{RULE}"
    )
}
