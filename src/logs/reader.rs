use crate::error::{OverseerError, Result};
use std::collections::VecDeque;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Read the last `lines` lines of a log file.
///
/// A missing file yields no lines: the process may simply not have written anything yet.
pub async fn tail_lines(file_path: &Path, lines: usize) -> Result<Vec<String>> {
    if !file_path.exists() {
        return Ok(Vec::new());
    }

    let file = File::open(file_path).await.map_err(|e| {
        OverseerError::LogError(format!(
            "Failed to open log file {}: {}",
            file_path.display(),
            e
        ))
    })?;

    let mut window = VecDeque::with_capacity(lines.min(4096));
    let mut lines_stream = BufReader::new(file).lines();

    while let Some(line) = lines_stream
        .next_line()
        .await
        .map_err(|e| OverseerError::LogError(format!("Failed to read log line: {}", e)))?
    {
        if lines == 0 {
            continue;
        }
        if window.len() == lines {
            window.pop_front();
        }
        window.push_back(line);
    }

    Ok(window.into_iter().collect())
}
