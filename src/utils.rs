use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::error::{MapError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Align {
    Left,
    Right,
}

/// Render rows as a plain-text table with a header separator.
/// Columns not listed in `left_aligned` are right-aligned.
pub fn table(headers: &[&str], rows: &[Vec<String>], left_aligned: &[&str]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate().take(widths.len()) {
            widths[i] = widths[i].max(cell.len());
        }
    }

    let align = |i: usize| {
        if left_aligned.contains(&headers[i]) {
            Align::Left
        } else {
            Align::Right
        }
    };
    let render = |cells: Vec<&str>| {
        cells
            .iter()
            .enumerate()
            .map(|(i, cell)| match align(i) {
                Align::Left => format!("{:<width$}", cell, width = widths[i]),
                Align::Right => format!("{:>width$}", cell, width = widths[i]),
            })
            .collect::<Vec<_>>()
            .join("   ")
            .trim_end()
            .to_string()
    };

    let mut lines = vec![render(headers.to_vec())];
    lines.push(
        widths
            .iter()
            .map(|w| "-".repeat(*w))
            .collect::<Vec<_>>()
            .join("   "),
    );
    for row in rows {
        lines.push(render(row.iter().map(String::as_str).collect()));
    }
    lines.join("\n")
}

/// Total size in bytes of all files below `path`.
pub async fn dir_size(path: &Path) -> Result<u64> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || dir_size_blocking(&path))
        .await
        .map_err(|e| MapError::Internal(e.to_string()))?
}

fn dir_size_blocking(path: &Path) -> Result<u64> {
    let mut total = 0;
    let mut stack: Vec<PathBuf> = vec![path.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if meta.is_dir() {
                stack.push(entry.path());
            } else {
                total += meta.len();
            }
        }
    }
    Ok(total)
}

/// Human-readable byte count, e.g. `1.5 KB`.
pub fn num_bytes_to_str(num_bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = num_bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", num_bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// Poll until `path` exists. `None` waits forever.
pub async fn wait_for_path(path: &Path, timeout: Option<Duration>, poll: Duration) -> Result<()> {
    let start = Instant::now();
    loop {
        if path.exists() {
            return Ok(());
        }
        if let Some(timeout) = timeout {
            if start.elapsed() >= timeout {
                return Err(MapError::Timeout(timeout, path.display().to_string()));
            }
        }
        tokio::time::sleep(poll).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_alignment() {
        let rendered = table(
            &["Component", "Code", "Hold Reason"],
            &[
                vec!["0".to_string(), "1".to_string(), "held by user".to_string()],
                vec!["12".to_string(), "6".to_string(), "no shell".to_string()],
            ],
            &["Component", "Hold Reason"],
        );
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines[0], "Component   Code   Hold Reason");
        assert_eq!(lines[1], "---------   ----   ------------");
        assert_eq!(lines[2], "0              1   held by user");
        assert_eq!(lines[3], "12             6   no shell");
    }

    #[test]
    fn bytes_to_str() {
        assert_eq!(num_bytes_to_str(12), "12 B");
        assert_eq!(num_bytes_to_str(1536), "1.5 KB");
        assert_eq!(num_bytes_to_str(3 * 1024 * 1024), "3.0 MB");
    }

    #[tokio::test]
    async fn dir_size_counts_nested_files() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("nested")).unwrap();
        std::fs::write(tmp.path().join("a"), [0u8; 10]).unwrap();
        std::fs::write(tmp.path().join("nested/b"), [0u8; 5]).unwrap();
        assert_eq!(dir_size(tmp.path()).await.unwrap(), 15);
    }

    #[tokio::test]
    async fn wait_for_missing_path_times_out() {
        let tmp = tempfile::tempdir().unwrap();
        let result = wait_for_path(
            &tmp.path().join("never"),
            Some(Duration::from_millis(30)),
            Duration::from_millis(5),
        )
        .await;
        assert!(matches!(result, Err(MapError::Timeout(..))));
    }
}
