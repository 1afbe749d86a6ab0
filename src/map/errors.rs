use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::storage::RawError;

const STDERR_TAIL_LINES: usize = 20;

/// A component that exited unsuccessfully.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComponentError {
    pub tag: String,
    pub component: usize,
    pub input: Vec<String>,
    pub exit_code: Option<i32>,
    pub stderr: String,
    pub runtime: Duration,
    pub finished_at: DateTime<Utc>,
}

impl ComponentError {
    pub(crate) fn from_raw(tag: String, component: usize, input: Vec<String>, raw: RawError) -> Self {
        Self {
            tag,
            component,
            input,
            exit_code: raw.exit_code,
            stderr: raw.stderr,
            runtime: raw.runtime,
            finished_at: raw.finished_at,
        }
    }

    /// Multi-line, framed description of the failure.
    pub fn report(&self) -> String {
        let title = format!(
            " Error report for component {} of map {} ",
            self.component, self.tag
        );
        let rule = "=".repeat(title.len() + 20);

        let mut lines = vec![
            rule.clone(),
            format!("{:=^width$}", title, width = rule.len()),
            rule.clone(),
            format!(
                "Exit code:   {}",
                self.exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "none (killed by signal or never started)".to_string())
            ),
            format!("Runtime:     {:.3}s", self.runtime.as_secs_f64()),
            format!("Finished at: {}", self.finished_at.to_rfc3339()),
            format!("Input:       {}", self.input.join(" ")),
        ];

        let stderr_lines: Vec<&str> = self.stderr.lines().collect();
        if stderr_lines.is_empty() {
            lines.push("Standard error: (empty)".to_string());
        } else {
            let skip = stderr_lines.len().saturating_sub(STDERR_TAIL_LINES);
            if skip > 0 {
                lines.push(format!(
                    "Standard error (last {} of {} lines):",
                    STDERR_TAIL_LINES,
                    stderr_lines.len()
                ));
            } else {
                lines.push("Standard error:".to_string());
            }
            lines.extend(stderr_lines[skip..].iter().map(|l| format!("  {}", l)));
        }
        lines.push(rule);
        lines.join("\n")
    }
}

impl std::fmt::Display for ComponentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "component {} of map {} failed with exit code {:?}",
            self.component, self.tag, self.exit_code
        )
    }
}
