//! CommandRunner: spawns external binaries, captures output, sanitises it.
//!
//! Wraps `tokio::process::Command` the way a systems-facing component wraps
//! any OS call: a typed outcome instead of a raw exit-code/string tuple, and
//! logging at the boundary so every invocation leaves a trace.

use std::sync::OnceLock;

use regex::Regex;
use tracing::{debug, warn};

use crate::metrics::Metrics;

/// Result of one external command invocation.
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub command_string: String,
    pub exit_code: i32,
    pub success: bool,
    /// Raw, merged stdout+stderr.
    pub raw_output: String,
    /// `raw_output` with terminal control sequences removed.
    pub sanitised_output: String,
}

#[derive(Debug, Clone, Default)]
pub struct CommandRunner {
    /// Prefix prepended to argv for mutating commands, e.g. `sudo`. Empty
    /// disables elevation.
    elevate_command: String,
    metrics: Option<Metrics>,
}

impl CommandRunner {
    pub fn new(elevate_command: impl Into<String>) -> Self {
        Self {
            elevate_command: elevate_command.into(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Run `program` with `args`, optionally prefixed by the configured
    /// elevation command. Never returns an `Err`: spawn failures are folded
    /// into a failed `CommandOutcome` the same way a non-zero exit is.
    pub async fn run(&self, program: &str, args: &[&str], elevate: bool) -> CommandOutcome {
        let (bin, full_args): (&str, Vec<&str>) = if elevate && !self.elevate_command.is_empty() {
            let mut a = vec![program];
            a.extend_from_slice(args);
            (self.elevate_command.as_str(), a)
        } else {
            (program, args.to_vec())
        };

        let command_string = std::iter::once(bin)
            .chain(full_args.iter().copied())
            .collect::<Vec<_>>()
            .join(" ");

        debug!(command = %command_string, "running command");

        let output = tokio::process::Command::new(bin).args(&full_args).output().await;

        match output {
            Ok(out) => {
                let mut combined = String::from_utf8_lossy(&out.stdout).into_owned();
                combined.push_str(&String::from_utf8_lossy(&out.stderr));
                let exit_code = out.status.code().unwrap_or(-1);
                let success = out.status.success();
                if !success {
                    warn!(command = %command_string, exit_code, "command exited non-zero");
                }
                if let Some(metrics) = &self.metrics {
                    let outcome_label = if success { "success" } else { "failure" };
                    metrics
                        .commands_total
                        .with_label_values(&[program, outcome_label])
                        .inc();
                }
                let sanitised = sanitise_output(&combined);
                CommandOutcome {
                    command_string,
                    exit_code,
                    success,
                    raw_output: combined,
                    sanitised_output: sanitised,
                }
            }
            Err(e) => {
                warn!(command = %command_string, error = %e, "failed to spawn command");
                if let Some(metrics) = &self.metrics {
                    metrics.commands_total.with_label_values(&[program, "failure"]).inc();
                }
                CommandOutcome {
                    command_string,
                    exit_code: -1,
                    success: false,
                    raw_output: e.to_string(),
                    sanitised_output: e.to_string(),
                }
            }
        }
    }
}

fn csi_sequence() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]").unwrap())
}

fn backspace_pair() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r".\x08").unwrap())
}

/// Removes ANSI CSI sequences, `<char><BS>` pairs, collapses carriage-return
/// progress redraws to their last segment, normalises CRLF to LF, and strips
/// trailing whitespace per line.
pub fn sanitise_output(raw: &str) -> String {
    let no_csi = csi_sequence().replace_all(raw, "");
    let mut no_backspace = no_csi.into_owned();
    // Backspace pairs can chain (e.g. "ab\x08\x08"); repeat until stable.
    loop {
        let replaced = backspace_pair().replace_all(&no_backspace, "");
        if replaced == no_backspace {
            break;
        }
        no_backspace = replaced.into_owned();
    }

    let normalised = no_backspace.replace("\r\n", "\n");

    normalised
        .split('\n')
        .map(|line| {
            // A line may still contain bare `\r` progress-redraw segments;
            // keep only the content after the last one.
            let last_segment = line.rsplit('\r').next().unwrap_or(line);
            last_segment.trim_end()
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_captures_stdout_and_exit_code() {
        let runner = CommandRunner::new("");
        let outcome = runner.run("echo", &["hello"], false).await;
        assert!(outcome.success);
        assert_eq!(outcome.exit_code, 0);
        assert!(outcome.sanitised_output.contains("hello"));
    }

    #[tokio::test]
    async fn run_reports_nonzero_exit() {
        let runner = CommandRunner::new("");
        let outcome = runner.run("false", &[], false).await;
        assert!(!outcome.success);
        assert_ne!(outcome.exit_code, 0);
    }

    #[tokio::test]
    async fn run_handles_spawn_failure() {
        let runner = CommandRunner::new("");
        let outcome = runner.run("this-binary-does-not-exist", &[], false).await;
        assert!(!outcome.success);
        assert_eq!(outcome.exit_code, -1);
    }

    #[test]
    fn sanitise_strips_csi_sequences() {
        let raw = "\x1b[32mgreen\x1b[0m text";
        assert_eq!(sanitise_output(raw), "green text");
    }

    #[test]
    fn sanitise_collapses_carriage_return_redraws() {
        let raw = "progress: 10%\rprogress: 50%\rprogress: 100%";
        assert_eq!(sanitise_output(raw), "progress: 100%");
    }

    #[test]
    fn sanitise_removes_backspace_pairs() {
        let raw = "ab\x08c";
        assert_eq!(sanitise_output(raw), "ac");
    }

    #[test]
    fn sanitise_normalises_crlf_and_trims_trailing_whitespace() {
        let raw = "line one   \r\nline two\r\n";
        assert_eq!(sanitise_output(raw), "line one\nline two\n");
    }
}
