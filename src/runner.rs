//! Argument resolution and subprocess execution for a single probe call.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::config::ProbeDefinition;

/// Sentinel exit code: the process could not be started or its real exit
/// status is unavailable (e.g. killed by a signal).
pub const EXIT_CODE_UNAVAILABLE: i32 = 999;

/// Outcome of one probe command invocation.
#[derive(Debug, Clone)]
pub struct RunResult {
    /// Real exit status, or [`EXIT_CODE_UNAVAILABLE`].
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// Wall-clock time from spawn to exit.
    pub duration: Duration,
}

impl RunResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Resolve the probe's argument list against a request's query parameters,
/// strictly in declaration order.
///
/// Per argument: the query value if the argument is dynamic and the caller
/// supplied one, else the declared default, else nothing at all. An omitted
/// argument is a skip, not an empty string, which shifts the position of
/// everything after it — documented behavior, significant for commands that
/// distinguish omission from `""`.
pub fn build_command(
    probe: &ProbeDefinition,
    params: &HashMap<String, String>,
) -> Vec<String> {
    let mut args = Vec::with_capacity(probe.argument_order.len());

    for name in &probe.argument_order {
        // Load-time validation guarantees every ordered name has an entry.
        let Some(argument) = probe.arguments.get(name) else {
            continue;
        };
        let mut value: Option<&String> = None;

        if argument.dynamic {
            value = params.get(name);
        }

        if value.is_none() {
            value = argument.default_value.as_ref();
        }

        if let Some(value) = value {
            debug!(argument = %name, %value, "append argument");
            args.push(value.clone());
        }
    }

    args
}

/// Run `command` with `args`, capturing stdout and stderr in full.
///
/// Arguments are passed as a discrete vector with no shell involved, so
/// argument values cannot inject further commands. There is no internal
/// timeout: a hanging command holds this call, and with it the request,
/// indefinitely — the surrounding HTTP deadline is the only bound.
pub async fn run(command: &str, args: &[String]) -> RunResult {
    debug!(%command, ?args, "start cmd");
    let start = Instant::now();

    let output = tokio::process::Command::new(command)
        .args(args)
        .output()
        .await;

    let duration = start.elapsed();
    debug!(?duration, "end cmd");

    match output {
        Ok(output) => RunResult {
            exit_code: output.status.code().unwrap_or(EXIT_CODE_UNAVAILABLE),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            duration,
        },
        Err(err) => {
            debug!(%command, %err, "cmd could not be started");
            RunResult {
                exit_code: EXIT_CODE_UNAVAILABLE,
                stdout: String::new(),
                stderr: String::new(),
                duration,
            }
        }
    }
}
