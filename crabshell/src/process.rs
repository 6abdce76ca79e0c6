//! Blocking subprocess helpers for the external collaborators.

use std::path::Path;
use std::process::{Command, Output, Stdio};

use log::debug;

use crate::error::{Error, Result};

/// Lines of stdout/stderr kept in an [`Error::ExternalTool`].
pub const OUTPUT_TAIL_LINES: usize = 120;

/// Runs `command` to completion and fails with the captured output tail when
/// it exits non-zero.
pub fn run_checked(command: &mut Command, action: &str) -> Result<Output> {
    let rendered = describe(command);
    debug!("{action}: {rendered}");

    let output = command
        .stdin(Stdio::null())
        .output()
        .map_err(|error| Error::ExternalTool {
            action: action.to_string(),
            command: rendered.clone(),
            cwd: working_dir(command),
            status: "spawn failed".to_string(),
            stdout_tail: String::new(),
            stderr_tail: error.to_string(),
        })?;

    if output.status.success() {
        return Ok(output);
    }

    Err(Error::ExternalTool {
        action: action.to_string(),
        command: rendered,
        cwd: working_dir(command),
        status: output
            .status
            .code()
            .map(|code| code.to_string())
            .unwrap_or_else(|| "signal".to_string()),
        stdout_tail: tail(&String::from_utf8_lossy(&output.stdout), OUTPUT_TAIL_LINES),
        stderr_tail: tail(&String::from_utf8_lossy(&output.stderr), OUTPUT_TAIL_LINES),
    })
}

/// True when `program <arg>` starts and exits zero. Used to reject
/// placeholder binaries such as the macOS `java` stub.
pub fn answers(program: &Path, arg: &str) -> bool {
    Command::new(program)
        .arg(arg)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

pub fn describe(command: &Command) -> String {
    std::iter::once(command.get_program())
        .chain(command.get_args())
        .map(|part| part.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

fn working_dir(command: &Command) -> String {
    command
        .get_current_dir()
        .map(|dir| dir.display().to_string())
        .unwrap_or_else(|| ".".to_string())
}

pub fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}
