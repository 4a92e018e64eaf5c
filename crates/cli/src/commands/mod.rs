pub mod config;
pub mod doctor;
pub mod smoke;

use serde::Serialize;
use serde_json::json;

/// What a subcommand prints and the process exit status that goes with it.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub exit_code: u8,
    pub output: String,
}

#[derive(Debug, Serialize)]
struct CommandFailure<'a> {
    command: &'a str,
    status: &'static str,
    error_class: &'a str,
    message: String,
}

impl CommandResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self { exit_code: 0, output: output.into() }
    }

    pub fn failure(
        command: &str,
        error_class: &str,
        message: impl Into<String>,
        exit_code: u8,
    ) -> Self {
        let payload =
            CommandFailure { command, status: "error", error_class, message: message.into() };
        Self { exit_code, output: render_json(&payload, command, false) }
    }
}

pub(crate) fn render_json<T: Serialize>(payload: &T, command: &str, pretty: bool) -> String {
    let rendered =
        if pretty { serde_json::to_string_pretty(payload) } else { serde_json::to_string(payload) };
    rendered.unwrap_or_else(|error| {
        json!({
            "command": command,
            "status": "error",
            "error_class": "serialization",
            "message": error.to_string(),
        })
        .to_string()
    })
}
