use bx_core::diagnostics;
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    Ok,
    UserError,
    Failure,
}

#[derive(Debug, Clone)]
pub struct Outcome {
    pub status: CommandStatus,
    pub message: String,
    pub details: Value,
}

impl Outcome {
    pub fn success(message: impl Into<String>, details: Value) -> Self {
        Self {
            status: CommandStatus::Ok,
            message: message.into(),
            details,
        }
    }

    /// Typed cache failures are the caller's to fix; anything else is ours.
    pub fn from_error(err: &anyhow::Error) -> Self {
        let code = diagnostics::code_of(err);
        let status = if code == diagnostics::GENERIC {
            CommandStatus::Failure
        } else {
            CommandStatus::UserError
        };
        Self {
            status,
            message: format!("{err:#}"),
            details: json!({ "code": code }),
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self.status {
            CommandStatus::Ok => 0,
            CommandStatus::UserError => 1,
            CommandStatus::Failure => 2,
        }
    }

    pub fn to_json(&self, command: &str) -> Value {
        let status = match self.status {
            CommandStatus::Ok => "ok",
            CommandStatus::UserError => "user-error",
            CommandStatus::Failure => "error",
        };
        let details = match &self.details {
            Value::Object(_) => self.details.clone(),
            Value::Null => json!({}),
            other => json!({ "value": other }),
        };
        json!({
            "status": status,
            "message": format!("bx {command}: {}", self.message),
            "details": details,
        })
    }

    /// Lines printed after the message in human mode.
    pub fn human_lines(&self) -> Vec<String> {
        self.details
            .get("lines")
            .and_then(Value::as_array)
            .map(|lines| {
                lines
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}
