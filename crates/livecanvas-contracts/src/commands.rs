use std::fmt;

use serde_json::{Map, Value};

use crate::request::ParameterUpdate;

pub const SHUTDOWN_COMMAND: &str = "shutdown";

/// A decoded controller message.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    ParameterUpdate(ParameterUpdate),
    Shutdown,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CommandDecodeErrorKind {
    InvalidUtf8,
    InvalidJson,
    NotAnObject,
    InvalidField,
}

#[derive(Debug)]
pub struct CommandDecodeError {
    kind: CommandDecodeErrorKind,
    message: String,
}

impl CommandDecodeError {
    fn new(kind: CommandDecodeErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> CommandDecodeErrorKind {
        self.kind
    }
}

impl fmt::Display for CommandDecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CommandDecodeError {}

/// Decodes one raw input line. Bytes that are not UTF-8 are rejected rather
/// than replaced.
pub fn decode_command_bytes(raw: &[u8]) -> Result<Option<Command>, CommandDecodeError> {
    let line = std::str::from_utf8(raw).map_err(|err| {
        CommandDecodeError::new(
            CommandDecodeErrorKind::InvalidUtf8,
            format!("invalid UTF-8: {err}"),
        )
    })?;
    decode_command(line)
}

/// Decodes one input line. Blank lines yield `Ok(None)`.
pub fn decode_command(line: &str) -> Result<Option<Command>, CommandDecodeError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let value: Value = serde_json::from_str(trimmed)
        .map_err(|err| CommandDecodeError::new(CommandDecodeErrorKind::InvalidJson, err.to_string()))?;
    let Value::Object(record) = value else {
        return Err(CommandDecodeError::new(
            CommandDecodeErrorKind::NotAnObject,
            format!("expected a JSON object, got {}", json_kind(&value)),
        ));
    };
    command_from_record(record).map(Some)
}

fn command_from_record(record: Map<String, Value>) -> Result<Command, CommandDecodeError> {
    if record.get("command").and_then(Value::as_str) == Some(SHUTDOWN_COMMAND) {
        return Ok(Command::Shutdown);
    }
    let update: ParameterUpdate = serde_json::from_value(Value::Object(record)).map_err(|err| {
        CommandDecodeError::new(CommandDecodeErrorKind::InvalidField, err.to_string())
    })?;
    update
        .validate()
        .map_err(|message| CommandDecodeError::new(CommandDecodeErrorKind::InvalidField, message))?;
    Ok(Command::ParameterUpdate(update))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
