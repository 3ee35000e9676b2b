pub mod commands;
pub mod events;
pub mod request;

pub use commands::{
    decode_command, decode_command_bytes, Command, CommandDecodeError, CommandDecodeErrorKind,
};
pub use events::{record_event, EventWriter, Status, StatusSink};
pub use request::{GenerationRequest, ParameterUpdate};
