use thiserror::Error;

pub type DebugResult<T> = Result<T, DebugError>;

#[derive(Error, Debug)]
pub enum DebugError {
    #[error("transport: {0}")]
    Transport(#[from] std::io::Error),
    #[error("transport closed")]
    Disconnected,
    #[error("malformed message: {0}")]
    MalformedMessage(String),
    #[error("not implemented: {0}")]
    NotImplemented(String),
    #[error("invalid arguments for {command}: {message}")]
    InvalidArguments { command: String, message: String },
    #[error("unknown variablesReference {0}")]
    UnknownVariablesReference(i64),
    #[error("unknown frameId {0}")]
    UnknownFrame(i64),
    #[error("invalid source {0:?}")]
    InvalidSource(String),
    #[error("evaluation failed: {0}")]
    Evaluation(String),
    #[error("no exception is being reported")]
    NoException,
    #[error("failed to read script {path}: {source}")]
    Script {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("lua: {0}")]
    Lua(#[from] mlua::Error),
    #[error("the runtime was created without the `debug` library")]
    MissingDebugLibrary,
    #[error("internal error: {0}")]
    Internal(String),
}

/// Numeric error ids carried in the `error.id` field of failed responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorId {
    Internal = 1000,
    NotImplemented = 1001,
    MalformedMessage = 1002,
    InvalidArguments = 1003,
    UnknownReference = 1010,
    UnknownFrame = 1011,
    InvalidSource = 1020,
    Evaluation = 1030,
    NoException = 1040,
}

impl DebugError {
    pub fn error_id(&self) -> ErrorId {
        match self {
            DebugError::Transport(_)
            | DebugError::Disconnected
            | DebugError::Script { .. }
            | DebugError::Lua(_)
            | DebugError::MissingDebugLibrary
            | DebugError::Internal(_) => ErrorId::Internal,
            DebugError::MalformedMessage(_) => ErrorId::MalformedMessage,
            DebugError::NotImplemented(_) => ErrorId::NotImplemented,
            DebugError::InvalidArguments { .. } => ErrorId::InvalidArguments,
            DebugError::UnknownVariablesReference(_) => ErrorId::UnknownReference,
            DebugError::UnknownFrame(_) => ErrorId::UnknownFrame,
            DebugError::InvalidSource(_) => ErrorId::InvalidSource,
            DebugError::Evaluation(_) => ErrorId::Evaluation,
            DebugError::NoException => ErrorId::NoException,
        }
    }

    /// Short machine-facing message used as the response `message` field.
    pub fn short_message(&self) -> &'static str {
        match self.error_id() {
            ErrorId::Internal => "internalError",
            ErrorId::NotImplemented => "notImplemented",
            ErrorId::MalformedMessage => "malformedMessage",
            ErrorId::InvalidArguments => "invalidArguments",
            ErrorId::UnknownReference => "unknownReference",
            ErrorId::UnknownFrame => "unknownFrame",
            ErrorId::InvalidSource => "invalidSource",
            ErrorId::Evaluation => "evaluationFailed",
            ErrorId::NoException => "noException",
        }
    }
}
