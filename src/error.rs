use thiserror::Error;

#[derive(Error, Debug)]
pub enum HomeguardError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Forbidden transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Illegal operation: {message}")]
    IllegalOperation { message: String },

    #[error("Camera flag {flag} is already set")]
    AlreadyInState { flag: String },

    #[error("Camera busy: {message}")]
    Busy { message: String },

    #[error("Invalid duration string {input:?}")]
    DurationParse { input: String },

    #[error("Persistence error: {message}")]
    Persistence { message: String },
}

impl HomeguardError {
    pub fn illegal_operation<S: Into<String>>(message: S) -> Self {
        Self::IllegalOperation {
            message: message.into(),
        }
    }

    pub fn busy<S: Into<String>>(message: S) -> Self {
        Self::Busy {
            message: message.into(),
        }
    }

    pub fn persistence<S: Into<String>>(message: S) -> Self {
        Self::Persistence {
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, HomeguardError>;
