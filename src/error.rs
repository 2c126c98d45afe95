use crate::catalog::VoiceRecord;

/// Coarse classification used when reporting a [`ConsoleError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Lookup,
    Engine,
}

/// Failures surfaced by the command dispatcher. None of them end the session.
#[derive(Debug, thiserror::Error)]
pub enum ConsoleError {
    #[error("{message}")]
    Validation {
        message: String,
        usage: &'static str,
    },
    #[error("voice '{requested}' not found")]
    VoiceNotFound {
        requested: String,
        suggestions: Vec<VoiceRecord>,
        listing: Vec<VoiceRecord>,
        remaining: usize,
    },
    #[error("{message}")]
    NoMatch {
        message: String,
        hint: &'static str,
    },
    #[error("error speaking text: {0:#}")]
    Engine(anyhow::Error),
}

impl ConsoleError {
    pub fn validation(message: impl Into<String>, usage: &'static str) -> Self {
        Self::Validation {
            message: message.into(),
            usage,
        }
    }

    pub fn no_match(message: impl Into<String>, hint: &'static str) -> Self {
        Self::NoMatch {
            message: message.into(),
            hint,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } => ErrorKind::Validation,
            Self::VoiceNotFound { .. } | Self::NoMatch { .. } => ErrorKind::Lookup,
            Self::Engine(_) => ErrorKind::Engine,
        }
    }
}
