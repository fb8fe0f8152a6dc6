use std::path::PathBuf;

use crate::resolver::Platform;

/// Message shown (and reported) when the backend rejects the upload token.
pub const AUTH_FAILURE_MESSAGE: &str = "Upload token is invalid or missing!";

/// Problems with the collected parameters. None of these ever reach the network.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("no upload token given - pass --upload-token or set WALDO_UPLOAD_TOKEN")]
    MissingCredential,
    #[error("no {expected} found for {platform:?} - pass an explicit path")]
    MissingArtifact {
        platform: Platform,
        expected: &'static str,
    },
    #[error("unable to read {}: {reason}", .path.display())]
    UnreadableFile { path: PathBuf, reason: String },
    #[error("variant name must not be empty")]
    EmptyVariantName,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("{message}")]
    Auth { message: String },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("backend returned {status}: {message}")]
    Backend { status: u16, message: String },
    #[error("failed to archive {}: {reason}", .path.display())]
    Archive { path: PathBuf, reason: String },
    #[error("unexpected response from backend: {0}")]
    InvalidResponse(String),
    #[error("waldo CLI exited with {}: {message}", .code.map(|c| c.to_string()).unwrap_or_else(|| "signal".to_owned()))]
    Tool { code: Option<i32>, message: String },
    #[error("failed to provision waldo CLI: {0}")]
    Provision(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Terminal states of one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalState {
    Succeeded,
    AuthFailed,
    Failed,
    TimedOut,
}

impl UploadError {
    pub fn auth() -> Self {
        UploadError::Auth {
            message: AUTH_FAILURE_MESSAGE.to_owned(),
        }
    }

    pub fn terminal_state(&self) -> TerminalState {
        match self {
            UploadError::Auth { .. } => TerminalState::AuthFailed,
            UploadError::Transport(TransportError::Timeout(_)) => TerminalState::TimedOut,
            _ => TerminalState::Failed,
        }
    }
}
