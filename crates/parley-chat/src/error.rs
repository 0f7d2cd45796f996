use thiserror::Error;

/// Domain failures for chat operations. Authentication is not here:
/// the gateway closes unauthenticated sockets and the REST middleware
/// answers 401 before any of this code runs.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("chat or user not found")]
    NotFound,

    #[error("not a member of this chat")]
    NotAMember,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, ChatError>;
