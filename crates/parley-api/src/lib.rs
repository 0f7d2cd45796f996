pub mod auth;
pub mod chats;
pub mod middleware;
pub mod users;

use axum::http::StatusCode;
use parley_chat::ChatError;

/// REST mapping for domain failures. The gateway's lenient silent-drop
/// policy is an intent-path behavior; REST callers get real statuses.
pub fn status_for(err: &ChatError) -> StatusCode {
    match err {
        ChatError::NotFound => StatusCode::NOT_FOUND,
        ChatError::NotAMember => StatusCode::FORBIDDEN,
        ChatError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        ChatError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
