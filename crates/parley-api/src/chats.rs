use axum::{Extension, Json, extract::State, http::StatusCode};
use tracing::warn;
use uuid::Uuid;

use parley_types::api::{ChatMember, ChatSummary, Claims, CreateGroupRequest};
use parley_types::models::Chat;

use crate::{auth::AppState, status_for};

/// List every chat the caller belongs to, with member usernames
/// resolved. Message history is not included; clients fetch it over the
/// gateway when they join a chat.
pub async fn list_chats(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Vec<ChatSummary>>, StatusCode> {
    let db = state.db.clone();
    let caller = claims.sub.to_string();

    let summaries = tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<ChatSummary>> {
        let rows = db.chats_for_user(&caller)?;
        let chat_ids: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();

        let mut members_by_chat: std::collections::HashMap<String, Vec<ChatMember>> =
            std::collections::HashMap::new();
        for m in db.members_for_chats(&chat_ids)? {
            members_by_chat
                .entry(m.chat_id)
                .or_default()
                .push(ChatMember {
                    id: parse_id(&m.user_id),
                    username: m.username,
                });
        }

        Ok(rows
            .into_iter()
            .map(|row| ChatSummary {
                id: parse_id(&row.id),
                is_group: row.is_group,
                name: row.name,
                members: members_by_chat.remove(&row.id).unwrap_or_default(),
            })
            .collect())
    })
    .await
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    Ok(Json(summaries))
}

/// Create a group chat. The caller is always a member, whether or not
/// they listed themselves.
pub async fn create_group(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateGroupRequest>,
) -> Result<(StatusCode, Json<Chat>), StatusCode> {
    let chat = state
        .directory
        .create_group_chat(&req.name, &req.member_ids, claims.sub)
        .await
        .map_err(|err| status_for(&err))?;

    Ok((StatusCode::CREATED, Json(chat)))
}

fn parse_id(raw: &str) -> Uuid {
    raw.parse().unwrap_or_else(|_| {
        warn!(raw, "corrupt id in database");
        Uuid::nil()
    })
}
