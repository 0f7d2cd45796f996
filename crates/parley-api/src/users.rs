use axum::{Extension, Json, extract::State, http::StatusCode};
use chrono::{DateTime, Utc};
use tracing::warn;
use uuid::Uuid;

use parley_db::models::UserRow;
use parley_types::{api::Claims, models::User};

use crate::auth::AppState;

/// List every registered user except the caller, with current presence.
pub async fn list_users(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Vec<User>>, StatusCode> {
    let db = state.db.clone();
    let caller = claims.sub.to_string();

    let rows = tokio::task::spawn_blocking(move || db.list_users_except(&caller))
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    Ok(Json(rows.into_iter().map(user_from_row).collect()))
}

fn user_from_row(row: UserRow) -> User {
    User {
        id: parse_id(&row.id),
        username: row.username,
        online: row.online,
        last_seen: row.last_seen.as_deref().and_then(parse_timestamp),
        bio: row.bio,
        avatar_url: row.avatar_url,
        created_at: parse_timestamp(&row.created_at).unwrap_or_else(Utc::now),
    }
}

fn parse_id(raw: &str) -> Uuid {
    raw.parse().unwrap_or_else(|_| {
        warn!(raw, "corrupt user id in database");
        Uuid::nil()
    })
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    match DateTime::parse_from_rfc3339(raw) {
        Ok(ts) => Some(ts.with_timezone(&Utc)),
        // Rows stamped by SQLite's datetime('now') default carry
        // "YYYY-MM-DD HH:MM:SS" with no timezone
        Err(_) => match chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
            Ok(ndt) => Some(ndt.and_utc()),
            Err(_) => {
                warn!(raw, "corrupt timestamp in database");
                None
            }
        },
    }
}
