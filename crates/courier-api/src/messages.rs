use std::collections::HashMap;

use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use tracing::error;
use uuid::Uuid;

use courier_db::Database;
use courier_db::models::MessageRow;
use courier_gateway::dispatch::payload_from_row;
use courier_types::api::{Claims, HistoryQuery};
use courier_types::events::MessagePayload;
use courier_types::models::ReadReceipt;

use crate::auth::AppState;

const MAX_PAGE_LIMIT: u32 = 100;

/// Direct history between the caller and `partner`, both directions,
/// oldest first. Expired rows never appear; deleted rows come back
/// masked.
pub async fn get_direct_messages(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Vec<MessagePayload>>, StatusCode> {
    let partner = query.partner.ok_or(StatusCode::BAD_REQUEST)?;
    let (limit, offset) = page_window(&query)?;

    let db = state.db.clone();
    let me = claims.sub.to_string();
    let partner = partner.to_string();

    let messages = run_blocking(move || {
        let rows = db
            .direct_history(&me, &partner, limit, offset, &courier_db::now())
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        attach_state(&db, rows)
    })
    .await?;

    Ok(Json(messages))
}

/// Group history, member-only. Same pagination and masking rules as the
/// direct endpoint, plus per-reader receipts.
pub async fn get_group_messages(
    State(state): State<AppState>,
    Path(group_id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Vec<MessagePayload>>, StatusCode> {
    let (limit, offset) = page_window(&query)?;

    let db = state.db.clone();
    let gid = group_id.to_string();
    let me = claims.sub.to_string();

    let messages = run_blocking(move || {
        if db.get_group(&gid).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?.is_none() {
            return Err(StatusCode::NOT_FOUND);
        }
        if !db.is_member(&gid, &me).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)? {
            return Err(StatusCode::FORBIDDEN);
        }
        let rows = db
            .group_history(&gid, limit, offset, &courier_db::now())
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        attach_state(&db, rows)
    })
    .await?;

    Ok(Json(messages))
}

fn page_window(query: &HistoryQuery) -> Result<(u32, u32), StatusCode> {
    if query.page < 1 || query.limit < 1 {
        return Err(StatusCode::BAD_REQUEST);
    }
    let limit = query.limit.min(MAX_PAGE_LIMIT);
    Ok((limit, (query.page - 1) * limit))
}

/// Join reactions and read receipts onto a page of rows, then build the
/// client-facing payloads (which is where deleted content gets masked).
fn attach_state(db: &Database, rows: Vec<MessageRow>) -> Result<Vec<MessagePayload>, StatusCode> {
    let ids: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();

    let reaction_rows = db
        .reactions_for_messages(&ids)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    let receipt_rows = db
        .receipts_for_messages(&ids)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    let mut reactions: HashMap<String, HashMap<String, Vec<Uuid>>> = HashMap::new();
    for r in reaction_rows {
        if let Ok(user_id) = r.user_id.parse::<Uuid>() {
            reactions
                .entry(r.message_id)
                .or_default()
                .entry(r.emoji)
                .or_default()
                .push(user_id);
        }
    }

    let mut receipts: HashMap<String, Vec<ReadReceipt>> = HashMap::new();
    for r in receipt_rows {
        if let Ok(user_id) = r.user_id.parse::<Uuid>() {
            receipts.entry(r.message_id).or_default().push(ReadReceipt {
                user_id,
                read_at: courier_db::parse_timestamp(&r.read_at),
            });
        }
    }

    Ok(rows
        .into_iter()
        .map(|row| {
            let message_reactions = reactions.remove(&row.id).unwrap_or_default();
            let read_by = receipts.remove(&row.id).unwrap_or_default();
            payload_from_row(row, message_reactions, read_by)
        })
        .collect())
}

async fn run_blocking<T, F>(f: F) -> Result<T, StatusCode>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StatusCode> + Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| {
        error!("spawn_blocking join error: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?
}
