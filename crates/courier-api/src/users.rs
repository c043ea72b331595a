use axum::{Extension, Json, extract::State, http::StatusCode};
use tracing::error;
use uuid::Uuid;

use courier_types::api::{Claims, ContactResponse};
use courier_types::models::User;

use crate::auth::AppState;

/// Contact list: every other registered user, with the latest direct
/// message snippet and the caller's unread count.
pub async fn list_contacts(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Vec<ContactResponse>>, StatusCode> {
    let db = state.db.clone();
    let viewer = claims.sub.to_string();

    let rows = tokio::task::spawn_blocking(move || db.list_contacts(&viewer, &courier_db::now()))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    let contacts: Vec<ContactResponse> = rows
        .into_iter()
        .filter_map(|row| {
            let id: Uuid = row.id.parse().ok()?;
            Some(ContactResponse {
                id,
                username: row.username,
                name: row.name,
                avatar: row.avatar,
                last_message: row.last_message,
                unread_count: row.unread_count,
            })
        })
        .collect();

    Ok(Json(contacts))
}

/// The caller's own profile, resolved from the token.
pub async fn get_me(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<User>, StatusCode> {
    let db = state.db.clone();
    let me = claims.sub.to_string();

    let row = tokio::task::spawn_blocking(move || db.get_user_by_id(&me))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .ok_or(StatusCode::NOT_FOUND)?;

    Ok(Json(User {
        id: claims.sub,
        username: row.username,
        name: row.name,
        avatar: row.avatar,
        created_at: courier_db::parse_timestamp(&row.created_at),
    }))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use courier_db::Database;
    use courier_db::models::NewMessage;

    use super::*;
    use crate::auth::AppStateInner;

    fn test_state() -> AppState {
        Arc::new(AppStateInner {
            db: Arc::new(Database::open_in_memory().unwrap()),
            jwt_secret: "test-secret".into(),
        })
    }

    fn add_user(state: &AppState, username: &str) -> Uuid {
        let id = Uuid::new_v4();
        state
            .db
            .create_user(&id.to_string(), username, "hash", username, &courier_db::now())
            .unwrap();
        id
    }

    fn claims_for(user_id: Uuid, username: &str) -> Claims {
        Claims {
            sub: user_id,
            username: username.into(),
            exp: usize::MAX,
        }
    }

    #[tokio::test]
    async fn contacts_exclude_the_caller_and_count_unread() {
        let state = test_state();
        let alice = add_user(&state, "alice");
        let bob = add_user(&state, "bob");

        state
            .db
            .insert_message(&NewMessage {
                id: &Uuid::new_v4().to_string(),
                sender_id: &bob.to_string(),
                recipient_id: Some(&alice.to_string()),
                group_id: None,
                content: "unread",
                kind: "text",
                file_url: None,
                reply_to: None,
                reply_snippet: None,
                expires_at: None,
                created_at: &courier_db::now(),
            })
            .unwrap();

        let Json(contacts) =
            list_contacts(State(state), Extension(claims_for(alice, "alice")))
                .await
                .unwrap();

        assert_eq!(contacts.len(), 1);
        assert_eq!(contacts[0].id, bob);
        assert_eq!(contacts[0].unread_count, 1);
        assert_eq!(contacts[0].last_message.as_deref(), Some("unread"));
    }

    #[tokio::test]
    async fn me_returns_own_profile() {
        let state = test_state();
        let alice = add_user(&state, "alice");

        let Json(profile) = get_me(State(state), Extension(claims_for(alice, "alice")))
            .await
            .unwrap();
        assert_eq!(profile.id, alice);
        assert_eq!(profile.username, "alice");
    }
}
