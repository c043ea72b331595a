use std::collections::HashSet;

use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
};
use tracing::{error, info};
use uuid::Uuid;

use courier_db::Database;
use courier_types::api::{
    Claims, CreateGroupRequest, CreateGroupResponse, GroupResponse, UpdateGroupRequest,
};
use courier_types::models::{GROUP_MEMBERS_MAX, GROUP_MEMBERS_MIN, GROUP_NAME_MAX, GROUP_NAME_MIN};

use crate::auth::AppState;

/// Groups the caller belongs to, most recently updated first.
pub async fn list_groups(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Vec<GroupResponse>>, StatusCode> {
    let db = state.db.clone();
    let me = claims.sub.to_string();

    let groups = run_blocking(move || {
        let rows = db
            .list_groups_for_user(&me)
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        rows.into_iter()
            .map(|row| group_response(&db, row.id, row.name, row.avatar, row.updated_at))
            .collect::<Result<Vec<_>, _>>()
    })
    .await?;

    Ok(Json(groups))
}

pub async fn create_group(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateGroupRequest>,
) -> Result<(StatusCode, Json<CreateGroupResponse>), StatusCode> {
    let name = validate_name(&req.name)?;

    // The creator is always a member; the request lists the others.
    let mut members: HashSet<Uuid> = req.members.into_iter().collect();
    members.insert(claims.sub);
    let members = validate_members(&members)?;

    let group_id = Uuid::new_v4();
    let db = state.db.clone();
    let creator = claims.sub;

    run_blocking(move || {
        for member in &members {
            if !db
                .user_exists(member)
                .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
            {
                return Err(StatusCode::BAD_REQUEST);
            }
        }
        db.create_group(
            &group_id.to_string(),
            &name,
            req.avatar.as_deref(),
            &creator.to_string(),
            &members,
            &courier_db::now(),
        )
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        info!("group {} created by {} with {} members", group_id, creator, members.len());
        Ok(())
    })
    .await?;

    Ok((StatusCode::CREATED, Json(CreateGroupResponse { group_id })))
}

/// Member-only update. The prior state is snapshotted into the group's
/// history before any field changes.
pub async fn update_group(
    State(state): State<AppState>,
    Path(group_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<UpdateGroupRequest>,
) -> Result<Json<GroupResponse>, StatusCode> {
    if req.name.is_none() && req.avatar.is_none() && req.members.is_none() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let name = req.name.as_deref().map(validate_name).transpose()?;
    let members = req
        .members
        .map(|m| validate_members(&m.into_iter().collect::<HashSet<_>>()))
        .transpose()?;

    let db = state.db.clone();
    let me = claims.sub;

    let group = run_blocking(move || {
        let gid = group_id.to_string();
        if db
            .get_group(&gid)
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
            .is_none()
        {
            return Err(StatusCode::NOT_FOUND);
        }
        if !db
            .is_member(&gid, &me.to_string())
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        {
            return Err(StatusCode::FORBIDDEN);
        }
        if let Some(members) = &members {
            for member in members {
                if !db
                    .user_exists(member)
                    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
                {
                    return Err(StatusCode::BAD_REQUEST);
                }
            }
        }

        db.update_group(
            &gid,
            name.as_deref(),
            req.avatar.as_deref(),
            members.as_deref(),
            &me.to_string(),
            &courier_db::now(),
        )
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

        let row = db
            .get_group(&gid)
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
            .ok_or(StatusCode::INTERNAL_SERVER_ERROR)?;
        group_response(&db, row.id, row.name, row.avatar, row.updated_at)
    })
    .await?;

    Ok(Json(group))
}

fn validate_name(name: &str) -> Result<String, StatusCode> {
    let trimmed = name.trim();
    if trimmed.chars().count() < GROUP_NAME_MIN || trimmed.chars().count() > GROUP_NAME_MAX {
        return Err(StatusCode::BAD_REQUEST);
    }
    Ok(trimmed.to_string())
}

fn validate_members(members: &HashSet<Uuid>) -> Result<Vec<String>, StatusCode> {
    if members.len() < GROUP_MEMBERS_MIN || members.len() > GROUP_MEMBERS_MAX {
        return Err(StatusCode::BAD_REQUEST);
    }
    Ok(members.iter().map(Uuid::to_string).collect())
}

fn group_response(
    db: &Database,
    id: String,
    name: String,
    avatar: Option<String>,
    updated_at: String,
) -> Result<GroupResponse, StatusCode> {
    let members = db
        .get_group_members(&id)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .iter()
        .filter_map(|m| m.parse().ok())
        .collect();

    Ok(GroupResponse {
        id: id.parse().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?,
        name,
        avatar,
        members,
        updated_at: courier_db::parse_timestamp(&updated_at),
    })
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

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use courier_db::Database;

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

    async fn make_group(state: &AppState, creator: Uuid, others: &[Uuid]) -> Uuid {
        let (status, Json(resp)) = create_group(
            State(state.clone()),
            Extension(claims_for(creator, "creator")),
            Json(CreateGroupRequest {
                name: "the group".into(),
                avatar: None,
                members: others.to_vec(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        resp.group_id
    }

    #[tokio::test]
    async fn create_rejects_bad_names_and_small_member_sets() {
        let state = test_state();
        let alice = add_user(&state, "alice");
        let bob = add_user(&state, "bob");

        let err = create_group(
            State(state.clone()),
            Extension(claims_for(alice, "alice")),
            Json(CreateGroupRequest {
                name: "ab".into(),
                avatar: None,
                members: vec![bob],
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err, StatusCode::BAD_REQUEST);

        // just the creator is below the minimum
        let err = create_group(
            State(state),
            Extension(claims_for(alice, "alice")),
            Json(CreateGroupRequest {
                name: "lonely".into(),
                avatar: None,
                members: vec![],
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn create_rejects_unknown_members() {
        let state = test_state();
        let alice = add_user(&state, "alice");

        let err = create_group(
            State(state),
            Extension(claims_for(alice, "alice")),
            Json(CreateGroupRequest {
                name: "ghosts".into(),
                avatar: None,
                members: vec![Uuid::new_v4()],
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn creator_is_always_included() {
        let state = test_state();
        let alice = add_user(&state, "alice");
        let bob = add_user(&state, "bob");

        let group = make_group(&state, alice, &[bob]).await;

        let members = state.db.get_group_members(&group.to_string()).unwrap();
        assert_eq!(members.len(), 2);
        assert!(members.contains(&alice.to_string()));
    }

    #[tokio::test]
    async fn update_is_member_only_and_returns_new_state() {
        let state = test_state();
        let alice = add_user(&state, "alice");
        let bob = add_user(&state, "bob");
        let outsider = add_user(&state, "outsider");

        let group = make_group(&state, alice, &[bob]).await;

        let err = update_group(
            State(state.clone()),
            Path(group),
            Extension(claims_for(outsider, "outsider")),
            Json(UpdateGroupRequest {
                name: Some("hijack".into()),
                avatar: None,
                members: None,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err, StatusCode::FORBIDDEN);

        let Json(updated) = update_group(
            State(state),
            Path(group),
            Extension(claims_for(alice, "alice")),
            Json(UpdateGroupRequest {
                name: Some("renamed".into()),
                avatar: None,
                members: None,
            }),
        )
        .await
        .unwrap();
        assert_eq!(updated.name, "renamed");
        assert_eq!(updated.members.len(), 2);
    }

    #[tokio::test]
    async fn empty_update_is_rejected() {
        let state = test_state();
        let alice = add_user(&state, "alice");
        let bob = add_user(&state, "bob");
        let group = make_group(&state, alice, &[bob]).await;

        let err = update_group(
            State(state),
            Path(group),
            Extension(claims_for(alice, "alice")),
            Json(UpdateGroupRequest {
                name: None,
                avatar: None,
                members: None,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_group_is_not_found() {
        let state = test_state();
        let alice = add_user(&state, "alice");

        let err = update_group(
            State(state),
            Path(Uuid::new_v4()),
            Extension(claims_for(alice, "alice")),
            Json(UpdateGroupRequest {
                name: Some("whatever".into()),
                avatar: None,
                members: None,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err, StatusCode::NOT_FOUND);
    }
}
