use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use uuid::Uuid;

use courier_db::Database;
use courier_types::events::ServerEvent;

use crate::registry::Registry;

/// Background task that purges messages past their expiry.
///
/// Runs on a fixed interval independent of request traffic: physically
/// removes expired rows, then pushes a deletion notice to every party
/// who is connected at that moment. Clients that are offline simply
/// never see the message again — history reads filter expired rows on
/// their own.
pub async fn run_sweep_loop(db: Arc<Database>, registry: Registry, interval_secs: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));

    loop {
        interval.tick().await;

        match sweep(&db, &registry).await {
            Ok(count) => {
                if count > 0 {
                    info!("expiry sweep: purged {} messages", count);
                }
            }
            Err(e) => {
                warn!("expiry sweep error: {}", e);
            }
        }
    }
}

/// One sweep pass. Returns how many messages were purged.
pub async fn sweep(db: &Arc<Database>, registry: &Registry) -> anyhow::Result<usize> {
    let db_task = db.clone();
    let (purged, notices) = tokio::task::spawn_blocking(
        move || -> anyhow::Result<(usize, Vec<(Uuid, Vec<Uuid>)>)> {
            let expired = db_task.delete_expired(&courier_db::now())?;
            let purged = expired.len();

            let mut notices = Vec::with_capacity(expired.len());
            for row in expired {
                let message_id: Uuid = match row.id.parse() {
                    Ok(id) => id,
                    Err(_) => continue,
                };

                let audience: Vec<Uuid> = if let Some(group_id) = &row.group_id {
                    db_task
                        .get_group_members(group_id)?
                        .iter()
                        .filter_map(|m| m.parse().ok())
                        .collect()
                } else {
                    [Some(row.sender_id.as_str()), row.recipient_id.as_deref()]
                        .into_iter()
                        .flatten()
                        .filter_map(|id| id.parse().ok())
                        .collect()
                };

                notices.push((message_id, audience));
            }
            Ok((purged, notices))
        },
    )
    .await??;

    for (message_id, audience) in notices {
        registry
            .push_many(&audience, ServerEvent::MessageExpired { message_id })
            .await;
    }

    Ok(purged)
}
