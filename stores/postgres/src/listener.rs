//! Feeds the in-process notification [Bus] from the database's `LISTEN`
//! channel, so every process connected to the same store observes commits
//! regardless of which process performed them.

use std::time::Duration;

use everlog::notify::{Bus, Notification};
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::task::JoinHandle;

use crate::schema::Schema;

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Spawns the long-lived listener task. Connection failures are logged
/// and retried: notifications are advisory, and subscriptions fall back
/// to polling while the listener is down.
pub(crate) fn spawn(pool: PgPool, schema: Schema, bus: Bus) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let mut listener = match PgListener::connect_with(&pool).await {
                Ok(listener) => listener,
                Err(error) => {
                    tracing::warn!(%error, "failed to open notification listener, retrying");
                    tokio::time::sleep(RECONNECT_DELAY).await;
                    continue;
                },
            };

            if let Err(error) = listener.listen(schema.channel()).await {
                tracing::warn!(
                    %error,
                    channel = schema.channel(),
                    "failed to listen on notification channel, retrying"
                );
                tokio::time::sleep(RECONNECT_DELAY).await;
                continue;
            }

            tracing::debug!(channel = schema.channel(), "listening for commit notifications");

            loop {
                match listener.recv().await {
                    Ok(message) => {
                        match serde_json::from_str::<Notification>(message.payload()) {
                            Ok(notification) => bus.publish(notification),
                            Err(error) => tracing::warn!(
                                %error,
                                payload = message.payload(),
                                "discarding malformed commit notification"
                            ),
                        }
                    },
                    Err(error) => {
                        tracing::warn!(%error, "notification listener lost its connection");
                        break;
                    },
                }
            }

            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    })
}
