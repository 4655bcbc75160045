// src/rabbitmq/supervisor.rs
//
// Background task that restores the connection after the broker drops it and
// puts the consumers back onto the caller's stream.

use std::sync::{Arc, Weak};

use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::client::{Link, Shared};

pub(crate) fn spawn(shared: Weak<Shared>) {
    tokio::spawn(run(shared));
}

async fn run(shared: Weak<Shared>) {
    loop {
        // Only the connection is held while waiting, so dropping every client
        // handle lets this task wind down on the next notification.
        let connection = match shared.upgrade() {
            Some(shared) => shared.connection().await,
            None => return,
        };
        connection.closed().await;
        drop(connection);

        let Some(shared) = shared.upgrade() else {
            return;
        };
        if shared.is_closed() {
            debug!("Client closed, supervisor exiting");
            return;
        }

        warn!("[RabbitmqClient] disconnected");
        if !reconnect(&shared).await {
            return;
        }
        if !resubscribe(&shared).await {
            return;
        }
    }
}

/// Redial until it works. Returns false if the client got closed meanwhile.
async fn reconnect(shared: &Arc<Shared>) -> bool {
    let mut attempt: u32 = 0;
    loop {
        sleep(shared.options.reconnect_delay).await;
        if shared.is_closed() {
            return false;
        }
        attempt += 1;

        match Link::establish(shared.connector.as_ref(), &shared.url).await {
            Ok(link) => {
                // Checked under the write guard so close() always sees the
                // link that ends up installed.
                let mut current = shared.link.write().await;
                if shared.is_closed() {
                    drop(current);
                    link.release().await;
                    return false;
                }
                *current = link;
                drop(current);
                info!(attempt, "[RabbitmqClient] reconnected");
                return true;
            }
            Err(e) => {
                warn!(
                    attempt,
                    error = %e,
                    retry_in = ?shared.options.reconnect_delay,
                    "Reconnect failed"
                );
            }
        }
    }
}

/// Move an active consumer session onto the new channel. Returns false when
/// that fails; the client is then left without consumers.
async fn resubscribe(shared: &Arc<Shared>) -> bool {
    let mut state = shared.consumer.lock().await;
    if !state.is_active() {
        return true;
    }

    if let Err(e) = shared.stop_session(&mut state).await {
        warn!(error = %e, "[RabbitmqClient] failed to stop on reconnecting");
    }

    match shared.start_session(&mut state).await {
        Ok(_) => {
            info!("[RabbitmqClient] consumers resubscribed");
            true
        }
        Err(e) => {
            error!(error = %e, "[RabbitmqClient] failed to iterate on reconnecting");
            false
        }
    }
}
