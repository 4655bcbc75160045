mod config;
mod env;

use std::time::Duration;

use anyhow::{Context, Result};
use rabbitmq_json_client::{EnvelopeStream, RabbitmqClient};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

struct RelaySettings {
    url: String,
    queue_from: Vec<String>,
    queue_to: Vec<String>,
    reconnect_delay: Duration,
}

fn load_settings() -> Result<RelaySettings> {
    if let Some(path) = config::find_config_file() {
        let config = config::load_config(&path)?;
        info!("Using configuration file {}", path.display());
        return Ok(RelaySettings {
            reconnect_delay: config.reconnect_delay(),
            url: config.connection.uri,
            queue_from: config.queues.from,
            queue_to: config.queues.to,
        });
    }

    let config = env::Config::load().context("Failed to load configuration from environment")?;
    Ok(RelaySettings {
        url: config.rabbitmq_url,
        queue_from: config.queue_from,
        queue_to: config.queue_to,
        reconnect_delay: config.reconnect_delay,
    })
}

/// Forward every inbound message to all outbound queues, then acknowledge it.
async fn relay(client: &RabbitmqClient, stream: &EnvelopeStream, queue_to: &[String]) {
    while let Some(mut envelope) = stream.recv().await {
        info!(queue = %envelope.queue_name(), data = ?envelope.data(), "Message received");

        let mut forwarded = true;
        for queue in queue_to {
            if let Err(e) = client.send(queue, envelope.data()).await {
                error!(queue = %queue, error = %e, "Failed to send message");
                forwarded = false;
            }
        }

        let settled = if forwarded {
            envelope.success().await
        } else {
            envelope.requeue().await
        };
        if let Err(e) = settled {
            warn!(error = %e, "Failed to send response");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = load_settings()?;

    let client = RabbitmqClient::builder(&settings.url)
        .inbound(settings.queue_from)
        .outbound(settings.queue_to.clone())
        .reconnect_delay(settings.reconnect_delay)
        .connect()
        .await
        .context("Failed to create RabbitmqClient")?;
    info!("connected!");

    let stream = client.iterator().await.context("Failed to create iterator")?;

    tokio::select! {
        _ = relay(&client, &stream, &settings.queue_to) => {
            warn!("Message stream ended");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }

    if let Err(e) = client.stop().await {
        warn!(error = %e, "Failed to stop iteration");
    }
    client.close().await.context("Failed to close RabbitmqClient")?;
    Ok(())
}
