use std::env;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use dotenv::dotenv;
use rabbitmq_json_client::DEFAULT_RECONNECT_DELAY;

/// Relay settings taken from the environment (and a `.env` file, if present).
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub rabbitmq_url: String,
    pub queue_from: Vec<String>,
    pub queue_to: Vec<String>,
    pub reconnect_delay: Duration,
}

fn split_queues(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|queue| !queue.is_empty())
        .map(str::to_string)
        .collect()
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let rabbitmq_url = lookup("RABBITMQ_URL").ok_or_else(|| anyhow!("RABBITMQ_URL is not set"))?;
        let queue_from = lookup("QUEUE_FROM").map(|v| split_queues(&v)).unwrap_or_default();
        let queue_to = lookup("QUEUE_TO").map(|v| split_queues(&v)).unwrap_or_default();

        let reconnect_delay = match lookup("RABBITMQ_RECONNECT_DELAY_SECONDS") {
            Some(val) => Duration::from_secs(
                val.parse()
                    .context("RABBITMQ_RECONNECT_DELAY_SECONDS must be a whole number of seconds")?,
            ),
            None => DEFAULT_RECONNECT_DELAY,
        };

        Ok(Config {
            rabbitmq_url,
            queue_from,
            queue_to,
            reconnect_delay,
        })
    }
}
