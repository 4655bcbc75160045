// src/rabbitmq/registry.rs

use std::collections::BTreeSet;

/// Inbound and outbound queue names, deduplicated once at construction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueRegistry {
    inbound: BTreeSet<String>,
    outbound: BTreeSet<String>,
}

impl QueueRegistry {
    pub fn new<I, O, S, T>(inbound: I, outbound: O) -> Self
    where
        I: IntoIterator<Item = S>,
        O: IntoIterator<Item = T>,
        S: Into<String>,
        T: Into<String>,
    {
        Self {
            inbound: inbound.into_iter().map(Into::into).collect(),
            outbound: outbound.into_iter().map(Into::into).collect(),
        }
    }

    pub fn inbound(&self) -> impl Iterator<Item = &str> {
        self.inbound.iter().map(String::as_str)
    }

    pub fn outbound(&self) -> impl Iterator<Item = &str> {
        self.outbound.iter().map(String::as_str)
    }

    /// Every queue named on either side, each once.
    pub fn all(&self) -> BTreeSet<&str> {
        self.inbound().chain(self.outbound()).collect()
    }

    pub fn is_outbound(&self, queue: &str) -> bool {
        self.outbound.contains(queue)
    }
}
