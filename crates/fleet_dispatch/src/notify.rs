//! Notification fan-out for command events.
//!
//! One broadcast channel per topic. A slow subscriber loses its oldest
//! events (and is told how many) instead of holding up the publisher.

use fleet_core::{CommandEvent, ServerId};
use futures_util::stream::{self, Stream};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// `commands`: every server.
    AllCommands,
    /// `server/{id}/commands`
    ServerCommands(ServerId),
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::AllCommands => f.write_str("commands"),
            Topic::ServerCommands(id) => write!(f, "server/{}/commands", id),
        }
    }
}

impl FromStr for Topic {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "commands" {
            return Ok(Topic::AllCommands);
        }
        s.strip_prefix("server/")
            .and_then(|rest| rest.strip_suffix("/commands"))
            .and_then(|id| id.parse().ok())
            .map(Topic::ServerCommands)
            .ok_or_else(|| format!("unknown topic '{}'", s))
    }
}

pub struct EventBus {
    backlog: usize,
    all: broadcast::Sender<CommandEvent>,
    servers: Mutex<HashMap<ServerId, broadcast::Sender<CommandEvent>>>,
}

impl EventBus {
    /// `backlog` is how many undelivered events each subscriber may hold.
    pub fn new(backlog: usize) -> Self {
        let backlog = backlog.max(1);
        let (all, _) = broadcast::channel(backlog);
        Self {
            backlog,
            all,
            servers: Mutex::new(HashMap::new()),
        }
    }

    fn servers(&self) -> MutexGuard<'_, HashMap<ServerId, broadcast::Sender<CommandEvent>>> {
        self.servers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Deliver to current subscribers of the event's server topic and of
    /// `commands`. Never blocks; with no subscribers the event is dropped.
    pub fn publish(&self, event: CommandEvent) {
        {
            let mut servers = self.servers();
            if let Some(tx) = servers.get(&event.server_id) {
                if tx.receiver_count() == 0 {
                    servers.remove(&event.server_id);
                } else {
                    let _ = tx.send(event.clone());
                }
            }
        }
        let _ = self.all.send(event);
    }

    pub fn subscribe(&self, topic: Topic) -> Subscription {
        let rx = match topic {
            Topic::AllCommands => self.all.subscribe(),
            Topic::ServerCommands(id) => self
                .servers()
                .entry(id)
                .or_insert_with(|| broadcast::channel(self.backlog).0)
                .subscribe(),
        };
        tracing::debug!("New subscriber on {}", topic);
        Subscription {
            topic,
            rx,
            missed: 0,
        }
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        match topic {
            Topic::AllCommands => self.all.receiver_count(),
            Topic::ServerCommands(id) => self
                .servers()
                .get(&id)
                .map(|tx| tx.receiver_count())
                .unwrap_or(0),
        }
    }
}

pub struct Subscription {
    topic: Topic,
    rx: broadcast::Receiver<CommandEvent>,
    missed: u64,
}

impl Subscription {
    pub fn topic(&self) -> Topic {
        self.topic
    }

    /// Next event, skipping over any that were dropped for this subscriber.
    /// `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<CommandEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.missed += n;
                    tracing::warn!("Subscriber on {} fell behind, dropped {} events", self.topic, n);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Events dropped for this subscriber so far.
    pub fn missed(&self) -> u64 {
        self.missed
    }

    pub fn into_stream(self) -> impl Stream<Item = CommandEvent> + Send {
        stream::unfold(self, |mut sub| async move {
            let event = sub.recv().await?;
            Some((event, sub))
        })
    }
}
