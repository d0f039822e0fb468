use lazy_static::lazy_static;
use log::{debug, info};
use regex::Regex;
use std::{
    collections::HashMap,
    sync::{
        mpsc::{self, TrySendError},
        Arc, Mutex, MutexGuard,
    },
    thread,
};
use thiserror::Error;

#[derive(Error, Clone, Debug, PartialEq, Eq)]
/// Errors raised while setting up publishers and subscriptions
pub enum BusError {
    /// Topic name does not resolve to a valid absolute name
    #[error("Invalid topic name \"{0}\"")]
    InvalidTopic(String),
    /// Node name is not a plain identifier
    #[error("Invalid node name \"{0}\"")]
    InvalidNode(String),
    /// The subscription worker thread could not be started
    #[error("Failed to spawn subscription worker: {0}")]
    Spawn(String),
}

/// Resolve a topic name relative to a node.
///
/// `~/name` is private to the node (`/<node>/name`), `/name` is absolute and
/// anything else is placed in the root namespace.
pub fn resolve_topic(node: &str, topic: &str) -> Result<String, BusError> {
    lazy_static! {
        static ref NODE: Regex =
            Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("Failed to compile regex");
        static ref NAME: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(/[A-Za-z_][A-Za-z0-9_]*)*$")
            .expect("Failed to compile regex");
    }
    if !NODE.is_match(node) {
        return Err(BusError::InvalidNode(node.into()));
    }
    if topic == "~" {
        return Ok(format!("/{node}"));
    }
    let (prefix, name) = if let Some(name) = topic.strip_prefix("~/") {
        (format!("/{node}/"), name)
    } else if let Some(name) = topic.strip_prefix('/') {
        ("/".to_string(), name)
    } else {
        ("/".to_string(), topic)
    };
    if NAME.is_match(name) {
        Ok(prefix + name)
    } else {
        Err(BusError::InvalidTopic(topic.into()))
    }
}

struct Subscriber<T> {
    id: u64,
    tx: mpsc::SyncSender<T>,
}

struct Registry<T> {
    next_id: u64,
    topics: HashMap<String, Vec<Subscriber<T>>>,
}

/// An in-process publish/subscribe bus carrying messages of type `T`.
///
/// Every subscription owns a bounded queue. Publishing never blocks: a
/// message that does not fit in a subscriber's queue is dropped for that
/// subscriber. Delivery is in order per publisher and at most once.
pub struct Bus<T> {
    inner: Arc<Mutex<Registry<T>>>,
}

impl<T> Clone for Bus<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Bus<T> {
    fn registry(&self) -> MutexGuard<'_, Registry<T>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of live subscriptions on an absolute topic name
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.registry().topics.get(topic).map_or(0, |subs| subs.len())
    }
}

impl<T: Clone + Send + 'static> Default for Bus<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> Bus<T> {
    /// Create an empty bus
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Registry {
                next_id: 0,
                topics: HashMap::new(),
            })),
        }
    }

    /// Create a publisher for `topic` as seen from `node`. Queues live on the
    /// subscriber side, see [`Bus::create_subscription`].
    pub fn create_publisher(&self, node: &str, topic: &str) -> Result<Publisher<T>, BusError> {
        let topic = resolve_topic(node, topic)?;
        debug!("Publisher created on {topic}");
        Ok(Publisher {
            bus: self.clone(),
            topic,
        })
    }

    /// Subscribe to `topic` as seen from `node`.
    ///
    /// `callback` runs on a dedicated worker thread, once per message, in
    /// the order the messages were published.
    pub fn create_subscription<F>(
        &self,
        node: &str,
        topic: &str,
        depth: usize,
        mut callback: F,
    ) -> Result<Subscription<T>, BusError>
    where
        F: FnMut(T) + Send + 'static,
    {
        let topic = resolve_topic(node, topic)?;
        let (tx, rx) = mpsc::sync_channel::<T>(depth.max(1));
        let worker = thread::Builder::new()
            .name(format!("sub:{topic}"))
            .spawn(move || {
                while let Ok(msg) = rx.recv() {
                    callback(msg);
                }
            })
            .map_err(|e| BusError::Spawn(e.to_string()))?;
        let id = {
            let mut reg = self.registry();
            let id = reg.next_id;
            reg.next_id += 1;
            reg.topics
                .entry(topic.clone())
                .or_default()
                .push(Subscriber { id, tx });
            id
        };
        info!("Subscribed to {topic}");
        Ok(Subscription {
            bus: self.clone(),
            topic,
            id,
            worker: Some(worker),
        })
    }
}

/// Publishing end of a topic
pub struct Publisher<T> {
    bus: Bus<T>,
    topic: String,
}

impl<T: Clone> Publisher<T> {
    /// Absolute name of the topic
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Hand a message to every current subscriber of the topic
    pub fn publish(&self, msg: T) {
        let mut reg = self.bus.registry();
        let Some(subs) = reg.topics.get_mut(&self.topic) else {
            return;
        };
        subs.retain(|sub| match sub.tx.try_send(msg.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!("Queue full on {}, message dropped", self.topic);
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
    }
}

/// A live subscription. Dropping it unsubscribes and waits for the worker
/// to finish the messages already queued.
pub struct Subscription<T> {
    bus: Bus<T>,
    topic: String,
    id: u64,
    worker: Option<thread::JoinHandle<()>>,
}

impl<T> Subscription<T> {
    /// Absolute name of the topic
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        {
            let mut reg = self.bus.registry();
            if let Some(subs) = reg.topics.get_mut(&self.topic) {
                subs.retain(|sub| sub.id != self.id);
                if subs.is_empty() {
                    reg.topics.remove(&self.topic);
                }
            }
        }
        if let Some(hdl) = self.worker.take() {
            // dropped from inside our own callback
            if hdl.thread().id() != thread::current().id() {
                let _ = hdl.join();
            }
        }
    }
}
