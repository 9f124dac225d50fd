use crate::protocol::QoS;
use crate::topic::{self, LEVEL_SEPARATOR, MULTI_LEVEL_WILDCARD, SINGLE_LEVEL_WILDCARD};
use std::collections::HashMap;
use tracing::debug;

pub type ClientId = String;

/// Subscription index keyed by topic level.
///
/// Wildcard levels are stored as ordinary children named `+` and `#`, so a
/// publish walks at most three branches per level instead of scanning every
/// filter. The router is plain data; the broker serializes access to it.
#[derive(Debug, Default)]
pub struct Router {
    root: Node,
    count: usize,
}

#[derive(Debug, Default)]
struct Node {
    children: HashMap<String, Node>,
    subscribers: HashMap<ClientId, QoS>,
}

impl Node {
    fn is_empty(&self) -> bool {
        self.children.is_empty() && self.subscribers.is_empty()
    }
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces the subscription of `client_id` to `filter`.
    /// Returns the previously granted QoS if the filter was already present.
    pub fn subscribe(&mut self, client_id: &str, filter: &str, qos: QoS) -> Option<QoS> {
        let mut node = &mut self.root;
        for level in filter.split(LEVEL_SEPARATOR) {
            node = node.children.entry(level.to_string()).or_default();
        }

        let previous = node.subscribers.insert(client_id.to_string(), qos);
        if previous.is_none() {
            self.count += 1;
        }
        debug!("SUBSCRIBE client_id: {}, filter: {}, qos: {:?}", client_id, filter, qos);
        previous
    }

    /// Removes one subscription. Returns true if it existed.
    pub fn unsubscribe(&mut self, client_id: &str, filter: &str) -> bool {
        let levels: Vec<&str> = filter.split(LEVEL_SEPARATOR).collect();
        let removed = Self::remove_from(&mut self.root, &levels, client_id);
        if removed {
            self.count -= 1;
            debug!("UNSUBSCRIBE client_id: {}, filter: {}", client_id, filter);
        }
        removed
    }

    fn remove_from(node: &mut Node, levels: &[&str], client_id: &str) -> bool {
        let Some((level, rest)) = levels.split_first() else {
            return node.subscribers.remove(client_id).is_some();
        };

        let Some(child) = node.children.get_mut(*level) else {
            return false;
        };
        let removed = Self::remove_from(child, rest, client_id);
        if child.is_empty() {
            node.children.remove(*level);
        }
        removed
    }

    /// Removes every subscription listed in `filters` for `client_id`.
    pub fn unsubscribe_all<'a>(&mut self, client_id: &str, filters: impl IntoIterator<Item = &'a String>) {
        for filter in filters {
            self.unsubscribe(client_id, filter);
        }
    }

    /// Returns every subscriber whose filters match `topic`. A client matched
    /// by several filters appears once with the highest granted QoS.
    pub fn matching(&self, topic: &str) -> HashMap<ClientId, QoS> {
        let levels: Vec<&str> = topic.split(LEVEL_SEPARATOR).collect();
        let mut result = HashMap::new();
        let skip_wildcards = topic::is_system_topic(topic);
        Self::collect(&self.root, &levels, skip_wildcards, &mut result);
        result
    }

    fn collect(node: &Node, levels: &[&str], skip_wildcards: bool, result: &mut HashMap<ClientId, QoS>) {
        if !skip_wildcards {
            if let Some(all) = node.children.get(MULTI_LEVEL_WILDCARD) {
                Self::merge(&all.subscribers, result);
            }
        }

        let Some((level, rest)) = levels.split_first() else {
            Self::merge(&node.subscribers, result);
            return;
        };

        if let Some(child) = node.children.get(*level) {
            Self::collect(child, rest, false, result);
        }
        if !skip_wildcards {
            if let Some(child) = node.children.get(SINGLE_LEVEL_WILDCARD) {
                Self::collect(child, rest, false, result);
            }
        }
    }

    fn merge(subscribers: &HashMap<ClientId, QoS>, result: &mut HashMap<ClientId, QoS>) {
        for (client_id, qos) in subscribers {
            result
                .entry(client_id.clone())
                .and_modify(|granted| *granted = (*granted).max(*qos))
                .or_insert(*qos);
        }
    }

    /// Number of (client, filter) pairs currently indexed.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}
