//! Topic filter routing.
//!
//! The router maps each subscribed topic filter to the clients holding it. Matching
//! is a plain level by level predicate, see [`topic_matches`].

use dashmap::DashMap;

use crate::types::{ClientId, QoS, TopicFilter};

/// Per subscription options kept by the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubOpts {
    pub qos: QoS,
    /// v5, do not deliver the subscriber's own publishes back to it.
    pub no_local: bool,
}

impl SubOpts {
    #[inline]
    pub fn new(qos: QoS) -> Self {
        Self { qos, no_local: false }
    }
}

#[derive(Default)]
pub struct Router {
    routes: DashMap<TopicFilter, DashMap<ClientId, SubOpts>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a subscription, returns true when it did not exist before.
    pub fn add(&self, filter: &TopicFilter, client_id: &ClientId, opts: SubOpts) -> bool {
        self.routes.entry(filter.clone()).or_default().insert(client_id.clone(), opts).is_none()
    }

    /// Removes a subscription, returns whether one existed.
    pub fn remove(&self, filter: &str, client_id: &str) -> bool {
        let removed = match self.routes.get(filter) {
            Some(subs) => subs.remove(client_id).is_some(),
            None => return false,
        };
        self.routes.remove_if(filter, |_, subs| subs.is_empty());
        removed
    }

    /// Subscribers of `topic` with their delivery QoS ceilings, one entry per client.
    ///
    /// A client matching several filters gets the highest granted QoS.
    pub fn matches(&self, from: &str, topic: &str) -> Vec<(ClientId, QoS)> {
        let mut found: Vec<(ClientId, QoS)> = Vec::new();
        for route in self.routes.iter() {
            if !topic_matches(route.key(), topic) {
                continue;
            }
            for sub in route.value().iter() {
                let opts = sub.value();
                if opts.no_local && sub.key() == from {
                    continue;
                }
                match found.iter_mut().find(|(cid, _)| cid == sub.key()) {
                    Some((_, qos)) => *qos = (*qos).max(opts.qos),
                    None => found.push((sub.key().clone(), opts.qos)),
                }
            }
        }
        found
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Number of distinct subscribed topic filters.
    #[inline]
    pub fn len(&self) -> usize {
        self.routes.len()
    }
}

/// Whether `topic` is matched by `filter`.
///
/// `+` matches exactly one level and `#` the rest of the topic including its parent level.
/// Topics starting with `$` are not matched by filters starting with a wildcard.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut topic_levels = topic.split('/');
    for f in filter.split('/') {
        match f {
            "#" => return true,
            "+" => {
                if topic_levels.next().is_none() {
                    return false;
                }
            }
            level => {
                if topic_levels.next() != Some(level) {
                    return false;
                }
            }
        }
    }
    topic_levels.next().is_none()
}

/// A filter is valid when it is non empty and its wildcards occupy whole levels, `#` last.
pub fn is_valid_filter(filter: &str) -> bool {
    if filter.is_empty() || filter.contains('\0') {
        return false;
    }
    let levels: Vec<&str> = filter.split('/').collect();
    let last = levels.len() - 1;
    levels.iter().enumerate().all(|(i, level)| match *level {
        "#" => i == last,
        "+" => true,
        l => !l.contains(['+', '#']),
    })
}

/// Topic names of PUBLISH packets carry no wildcards.
#[inline]
pub fn is_valid_topic(topic: &str) -> bool {
    !topic.is_empty() && !topic.contains(['+', '#', '\0'])
}
