use log::debug;
use mqtt_router::{
    topic::{Namespace, TopicLevel, TopicTokens},
    types::{QoS, RouterError},
    MULTI_LEVEL_WILDCARD_STR,
};
use std::fmt;

#[derive(Debug)]
pub struct SubscriptionTreeNode<T> {
    label: String,
    children: Vec<SubscriptionTreeNode<T>>,
    subscribers: Vec<(T, QoS)>,
}

/// One subscription tree per topic namespace. The roots are created with the
/// tree and are never pruned.
#[derive(Debug)]
pub struct SubscriptionTree<T> {
    roots: [SubscriptionTreeNode<T>; 3],
}

impl<T: PartialEq> Default for SubscriptionTree<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: PartialEq> SubscriptionTree<T> {
    pub fn new() -> Self {
        Self {
            roots: [
                SubscriptionTreeNode::root(Namespace::Plain),
                SubscriptionTreeNode::root(Namespace::LeadingSlash),
                SubscriptionTreeNode::root(Namespace::SysReserved),
            ],
        }
    }

    /// Subscribe `subscriber` to `topic`. Subscribing again with the same
    /// subscriber replaces the QoS of the existing subscription and returns
    /// the old one.
    pub fn subscribe(
        &mut self,
        topic: &str,
        subscriber: T,
        qos: QoS,
    ) -> Result<Option<QoS>, RouterError> {
        let tokens = TopicTokens::tokenize(topic)?;
        self.insert(&tokens, subscriber, qos)
    }

    /// Remove `subscriber` from `topic`, returning the QoS it held.
    /// Unsubscribing from something that was never subscribed is not an error.
    pub fn unsubscribe(&mut self, topic: &str, subscriber: &T) -> Result<Option<QoS>, RouterError> {
        let tokens = TopicTokens::tokenize(topic)?;
        Ok(self.remove(&tokens, subscriber).map(|(_, qos)| qos))
    }

    pub fn insert(
        &mut self,
        topic: &TopicTokens,
        subscriber: T,
        qos: QoS,
    ) -> Result<Option<QoS>, RouterError> {
        let mut current_tree = &mut self.roots[topic.namespace().index()];

        for level in topic.levels() {
            let pos = match current_tree.children.iter().position(|c| c.label == *level) {
                Some(pos) => pos,
                None => {
                    let child = SubscriptionTreeNode::new(level)?;
                    current_tree
                        .children
                        .try_reserve(1)
                        .map_err(|_| RouterError::AllocationFailure)?;
                    current_tree.children.push(child);
                    current_tree.children.len() - 1
                },
            };

            current_tree = &mut current_tree.children[pos];
        }

        if let Some((_, existing_qos)) =
            current_tree.subscribers.iter_mut().find(|(s, _)| *s == subscriber)
        {
            let previous = *existing_qos;
            *existing_qos = qos;
            return Ok(Some(previous));
        }

        current_tree.subscribers.try_reserve(1).map_err(|_| RouterError::AllocationFailure)?;
        current_tree.subscribers.push((subscriber, qos));

        Ok(None)
    }

    pub fn remove(&mut self, topic: &TopicTokens, subscriber: &T) -> Option<(T, QoS)> {
        self.roots[topic.namespace().index()].remove(topic.levels(), subscriber)
    }

    /// Call `sub_fn` for every subscription matching `topic`, with the QoS
    /// the subscriber asked for.
    pub fn matching_subscribers<F: FnMut(&T, QoS)>(&self, topic: &TopicTokens, mut sub_fn: F) {
        self.roots[topic.namespace().index()].matching_subscribers(topic.levels(), &mut sub_fn);
    }

    /// Number of nodes below the root of `namespace`.
    pub fn node_count(&self, namespace: Namespace) -> usize {
        self.roots[namespace.index()].descendant_count()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.iter().all(|root| root.is_empty())
    }

    /// Indented rendering of one namespace tree, for diagnostics.
    pub fn dump(&self, namespace: Namespace) -> TreeDump<'_, T> {
        TreeDump { root: &self.roots[namespace.index()] }
    }
}

impl<T: PartialEq> SubscriptionTreeNode<T> {
    fn root(namespace: Namespace) -> Self {
        Self {
            label: namespace.root_label().to_string(),
            children: Vec::new(),
            subscribers: Vec::new(),
        }
    }

    fn new(level: &str) -> Result<Self, RouterError> {
        let mut label = String::new();
        label.try_reserve_exact(level.len()).map_err(|_| RouterError::AllocationFailure)?;
        label.push_str(level);

        Ok(Self { label, children: Vec::new(), subscribers: Vec::new() })
    }

    fn is_empty(&self) -> bool {
        self.subscribers.is_empty() && self.children.is_empty()
    }

    fn descendant_count(&self) -> usize {
        self.children.iter().map(|c| 1 + c.descendant_count()).sum()
    }

    fn remove(&mut self, levels: &[&str], subscriber: &T) -> Option<(T, QoS)> {
        let (level, rest) = match levels.split_first() {
            Some(split) => split,
            None => {
                let pos = self.subscribers.iter().position(|(s, _)| s == subscriber)?;
                return Some(self.subscribers.remove(pos));
            },
        };

        let pos = self.children.iter().position(|c| c.label == *level)?;
        let removed = self.children[pos].remove(rest, subscriber);

        // Prune on the way back up.
        if self.children[pos].is_empty() {
            let pruned = self.children.remove(pos);
            debug!("Pruned empty topic level \"{}\" below \"{}\"", pruned.label, self.label);
        }

        removed
    }

    /// A `#` child only counts as a match when nothing hangs below it.
    fn multi_level_wildcard(&self) -> Option<&SubscriptionTreeNode<T>> {
        self.children
            .iter()
            .find(|c| c.label == MULTI_LEVEL_WILDCARD_STR && c.children.is_empty())
    }

    fn visit_subscribers<F: FnMut(&T, QoS)>(&self, sub_fn: &mut F) {
        for (subscriber, qos) in &self.subscribers {
            sub_fn(subscriber, *qos);
        }
    }

    fn matching_subscribers<F: FnMut(&T, QoS)>(&self, levels: &[&str], sub_fn: &mut F) {
        let (level, rest) = match levels.split_first() {
            Some(split) => split,
            None => return,
        };

        for child in &self.children {
            match TopicLevel::from(child.label.as_str()) {
                TopicLevel::SingleLevelWildcard => {},
                TopicLevel::Concrete(label) if label == *level => {},
                TopicLevel::Concrete(_) | TopicLevel::MultiLevelWildcard => continue,
            }

            if rest.is_empty() {
                child.visit_subscribers(sub_fn);

                // `a/#` also matches `a` itself.
                if let Some(multi_level) = child.multi_level_wildcard() {
                    multi_level.visit_subscribers(sub_fn);
                }
            } else {
                child.matching_subscribers(rest, sub_fn);
            }
        }

        // `#` goes last, after the literal and `+` children.
        if let Some(multi_level) = self.multi_level_wildcard() {
            multi_level.visit_subscribers(sub_fn);
        }
    }
}

pub struct TreeDump<'a, T> {
    root: &'a SubscriptionTreeNode<T>,
}

impl<T: fmt::Display> SubscriptionTreeNode<T> {
    fn write_tree(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        write!(f, "{:indent$}{}", "", self.label, indent = depth * 2)?;

        for (subscriber, qos) in &self.subscribers {
            write!(f, " ({}, {})", subscriber, *qos as u8)?;
        }

        writeln!(f)?;

        for child in &self.children {
            child.write_tree(f, depth + 1)?;
        }

        Ok(())
    }
}

impl<T: fmt::Display> fmt::Display for TreeDump<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.root.write_tree(f, 0)
    }
}
