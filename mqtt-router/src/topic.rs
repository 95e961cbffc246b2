use crate::{
    MULTI_LEVEL_WILDCARD_STR, SINGLE_LEVEL_WILDCARD_STR, SYS_TOPIC_PREFIX, TOPIC_SEPARATOR,
};
use thiserror::Error;

/// Every topic belongs to exactly one namespace, and each namespace has its
/// own subscription tree. A `#` subscription can never reach across trees,
/// which keeps `$SYS` topics away from ordinary wildcard subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    Plain,
    LeadingSlash,
    SysReserved,
}

impl Namespace {
    pub const ALL: [Namespace; 3] =
        [Namespace::Plain, Namespace::LeadingSlash, Namespace::SysReserved];

    pub fn classify(topic: &str) -> Self {
        if topic.starts_with(SYS_TOPIC_PREFIX) {
            Namespace::SysReserved
        } else if topic.starts_with(TOPIC_SEPARATOR) {
            Namespace::LeadingSlash
        } else {
            Namespace::Plain
        }
    }

    /// Label of the root node of this namespace's tree.
    pub fn root_label(self) -> &'static str {
        match self {
            Namespace::Plain => "",
            Namespace::LeadingSlash => "/",
            Namespace::SysReserved => SYS_TOPIC_PREFIX,
        }
    }

    pub fn index(self) -> usize {
        match self {
            Namespace::Plain => 0,
            Namespace::LeadingSlash => 1,
            Namespace::SysReserved => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopicParseError {
    #[error("topic is empty")]
    EmptyTopic,
    #[error("could not allocate topic levels")]
    AllocationFailure,
}

#[derive(Debug, PartialEq)]
pub enum TopicLevel<'a> {
    Concrete(&'a str),
    SingleLevelWildcard,
    MultiLevelWildcard,
}

impl<'a> From<&'a str> for TopicLevel<'a> {
    fn from(level: &'a str) -> Self {
        match level {
            SINGLE_LEVEL_WILDCARD_STR => TopicLevel::SingleLevelWildcard,
            MULTI_LEVEL_WILDCARD_STR => TopicLevel::MultiLevelWildcard,
            _ => TopicLevel::Concrete(level),
        }
    }
}

/// A topic split into its levels.
///
/// Tokenizing never looks at wildcard characters, `+` and `#` come out as
/// ordinary levels. Empty levels are kept, so `a//b` has three levels and
/// only matches itself.
#[derive(Debug, Clone, PartialEq)]
pub struct TopicTokens<'a> {
    namespace: Namespace,
    levels: Vec<&'a str>,
}

impl<'a> TopicTokens<'a> {
    pub fn tokenize(topic: &'a str) -> Result<Self, TopicParseError> {
        if topic.is_empty() {
            return Err(TopicParseError::EmptyTopic);
        }

        let namespace = Namespace::classify(topic);

        // `$SYS` stays in the level list, a leading slash does not.
        let body = match namespace {
            Namespace::LeadingSlash => topic.strip_prefix(TOPIC_SEPARATOR).unwrap_or(topic),
            Namespace::Plain | Namespace::SysReserved => topic,
        };

        let level_count = body.matches(TOPIC_SEPARATOR).count() + 1;
        let mut levels = Vec::new();
        levels.try_reserve_exact(level_count).map_err(|_| TopicParseError::AllocationFailure)?;
        levels.extend(body.split(TOPIC_SEPARATOR));

        Ok(Self { namespace, levels })
    }

    pub fn namespace(&self) -> Namespace {
        self.namespace
    }

    pub fn levels(&self) -> &[&'a str] {
        &self.levels
    }
}

#[cfg(test)]
mod tests {
    use crate::topic::{Namespace, TopicLevel, TopicParseError, TopicTokens};

    fn tokens(topic: &str) -> (Namespace, Vec<&str>) {
        let tokens = TopicTokens::tokenize(topic).unwrap();
        (tokens.namespace(), tokens.levels().to_vec())
    }

    #[test]
    fn test_plain_topics() {
        assert_eq!(tokens("home"), (Namespace::Plain, vec!["home"]));
        assert_eq!(
            tokens("home/kitchen/temperature"),
            (Namespace::Plain, vec!["home", "kitchen", "temperature"])
        );
        assert_eq!(tokens("sport/+/player/#"), (Namespace::Plain, vec!["sport", "+", "player", "#"]));
    }

    #[test]
    fn test_empty_levels_are_kept() {
        assert_eq!(tokens("a//b"), (Namespace::Plain, vec!["a", "", "b"]));
        assert_eq!(tokens("a/"), (Namespace::Plain, vec!["a", ""]));
        assert_eq!(tokens("//"), (Namespace::LeadingSlash, vec!["", ""]));
    }

    #[test]
    fn test_leading_slash_is_stripped() {
        assert_eq!(tokens("/a/b"), (Namespace::LeadingSlash, vec!["a", "b"]));
        assert_eq!(tokens("/"), (Namespace::LeadingSlash, vec![""]));
    }

    #[test]
    fn test_sys_topics_keep_their_prefix() {
        assert_eq!(
            tokens("$SYS/broker/uptime"),
            (Namespace::SysReserved, vec!["$SYS", "broker", "uptime"])
        );
        assert_eq!(tokens("$SYS"), (Namespace::SysReserved, vec!["$SYS"]));
        assert_eq!(tokens("$SYSTEM/x"), (Namespace::SysReserved, vec!["$SYSTEM", "x"]));
        assert_eq!(tokens("$share/x"), (Namespace::Plain, vec!["$share", "x"]));
    }

    #[test]
    fn test_empty_topic() {
        assert_eq!(TopicTokens::tokenize(""), Err(TopicParseError::EmptyTopic));
    }

    #[test]
    fn test_topic_level() {
        assert_eq!(TopicLevel::from("+"), TopicLevel::SingleLevelWildcard);
        assert_eq!(TopicLevel::from("#"), TopicLevel::MultiLevelWildcard);
        assert_eq!(TopicLevel::from("#a"), TopicLevel::Concrete("#a"));
        assert_eq!(TopicLevel::from(""), TopicLevel::Concrete(""));
    }

    #[test]
    fn test_root_labels() {
        let labels: Vec<_> = Namespace::ALL.iter().map(|n| n.root_label()).collect();
        assert_eq!(labels, vec!["", "/", "$SYS"]);

        for (i, namespace) in Namespace::ALL.iter().enumerate() {
            assert_eq!(namespace.index(), i);
        }
    }
}
