pub const TOPIC_SEPARATOR: char = '/';

pub const MULTI_LEVEL_WILDCARD_STR: &str = "#";
pub const SINGLE_LEVEL_WILDCARD_STR: &str = "+";

/// Prefix of broker-internal topics, which live in their own namespace.
pub const SYS_TOPIC_PREFIX: &str = "$SYS";

pub mod topic;
pub mod types;
