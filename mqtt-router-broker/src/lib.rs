mod broker;
pub mod fanout;
pub mod store;
pub mod tree;

pub use broker::{
    Broker, BrokerConfig, BrokerMessage, ClientMessage, ConnectRequest, ConnectionId,
    OutgoingPublish, PublishRequest,
};
pub use fanout::{fan_out, publish_match, FanOutReport, Publication, Subscriber};
pub use store::{MemoryStore, Store, StoreError};
pub use tree::SubscriptionTree;
