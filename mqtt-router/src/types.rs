use crate::topic::TopicParseError;
use num_enum::TryFromPrimitive;
use thiserror::Error;

/// Client ID
pub type ClientId = String;

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, TryFromPrimitive)]
pub enum QoS {
    AtMostOnce = 0,  // QoS 0
    AtLeastOnce = 1, // QoS 1
    ExactlyOnce = 2, // QoS 2
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Where a stored delivery is in its QoS handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DeliveryState {
    /// QoS 0, nothing to wait for.
    Publish,
    /// QoS 1 publish sent, waiting for PUBACK.
    PublishAwaitingAck,
    /// QoS 2 publish sent, waiting for PUBREC.
    PublishAwaitingReceipt,
    /// QoS 2 PUBREL sent, waiting for PUBCOMP.
    ReleaseAwaitingComplete,
}

impl DeliveryState {
    /// The state a fresh outbound publish starts in.
    pub fn initial(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => DeliveryState::Publish,
            QoS::AtLeastOnce => DeliveryState::PublishAwaitingAck,
            QoS::ExactlyOnce => DeliveryState::PublishAwaitingReceipt,
        }
    }
}

/// Handle to a message payload held by the store. The router never owns
/// payload bytes, it only passes this along.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageRef(pub u64);

/// A fully resolved instruction to deliver one message to one subscriber.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    pub client_id: ClientId,
    /// 0 when `qos` is `AtMostOnce`.
    pub message_id: u16,
    pub direction: Direction,
    pub state: DeliveryState,
    pub qos: QoS,
    pub retain: bool,
    pub message: MessageRef,
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum RouterError {
    #[error("allocation failed")]
    AllocationFailure,
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("delivery to client {client_id} failed: {reason}")]
    DeliveryFailure { client_id: ClientId, reason: String },
    #[error("could not allocate a message id for client {client_id}: {reason}")]
    CounterFailure { client_id: ClientId, reason: String },
    #[error("{failed} of {attempted} deliveries failed")]
    FanOutIncomplete { failed: usize, attempted: usize },
}

impl From<TopicParseError> for RouterError {
    fn from(err: TopicParseError) -> Self {
        match err {
            TopicParseError::EmptyTopic => RouterError::InvalidArgument("empty topic"),
            TopicParseError::AllocationFailure => RouterError::AllocationFailure,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        topic::TopicParseError,
        types::{DeliveryState, QoS, RouterError},
    };
    use std::convert::TryFrom;

    #[test]
    fn test_qos_ordering() {
        assert_eq!(QoS::ExactlyOnce.min(QoS::AtLeastOnce), QoS::AtLeastOnce);
        assert_eq!(QoS::AtMostOnce.min(QoS::ExactlyOnce), QoS::AtMostOnce);
        assert_eq!(QoS::try_from(2u8).unwrap(), QoS::ExactlyOnce);
        assert!(QoS::try_from(3u8).is_err());
    }

    #[test]
    fn test_initial_state() {
        assert_eq!(DeliveryState::initial(QoS::AtMostOnce), DeliveryState::Publish);
        assert_eq!(DeliveryState::initial(QoS::AtLeastOnce), DeliveryState::PublishAwaitingAck);
        assert_eq!(DeliveryState::initial(QoS::ExactlyOnce), DeliveryState::PublishAwaitingReceipt);
    }

    #[test]
    fn test_topic_errors_convert() {
        assert_eq!(
            RouterError::from(TopicParseError::EmptyTopic),
            RouterError::InvalidArgument("empty topic")
        );
        assert_eq!(
            RouterError::from(TopicParseError::AllocationFailure),
            RouterError::AllocationFailure
        );
    }
}
