use crate::{
    store::{DeliveryRecord, Store},
    tree::SubscriptionTree,
};
use log::{trace, warn};
use mqtt_router::{
    topic::TopicTokens,
    types::{ClientId, Delivery, DeliveryState, Direction, MessageRef, QoS, RouterError},
};
use std::fmt;

/// Identity of a subscription in the tree. Two subscribers are the same
/// subscriber when their client IDs are equal.
#[derive(Debug, Clone)]
pub struct Subscriber {
    pub client_id: ClientId,
    /// Bridges relay messages to another broker and never get their own
    /// publishes back.
    pub bridge: bool,
}

impl Subscriber {
    pub fn new(client_id: impl Into<ClientId>, bridge: bool) -> Result<Self, RouterError> {
        let client_id = client_id.into();

        if client_id.is_empty() {
            return Err(RouterError::InvalidArgument("empty client id"));
        }

        Ok(Self { client_id, bridge })
    }
}

impl PartialEq for Subscriber {
    fn eq(&self, other: &Self) -> bool {
        self.client_id == other.client_id
    }
}

impl Eq for Subscriber {}

impl fmt::Display for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.client_id)
    }
}

/// A message that has been stored and is ready to be routed.
#[derive(Debug, Clone, Copy)]
pub struct Publication<'a> {
    pub source_id: &'a str,
    pub topic: &'a str,
    pub qos: QoS,
    pub retain: bool,
    pub message: MessageRef,
}

/// Outcome of routing one publication.
#[derive(Debug, Default)]
pub struct FanOutReport {
    pub deliveries: Vec<Delivery>,
    pub failures: Vec<RouterError>,
}

impl FanOutReport {
    pub fn attempted(&self) -> usize {
        self.deliveries.len() + self.failures.len()
    }

    pub fn into_result(self) -> Result<Vec<Delivery>, RouterError> {
        if self.failures.is_empty() {
            Ok(self.deliveries)
        } else {
            Err(RouterError::FanOutIncomplete {
                failed: self.failures.len(),
                attempted: self.attempted(),
            })
        }
    }
}

/// Route `publication` to every matching subscriber, recording each delivery
/// in `store`.
///
/// A failed delivery does not stop the others. All of them are attempted
/// and the failures are collected in the report.
pub fn fan_out<S: Store>(
    subscriptions: &SubscriptionTree<Subscriber>,
    store: &mut S,
    publication: &Publication<'_>,
) -> Result<FanOutReport, RouterError> {
    let tokens = TopicTokens::tokenize(publication.topic)?;
    let mut report = FanOutReport::default();

    subscriptions.matching_subscribers(&tokens, |subscriber, subscriber_qos| {
        if subscriber.bridge && subscriber.client_id == publication.source_id {
            trace!(
                "Not sending \"{}\" back to bridge {}",
                publication.topic,
                subscriber.client_id
            );
            return;
        }

        match deliver(store, subscriber, subscriber_qos, publication) {
            Ok(delivery) => {
                trace!(
                    "Delivering \"{}\" to {} (QoS {:?}, message id {})",
                    publication.topic,
                    delivery.client_id,
                    delivery.qos,
                    delivery.message_id
                );
                report.deliveries.push(delivery);
            },
            Err(err) => {
                warn!("Failed to route \"{}\": {}", publication.topic, err);
                report.failures.push(err);
            },
        }
    });

    Ok(report)
}

/// Route `publication` and fail if any single delivery failed.
pub fn publish_match<S: Store>(
    subscriptions: &SubscriptionTree<Subscriber>,
    store: &mut S,
    publication: &Publication<'_>,
) -> Result<Vec<Delivery>, RouterError> {
    fan_out(subscriptions, store, publication)?.into_result()
}

fn deliver<S: Store>(
    store: &mut S,
    subscriber: &Subscriber,
    subscriber_qos: QoS,
    publication: &Publication<'_>,
) -> Result<Delivery, RouterError> {
    let client_id = &subscriber.client_id;
    let qos = publication.qos.min(subscriber_qos);

    let message_id = match qos {
        QoS::AtMostOnce => 0,
        QoS::AtLeastOnce | QoS::ExactlyOnce => {
            store.alloc_message_id(client_id).map_err(|err| RouterError::CounterFailure {
                client_id: client_id.clone(),
                reason: err.to_string(),
            })?
        },
    };

    let record = DeliveryRecord {
        message_id,
        direction: Direction::Outbound,
        state: DeliveryState::initial(qos),
        qos,
        message: publication.message,
    };

    store.mark_delivery(client_id, record.clone()).map_err(|err| {
        RouterError::DeliveryFailure { client_id: client_id.clone(), reason: err.to_string() }
    })?;

    Ok(Delivery {
        client_id: client_id.clone(),
        message_id: record.message_id,
        direction: record.direction,
        state: record.state,
        qos: record.qos,
        retain: publication.retain,
        message: record.message,
    })
}

#[cfg(test)]
mod tests {
    use crate::{
        fanout::{fan_out, publish_match, Publication, Subscriber},
        store::{MemoryStore, Store},
        tree::SubscriptionTree,
    };
    use bytes::Bytes;
    use mqtt_router::types::{Delivery, DeliveryState, Direction, MessageRef, QoS, RouterError};

    struct Fixture {
        subscriptions: SubscriptionTree<Subscriber>,
        store: MemoryStore,
    }

    impl Fixture {
        fn new(clients: &[&str]) -> Self {
            let _ = env_logger::builder().is_test(true).try_init();

            let mut store = MemoryStore::new();
            for (socket, client_id) in clients.iter().enumerate() {
                store.client_insert(client_id, socket as u64).unwrap();
            }

            Self { subscriptions: SubscriptionTree::new(), store }
        }

        fn subscribe(&mut self, client_id: &str, bridge: bool, qos: QoS, topic: &str) {
            let subscriber = Subscriber::new(client_id, bridge).unwrap();
            self.subscriptions.subscribe(topic, subscriber, qos).unwrap();
        }

        fn publish(
            &mut self,
            source_id: &str,
            qos: QoS,
            topic: &str,
        ) -> (MessageRef, Result<Vec<Delivery>, RouterError>) {
            let message = self.store.store_message(topic, qos, Bytes::from_static(b"P")).unwrap();
            let publication = Publication { source_id, topic, qos, retain: false, message };
            (message, publish_match(&self.subscriptions, &mut self.store, &publication))
        }
    }

    #[test]
    fn test_scenario() {
        let mut fixture = Fixture::new(&["client1", "client2", "client3"]);
        fixture.subscribe("client1", false, QoS::AtLeastOnce, "a/b");
        fixture.subscribe("client2", false, QoS::AtMostOnce, "a/+");

        let (message, deliveries) = fixture.publish("client3", QoS::ExactlyOnce, "a/b");

        assert_eq!(
            deliveries.unwrap(),
            vec![
                Delivery {
                    client_id: "client1".into(),
                    message_id: 1,
                    direction: Direction::Outbound,
                    state: DeliveryState::PublishAwaitingAck,
                    qos: QoS::AtLeastOnce,
                    retain: false,
                    message,
                },
                Delivery {
                    client_id: "client2".into(),
                    message_id: 0,
                    direction: Direction::Outbound,
                    state: DeliveryState::Publish,
                    qos: QoS::AtMostOnce,
                    retain: false,
                    message,
                },
            ]
        );

        assert_eq!(fixture.store.deliveries("client1").len(), 1);
        assert!(fixture.store.deliveries("client2").is_empty());
    }

    #[test]
    fn test_qos_downgrade() {
        let mut fixture = Fixture::new(&["sub", "pub"]);
        fixture.subscribe("sub", false, QoS::ExactlyOnce, "t");

        let (_, deliveries) = fixture.publish("pub", QoS::AtMostOnce, "t");
        let deliveries = deliveries.unwrap();
        assert_eq!(deliveries[0].qos, QoS::AtMostOnce);
        assert_eq!(deliveries[0].message_id, 0);

        let (_, deliveries) = fixture.publish("pub", QoS::ExactlyOnce, "t");
        let deliveries = deliveries.unwrap();
        assert_eq!(deliveries[0].qos, QoS::ExactlyOnce);
        assert_eq!(deliveries[0].state, DeliveryState::PublishAwaitingReceipt);
        assert_eq!(deliveries[0].message_id, 1);

        let (_, deliveries) = fixture.publish("pub", QoS::AtLeastOnce, "t");
        assert_eq!(deliveries.unwrap()[0].message_id, 2);
    }

    #[test]
    fn test_bridge_does_not_receive_its_own_publish() {
        let mut fixture = Fixture::new(&["bridge", "client", "other"]);
        fixture.subscribe("bridge", true, QoS::AtMostOnce, "#");
        fixture.subscribe("client", false, QoS::AtMostOnce, "#");

        let (_, deliveries) = fixture.publish("bridge", QoS::AtMostOnce, "a/b");
        let receivers: Vec<_> =
            deliveries.unwrap().into_iter().map(|d| d.client_id).collect();
        assert_eq!(receivers, vec!["client".to_string()]);

        let (_, deliveries) = fixture.publish("other", QoS::AtMostOnce, "a/b");
        assert_eq!(deliveries.unwrap().len(), 2);
    }

    #[test]
    fn test_ordinary_client_receives_its_own_publish() {
        let mut fixture = Fixture::new(&["client"]);
        fixture.subscribe("client", false, QoS::AtMostOnce, "a/b");

        let (_, deliveries) = fixture.publish("client", QoS::AtMostOnce, "a/b");
        assert_eq!(deliveries.unwrap().len(), 1);
    }

    #[test]
    fn test_failures_do_not_stop_fan_out() {
        // "ghost" was never registered with the store.
        let mut fixture = Fixture::new(&["first", "last", "pub"]);
        fixture.subscribe("first", false, QoS::AtLeastOnce, "a/+");
        fixture.subscribe("ghost", false, QoS::AtMostOnce, "a/b");
        fixture.subscribe("ghost", false, QoS::AtLeastOnce, "a/#");
        fixture.subscribe("last", false, QoS::AtLeastOnce, "#");

        let message =
            fixture.store.store_message("a/b", QoS::AtLeastOnce, Bytes::new()).unwrap();
        let publication = Publication {
            source_id: "pub",
            topic: "a/b",
            qos: QoS::AtLeastOnce,
            retain: true,
            message,
        };

        let report = fan_out(&fixture.subscriptions, &mut fixture.store, &publication).unwrap();
        let receivers: Vec<_> = report.deliveries.iter().map(|d| d.client_id.as_str()).collect();
        assert_eq!(receivers, vec!["first", "last"]);
        assert!(report.deliveries.iter().all(|d| d.retain));

        assert_eq!(report.failures.len(), 2);
        assert!(matches!(report.failures[0], RouterError::DeliveryFailure { .. }));
        assert!(matches!(report.failures[1], RouterError::CounterFailure { .. }));

        assert_eq!(report.into_result(), Err(RouterError::FanOutIncomplete { failed: 2, attempted: 4 }));
        assert_eq!(fixture.store.deliveries("last").len(), 1);
    }

    #[test]
    fn test_no_subscribers() {
        let mut fixture = Fixture::new(&["pub"]);
        fixture.subscribe("pub", false, QoS::AtMostOnce, "$SYS/#");

        let (_, deliveries) = fixture.publish("pub", QoS::AtMostOnce, "a");
        assert_eq!(deliveries, Ok(vec![]));

        let (_, deliveries) = fixture.publish("pub", QoS::AtMostOnce, "");
        assert_eq!(deliveries, Err(RouterError::InvalidArgument("empty topic")));
    }

    #[test]
    fn test_empty_client_id_is_rejected() {
        assert_eq!(
            Subscriber::new("", false).unwrap_err(),
            RouterError::InvalidArgument("empty client id")
        );
    }
}
