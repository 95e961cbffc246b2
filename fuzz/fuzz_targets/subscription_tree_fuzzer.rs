#![no_main]
use libfuzzer_sys::fuzz_target;
use mqtt_router::types::QoS;
use mqtt_router_broker::SubscriptionTree;

// Every subscription added is removed again, which must leave no nodes behind.
fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        let topics: Vec<&str> = s.split('\n').filter(|t| !t.is_empty()).collect();
        let mut tree = SubscriptionTree::new();

        for (subscriber, topic) in topics.iter().enumerate() {
            tree.subscribe(topic, subscriber, QoS::AtMostOnce).unwrap();
        }

        for (subscriber, topic) in topics.iter().enumerate() {
            tree.unsubscribe(topic, &subscriber).unwrap();
        }

        assert!(tree.is_empty());
    }
});
