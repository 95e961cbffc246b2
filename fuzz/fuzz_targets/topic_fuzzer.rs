#![no_main]
use libfuzzer_sys::fuzz_target;
use mqtt_router::topic::{Namespace, TopicTokens};

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(tokens) = TopicTokens::tokenize(s) {
            let joined = tokens.levels().join("/");

            match tokens.namespace() {
                Namespace::LeadingSlash => assert_eq!(format!("/{}", joined), s),
                Namespace::Plain | Namespace::SysReserved => assert_eq!(joined, s),
            }
        }
    }
});
