//! Record header helpers shared by the ingest and dead-letter consumers.

use rdkafka::message::{Headers, Message};

/// Returns the raw value of the first header with the given name.
pub fn header_value<M: Message>(msg: &M, name: &str) -> Option<Vec<u8>> {
    msg.headers()?
        .iter()
        .find(|h| h.key == name)
        .and_then(|h| h.value.map(|v| v.to_vec()))
}

/// Returns the header value decoded as UTF-8, if present and valid.
pub fn header_value_utf8<M: Message>(msg: &M, name: &str) -> Option<String> {
    header_value(msg, name).and_then(|v| String::from_utf8(v).ok())
}

/// Collects all headers of a record for forwarding to the dead-letter topic.
pub fn collect_headers<M: Message>(msg: &M) -> Vec<(String, Vec<u8>)> {
    msg.headers()
        .map(|headers| {
            headers
                .iter()
                .map(|h| {
                    (
                        h.key.to_string(),
                        h.value.map(|v| v.to_vec()).unwrap_or_default(),
                    )
                })
                .collect()
        })
        .unwrap_or_default()
}
