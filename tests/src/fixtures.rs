//! Task envelopes and raw message bodies.

use enrich_core::{TaskEnvelope, TaskKind};
use serde_json::json;

/// A well-formed envelope for `kind` about `resource_key`.
pub fn envelope(kind: TaskKind, resource_key: &str) -> TaskEnvelope {
    TaskEnvelope::new(kind, resource_key, &payload(kind, resource_key))
        .expect("fixture payload serializes")
}

/// A provider payload shaped like the original deployment's requests.
pub fn payload(kind: TaskKind, resource_key: &str) -> serde_json::Value {
    match kind {
        TaskKind::DomainEmail => json!({ "domain": resource_key, "limit": 10 }),
        TaskKind::Phone => json!({ "name": resource_key, "country": "US" }),
        TaskKind::Serp => json!({ "q": resource_key, "num": 10 }),
        TaskKind::LeakCheck => json!({ "email": resource_key }),
        TaskKind::ShodanHost => json!({ "ip": resource_key }),
        _ => json!({ "query": resource_key }),
    }
}

/// Body bytes with payload whitespace and key order a re-serializer would lose.
pub fn hand_written_body(kind: TaskKind, resource_key: &str) -> Vec<u8> {
    format!(
        r#"{{"kind":"{}","resource_key":"{}","payload":{{ "z": 1,  "a": [ 1, 2 ] }}}}"#,
        kind, resource_key
    )
    .into_bytes()
}

/// Bodies that can never decode.
pub fn malformed_bodies() -> Vec<Vec<u8>> {
    vec![
        b"{not json".to_vec(),
        br#"{"kind":"serp","payload":{}}"#.to_vec(),
        br#"{"kind":"teleport","resource_key":"x","payload":{}}"#.to_vec(),
        br#"{"kind":"serp","resource_key":"","payload":{}}"#.to_vec(),
    ]
}
