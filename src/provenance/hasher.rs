//! NR-041: BLAKE3 hashing of desired state for the lock file.

use crate::core::state::State;
use crate::resources::{Converge, Resource};

/// Hash a string. Returns `"blake3:{hex}"`.
pub fn hash_string(s: &str) -> String {
    format!("blake3:{}", blake3::hash(s.as_bytes()).to_hex())
}

/// Compute a composite hash from multiple components.
pub fn composite_hash(components: &[&str]) -> String {
    let mut hasher = blake3::Hasher::new();
    for c in components {
        hasher.update(c.as_bytes());
        hasher.update(b"\0");
    }
    format!("blake3:{}", hasher.finalize().to_hex())
}

/// Hash of a state's ordered attributes. `State::Empty` has its own hash.
pub fn hash_state(state: &State) -> String {
    let parts: Vec<String> = state
        .attributes()
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();
    let mut components: Vec<&str> = vec![if state.is_empty() { "empty" } else { "state" }];
    components.extend(parts.iter().map(String::as_str));
    composite_hash(&components)
}

/// Hash of a resource's desired spec: its kind plus every manifest field.
///
/// Secrets (join tokens) only ever enter the digest, never the lock.
pub fn hash_desired(resource: &Resource) -> String {
    let fields = resource
        .fields()
        .and_then(|v| serde_yaml_ng::to_string(&v));
    match fields {
        Ok(yaml) => composite_hash(&[resource.kind().tag(), &yaml]),
        Err(e) => {
            tracing::warn!(error = %e, "cannot serialize resource fields, hashing state only");
            composite_hash(&[resource.kind().tag(), &hash_state(&resource.state())])
        }
    }
}
