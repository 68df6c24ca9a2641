/// Stable replication identifiers.
///
/// Two runs configured with the same source, target, filter and direction
/// must share a checkpoint, so the id is a pure hash of those four inputs.
use sha1::{Digest, Sha1};

use satchel_core::canonical::canonical_json;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Push,
    Pull,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Push => "push",
            Direction::Pull => "pull",
        }
    }
}

pub fn replication_id(
    source: &str,
    target: &str,
    filter: Option<&serde_json::Value>,
    direction: Direction,
) -> String {
    let mut hasher = Sha1::new();
    hasher.update(source.as_bytes());
    hasher.update(target.as_bytes());
    if let Some(filter) = filter {
        hasher.update(canonical_json(filter).as_bytes());
    }
    hasher.update(direction.as_str().as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}
