use parking_lot::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch at which id timestamps start.
const EPOCH_MS: u64 = 1_288_834_974_657;

const NODE_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;
const MAX_SEQUENCE: u64 = (1 << SEQUENCE_BITS) - 1;

/// The largest instance id that fits the id layout.
pub const MAX_NODE_ID: u16 = (1 << NODE_BITS) - 1;

/// Generates snapshot versions of the form `v.<id>`, where ids are
/// snowflake-style: a millisecond timestamp, the instance id, and a sequence
/// number. Ids produced by one generator strictly increase, even if the
/// clock steps backwards.
#[derive(Debug)]
pub struct VersionGenerator {
    node: u64,
    state: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    last_ms: u64,
    sequence: u64,
}

#[derive(Debug, thiserror::Error)]
#[error("instance id {0} must be between 1 and {max}", max = MAX_NODE_ID)]
pub struct InvalidNodeId(pub u16);

// === impl VersionGenerator ===

impl VersionGenerator {
    pub fn new(node: u16) -> Result<Self, InvalidNodeId> {
        if node == 0 || node > MAX_NODE_ID {
            return Err(InvalidNodeId(node));
        }
        Ok(Self {
            node: u64::from(node),
            state: Mutex::default(),
        })
    }

    pub fn next_version(&self) -> String {
        format!("v.{}", self.next_id())
    }

    pub fn next_id(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default()
            .saturating_sub(EPOCH_MS);

        let mut state = self.state.lock();
        if now > state.last_ms {
            state.last_ms = now;
            state.sequence = 0;
        } else if state.sequence < MAX_SEQUENCE {
            state.sequence += 1;
        } else {
            // The sequence is exhausted for this millisecond (or the clock
            // went backwards); borrow from the next one.
            state.last_ms += 1;
            state.sequence = 0;
        }

        (state.last_ms << (NODE_BITS + SEQUENCE_BITS))
            | (self.node << SEQUENCE_BITS)
            | state.sequence
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_out_of_range_ids() {
        assert!(VersionGenerator::new(0).is_err());
        assert!(VersionGenerator::new(MAX_NODE_ID + 1).is_err());
        assert!(VersionGenerator::new(1).is_ok());
        assert!(VersionGenerator::new(MAX_NODE_ID).is_ok());
    }

    #[test]
    fn ids_strictly_increase() {
        let versions = VersionGenerator::new(7).expect("valid id");
        let mut last = 0;
        for _ in 0..10_000 {
            let id = versions.next_id();
            assert!(id > last, "{id} must be greater than {last}");
            last = id;
        }
    }

    #[test]
    fn ids_carry_the_instance() {
        let versions = VersionGenerator::new(42).expect("valid id");
        let id = versions.next_id();
        assert_eq!((id >> SEQUENCE_BITS) & u64::from(MAX_NODE_ID), 42);
        assert!(versions.next_version().starts_with("v."));
    }
}
