//! Consistent-hash ring mapping document ids to shard owners
//!
//! Every shard key (`{node}:{index}:r{r}:s{s}`) is placed on the ring at a
//! number of virtual points; a lookup walks clockwise to the first point at
//! or after the key's hash. Routing is stable across restarts because the
//! hash depends only on the key text.

use std::collections::BTreeMap;

/// Virtual points per ring key
const VNODES: u32 = 40;

/// A consistent-hash ring over shard keys
#[derive(Debug, Clone, Default)]
pub struct HashRing {
    points: BTreeMap<u64, String>,
}

impl HashRing {
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut points = BTreeMap::new();
        for key in keys {
            let key = key.into();
            for vnode in 0..VNODES {
                points.insert(hash64(&format!("{}#{}", key, vnode)), key.clone());
            }
        }
        Self { points }
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// The ring key owning the hash slot for `key`
    pub fn get(&self, key: &str) -> Option<&str> {
        if self.points.is_empty() {
            return None;
        }

        let hash = hash64(key);
        self.points
            .range(hash..)
            .next()
            .or_else(|| self.points.iter().next())
            .map(|(_, key)| key.as_str())
    }

    /// The node portion of the owning ring key
    pub fn get_node(&self, key: &str) -> Option<&str> {
        self.get(key)
            .and_then(|ring_key| ring_key.split(':').next())
    }
}

fn hash64(data: &str) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut hash = OFFSET;
    for byte in data.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring_keys(nodes: &[&str]) -> Vec<String> {
        nodes
            .iter()
            .flat_map(|node| {
                (0..2).map(move |s| format!("{}:products:r0:s{}", node, s))
            })
            .collect()
    }

    #[test]
    fn test_empty_ring_has_no_owner() {
        let ring = HashRing::default();
        assert!(ring.get("products:doc-1").is_none());
    }

    #[test]
    fn test_lookup_is_deterministic() {
        let ring = HashRing::new(ring_keys(&["node-a", "node-b"]));
        let first = ring.get_node("products:doc-1").unwrap().to_string();
        for _ in 0..10 {
            assert_eq!(ring.get_node("products:doc-1").unwrap(), first);
        }
    }

    #[test]
    fn test_lookup_returns_member_node() {
        let ring = HashRing::new(ring_keys(&["node-a", "node-b"]));
        for i in 0..100 {
            let node = ring.get_node(&format!("products:doc-{}", i)).unwrap();
            assert!(node == "node-a" || node == "node-b");
        }
    }

    #[test]
    fn test_single_node_owns_everything() {
        let ring = HashRing::new(ring_keys(&["node-a"]));
        for i in 0..20 {
            assert_eq!(ring.get_node(&format!("k{}", i)).unwrap(), "node-a");
        }
    }

    #[test]
    fn test_keys_spread_across_nodes() {
        let ring = HashRing::new(ring_keys(&["node-a", "node-b", "node-c"]));
        let mut owners = std::collections::HashSet::new();
        for i in 0..200 {
            owners.insert(ring.get_node(&format!("doc-{}", i)).unwrap().to_string());
        }
        assert_eq!(owners.len(), 3);
    }
}
