//! Collection aliases using the workspace's preferred hasher.

use crate::hash::FastBuildHasher;

/// A hash map based on `hashbrown` ([`HashMap`][hashbrown::HashMap]) using [`FastHasher`][crate::hash::FastHasher].
pub type FastHashMap<K, V> = hashbrown::HashMap<K, V, FastBuildHasher>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::get_fast_build_hasher;

    #[test]
    fn fast_hash_map_clones_independently() {
        let mut original: FastHashMap<u64, &str> = FastHashMap::with_hasher(get_fast_build_hasher());
        original.insert(1, "one");

        let mut copy = original.clone();
        copy.remove(&1);

        assert_eq!(original.get(&1), Some(&"one"));
        assert!(copy.is_empty());
    }
}
