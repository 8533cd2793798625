//! Thin collection aliases — a single place to swap the underlying
//! hasher or map implementation without touching call sites.

use std::collections::HashMap as StdHashMap;
use std::collections::HashSet as StdHashSet;

pub type HashMap<K, V> = StdHashMap<K, V>;
pub type HashSet<K> = StdHashSet<K>;
