pub mod error;
pub mod eventqueue;
pub mod resources;
pub mod utils;

pub type Map<K, V> = hashbrown::HashMap<K, V, fxhash::FxBuildHasher>;
pub type Set<T> = hashbrown::HashSet<T, fxhash::FxBuildHasher>;
