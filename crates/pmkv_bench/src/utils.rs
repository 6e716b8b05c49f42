//! Benchmark utilities.

use pmkv_core::{Config, EngineKind, Store};
use rand::seq::SliceRandom;
use rand::Rng;

/// Every engine, in registry order.
pub const ENGINES: [EngineKind; 3] = [EngineKind::CMap, EngineKind::STree, EngineKind::Radix];

/// Pool size used by in-memory benches.
pub const BENCH_POOL_SIZE: u64 = 512 << 20;

/// Generate random data of the specified size.
pub fn random_data(size: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..size).map(|_| rng.gen()).collect()
}

/// Generate `count` distinct 16-byte keys in random order.
pub fn generate_keys(count: usize) -> Vec<Vec<u8>> {
    let mut keys: Vec<Vec<u8>> = (0..count)
        .map(|i| format!("user{i:012}").into_bytes())
        .collect();
    keys.shuffle(&mut rand::thread_rng());
    keys
}

/// Opens an in-memory store with default tuning.
pub fn volatile_store(kind: EngineKind) -> Store {
    Store::open_volatile_with_config(kind, &Config::new("bench").size(BENCH_POOL_SIZE))
        .expect("Failed to open bench store")
}

/// Opens a store holding `keys`, each with a random value of `value_size` bytes.
pub fn populated_store(kind: EngineKind, keys: &[Vec<u8>], value_size: usize) -> Store {
    let store = volatile_store(kind);
    for key in keys {
        store
            .put(key, &random_data(value_size))
            .expect("Failed to populate bench store");
    }
    store
}
