//! Stress tests for pmkv.
//!
//! These helpers drive one store from many threads. A store is shared by
//! reference; every helper runs its workers inside a thread scope.

use pmkv_core::Store;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Result of a stress test run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Total operations performed.
    pub total_ops: usize,
    /// Successful operations.
    pub successful_ops: usize,
    /// Failed operations.
    pub failed_ops: usize,
    /// Total duration.
    pub duration: Duration,
    /// Operations per second.
    pub ops_per_second: f64,
}

impl StressTestResult {
    /// Creates a new result.
    pub fn new(successful: usize, failed: usize, duration: Duration) -> Self {
        let total = successful + failed;
        let ops_per_second = if duration.as_secs_f64() > 0.0 {
            total as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        Self {
            total_ops: total,
            successful_ops: successful,
            failed_ops: failed,
            duration,
            ops_per_second,
        }
    }

    /// Prints a summary of the test.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {} ===", name);
        println!("Total operations: {}", self.total_ops);
        println!("Successful: {}", self.successful_ops);
        println!("Failed: {}", self.failed_ops);
        println!("Duration: {:?}", self.duration);
        println!("Throughput: {:.2} ops/sec", self.ops_per_second);
    }
}

/// Configuration for stress tests.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Operations per thread.
    pub operations: usize,
    /// Number of concurrent threads.
    pub threads: usize,
    /// Size of each value in bytes.
    pub value_size: usize,
    /// Number of distinct keys shared by readers.
    pub key_count: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            operations: 2_000,
            threads: 4,
            value_size: 64,
            key_count: 1_000,
        }
    }
}

/// Key written by `thread` for its `i`-th operation.
pub fn thread_key(thread: usize, i: usize) -> Vec<u8> {
    format!("t{thread:02}-{i:08}").into_bytes()
}

/// Value stored under `key`: the key repeated to `size` bytes.
pub fn derived_value(key: &[u8], size: usize) -> Vec<u8> {
    key.iter().copied().cycle().take(size).collect()
}

fn run_threads(
    threads: usize,
    work: impl Fn(usize, &AtomicUsize, &AtomicUsize) + Sync,
) -> StressTestResult {
    let successful = AtomicUsize::new(0);
    let failed = AtomicUsize::new(0);
    let start = Instant::now();
    thread::scope(|scope| {
        for t in 0..threads {
            let work = &work;
            let successful = &successful;
            let failed = &failed;
            scope.spawn(move || work(t, successful, failed));
        }
    });
    StressTestResult::new(
        successful.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        start.elapsed(),
    )
}

fn tally<T, E>(result: Result<T, E>, successful: &AtomicUsize, failed: &AtomicUsize) {
    match result {
        Ok(_) => successful.fetch_add(1, Ordering::Relaxed),
        Err(_) => failed.fetch_add(1, Ordering::Relaxed),
    };
}

/// Every thread puts its own keys. All keys are readable afterwards.
pub fn stress_concurrent_puts(store: &Store, config: &StressConfig) -> StressTestResult {
    run_threads(config.threads, |t, successful, failed| {
        for i in 0..config.operations {
            let key = thread_key(t, i);
            let value = derived_value(&key, config.value_size);
            tally(store.put(&key, &value), successful, failed);
        }
    })
}

/// Checks that every key of [`stress_concurrent_puts`] holds its value.
pub fn verify_concurrent_puts(store: &Store, config: &StressConfig) -> Result<(), String> {
    for t in 0..config.threads {
        for i in 0..config.operations {
            let key = thread_key(t, i);
            let expected = derived_value(&key, config.value_size);
            match store.get(&key) {
                Ok(Some(value)) if value == expected => {}
                other => return Err(format!("{:?}: {other:?}", String::from_utf8_lossy(&key))),
            }
        }
    }
    Ok(())
}

/// Threads read a shared key set. A value must always match its key.
pub fn stress_concurrent_reads(store: &Store, config: &StressConfig) -> StressTestResult {
    for i in 0..config.key_count {
        let key = thread_key(0, i);
        let _ = store.put(&key, &derived_value(&key, config.value_size));
    }
    run_threads(config.threads, |t, successful, failed| {
        for i in 0..config.operations {
            let key = thread_key(0, (t * config.operations + i) % config.key_count);
            let result = match store.get(&key) {
                Ok(Some(value)) if value == derived_value(&key, config.value_size) => Ok(()),
                _ => Err(()),
            };
            tally(result, successful, failed);
        }
    })
}

/// Half the threads overwrite and remove keys while the other half read
/// and iterate. Readers fail an operation if they ever see a value that
/// does not belong to its key.
pub fn stress_mixed_operations(store: &Store, config: &StressConfig) -> StressTestResult {
    run_threads(config.threads, |t, successful, failed| {
        for i in 0..config.operations {
            let key = thread_key(0, (t * 7 + i) % config.key_count);
            if t % 2 == 0 {
                let result = if i % 5 == 4 {
                    store.remove(&key).map(|_| ())
                } else {
                    store.put(&key, &derived_value(&key, config.value_size))
                };
                tally(result, successful, failed);
            } else if i % 50 == 0 {
                let mut torn = false;
                let result = store.get_all(|k, v| {
                    if v != derived_value(k, config.value_size).as_slice() {
                        torn = true;
                        return ControlFlow::Break(());
                    }
                    ControlFlow::Continue(())
                });
                let result = match result {
                    Ok(()) if !torn => Ok(()),
                    _ => Err(()),
                };
                tally(result, successful, failed);
            } else {
                let result = match store.get(&key) {
                    Ok(Some(value)) if value != derived_value(&key, config.value_size) => Err(()),
                    Ok(_) => Ok(()),
                    Err(_) => Err(()),
                };
                tally(result, successful, failed);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{TestStore, ALL_ENGINES};
    use pmkv_core::MIN_POOL_SIZE;

    fn small() -> StressConfig {
        StressConfig {
            operations: 200,
            threads: 4,
            value_size: 32,
            key_count: 100,
        }
    }

    #[test]
    fn test_concurrent_puts() {
        for kind in ALL_ENGINES {
            let test_store = TestStore::volatile_sized(kind, 4 * MIN_POOL_SIZE);
            let config = small();
            let result = stress_concurrent_puts(&test_store, &config);
            assert_eq!(result.failed_ops, 0);
            assert_eq!(result.successful_ops, 800);
            verify_concurrent_puts(&test_store, &config).unwrap();
            assert_eq!(test_store.count_all().unwrap(), 800);
        }
    }

    #[test]
    fn test_concurrent_reads() {
        let test_store = TestStore::volatile(pmkv_core::EngineKind::CMap);
        let result = stress_concurrent_reads(&test_store, &small());
        assert_eq!(result.failed_ops, 0);
    }

    #[test]
    fn test_derived_value() {
        assert_eq!(derived_value(b"ab", 5), b"ababa");
        assert!(derived_value(b"ab", 0).is_empty());
    }
}
