//! Inspect command implementation.

use crate::CliError;
use pmkv_core::{HeapStats, Store};
use serde::Serialize;
use std::path::Path;

/// Pool inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Pool path.
    pub path: String,
    /// Engine that created the pool.
    pub engine: String,
    /// Pool identity.
    pub uuid: String,
    /// Format version as `major.minor`.
    pub format: String,
    /// Pool size in bytes.
    pub pool_size: u64,
    /// Number of undo lanes.
    pub lanes: u32,
    /// Bytes per undo lane.
    pub lane_size: u32,
    /// Region offset of the heap.
    pub heap_offset: u64,
    /// Committed entries.
    pub entries: u64,
    /// Allocator state after recovery.
    pub heap: HeapStats,
}

/// Runs the inspect command.
///
/// Opening the pool runs recovery, so an interrupted transaction is rolled
/// back before anything is reported.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let result = inspect(path)?;
    match format {
        "text" => print_text(&result),
        "json" => println!("{}", serde_json::to_string_pretty(&result)?),
        other => return Err(CliError::UnknownFormat(other.to_string()).into()),
    }
    Ok(())
}

/// Opens the pool at `path` and collects its metadata.
pub fn inspect(path: &Path) -> pmkv_core::CoreResult<InspectResult> {
    let store = Store::open_path(path)?;
    let header = store.header()?;
    let stats = store.stats()?;
    let result = InspectResult {
        path: path.display().to_string(),
        engine: header.engine.to_string(),
        uuid: header.uuid.to_string(),
        format: format!("{}.{}", header.major, header.minor),
        pool_size: header.pool_size,
        lanes: header.lane_count,
        lane_size: header.lane_size,
        heap_offset: header.heap_offset,
        entries: stats.entries,
        heap: stats.heap,
    };
    store.close()?;
    Ok(result)
}

fn print_text(result: &InspectResult) {
    println!("Pool:        {}", result.path);
    println!("Engine:      {}", result.engine);
    println!("UUID:        {}", result.uuid);
    println!("Format:      v{}", result.format);
    println!("Size:        {} bytes", result.pool_size);
    println!("Lanes:       {} x {} bytes", result.lanes, result.lane_size);
    println!("Entries:     {}", result.entries);
    println!();
    println!("Heap at {:#x}:", result.heap_offset);
    println!("  size:       {} bytes", result.heap.heap_size);
    println!(
        "  used:       {} bytes in {} blocks",
        result.heap.used_bytes, result.heap.used_blocks
    );
    println!(
        "  free:       {} bytes in {} blocks",
        result.heap.free_bytes, result.heap.free_blocks
    );
    println!("  wilderness: {} bytes", result.heap.wilderness_bytes);
}

#[cfg(test)]
mod tests {
    use super::*;
    use pmkv_core::{Config, EngineKind, MIN_POOL_SIZE};
    use tempfile::TempDir;

    #[test]
    fn inspect_reports_header_and_entries() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pool");
        let config = Config::new(&path).size(MIN_POOL_SIZE).force_create(true);
        let store = Store::open_with_config(EngineKind::STree, &config).unwrap();
        store.put(b"a", b"1").unwrap();
        store.put(b"b", b"2").unwrap();
        store.close().unwrap();

        let result = inspect(&path).unwrap();
        assert_eq!(result.engine, "stree");
        assert_eq!(result.entries, 2);
        assert_eq!(result.pool_size, MIN_POOL_SIZE);
        assert!(result.heap.used_blocks >= 3);

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["heap"]["heap_size"], result.heap.heap_size);
    }

    #[test]
    fn unknown_format_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pool");
        let config = Config::new(&path).size(MIN_POOL_SIZE).force_create(true);
        Store::open_with_config(EngineKind::Radix, &config)
            .unwrap()
            .close()
            .unwrap();
        assert!(run(&path, "yaml").is_err());
    }
}
