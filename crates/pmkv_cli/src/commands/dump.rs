//! Dump command implementation.

use pmkv_core::{CoreResult, Store};
use std::ops::ControlFlow;
use std::path::Path;

/// Runs the dump command.
pub fn run(path: &Path, limit: Option<usize>, hex: bool) -> Result<(), Box<dyn std::error::Error>> {
    let store = Store::open_path(path)?;
    let total = store.count_all()?;
    let lines = dump(&store, limit, hex)?;
    for line in &lines {
        println!("{line}");
    }
    if (lines.len() as u64) < total {
        println!("... {} of {total} entries shown", lines.len());
    }
    store.close()?;
    Ok(())
}

/// Formats up to `limit` entries of `store`, one per line.
pub fn dump(store: &Store, limit: Option<usize>, hex: bool) -> CoreResult<Vec<String>> {
    let limit = limit.unwrap_or(usize::MAX);
    let mut lines = Vec::new();
    if limit == 0 {
        return Ok(lines);
    }
    store.get_all(|key, value| {
        lines.push(format!("{} => {}", render(key, hex), render(value, hex)));
        if lines.len() >= limit {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    })?;
    Ok(lines)
}

fn render(bytes: &[u8], hex: bool) -> String {
    if hex {
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    } else {
        format!("\"{}\"", bytes.escape_ascii())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pmkv_core::EngineKind;

    #[test]
    fn dump_respects_limit_and_order() {
        let store = Store::open_volatile(EngineKind::Radix, pmkv_core::MIN_POOL_SIZE).unwrap();
        store.put(b"b", b"2").unwrap();
        store.put(b"a", b"\x00\x01").unwrap();
        store.put(b"c", b"3").unwrap();

        let lines = dump(&store, None, false).unwrap();
        assert_eq!(lines, ["\"a\" => \"\\x00\\x01\"", "\"b\" => \"2\"", "\"c\" => \"3\""]);

        let lines = dump(&store, Some(1), true).unwrap();
        assert_eq!(lines, ["61 => 0001"]);

        assert!(dump(&store, Some(0), false).unwrap().is_empty());
    }
}
