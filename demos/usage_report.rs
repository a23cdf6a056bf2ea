//! Grow a few bit vectors inside named events and print the usage timeline
//! as JSON.
//!
//! ```sh
//! BITMEM_PAGE_POOL=64M RUST_LOG=debug cargo run --example usage_report
//! ```

use std::io;

use bitmem::{MemError, MemoryConfig, MemoryManager, RawBitVec};

fn build(manager: &MemoryManager, bits: u64) -> Result<RawBitVec, MemError> {
    let _event = manager.monitor().event(format!("build {bits}"));
    let mut v = RawBitVec::new();
    let mut len = 64;
    while len < bits {
        manager.resize(&mut v, len)?;
        len *= 2;
    }
    manager.resize(&mut v, bits)?;
    for i in (0..bits).step_by(3) {
        v.set(i, true);
    }
    Ok(v)
}

fn main() -> Result<(), MemError> {
    env_logger::init();

    let config = MemoryConfig::from_env()?;
    let manager = match MemoryManager::with_config(&config) {
        Ok(manager) => manager,
        Err(e) => {
            log::warn!("{e}, falling back to the heap");
            MemoryManager::new()
        }
    };
    manager.monitor().set_granularity(config.log_granularity());

    manager.monitor().start();
    let mut vectors = Vec::new();
    for bits in [10_000, 1_000_000, 4_000_000] {
        let v = build(&manager, bits)?;
        log::info!("{bits} bits, {} set", v.rank(v.len()));
        vectors.push(v);
    }
    manager.monitor().scoped("teardown", || {
        vectors
            .iter_mut()
            .try_for_each(|v| manager.clear(v))
    })?;
    manager.monitor().stop();

    if let Some(stats) = manager.page_pool_stats() {
        log::info!("page pool: {stats:?}");
    }
    manager.monitor().report().write_json(io::stdout().lock())?;
    println!();
    Ok(())
}
