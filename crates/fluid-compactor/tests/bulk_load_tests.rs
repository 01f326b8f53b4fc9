//! Bulk-load shape tests against the in-memory engine.

use fluid_compactor::config::{FileSizePolicy, FluidConfig};
use fluid_compactor::loader::BulkLoader;
use fluid_compactor::workload::read_existing_keys;
use fluid_datagen::RandomKeySource;
use fluid_testkit::MemEngine;
use std::collections::HashSet;
use std::sync::Arc;

const MIB: u64 = 1 << 20;
const KIB: u64 = 1 << 10;

fn tuning(size_ratio: u64, k: u64, z: u64, entry_size: u64) -> FluidConfig {
    FluidConfig {
        size_ratio,
        lower_level_run_max: k,
        largest_level_run_max: z,
        buffer_size: MIB,
        entry_size,
        ..FluidConfig::default()
    }
}

fn unique_keys(keys: &[String]) -> usize {
    keys.iter().collect::<HashSet<_>>().len()
}

#[tokio::test]
async fn single_buffer_sized_load_stays_on_level_zero() {
    // 1024 entries of 1 KiB exactly fill the 1 MiB buffer: one level, one
    // file, no compaction at all.
    let config = tuning(2, 1, 1, KIB);
    let engine = Arc::new(MemEngine::new(16, config.buffer_size));
    let mut loader = BulkLoader::new(config, Arc::clone(&engine), RandomKeySource::new(42));

    loader.bulk_load_entries(1024).await.unwrap();

    assert_eq!(loader.keys().len(), 1024);
    assert_eq!(engine.nonempty_levels(), vec![0]);
    assert_eq!(engine.level_file_counts()[0], 1);
    assert_eq!(engine.level_entry_counts()[0], unique_keys(loader.keys()));
    assert_eq!(engine.compaction_attempts(), 0);

    assert_eq!(loader.config().num_entries, 1024);
    assert_eq!(loader.config().levels, 1);
}

#[tokio::test]
async fn entry_mode_load_fills_estimated_levels() {
    // 10_000 entries of 1 KiB at T = 2: four levels, one run each.
    let config = tuning(2, 1, 1, KIB);
    let engine = Arc::new(MemEngine::new(16, config.buffer_size));
    let mut loader = BulkLoader::new(config, Arc::clone(&engine), RandomKeySource::new(7));

    loader.bulk_load_entries(10_000).await.unwrap();

    assert_eq!(engine.nonempty_levels(), vec![0, 1, 2, 3]);
    assert_eq!(&engine.level_file_counts()[..4], &[1, 1, 1, 1]);

    // The scaled plan writes 666 + 1333 + 2666 + 5333 entries.
    assert_eq!(loader.keys().len(), 9998);
    let total_entries: usize = engine.level_entry_counts().iter().sum();
    assert!(total_entries <= 9998);

    assert_eq!(loader.config().num_entries, 10_000);
    assert_eq!(loader.config().levels, 4);
}

#[tokio::test]
async fn level_mode_load_respects_k_and_z() {
    // T = 4, K = 2, Z = 1, three levels filled to capacity.
    let config = tuning(4, 2, 1, KIB);
    let engine = Arc::new(MemEngine::new(16, config.buffer_size));
    let mut loader = BulkLoader::new(config, Arc::clone(&engine), RandomKeySource::new(3));

    loader.bulk_load_levels(3).await.unwrap();

    // 3072 + 12_288 + 49_152 entries, bottom level first.
    assert_eq!(loader.keys().len(), 64_512);
    assert_eq!(engine.nonempty_levels(), vec![0, 1, 2]);

    let counts = engine.level_file_counts();
    assert_eq!(counts[2], 1, "terminal level holds Z = 1 runs");
    assert_eq!(counts[1], 2, "middle level holds K = 2 runs");
    assert_eq!(counts[0], 2, "top level holds K = 2 runs");

    assert_eq!(loader.config().num_entries, 64_512);
    assert_eq!(loader.config().levels, 3);
}

#[tokio::test]
async fn fixed_policy_caps_every_file() {
    let mut config = tuning(2, 1, 1, 32);
    config.buffer_size = KIB;
    config.file_size_policy_opt = FileSizePolicy::Fixed;
    config.fixed_file_size = 2048;

    let engine = Arc::new(MemEngine::new(16, config.buffer_size));
    let fixed_file_size = config.fixed_file_size;
    let mut loader = BulkLoader::new(config, Arc::clone(&engine), RandomKeySource::new(11));

    loader.bulk_load_levels(2).await.unwrap();

    assert_eq!(engine.nonempty_levels(), vec![0, 1]);
    // No SSTable exceeds the cap (the 5% metadata allowance is headroom,
    // not a license).
    assert!(engine.max_file_size() <= fixed_file_size);
    // FIXED schedules the level-1 placement too, unlike INCREASING/BUFFER.
    assert_eq!(engine.compaction_attempts(), 2);
}

#[tokio::test]
async fn early_stop_flag_does_not_truncate_a_full_tree() {
    // The plan always sums to at most the target, so the cutoff can only
    // trip once the last level has landed; every level must still fill.
    let config = tuning(2, 1, 1, KIB);
    let engine = Arc::new(MemEngine::new(16, config.buffer_size));
    let mut loader = BulkLoader::new(config, Arc::clone(&engine), RandomKeySource::new(5))
        .stop_after_level_filled(true);

    // Exactly a full 4-level tree: 1024 + 2048 + 4096 + 8192.
    loader.bulk_load_entries(15_360).await.unwrap();

    assert_eq!(engine.nonempty_levels(), vec![0, 1, 2, 3]);
    assert_eq!(loader.keys().len(), 15_360);
}

#[tokio::test]
async fn written_keys_and_config_are_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let config = tuning(2, 1, 1, KIB);
    let engine = Arc::new(MemEngine::new(16, config.buffer_size));
    let mut loader = BulkLoader::new(config, Arc::clone(&engine), RandomKeySource::new(9));

    loader.bulk_load_entries(2048).await.unwrap();
    loader.write_existing_keys(dir.path()).unwrap();
    loader.config().save_to_db_path(dir.path()).unwrap();

    let mut expected: Vec<String> = loader.keys().to_vec();
    expected.sort();
    assert_eq!(read_existing_keys(dir.path()).unwrap(), expected);

    let reloaded = FluidConfig::load_from_db_path(dir.path());
    assert_eq!(&reloaded, loader.config());
    assert_eq!(reloaded.num_entries, 2048);
}
