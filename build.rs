use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;

#[derive(Deserialize, Default)]
struct ConfigSection {
    intermediate_bits: Option<usize>,
    min_chunk_bits: Option<usize>,
    max_small_bits: Option<usize>,
    min_object_count: Option<usize>,
    remote_cache_bytes: Option<usize>,
    remote_slot_bits: Option<usize>,
    max_post_rounds: Option<usize>,
    heap_growth_bytes: Option<usize>,
}

#[derive(Deserialize, Default)]
struct Config {
    #[serde(default)]
    config: ConfigSection,
}

struct ResolvedConfig {
    intermediate_bits: usize,
    min_chunk_bits: usize,
    max_small_bits: usize,
    min_object_count: usize,
    remote_cache_bytes: usize,
    remote_slot_bits: usize,
    max_post_rounds: usize,
    heap_growth_bytes: usize,
}

fn resolve_config(cfg: &ConfigSection) -> ResolvedConfig {
    let intermediate_bits = cfg.intermediate_bits.unwrap_or(2);
    let min_chunk_bits = cfg.min_chunk_bits.unwrap_or(14);
    let max_small_bits = cfg.max_small_bits.unwrap_or(16);
    // Slabs must hold more objects when the free-list mitigations are on, so
    // the two-queue randomisation has entries to interleave.
    let check_client = env::var("CARGO_FEATURE_CHECK_CLIENT").is_ok();
    let min_object_count = cfg
        .min_object_count
        .unwrap_or(if check_client { 13 } else { 4 });
    let remote_cache_bytes = cfg.remote_cache_bytes.unwrap_or(1 << min_chunk_bits);
    let remote_slot_bits = cfg.remote_slot_bits.unwrap_or(6);
    let max_post_rounds = cfg.max_post_rounds.unwrap_or(8);
    let heap_growth_bytes = cfg.heap_growth_bytes.unwrap_or(2 * 1024 * 1024);

    // The smallest allocation is two pointers; the size-encoding mantissa
    // must fit below its log2.
    assert!(
        intermediate_bits < 4,
        "intermediate_bits ({}) must be less than log2 of the minimum allocation size",
        intermediate_bits
    );
    assert!(
        (12..=20).contains(&min_chunk_bits),
        "min_chunk_bits ({}) must be in 12..=20",
        min_chunk_bits
    );
    assert!(
        max_small_bits >= min_chunk_bits,
        "max_small_bits ({}) must be >= min_chunk_bits ({})",
        max_small_bits,
        min_chunk_bits
    );
    assert!(
        max_small_bits <= 20,
        "max_small_bits ({}) must be <= 20 so slab capacities fit in u16",
        max_small_bits
    );
    assert!(
        min_object_count > 0,
        "min_object_count must be greater than zero"
    );
    assert!(
        remote_cache_bytes > 0,
        "remote_cache_bytes must be greater than zero"
    );
    assert!(
        (1..=12).contains(&remote_slot_bits),
        "remote_slot_bits ({}) must be in 1..=12",
        remote_slot_bits
    );
    assert!(
        max_post_rounds > 0,
        "max_post_rounds must be greater than zero"
    );
    assert!(
        heap_growth_bytes >= (1 << min_chunk_bits),
        "heap_growth_bytes ({}) must be at least one chunk ({})",
        heap_growth_bytes,
        1usize << min_chunk_bits
    );
    assert!(
        heap_growth_bytes.is_power_of_two(),
        "heap_growth_bytes ({}) must be a power of 2",
        heap_growth_bytes
    );

    ResolvedConfig {
        intermediate_bits,
        min_chunk_bits,
        max_small_bits,
        min_object_count,
        remote_cache_bytes,
        remote_slot_bits,
        max_post_rounds,
        heap_growth_bytes,
    }
}

fn default_config_path() -> String {
    let manifest_dir = env::var("CARGO_MANIFEST_DIR").unwrap();
    format!("{}/rxmalloc.toml", manifest_dir)
}

fn generate_config(cfg: &ResolvedConfig, out_path: &Path) {
    let code = format!(
        "// Auto-generated by build.rs. Do not edit.\n\n\
         pub const INTERMEDIATE_BITS: usize = {};\n\
         pub const MIN_CHUNK_BITS: usize = {};\n\
         pub const MIN_CHUNK_SIZE: usize = 1 << MIN_CHUNK_BITS;\n\
         pub const MAX_SMALL_SIZECLASS_BITS: usize = {};\n\
         pub const MAX_SMALL_SIZECLASS_SIZE: usize = 1 << MAX_SMALL_SIZECLASS_BITS;\n\
         pub const MIN_OBJECT_COUNT: usize = {};\n\
         pub const REMOTE_CACHE_BYTES: usize = {};\n\
         pub const REMOTE_SLOT_BITS: usize = {};\n\
         pub const REMOTE_SLOTS: usize = 1 << REMOTE_SLOT_BITS;\n\
         pub const REMOTE_MASK: usize = REMOTE_SLOTS - 1;\n\
         pub const MAX_POST_ROUNDS: usize = {};\n\
         pub const HEAP_GROWTH_BYTES: usize = {};\n",
        cfg.intermediate_bits,
        cfg.min_chunk_bits,
        cfg.max_small_bits,
        cfg.min_object_count,
        cfg.remote_cache_bytes,
        cfg.remote_slot_bits,
        cfg.max_post_rounds,
        cfg.heap_growth_bytes,
    );
    fs::write(out_path, code).expect("failed to write config_gen.rs");
}

fn main() {
    println!("cargo:rerun-if-env-changed=RXMALLOC_CONFIG");
    println!("cargo:rerun-if-env-changed=CARGO_FEATURE_CHECK_CLIENT");

    let out_dir = env::var("OUT_DIR").unwrap();

    let config_path = env::var("RXMALLOC_CONFIG").unwrap_or_else(|_| default_config_path());
    println!("cargo:rerun-if-changed={}", config_path);
    let content = fs::read_to_string(&config_path)
        .unwrap_or_else(|e| panic!("failed to read {}: {}", config_path, e));

    let config: Config = toml::from_str(&content).expect("failed to parse TOML config");

    let resolved = resolve_config(&config.config);
    generate_config(&resolved, &Path::new(&out_dir).join("config_gen.rs"));
}
