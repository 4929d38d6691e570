use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;

#[derive(Deserialize, Default)]
struct ConfigSection {
    arena_size: Option<usize>,
    cache_cap: Option<usize>,
    max_cpus: Option<usize>,
    index_buckets: Option<usize>,
}

#[derive(Deserialize, Default)]
struct Config {
    #[serde(default)]
    config: ConfigSection,
    #[serde(default)]
    classes: Vec<usize>,
}

struct ResolvedConfig {
    arena_size: usize,
    arena_shift: u32,
    cache_cap: usize,
    max_cpus: usize,
    index_buckets: usize,
}

fn resolve_config(cfg: &ConfigSection) -> ResolvedConfig {
    let arena_size = cfg.arena_size.unwrap_or(2 * 1024 * 1024);
    assert!(
        arena_size.is_power_of_two(),
        "arena_size ({}) must be a power of 2",
        arena_size
    );
    assert!(
        arena_size >= 64 * 1024,
        "arena_size ({}) must be >= 64 KiB",
        arena_size
    );

    let cache_cap = cfg.cache_cap.unwrap_or(64);
    let max_cpus = cfg.max_cpus.unwrap_or(64);
    let index_buckets = cfg.index_buckets.unwrap_or(101);

    assert!(
        cache_cap >= 2 && cache_cap % 2 == 0,
        "cache_cap ({}) must be an even number >= 2",
        cache_cap
    );
    assert!(max_cpus > 0, "max_cpus must be > 0");
    assert!(index_buckets > 0, "index_buckets must be > 0");

    ResolvedConfig {
        arena_size,
        arena_shift: arena_size.trailing_zeros(),
        cache_cap,
        max_cpus,
        index_buckets,
    }
}

fn validate_classes(classes: &[usize], arena_size: usize) {
    assert!(!classes.is_empty(), "NVMALLOC_CONFIG: no size classes defined");
    assert!(
        classes.len() < 64,
        "NVMALLOC_CONFIG: too many classes ({}, max 63)",
        classes.len()
    );
    for (i, &size) in classes.iter().enumerate() {
        assert!(
            size.is_power_of_two(),
            "class {}: size {} must be a power of 2",
            i,
            size
        );
        assert!(size >= 8, "class {}: size {} must be >= 8", i, size);
        assert!(
            size < arena_size,
            "class {}: size {} must be < arena_size {}",
            i,
            size,
            arena_size
        );
        if i > 0 {
            assert!(
                size > classes[i - 1],
                "class {}: size {} must be > previous size {}",
                i,
                size,
                classes[i - 1]
            );
        }
    }
}

fn default_config_path() -> String {
    let manifest_dir = env::var("CARGO_MANIFEST_DIR").unwrap();
    format!("{}/nvmalloc.toml", manifest_dir)
}

fn generate_config(cfg: &ResolvedConfig, out_path: &Path) {
    let code = format!(
        "// Auto-generated by build.rs. Do not edit.\n\n\
         pub const ARENA_SHIFT: usize = {};\n\
         pub const ARENA_SIZE: usize = {};\n\
         pub const CACHE_CAP: usize = {};\n\
         pub const CACHE_BATCH: usize = {};\n\
         pub const MAX_CPUS: usize = {};\n\
         pub const INDEX_BUCKETS: usize = {};\n",
        cfg.arena_shift,
        cfg.arena_size,
        cfg.cache_cap,
        cfg.cache_cap / 2,
        cfg.max_cpus,
        cfg.index_buckets,
    );
    fs::write(out_path, code).expect("failed to write config_gen.rs");
}

fn generate_size_classes(classes: &[usize], out_path: &Path) {
    let mut code = String::from("// Auto-generated by build.rs. Do not edit.\n\n");
    code.push_str(&format!(
        "pub const SC_COUNT: usize = {};\n\n",
        classes.len()
    ));
    code.push_str(&format!(
        "pub static SIZE_CLASSES: [usize; {}] = [\n",
        classes.len()
    ));
    for size in classes {
        code.push_str(&format!("    {},\n", size));
    }
    code.push_str("];\n");

    fs::write(out_path, code).expect("failed to write size_class_gen.rs");
}

fn main() {
    println!("cargo:rerun-if-env-changed=NVMALLOC_CONFIG");

    let out_dir = env::var("OUT_DIR").unwrap();

    let config_path = env::var("NVMALLOC_CONFIG").unwrap_or_else(|_| default_config_path());
    println!("cargo:rerun-if-changed={}", config_path);
    let content = fs::read_to_string(&config_path)
        .unwrap_or_else(|e| panic!("failed to read {}: {}", config_path, e));

    let config: Config = toml::from_str(&content).expect("failed to parse TOML config");

    let resolved = resolve_config(&config.config);
    validate_classes(&config.classes, resolved.arena_size);

    generate_config(&resolved, &Path::new(&out_dir).join("config_gen.rs"));
    generate_size_classes(&config.classes, &Path::new(&out_dir).join("size_class_gen.rs"));
}
