// Copyright 2024-2026 extract-core Contributors
// SPDX-License-Identifier: Apache-2.0

//! Config CLI subcommands: show, defaults, validate.
//!
//! These commands resolve configuration the same way the engine does
//! (file, then environment) without starting it.

use std::path::PathBuf;

use crate::config::{EffectiveConfig, EngineConfig};

use super::load_config;

/// Print effective config as key-value pairs to stdout.
///
/// Returns 0 on success, 2 if the config file cannot be loaded.
pub fn run_show(path: Option<&PathBuf>) -> i32 {
    match load_config(path) {
        Ok(cfg) => {
            print_config(&cfg.effective_config());
            0
        }
        Err(e) => {
            eprintln!("ERROR: {e}");
            2
        }
    }
}

/// Print built-in defaults (no file, no env overrides) to stdout.
pub fn run_defaults() {
    print_config(&EngineConfig::default().effective_config());
}

/// Validate configuration for misconfigurations clamping cannot fix.
///
/// Returns 0 if valid, 1 if any warnings are found, 2 if loading fails.
pub fn run_validate(path: Option<&PathBuf>) -> i32 {
    let cfg = match load_config(path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("ERROR: {e}");
            return 2;
        }
    };
    let mut warnings = 0;

    if let Err(e) = cfg.validate() {
        eprintln!("WARNING: {e}");
        warnings += 1;
    }
    if cfg.defaults.concurrency_limit > cfg.max_concurrent {
        eprintln!(
            "WARNING: EXTRACT_CORE_DEFAULT_CONCURRENCY ({}) > EXTRACT_CORE_MAX_CONCURRENT ({}); batches cannot reach their limit",
            cfg.defaults.concurrency_limit, cfg.max_concurrent
        );
        warnings += 1;
    }
    if cfg.item_timeout < cfg.token_poll_interval {
        eprintln!(
            "WARNING: EXTRACT_CORE_ITEM_TIMEOUT_MS ({}) < EXTRACT_CORE_TOKEN_POLL_MS ({})",
            cfg.item_timeout.as_millis(),
            cfg.token_poll_interval.as_millis()
        );
        warnings += 1;
    }

    if warnings == 0 {
        println!("Configuration is valid.");
        0
    } else {
        1
    }
}

fn print_config(cfg: &EffectiveConfig) {
    println!("EXTRACT_CORE_MAX_CONCURRENT={}", cfg.max_concurrent);
    println!("EXTRACT_CORE_MAX_PENDING={}", cfg.max_pending);
    println!("EXTRACT_CORE_MAX_BATCH_ITEMS={}", cfg.max_batch_items);
    println!("EXTRACT_CORE_MAX_CONCURRENCY_LIMIT={}", cfg.max_concurrency_limit);
    println!("EXTRACT_CORE_GLOBAL_RATE_CAPACITY={}", cfg.global_rate_capacity);
    println!("EXTRACT_CORE_GLOBAL_RATE_PER_SEC={}", cfg.global_rate_per_sec);
    println!("EXTRACT_CORE_CACHE_TTL_SECS={}", cfg.cache_ttl_secs);
    println!("EXTRACT_CORE_CACHE_MAX_ENTRIES={}", cfg.cache_max_entries);
    println!("EXTRACT_CORE_ITEM_TIMEOUT_MS={}", cfg.item_timeout_ms);
    println!("EXTRACT_CORE_RETRY_MAX_ATTEMPTS={}", cfg.retry_max_attempts);
    println!("EXTRACT_CORE_RETRY_BASE_DELAY_MS={}", cfg.retry_base_delay_ms);
    println!("EXTRACT_CORE_RETRY_MULTIPLIER={}", cfg.retry_multiplier);
    println!("EXTRACT_CORE_RETRY_MAX_DELAY_MS={}", cfg.retry_max_delay_ms);
    println!("EXTRACT_CORE_RETRY_JITTER={}", cfg.retry_jitter);
    println!("EXTRACT_CORE_TOKEN_POLL_MS={}", cfg.token_poll_ms);
    println!("EXTRACT_CORE_BATCH_RETENTION_SECS={}", cfg.batch_retention_secs);
    println!("EXTRACT_CORE_MAINTENANCE_INTERVAL_SECS={}", cfg.maintenance_interval_secs);
    println!("EXTRACT_CORE_SHUTDOWN_TIMEOUT={}", cfg.shutdown_timeout_secs);
    println!("EXTRACT_CORE_DEFAULT_PRIORITY={}", cfg.defaults.priority);
    println!("EXTRACT_CORE_DEFAULT_CONCURRENCY={}", cfg.defaults.concurrency_limit);
    match cfg.defaults.rate_limit {
        Some(rate) => println!("EXTRACT_CORE_DEFAULT_RATE_LIMIT={rate}"),
        None => println!("EXTRACT_CORE_DEFAULT_RATE_LIMIT="),
    }
    println!("EXTRACT_CORE_DEFAULT_TTL_SECS={}", cfg.defaults.ttl.as_secs());
}
