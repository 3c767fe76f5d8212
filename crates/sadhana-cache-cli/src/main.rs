//! sadhana-cache - inspect and maintain the sadhana tracker's on-disk cache.
//!
//! Operates on the persistent tier in the configured cache directory
//! (`SADHANA_CACHE_DIR` overrides it). Log verbosity follows `RUST_LOG`.

use std::io;
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use sadhana_cache_core::{
    CacheManager, CacheSettings, DomainEvent, InvalidationManager, NoopQueryLayer,
};
use serde_json::Value;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const USAGE: &str = "\
Usage: sadhana-cache <command> [options]

Commands:
  stats                              Print persistent entry counts and bytes used
  list                               List persistent entries with age
  get <key> [--scope S]              Print a cached value
  set <key> <json> [--scope S] [--ttl-ms N]
                                     Cache a value (default TTL from config)
  delete <key> [--scope S]           Remove one entry
  delete-pattern <glob> [--scope S]  Remove entries whose key matches the glob
  clear [--scope S]                  Remove a scope's entries, or everything
  sweep                              Remove expired entries once
  watch                              Sweep periodically until Ctrl-C
  event <name> [subject] [--user U]  Apply a domain event's invalidations
                                     (global entries only without --user)
  config [--init]                    Show settings, or write the defaults";

/// Initialize the tracing subscriber for logging
fn init_tracing() {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
}

// ============================================================================
// Argument parsing
// ============================================================================

/// Positional arguments plus the recognized `--flag value` options.
#[derive(Debug, Default, PartialEq)]
struct Args {
    positional: Vec<String>,
    scope: Option<String>,
    user: Option<String>,
    ttl_ms: Option<i64>,
    init: bool,
}

impl Args {
    fn parse(raw: &[String]) -> Result<Self> {
        let mut args = Args::default();
        let mut iter = raw.iter();
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "--scope" => args.scope = Some(flag_value(&mut iter, "--scope")?),
                "--user" => args.user = Some(flag_value(&mut iter, "--user")?),
                "--ttl-ms" => {
                    let value = flag_value(&mut iter, "--ttl-ms")?;
                    args.ttl_ms = Some(
                        value
                            .parse()
                            .map_err(|_| anyhow!("--ttl-ms expects milliseconds, got '{}'", value))?,
                    );
                }
                "--init" => args.init = true,
                flag if flag.starts_with("--") => bail!("Unknown option: {}", flag),
                _ => args.positional.push(arg.clone()),
            }
        }
        Ok(args)
    }

    fn positional(&self, index: usize, name: &str) -> Result<&str> {
        self.positional
            .get(index)
            .map(String::as_str)
            .ok_or_else(|| anyhow!("Missing <{}>\n\n{}", name, USAGE))
    }
}

fn flag_value<'a>(iter: &mut impl Iterator<Item = &'a String>, flag: &str) -> Result<String> {
    iter.next()
        .cloned()
        .ok_or_else(|| anyhow!("{} requires a value", flag))
}

/// Accept JSON, falling back to a plain string for convenience.
fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    init_tracing();

    let raw: Vec<String> = std::env::args().skip(1).collect();
    let Some((command, rest)) = raw.split_first() else {
        println!("{}", USAGE);
        return Ok(());
    };
    let args = Args::parse(rest)?;

    let settings = CacheSettings::load()?;
    if command.as_str() == "config" {
        return show_config(&settings, args.init);
    }

    let cache = Arc::new(CacheManager::open(&settings)?);
    info!(dir = %settings.cache_dir()?.display(), command = %command, "sadhana-cache starting");
    let scope = args.scope.as_deref();

    match command.as_str() {
        "stats" => {
            println!("{}", serde_json::to_string_pretty(&cache.persistent_stats())?);
        }
        "list" => {
            let now = cache.now();
            for (key, entry) in cache.persistent_entries() {
                let state = if entry.is_fresh_at(now) { "fresh" } else { "stale" };
                println!("{:<48} {:>10}  {}", key, entry.age_display_at(now), state);
            }
        }
        "get" => {
            let key = args.positional(0, "key")?;
            match cache.get::<Value>(key, scope) {
                Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                None => bail!("No fresh entry for '{}'", key),
            }
        }
        "set" => {
            let key = args.positional(0, "key")?;
            let value = parse_value(args.positional(1, "json")?);
            let ttl = args
                .ttl_ms
                .map(chrono::Duration::milliseconds)
                .unwrap_or_else(|| settings.default_ttl());
            cache.set(key, &value, ttl, scope);
        }
        "delete" => {
            let key = args.positional(0, "key")?;
            if !cache.delete(key, scope) {
                println!("'{}' was not cached", key);
            }
        }
        "delete-pattern" => {
            let glob = args.positional(0, "glob")?;
            println!("Removed {} entries", cache.delete_pattern(glob, scope));
        }
        "clear" => {
            println!("Removed {} entries", cache.clear(scope));
        }
        "sweep" => {
            println!("Removed {} expired entries", cache.sweep());
        }
        "watch" => {
            let sweeper = cache.spawn_sweeper(settings.sweep_interval());
            println!(
                "Sweeping every {}s, press Ctrl-C to stop",
                settings.sweep_interval_secs
            );
            tokio::signal::ctrl_c().await?;
            sweeper.shutdown().await;
        }
        "event" => {
            let name = args.positional(0, "name")?;
            let event = DomainEvent::parse(name, args.positional.get(1).map(String::as_str))?;
            println!("{}", apply_event(cache.clone(), &event, args.user.as_deref()));
        }
        other => bail!("Unknown command: {}\n\n{}", other, USAGE),
    }

    Ok(())
}

/// Run `event` through an invalidation manager scoped to `user`, if any.
fn apply_event(cache: Arc<CacheManager>, event: &DomainEvent, user: Option<&str>) -> String {
    let invalidation = InvalidationManager::new(cache, Arc::new(NoopQueryLayer));
    match user {
        Some(user) => {
            invalidation.set_user_id(user);
            format!(
                "{}: removed {} entries (user {} and global)",
                event,
                invalidation.handle(event),
                user
            )
        }
        None => format!(
            "{}: removed {} entries (global only; pass --user to include a user's entries)",
            event,
            invalidation.handle(event)
        ),
    }
}

fn show_config(settings: &CacheSettings, init: bool) -> Result<()> {
    if init {
        CacheSettings::default().save()?;
        println!("Wrote defaults to {}", CacheSettings::config_path()?.display());
        return Ok(());
    }
    println!("config:    {}", CacheSettings::config_path()?.display());
    println!("cache dir: {}", settings.cache_dir()?.display());
    println!("{}", serde_json::to_string_pretty(settings)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use sadhana_cache_core::{MemoryStore, SystemClock};

    use super::*;

    fn strings(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_options_anywhere() {
        let args = Args::parse(&strings(&["--scope", "u1", "books:*"])).expect("parse");
        assert_eq!(args.positional, vec!["books:*".to_string()]);
        assert_eq!(args.scope.as_deref(), Some("u1"));

        let args = Args::parse(&strings(&["sadhana_completed", "s42", "--user", "u1"]))
            .expect("parse");
        assert_eq!(args.positional(1, "subject").expect("subject"), "s42");
        assert_eq!(args.user.as_deref(), Some("u1"));
    }

    #[test]
    fn test_parse_ttl() {
        let args = Args::parse(&strings(&["k", "1", "--ttl-ms", "1500"])).expect("parse");
        assert_eq!(args.ttl_ms, Some(1500));
        assert!(Args::parse(&strings(&["--ttl-ms", "soon"])).is_err());
    }

    #[test]
    fn test_parse_rejects_bad_flags() {
        assert!(Args::parse(&strings(&["--scope"])).is_err());
        assert!(Args::parse(&strings(&["--verbose"])).is_err());
    }

    #[test]
    fn test_missing_positional() {
        let args = Args::parse(&[]).expect("parse");
        assert!(args.positional(0, "key").is_err());
    }

    fn memory_cache() -> Arc<CacheManager> {
        Arc::new(CacheManager::new(
            Arc::new(MemoryStore::new()),
            Arc::new(SystemClock),
        ))
    }

    #[test]
    fn test_event_without_user_is_global_only() {
        let cache = memory_cache();
        let ttl = chrono::Duration::minutes(5);
        cache.set("profile:detail", &"mine", ttl, Some("u1"));
        cache.set("community:stats", &1, ttl, None);

        let event = DomainEvent::parse("profile_updated", None).expect("event");
        let output = apply_event(cache.clone(), &event, None);
        assert!(output.contains("removed 0 entries"));
        assert!(output.contains("global only"));
        assert!(cache.get::<String>("profile:detail", Some("u1")).is_some());

        let output = apply_event(cache.clone(), &event, Some("u1"));
        assert!(output.contains("removed 1 entries (user u1 and global)"));
        assert!(cache.get::<String>("profile:detail", Some("u1")).is_none());
    }

    #[test]
    fn test_parse_value() {
        assert_eq!(parse_value("{\"a\":1}"), serde_json::json!({"a": 1}));
        assert_eq!(parse_value("42"), serde_json::json!(42));
        assert_eq!(parse_value("hello"), Value::String("hello".to_string()));
    }
}
