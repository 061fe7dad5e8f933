//! # shardmap - shard map administration
//!
//! Command-line front end over a sled data directory holding the global shard
//! map and the local store of every shard.

use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::filter::EnvFilter;

use shardmap::{
    BackendConfig, LockOwnerId, ManagerConfig, Mapping, MappingDifferenceResolution,
    MappingStatus, ShardKey, ShardKeyType, ShardLocation, ShardMap, ShardMapKind,
    ShardMapManager, ShardRange, SledStoreProvider,
};

/// Shard map administration.
///
/// Shard locations are written `[protocol:]server[,port]/database`. Keys are
/// parsed for the shard map's key type; `min`, `max` and `+inf` are accepted.
#[derive(Parser, Debug)]
#[command(name = "shardmap", version, about = "Shard map administration")]
struct Args {
    /// Directory holding the global store and every shard's local store.
    #[arg(long, default_value = "shardmap.data")]
    data_dir: String,

    /// Log level - 'trace', 'debug', 'info', 'warn', or 'error'.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Print results as JSON.
    #[arg(long, default_value_t = false)]
    json: bool,

    /// Attempts per store call before a transient fault is reported.
    #[arg(long, default_value_t = 5)]
    retry_attempts: u32,

    /// Disable the mapping lookup cache.
    #[arg(long, default_value_t = false)]
    no_cache: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a shard map.
    CreateShardMap {
        name: String,
        /// 'range' or 'list'.
        #[arg(long, default_value = "range")]
        kind: String,
        /// int32, int64, guid, binary, datetime, timespan or datetimeoffset.
        #[arg(long, default_value = "int32")]
        key_type: String,
    },
    /// List shard maps with their shards and mappings.
    List {
        /// Restrict to one shard map.
        shard_map: Option<String>,
    },
    /// Add an empty shard.
    AddShard {
        shard_map: String,
        #[arg(long)]
        shard: String,
    },
    /// Remove a shard with no mappings.
    RemoveShard {
        shard_map: String,
        #[arg(long)]
        shard: String,
    },
    /// Map a range (`--low`/`--high`) or a single key (`--key`) to a shard.
    AddMapping {
        shard_map: String,
        #[arg(long)]
        shard: String,
        #[arg(long, conflicts_with = "key", requires = "high")]
        low: Option<String>,
        #[arg(long, requires = "low")]
        high: Option<String>,
        #[arg(long)]
        key: Option<String>,
        /// Create the mapping offline.
        #[arg(long, default_value_t = false)]
        offline: bool,
    },
    /// Take the mapping holding `key` offline and remove it.
    RemoveMapping {
        shard_map: String,
        key: String,
        /// Ignore any lock held on the mapping.
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    /// Resolve a key to its shard.
    Lookup { shard_map: String, key: String },
    /// Compare a shard's local mappings with the global map.
    Detect {
        #[arg(long)]
        shard: String,
        #[arg(long)]
        shard_map: Option<String>,
    },
    /// Detect and resolve differences on a shard in favor of one side.
    Resolve {
        #[arg(long)]
        shard: String,
        #[arg(long)]
        shard_map: Option<String>,
        /// 'shard' keeps the shard's mappings, 'shard-map' keeps the global ones.
        #[arg(long)]
        keep: String,
    },
    /// Rewrite a shard's local mappings from the global map.
    RebuildShard {
        #[arg(long)]
        shard: String,
        #[arg(long)]
        shard_map: Option<String>,
        /// Differing ranges (`LOW..HIGH`) where the shard's own mappings win.
        #[arg(long = "keep")]
        keep: Vec<String>,
    },
    /// Rebuild the global map from the local stores of the given shards.
    RebuildGlobal {
        #[arg(long = "shard", required = true)]
        shards: Vec<String>,
    },
    /// Register a shard found at a location in the global map.
    Attach {
        #[arg(long)]
        shard: String,
        #[arg(long)]
        shard_map: Option<String>,
    },
    /// Remove a shard from the global map, leaving its local store alone.
    Detach {
        #[arg(long)]
        shard: String,
        #[arg(long)]
        shard_map: Option<String>,
    },
    /// Replay pending operations.
    Replay {
        #[arg(long)]
        shard_map: Option<String>,
        /// Skip entries younger than this.
        #[arg(long, default_value_t = 0)]
        min_age_secs: u64,
    },
    /// Replay pending operations periodically until interrupted.
    Sweep {
        #[arg(long, default_value_t = 60)]
        interval_secs: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing/logging
    initialize_tracing(&args.log_level)?;

    let config = build_manager_config(&args);
    let provider = Arc::new(SledStoreProvider::new(config.backend.clone())?);
    let manager = ShardMapManager::new(provider.clone(), config);

    let result = match args.command {
        Command::Sweep { interval_secs } => run_sweeper(&manager, interval_secs).await,
        command => {
            // Store calls block; keep them off the runtime's worker threads.
            tokio::task::block_in_place(|| run_command(&manager, command, args.json))
        }
    };
    provider.flush()?;
    result
}

/// Initialize the tracing/logging system with the specified log level.
fn initialize_tracing(log_level: &str) -> anyhow::Result<()> {
    let env_filter = match log_level {
        "trace" => EnvFilter::new("trace"),
        "debug" => EnvFilter::new("debug"),
        "info" => EnvFilter::new("info"),
        "warn" => EnvFilter::new("warn"),
        "error" => EnvFilter::new("error"),
        _ => {
            eprintln!("Invalid log level: {}. Using 'info'", log_level);
            EnvFilter::new("info")
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_writer(std::io::stderr)
        .init();

    Ok(())
}

/// Build ManagerConfig from CLI arguments.
fn build_manager_config(args: &Args) -> ManagerConfig {
    ManagerConfig {
        backend: BackendConfig {
            data_dir: PathBuf::from(&args.data_dir),
            temporary: false,
            flush_interval_ms: 1000,
        },
        retry_max_attempts: args.retry_attempts,
        cache_enabled: !args.no_cache,
        // Admin commands run alone, so every pending entry is stale.
        replay_grace: Duration::ZERO,
        ..Default::default()
    }
}

async fn run_sweeper(manager: &ShardMapManager, interval_secs: u64) -> anyhow::Result<()> {
    let interval = Duration::from_secs(interval_secs.max(1));
    let handle = shardmap::operation::OperationSweeper::new(
        manager.context().clone(),
        interval,
        manager.config().replay_grace,
    )
    .run();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("Received interrupt, stopping sweeper");
    handle.abort();
    Ok(())
}

fn run_command(manager: &ShardMapManager, command: Command, as_json: bool) -> anyhow::Result<()> {
    match command {
        Command::CreateShardMap {
            name,
            kind,
            key_type,
        } => {
            let kind = parse_kind(&kind)?;
            let key_type = ShardKeyType::parse(&key_type)
                .ok_or_else(|| anyhow!("unknown key type: {}", key_type))?;
            let map = manager.create_shard_map(&name, kind, key_type)?;
            emit(as_json, json!({ "id": map.id, "name": map.name }), || {
                format!("Created shard map '{}' ({})", map.name, map.id)
            });
        }
        Command::List { shard_map } => {
            let maps = match shard_map {
                Some(name) => vec![manager.get_shard_map(&name)?],
                None => manager.list_shard_maps()?,
            };
            let mut out = Vec::new();
            for map in &maps {
                let shards = manager.get_shards(map)?;
                let mappings = manager.get_mappings(map, None)?;
                out.push(json!({
                    "name": map.name,
                    "kind": map.kind.to_string(),
                    "key_type": map.key_type.to_string(),
                    "shards": shards.iter().map(|s| json!({
                        "location": s.location.to_string(),
                        "status": format!("{:?}", s.status),
                        "version": s.version,
                    })).collect::<Vec<_>>(),
                    "mappings": mappings.iter().map(mapping_json).collect::<Vec<_>>(),
                }));
                if !as_json {
                    println!("{} ({}, {})", map.name, map.kind, map.key_type);
                    for shard in &shards {
                        println!("  shard {} v{} {:?}", shard.location, shard.version, shard.status);
                    }
                    for m in &mappings {
                        println!("  {}", m);
                    }
                }
            }
            if as_json {
                println!("{}", serde_json::to_string_pretty(&out)?);
            }
        }
        Command::AddShard { shard_map, shard } => {
            let map = manager.get_shard_map(&shard_map)?;
            let shard = manager.add_shard(&map, ShardLocation::parse(&shard)?)?;
            emit(as_json, json!({ "id": shard.id, "location": shard.location.to_string() }), || {
                format!("Added shard {} to '{}'", shard.location, map.name)
            });
        }
        Command::RemoveShard { shard_map, shard } => {
            let map = manager.get_shard_map(&shard_map)?;
            let shard = manager.get_shard(&map, &ShardLocation::parse(&shard)?)?;
            manager.remove_shard(&map, &shard)?;
            emit(as_json, json!({ "removed": shard.location.to_string() }), || {
                format!("Removed shard {} from '{}'", shard.location, map.name)
            });
        }
        Command::AddMapping {
            shard_map,
            shard,
            low,
            high,
            key,
            offline,
        } => {
            let map = manager.get_shard_map(&shard_map)?;
            let shard = manager.get_shard(&map, &ShardLocation::parse(&shard)?)?;
            let status = if offline {
                MappingStatus::Offline
            } else {
                MappingStatus::Online
            };
            let mapping = match (low, high, key) {
                (Some(low), Some(high), None) => {
                    let range = ShardRange::new(
                        ShardKey::parse(map.key_type, &low)?,
                        ShardKey::parse(map.key_type, &high)?,
                    )?;
                    manager.add_range_mapping(&map, &shard, range, status)?
                }
                (None, None, Some(key)) => {
                    let key = ShardKey::parse(map.key_type, &key)?;
                    manager.add_point_mapping(&map, &shard, key, status)?
                }
                _ => bail!("give either --low and --high, or --key"),
            };
            emit(as_json, mapping_json(&mapping), || format!("Added {}", mapping));
        }
        Command::RemoveMapping {
            shard_map,
            key,
            force,
        } => {
            let map = manager.get_shard_map(&shard_map)?;
            let mapping = mapping_for_key(manager, &map, &key)?;
            let owner = if force {
                LockOwnerId::FORCE
            } else {
                LockOwnerId::NONE
            };
            let mapping = if mapping.is_online() {
                manager.update_mapping_status(&map, &mapping, MappingStatus::Offline, owner)?
            } else {
                mapping
            };
            manager.remove_mapping(&map, &mapping, owner)?;
            emit(as_json, json!({ "removed": mapping.id }), || {
                format!("Removed mapping {}", mapping.range)
            });
        }
        Command::Lookup { shard_map, key } => {
            let map = manager.get_shard_map(&shard_map)?;
            let key = ShardKey::parse(map.key_type, &key)?;
            let mapping = manager.lookup(&map, &key)?;
            emit(as_json, mapping_json(&mapping), || {
                format!("{} -> {}", key, mapping.location)
            });
        }
        Command::Detect { shard, shard_map } => {
            let location = ShardLocation::parse(&shard)?;
            let recovery = manager.recovery_manager();
            let mut out = Vec::new();
            for token in recovery.detect_mapping_differences(&location, shard_map.as_deref())? {
                let map = recovery.shard_map(token)?;
                let diffs = recovery.get_mapping_differences(token)?;
                if !as_json {
                    println!("{} on {}: {} difference(s)", map.name, location, diffs.len());
                    for (range, place) in &diffs {
                        println!("  {} {}", range, place);
                    }
                }
                out.push(json!({
                    "shard_map": map.name,
                    "differences": diffs.iter().map(|(range, place)| json!({
                        "range": range.to_string(),
                        "location": place,
                    })).collect::<Vec<_>>(),
                }));
            }
            if as_json {
                println!("{}", serde_json::to_string_pretty(&out)?);
            }
        }
        Command::Resolve {
            shard,
            shard_map,
            keep,
        } => {
            let resolution = match keep.as_str() {
                "shard" => MappingDifferenceResolution::KeepShardMapping,
                "shard-map" => MappingDifferenceResolution::KeepShardMapMapping,
                other => bail!("--keep must be 'shard' or 'shard-map', got '{}'", other),
            };
            let location = ShardLocation::parse(&shard)?;
            let recovery = manager.recovery_manager();
            let tokens = recovery.detect_mapping_differences(&location, shard_map.as_deref())?;
            for token in &tokens {
                recovery.resolve_mapping_differences(*token, resolution)?;
            }
            emit(as_json, json!({ "resolved": tokens.len() }), || {
                format!("Resolved {} shard map(s) on {}", tokens.len(), location)
            });
        }
        Command::RebuildShard {
            shard,
            shard_map,
            keep,
        } => {
            let location = ShardLocation::parse(&shard)?;
            let recovery = manager.recovery_manager();
            let tokens = recovery.detect_mapping_differences(&location, shard_map.as_deref())?;
            if !keep.is_empty() && tokens.len() != 1 {
                bail!("--keep needs exactly one shard map; pass --shard-map");
            }
            for token in &tokens {
                let map = recovery.shard_map(*token)?;
                let ranges = keep
                    .iter()
                    .map(|text| parse_range(&map, text))
                    .collect::<anyhow::Result<Vec<_>>>()?;
                recovery.rebuild_mappings_on_shard(*token, &ranges)?;
            }
            emit(as_json, json!({ "rebuilt": tokens.len() }), || {
                format!("Rebuilt {} shard map(s) on {}", tokens.len(), location)
            });
        }
        Command::RebuildGlobal { shards } => {
            let locations = shards
                .iter()
                .map(|s| ShardLocation::parse(s))
                .collect::<Result<Vec<_>, _>>()?;
            let restored = manager
                .recovery_manager()
                .rebuild_mappings_on_shard_map_manager_from_shards(&locations)?;
            emit(as_json, json!({ "mappings": restored }), || {
                format!("Restored {} mapping(s) from {} shard(s)", restored, locations.len())
            });
        }
        Command::Attach { shard, shard_map } => {
            let location = ShardLocation::parse(&shard)?;
            let attached = manager
                .recovery_manager()
                .attach_shard(&location, shard_map.as_deref())?;
            emit(as_json, json!({ "attached": attached.len() }), || {
                format!("Attached {} at {}", plural(attached.len(), "shard"), location)
            });
        }
        Command::Detach { shard, shard_map } => {
            let location = ShardLocation::parse(&shard)?;
            let detached = manager
                .recovery_manager()
                .detach_shard(&location, shard_map.as_deref())?;
            emit(as_json, json!({ "detached": detached }), || {
                format!("Detached {} at {}", plural(detached, "shard"), location)
            });
        }
        Command::Replay {
            shard_map,
            min_age_secs,
        } => {
            let map = shard_map.map(|name| manager.get_shard_map(&name)).transpose()?;
            let summary = manager
                .replay_pending_operations(map.as_ref(), Duration::from_secs(min_age_secs))?;
            emit(as_json, serde_json::to_value(&summary)?, || {
                format!(
                    "completed {}, undone {}, deferred {}, failed {}",
                    summary.completed, summary.undone, summary.deferred, summary.failed
                )
            });
        }
        Command::Sweep { .. } => bail!("sweep is run by main"),
    }
    Ok(())
}

fn emit(as_json: bool, value: serde_json::Value, text: impl FnOnce() -> String) {
    if as_json {
        println!("{}", value);
    } else {
        println!("{}", text());
    }
}

fn plural(n: usize, noun: &str) -> String {
    if n == 1 {
        format!("1 {}", noun)
    } else {
        format!("{} {}s", n, noun)
    }
}

fn mapping_json(m: &Mapping) -> serde_json::Value {
    json!({
        "id": m.id,
        "range": m.range.to_string(),
        "location": m.location.to_string(),
        "status": format!("{:?}", m.status),
        "version": m.version,
        "locked": !m.lock_owner.is_none(),
    })
}

fn parse_kind(text: &str) -> anyhow::Result<ShardMapKind> {
    match text.to_ascii_lowercase().as_str() {
        "range" => Ok(ShardMapKind::Range),
        "list" => Ok(ShardMapKind::List),
        _ => Err(anyhow!("Invalid shard map kind: {}. Must be 'range' or 'list'", text)),
    }
}

/// Parses `LOW..HIGH` for the shard map's key type.
fn parse_range(map: &ShardMap, text: &str) -> anyhow::Result<ShardRange> {
    let (low, high) = text
        .split_once("..")
        .ok_or_else(|| anyhow!("invalid range {:?}, expected LOW..HIGH", text))?;
    Ok(ShardRange::new(
        ShardKey::parse(map.key_type, low)?,
        ShardKey::parse(map.key_type, high)?,
    )?)
}

fn mapping_for_key(
    manager: &ShardMapManager,
    map: &ShardMap,
    text: &str,
) -> anyhow::Result<Mapping> {
    let key = ShardKey::parse(map.key_type, text)?;
    let point = ShardRange::point(key.clone())?;
    manager
        .get_mappings_for_range(map, &point)?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("no mapping holds key {} in '{}'", key, map.name))
}
