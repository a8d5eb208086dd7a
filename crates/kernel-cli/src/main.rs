use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;

use kernel_api::{serve, IndexBackend, ManagerOptions, MirrorConfig, MultiWorldConfig, WorldManager};
use tracing_subscriber::EnvFilter;

const DEFAULT_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_DATA_DIR: &str = "./data";
const DEFAULT_WORLDS_PATH: &str = "./configs/worlds.yaml";
const DEFAULT_SEED: i64 = 1337;

fn print_usage() {
    println!("kernel-cli <command>");
    println!("commands:");
    println!("  serve [flags]");
    println!("    --addr <addr>        listen address (default {DEFAULT_ADDR})");
    println!("    --data-dir <path>    runtime data directory (default {DEFAULT_DATA_DIR})");
    println!("    --worlds <path>      worlds.yaml; built-in worlds when absent (default {DEFAULT_WORLDS_PATH})");
    println!("    --seed <n>           seed for fresh worlds (default {DEFAULT_SEED})");
    println!("    --disable-index      skip the tick/audit/snapshot index");
    println!("    --fresh              ignore snapshots already on disk");
}

#[derive(Debug, Clone, PartialEq)]
struct ServeArgs {
    addr: SocketAddr,
    data_dir: PathBuf,
    worlds: PathBuf,
    seed: i64,
    disable_index: bool,
    load_latest_snapshot: bool,
}

fn parse_serve_args(args: &[String]) -> Result<ServeArgs, String> {
    let mut parsed = ServeArgs {
        addr: parse_socket_addr(DEFAULT_ADDR)?,
        data_dir: PathBuf::from(DEFAULT_DATA_DIR),
        worlds: PathBuf::from(DEFAULT_WORLDS_PATH),
        seed: DEFAULT_SEED,
        disable_index: false,
        load_latest_snapshot: true,
    };
    let mut iter = args.iter();
    while let Some(flag) = iter.next() {
        let mut value = |label: &str| {
            iter.next()
                .cloned()
                .ok_or_else(|| format!("missing value for {label}"))
        };
        match flag.as_str() {
            "--addr" => parsed.addr = parse_socket_addr(&value("--addr")?)?,
            "--data-dir" => parsed.data_dir = PathBuf::from(value("--data-dir")?),
            "--worlds" => parsed.worlds = PathBuf::from(value("--worlds")?),
            "--seed" => {
                let raw = value("--seed")?;
                parsed.seed = raw
                    .parse::<i64>()
                    .map_err(|_| format!("invalid seed: {raw}"))?;
            }
            "--disable-index" => parsed.disable_index = true,
            "--fresh" => parsed.load_latest_snapshot = false,
            other => return Err(format!("unknown flag: {other}")),
        }
    }
    Ok(parsed)
}

fn parse_socket_addr(raw: &str) -> Result<SocketAddr, String> {
    raw.parse::<SocketAddr>()
        .map_err(|_| format!("invalid addr: {raw}"))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Resolves on SIGINT or SIGTERM. SIGHUP is swallowed.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match (signal(SignalKind::terminate()), signal(SignalKind::hangup())) {
            (Ok(mut term), Ok(mut hup)) => loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    _ = term.recv() => break,
                    _ = hup.recv() => tracing::info!("SIGHUP ignored"),
                }
            },
            _ => {
                tracing::warn!("signal handlers unavailable; waiting for ctrl-c only");
                if tokio::signal::ctrl_c().await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
        }
    }
    #[cfg(not(unix))]
    {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
    tracing::info!("shutdown requested");
}

async fn run_serve(args: ServeArgs) -> Result<(), String> {
    let worlds_path = args.worlds.exists().then_some(args.worlds.as_path());
    let directory = MultiWorldConfig::load(worlds_path)
        .map_err(|err| format!("failed to load worlds: {err}"))?;
    let index = if args.disable_index {
        IndexBackend::Disabled
    } else {
        IndexBackend::from_env().map_err(|err| format!("invalid index backend: {err}"))?
    };
    let manager = WorldManager::start(
        directory,
        ManagerOptions {
            data_dir: Some(args.data_dir.clone()),
            seed: args.seed,
            index,
            mirror: MirrorConfig::from_env(),
            load_latest_snapshot: args.load_latest_snapshot,
        },
    )
    .map_err(|err| format!("failed to start worlds: {err}"))?;

    tracing::info!(
        addr = %args.addr,
        data_dir = %args.data_dir.display(),
        worlds = manager.world_ids().len(),
        "serving voxel worlds"
    );
    let served = serve(args.addr, std::sync::Arc::clone(&manager), shutdown_signal()).await;
    manager.shutdown().await;
    served.map_err(|err| format!("server error: {err}"))
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();
    let command = args.get(1).map(String::as_str);

    match command {
        Some("serve") => match parse_serve_args(&args[2..]) {
            Ok(serve_args) => {
                init_tracing();
                if let Err(err) = run_serve(serve_args).await {
                    tracing::error!("{err}");
                    eprintln!("error: {err}");
                    std::process::exit(1);
                }
            }
            Err(err) => {
                eprintln!("error: {err}");
                print_usage();
                std::process::exit(2);
            }
        },
        Some("help") | Some("--help") | Some("-h") => print_usage(),
        _ => {
            print_usage();
            std::process::exit(2);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn serve_flags_override_defaults() {
        let parsed = parse_serve_args(&args(&[
            "--addr",
            "127.0.0.1:9000",
            "--data-dir",
            "/tmp/vc",
            "--seed",
            "-4",
            "--disable-index",
            "--fresh",
        ]))
        .expect("flags");
        assert_eq!(parsed.addr, "127.0.0.1:9000".parse::<SocketAddr>().expect("addr"));
        assert_eq!(parsed.data_dir, PathBuf::from("/tmp/vc"));
        assert_eq!(parsed.seed, -4);
        assert!(parsed.disable_index);
        assert!(!parsed.load_latest_snapshot);
        assert_eq!(parsed.worlds, PathBuf::from(DEFAULT_WORLDS_PATH));
    }

    #[test]
    fn bad_flags_are_reported() {
        assert!(parse_serve_args(&args(&["--seed"])).is_err());
        assert!(parse_serve_args(&args(&["--seed", "many"])).is_err());
        assert!(parse_serve_args(&args(&["--addr", "nowhere"])).is_err());
        assert!(parse_serve_args(&args(&["--verbose"])).is_err());
        let defaults = parse_serve_args(&[]).expect("defaults");
        assert!(defaults.load_latest_snapshot);
        assert_eq!(defaults.seed, DEFAULT_SEED);
    }
}
