mod config;
mod handler;
mod logging;

use std::sync::Arc;

use handler::{ChokeManager, ChokeOptions, ContentProvider, DirectoryContentProvider};
use peerdrop_core::{
    ConnectionRegistry, DownloadRequest, Endpoint, InMemorySignaling, OrchestratorOptions, PeerId,
    PeerTarget, SchedulerOptions, SignalingChannel, TransportMethod,
};
use tracing::info;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn print_help() {
    println!("peerdrop-host {} — content-addressed chunk transfer daemon", VERSION);
    println!();
    println!("USAGE:");
    println!("    peerdrop-host [OPTIONS]");
    println!("    peerdrop-host fetch --peer-addr <addr> --peer-port <port> --digest <hex> --out <path>");
    println!();
    println!("OPTIONS:");
    println!("    -h, --help       Print this help message and exit");
    println!("    -V, --version    Print version and exit");
    println!();
    println!("DESCRIPTION:");
    println!("    With no subcommand, runs the host daemon: serves chunks out of");
    println!("    the configured content directory to any peer that connects, and");
    println!("    answers handshake/metadata/chunk requests (spec-described C10).");
    println!();
    println!("    `fetch` runs a one-shot download against a single known peer,");
    println!("    driving the same multi-peer scheduler a full client would use.");
    println!();
    println!("CONFIGURATION:");
    println!("    Config file (optional, first found wins):");
    println!("      ~/.config/peerdrop/config.toml");
    println!("      /etc/peerdrop/config.toml");
    println!();
    println!("ENVIRONMENT VARIABLES (override config file):");
    println!("    PEERDROP_LISTEN_PORT          Reliable-stream listen port (default: 4949)");
    println!("    PEERDROP_CONTENT_DIR          Directory served to peers (default: ./peerdrop-content)");
    println!("    PEERDROP_CHUNK_SIZE           Chunk size in bytes (default: 262144)");
    println!("    PEERDROP_MAX_UNCHOKED         Unchoked peer count when choking is on (default: 4)");
    println!("    PEERDROP_CHOKE_INTERVAL_SECS  Choke recompute interval in seconds (default: 10)");
    println!("    PEERDROP_SUPER_SEED           1/true enables super-seed choking and turns choking on");
    println!();
    println!("    Stop the daemon with Ctrl+C or SIGTERM.");
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();
    match args.get(1).map(String::as_str) {
        Some("--version") | Some("-V") => {
            println!("peerdrop-host {VERSION}");
            return Ok(());
        }
        Some("--help") | Some("-h") => {
            print_help();
            return Ok(());
        }
        Some("fetch") => {
            let rt = tokio::runtime::Runtime::new()?;
            return rt.block_on(run_fetch(&args[2..]));
        }
        Some(other) if other.starts_with('-') => {
            eprintln!("peerdrop-host: unknown option '{other}'\n");
            print_help();
            std::process::exit(1);
        }
        _ => {}
    }

    logging::init();
    let cfg = config::load();
    info!(port = cfg.listen_port, content_dir = %cfg.content_dir.display(), "starting peerdrop-host");

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run_daemon(cfg))?;
    Ok(())
}

async fn run_daemon(cfg: config::Config) -> Result<(), Box<dyn std::error::Error>> {
    std::fs::create_dir_all(&cfg.content_dir)?;

    let providers: Arc<Vec<Arc<dyn ContentProvider>>> = Arc::new(vec![Arc::new(
        DirectoryContentProvider::new(cfg.content_dir.clone(), cfg.chunk_size),
    )]);

    let choke = if cfg.choking_enabled {
        let manager = ChokeManager::new(ChokeOptions {
            max_unchoked: cfg.max_unchoked,
            update_interval: std::time::Duration::from_secs(cfg.choke_interval_secs),
            super_seed: cfg.super_seed,
        });
        manager.clone().spawn_recompute_loop();
        Some(manager)
    } else {
        None
    };

    let advertised_endpoints = Arc::new(vec![Endpoint::new(
        "0.0.0.0",
        cfg.listen_port,
        TransportMethod::ReliableStream,
    )]);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", cfg.listen_port)).await?;
    info!(port = cfg.listen_port, "listening for inbound connections");
    tokio::spawn(handler::accept_stream_loop(
        listener,
        providers,
        choke,
        advertised_endpoints,
    ));

    shutdown_signal().await
}

async fn run_fetch(args: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    let mut peer_addr = None;
    let mut peer_port = None;
    let mut digest = None;
    let mut out = None;

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--peer-addr" => peer_addr = iter.next().cloned(),
            "--peer-port" => peer_port = iter.next().and_then(|s| s.parse::<u16>().ok()),
            "--digest" => digest = iter.next().cloned(),
            "--out" => out = iter.next().cloned(),
            other => {
                eprintln!("peerdrop-host fetch: unknown argument '{other}'");
                std::process::exit(1);
            }
        }
    }

    let (Some(peer_addr), Some(peer_port), Some(digest), Some(out)) = (peer_addr, peer_port, digest, out) else {
        eprintln!("usage: peerdrop-host fetch --peer-addr <addr> --peer-port <port> --digest <hex> --out <path>");
        std::process::exit(1);
    };

    logging::init();

    let registry = Arc::new(ConnectionRegistry::in_memory());
    let signaling: Arc<dyn SignalingChannel> = Arc::new(InMemorySignaling::new());
    let peer = PeerTarget {
        id: PeerId::new(format!("{peer_addr}:{peer_port}")),
        endpoints: vec![Endpoint::new(peer_addr, peer_port, TransportMethod::ReliableStream)],
    };

    let request = DownloadRequest {
        peers: vec![peer],
        digest,
        save_path: out.into(),
        resume: true,
        progress_callback: Some(Arc::new(|received, total| {
            info!(received, total, "download progress");
        })),
        peer_status_callback: None,
    };

    let opts = SchedulerOptions {
        orchestrator: OrchestratorOptions::default(),
        ..SchedulerOptions::default()
    };

    let (_handle, join) = peerdrop_core::scheduler::spawn(request, registry, Some(signaling), opts);
    match join.await {
        Ok(Ok(path)) => {
            info!(path = %path.display(), "download complete");
            Ok(())
        }
        Ok(Err(e)) => Err(Box::new(e)),
        Err(e) => Err(Box::new(e)),
    }
}

async fn shutdown_signal() -> Result<(), Box<dyn std::error::Error>> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).map_err(std::io::Error::other)?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
