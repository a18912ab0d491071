use acct_server::audit::{AuditEntry, AuditLogger, EventId};
use acct_server::store::{Store, ValkeyStore};
use acct_server::{logging, AcctServer, Config, PacketHandler};
use clap::Parser;
use std::process;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// EAP-AKA RADIUS Accounting Server (RFC 2866)
///
/// Configuration is read from the environment: REDIS_HOST, REDIS_PORT,
/// REDIS_PASS (required), REDIS_DB, LISTEN_ADDR, RADIUS_SECRET,
/// LOG_MASK_IMSI, LOG_LEVEL, LOG_FORMAT, AUDIT_LOG_PATH.
#[derive(Parser, Debug)]
#[command(author, about, long_about = None)]
#[command(name = "eapaka-acct")]
struct Cli {
    /// Validate configuration and exit (doesn't start server)
    #[arg(long)]
    validate: bool,

    /// Print version information and exit
    #[arg(short = 'V', long)]
    version: bool,
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.version {
        println!("eapaka-acct v{}", env!("CARGO_PKG_VERSION"));
        println!("RADIUS Accounting Server for EAP-AKA (RFC 2866, RFC 5997)");
        println!();
        println!("Repository: {}", env!("CARGO_PKG_REPOSITORY"));
        println!("License: {}", env!("CARGO_PKG_LICENSE"));
        process::exit(0);
    }

    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            if cli.validate {
                eprintln!("Configuration validation failed!");
                eprintln!("   Error: {}", e);
            } else {
                logging::init_fallback();
                error!("Invalid configuration: {}", e);
            }
            process::exit(1);
        }
    };

    if cli.validate {
        println!("Configuration validated successfully!");
        println!();
        println!("Configuration summary:");
        println!("  Listen: {}", config.listen_addr);
        println!("  Store: {}:{} db {}", config.redis_host, config.redis_port, config.redis_db);
        println!(
            "  Store password: {}",
            if config.redis_password.is_empty() { "(none)" } else { "********" }
        );
        println!(
            "  Fallback secret: {}",
            if config.radius_secret.is_some() { "set" } else { "not set" }
        );
        println!("  Mask IMSI: {}", config.log_mask_imsi);
        println!("  Log level: {} ({:?})", config.log_level, config.log_format);
        if let Some(ref path) = config.audit_log_path {
            println!("  Audit log: {}", path);
        }
        process::exit(0);
    }

    if let Err(e) = logging::init(&config) {
        eprintln!("{}", e);
        process::exit(1);
    }

    info!("eapaka-acct v{}", env!("CARGO_PKG_VERSION"));

    let audit = match AuditLogger::new(config.audit_log_path.as_ref()) {
        Ok(logger) => Arc::new(logger),
        Err(e) => {
            error!("Failed to open audit log: {}", e);
            process::exit(1);
        }
    };
    if let Some(path) = audit.file_path() {
        info!("Audit logging enabled: {}", path.display());
    }

    let store = match ValkeyStore::connect(config.valkey_config()).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("Failed to create store client: {}", e);
            process::exit(1);
        }
    };

    // Store outages are tolerated; the listener starts regardless.
    match store.ping().await {
        Ok(()) => info!("Connected to store at {}:{}", config.redis_host, config.redis_port),
        Err(e) => {
            audit
                .log(AuditEntry::new(EventId::ValkeyConnErr, "Store not reachable at startup").with_details(e.to_string()))
                .await
        }
    }

    let listen_addr = match config.listen_socket_addr() {
        Ok(addr) => addr,
        Err(e) => {
            error!("{}", e);
            process::exit(1);
        }
    };

    let handler = PacketHandler::new(
        store.clone(),
        Arc::clone(&audit),
        config.fallback_secret(),
        config.log_mask_imsi,
    );

    let server = match AcctServer::bind(listen_addr, handler).await {
        Ok(srv) => srv,
        Err(e) => {
            error!("Failed to create server: {}", e);
            process::exit(1);
        }
    };

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received");
        signal_token.cancel();
    });

    let result = server.run(shutdown).await;

    // Anything still waiting on the store past the grace period gives up.
    store.shutdown();

    if let Err(e) = result {
        error!("Server error: {}", e);
        process::exit(1);
    }
    info!("Server stopped");
}
