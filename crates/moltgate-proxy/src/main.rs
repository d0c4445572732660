//! moltgate binary: configuration, signals, and the proxy lifecycle.

use moltgate_proxy::audit::{AuditLog, AuditRecord};
use moltgate_proxy::{server, ProxyConfig, Result};
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// How long in-flight connections get to finish after SIGTERM.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() {
    // Diagnostics on stderr; stdout belongs to the audit trail.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run().await {
        error!("{}", e);
        eprintln!("moltgate: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let config = ProxyConfig::from_env()?;
    let handle = server::start(config, AuditLog::stdout()).await?;
    supervise(handle).await
}

/// Own the reload/terminate signals until shutdown.
async fn supervise(handle: server::ProxyHandle) -> Result<()> {
    wait_for_signals(&handle).await;

    handle.shutdown();
    handle.state.audit.log(AuditRecord {
        method: "SHUTDOWN".to_string(),
        hostname: "localhost".to_string(),
        port: handle.port,
        allowed: true,
        ..Default::default()
    });

    let drained = handle.drain(SHUTDOWN_GRACE).await;
    if drained {
        info!("shutdown complete");
        std::process::exit(0);
    }
    error!("shutdown grace period expired");
    std::process::exit(1);
}

#[cfg(unix)]
async fn wait_for_signals(handle: &server::ProxyHandle) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!("failed to install SIGTERM handler: {}", e);
            return;
        }
    };
    let mut sighup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            error!("failed to install SIGHUP handler: {}", e);
            return;
        }
    };

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received ctrl-c");
                return;
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM");
                return;
            }
            _ = sighup.recv() => {
                // Reload failures keep the previous allowlist active.
                if let Err(e) = handle.state.allowlist.reload() {
                    handle
                        .state
                        .audit
                        .log_error("allowlist reload failed", Some(&e));
                }
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signals(_handle: &server::ProxyHandle) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to wait for ctrl-c: {}", e);
    }
}
