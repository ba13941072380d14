//! xskd - AF_XDP queue dispatcher daemon
//!
//! Attaches the dispatcher to an interface, or joins the one another process
//! already attached there, and holds a reference until Ctrl-C. AF_XDP socket
//! owners bind through the XSKS_MAP pinned under `XSKD_PIN_PATH`.
//!
//! # Usage
//!
//! ```bash
//! # Attach to the default-route interface in generic mode
//! sudo xskd
//!
//! # Native mode on a given NIC
//! sudo XSKD_INTERFACE=ens5 XSKD_XDP_MODE=drv xskd
//!
//! # Private attachment, nothing pinned
//! sudo XSKD_PIN_PATH=off xskd
//! ```

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use xskd_core::version::read_file_version;
use xskd_core::{XskConfig, XskProgram};

fn main() {
    init_tracing();

    let config = match XskConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            std::process::exit(2);
        }
    };

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .thread_name("xskd")
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "Failed to build runtime");
            std::process::exit(1);
        }
    };

    runtime.block_on(async {
        if let Err(e) = run(config).await {
            error!(error = %e, "xskd failed");
            std::process::exit(1);
        }
    });
}

/// Initialize the tracing subscriber.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("xskd_core=debug,info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true)
        .init();
}

async fn run(config: XskConfig) -> xskd_core::Result<()> {
    match read_file_version(&config.object_path) {
        Ok(version) => info!(
            path = %config.object_path.display(),
            version = version,
            "Found XDP object"
        ),
        Err(e) => warn!(error = %e, "Could not read XDP object version"),
    }

    let report_interval = config.report_interval;
    let program = Arc::new(XskProgram::new(config));
    program.load_and_attach()?;

    info!(
        interface = program.attached_interface().as_deref().unwrap_or("unknown"),
        capacity = program.capacity()?,
        refcount = program.refcount()?,
        "Dispatcher attached"
    );

    let reporter = spawn_binding_reporter(Arc::clone(&program), report_interval);

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    reporter.abort();

    // Only the last user anywhere actually detaches
    program.detach()?;

    info!("Dispatcher released");
    Ok(())
}

/// Spawn a background task to periodically log bound queues.
fn spawn_binding_reporter(
    program: Arc<XskProgram>,
    every: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            interval.tick().await;

            match program.bindings() {
                Ok(bindings) => {
                    let queues: Vec<u32> = bindings.iter().map(|(q, _)| *q).collect();
                    info!(bound = bindings.len(), queues = ?queues, "Dispatch table bindings");
                }
                Err(e) => warn!(error = %e, "Failed to read bindings"),
            }

            match program.refcount() {
                Ok(count) => info!(refcount = count, "XDP program references"),
                Err(e) => warn!(error = %e, "Failed to read refcount"),
            }
        }
    })
}
