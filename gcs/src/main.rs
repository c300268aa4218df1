//! Entry point: parse the command-line surface, bring up the VM-wide
//! cgroups, dial the bridge transport, wire the runtime adapter and
//! handler catalogue, then serve until the connection closes.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use gcs::bootstrap;
use gcs::bridge::Bridge;
use gcs::config::{self, ServiceArgs};
use gcs::host::{handlers, Host};
use gcs::runtime::RuncAdapter;
use gcs::transport::Transport;
use gcs_shared::GcsResult;

const RUNC_BINARY: &str = "runc";
const RUNC_ROOT: &str = "/run/gcs/runc";
const BUNDLE_ROOT: &str = "/run/gcs/c";

#[tokio::main]
async fn main() {
    let args = ServiceArgs::parse();
    let _log_guard = match config::init_tracing(&args) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("gcs: failed to initialize logging: {e}");
            std::process::exit(1);
        }
    };

    match run(args).await {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            tracing::error!(error = %e, "fatal error, exiting");
            std::process::exit(1);
        }
    }
}

async fn run(args: ServiceArgs) -> GcsResult<()> {
    if let Err(e) = bootstrap::init_memory_cgroups(&args) {
        tracing::error!(error = %e, "cgroup setup failed");
        return Err(e);
    }

    let runtime = Arc::new(RuncAdapter::new(
        PathBuf::from(RUNC_BINARY),
        PathBuf::from(RUNC_ROOT),
    ));
    let host = Host::new(runtime, PathBuf::from(BUNDLE_ROOT));
    bootstrap::install_signal_stack_dump(host.clone())?;

    let bridge = Bridge::new();
    handlers::register_handlers(host, bridge.clone()).await;

    let (reader, writer) = dial_transport(&args).await?;

    tracing::info!(port = args.bridge_port, use_inouterr = args.use_inouterr, "bridge serving");
    bridge.serve(reader, writer).await
}

#[cfg(target_os = "linux")]
async fn dial_transport(
    args: &ServiceArgs,
) -> GcsResult<(gcs::transport::BoxedReader, gcs::transport::BoxedWriter)> {
    use gcs::transport::vsock::VsockTransport;
    use gcs::transport::StdioTransport;

    if args.use_inouterr {
        StdioTransport.dial().await
    } else {
        VsockTransport {
            cid: libc::VMADDR_CID_HOST,
            port: args.bridge_port,
        }
        .dial()
        .await
    }
}

#[cfg(not(target_os = "linux"))]
async fn dial_transport(
    _args: &ServiceArgs,
) -> GcsResult<(gcs::transport::BoxedReader, gcs::transport::BoxedWriter)> {
    use gcs::transport::StdioTransport;
    StdioTransport.dial().await
}
