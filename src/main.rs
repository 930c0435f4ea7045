//! solmesh relay daemon
//!
//! Runs the relay engine standalone: loads configuration, wires the system
//! adapters, and reports queue health until interrupted. BLE frames are
//! exchanged by the host integration; this binary is the reference harness
//! for running the core on a bench machine.
//!
//! Exit codes: 0 on success, 1 on runtime error, 2 on malformed
//! configuration.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use solmesh::adapters::{Adapters, NetworkSensor, StaticNetworkSensor, SystemClock};
use solmesh::config::CoreConfig;
use solmesh::SolMeshCore;
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();

    let config_path = std::env::args().nth(1);
    let config = match load_config(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e:#}");
            return ExitCode::from(2);
        }
    };

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("fatal: {e:#}");
            ExitCode::from(1)
        }
    }
}

fn load_config(path: Option<&str>) -> anyhow::Result<CoreConfig> {
    #[cfg(feature = "config-file")]
    {
        CoreConfig::load(path).context("loading configuration")
    }
    #[cfg(not(feature = "config-file"))]
    {
        if path.is_some() {
            anyhow::bail!("config files need the config-file feature");
        }
        let config = CoreConfig::default();
        config.validate().context("validating configuration")?;
        Ok(config)
    }
}

async fn run(config: CoreConfig) -> anyhow::Result<()> {
    let rpc_url = config.rpc_url.clone();

    #[cfg(feature = "rpc-client")]
    let rpc: Option<Arc<dyn solmesh::adapters::ChainRpc>> = match rpc_url.as_deref() {
        Some(url) => Some(Arc::new(solmesh::adapters::SolanaRpc::new(url))),
        None => None,
    };
    #[cfg(not(feature = "rpc-client"))]
    let rpc: Option<Arc<dyn solmesh::adapters::ChainRpc>> = None;

    // without a connectivity callback from the host, an RPC endpoint in the
    // config is the best online signal we have
    let network: Arc<dyn NetworkSensor> = Arc::new(StaticNetworkSensor(rpc.is_some()));

    let adapters = Adapters {
        ble: None,
        network,
        signer: None,
        rpc,
        clock: Arc::new(SystemClock),
    };

    let core = SolMeshCore::init(config, adapters)
        .await
        .context("initializing relay core")?;

    info!("🚀 solmesh relay running, ctrl-c to stop");

    let mut status = tokio::time::interval(Duration::from_secs(30));
    status.tick().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = status.tick() => report(&core),
        }
    }

    info!("🛑 shutting down");
    core.shutdown().await;
    Ok(())
}

fn report(core: &SolMeshCore) {
    let sizes = core.queue_sizes();
    let metrics = core.metrics();
    info!(
        "[{}] queues: {} outbound / {} retry / {} received / {} confirmation; \
         frames sent {}, submitted {}, relayed {}",
        chrono::Utc::now().format("%H:%M:%S"),
        sizes.outbound_total(),
        sizes.retry,
        sizes.received,
        sizes.confirmation,
        metrics.frames_sent,
        metrics.submitted,
        metrics.relayed,
    );

    for confirmation in core.take_confirmations() {
        info!("confirmation for tx {}: {:?}", confirmation.tx_id, confirmation.status);
    }
}
