use sn98_validator::chain::{AlloyChainClient, ChainClient, ChainRegistry};
use sn98_validator::executor::ExecutorClient;
use sn98_validator::peers::{
    HttpPeerClient, JsonRosterDirectory, MinerDirectory, MinerQueryGateway, PeerClient,
};
use sn98_validator::price::{DefiLlamaPriceFeed, TokenPriceFeed};
use sn98_validator::runtime::{JobSupervisor, OrchestratorSettings, RoundOrchestrator, VaultSync};
use sn98_validator::storage::ValidatorDb;
use sn98_validator::utils::config::Config;
use sn98_validator::vault::VaultService;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    match std::env::var("RUST_LOG") {
        Ok(val) => println!("[STARTUP] RUST_LOG is set to: '{}'", val),
        Err(_) => println!("[STARTUP] RUST_LOG is unset."),
    }
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        println!("[STARTUP] RUST_LOG invalid or unset; defaulting to 'info'");
        tracing_subscriber::EnvFilter::new("info")
    });
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load()?;
    tracing::info!(
        "[STARTUP] netuid={} chain={} check_interval={} vault_gating={} db={}",
        config.netuid,
        config.chain_id,
        config.rebalance_check_interval,
        config.vault_gating_enabled,
        config.db_path.display()
    );

    let db = Arc::new(ValidatorDb::open(&config.db_path)?);
    let registry = Arc::new(ChainRegistry::new(config.rpc_urls.clone()));
    // Fail fast on a malformed RPC URL; an unreachable node is only logged.
    registry.provider(config.chain_id)?;
    let chain: Arc<dyn ChainClient> = Arc::new(AlloyChainClient::new(registry.clone()));
    match chain.block_number(config.chain_id).await {
        Ok(block) => tracing::info!("[STARTUP] connectivity OK, latest block {}", block),
        Err(err) => tracing::warn!("[STARTUP] connectivity check failed: {}", err),
    }

    let query_timeout = Duration::from_millis(config.miner_query_timeout_ms);
    let peer_client: Arc<dyn PeerClient> = Arc::new(HttpPeerClient::new(query_timeout));
    let directory: Arc<dyn MinerDirectory> =
        Arc::new(JsonRosterDirectory::new(config.peer_roster_path.clone()));
    let gateway = MinerQueryGateway::new(peer_client.clone(), query_timeout);
    let executor = Arc::new(ExecutorClient::new(
        Some(config.executor_bot_url.clone()),
        config.executor_bot_api_key.clone(),
        db.clone(),
    ));
    let prices: Arc<dyn TokenPriceFeed> = Arc::new(DefiLlamaPriceFeed::new());
    let vaults = Arc::new(VaultService::new(
        db.clone(),
        chain.clone(),
        Some(prices),
        config.minimum_vault_balance_usd,
    ));

    let settings = OrchestratorSettings {
        my_uid: config.my_uid,
        check_interval: config.rebalance_check_interval,
        vault_gating: config.vault_gating_enabled,
        ..OrchestratorSettings::default()
    };
    let orchestrator = Arc::new(RoundOrchestrator::new(
        db.clone(),
        db.clone(),
        chain.clone(),
        directory.clone(),
        gateway,
        executor,
        Some(vaults.clone()),
        settings,
    ));
    let supervisor = JobSupervisor::new(
        db.clone(),
        orchestrator,
        Some(VaultSync {
            service: vaults,
            directory,
            client: peer_client,
            timeout: query_timeout,
        }),
        Duration::from_secs(config.job_monitor_interval_secs),
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
    #[cfg(unix)]
    {
        let shutdown_tx_sigterm = shutdown_tx.clone();
        tokio::spawn(async move {
            use tokio::signal::unix::{signal, SignalKind};
            let Ok(mut term_signal) = signal(SignalKind::terminate()) else {
                return;
            };
            let _ = term_signal.recv().await;
            tracing::info!("[STARTUP] SIGTERM received");
            let _ = shutdown_tx_sigterm.send(());
        });
    }
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("[STARTUP] Ctrl-C received");
            let _ = shutdown_tx.send(());
        }
    });

    tracing::info!("[STARTUP] validator running");
    supervisor.run(shutdown_rx).await;
    Ok(())
}
