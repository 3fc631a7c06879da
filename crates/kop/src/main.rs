use std::sync::Arc;

use anyhow::Context;
use kop_core::{
    broadcast::BroadcastSender,
    commands::CommandRegistry,
    config::Config,
    directory::MemberDirectory,
    inbound::InboundPipeline,
    session::{ConnectionManager, MessageSender},
    status::{StatusEvent, StatusHub},
    utils::AuditLogger,
};
use kop_gateway::GatewayFactory;
use kop_store::{Database, SqliteCampaignStore, SqliteMemberStore};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const INBOUND_QUEUE: usize = 256;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    kop_core::logging::init("kop")?;

    let cfg = Arc::new(Config::load()?);
    let db = Database::open(&cfg.database_path)
        .await
        .context("opening database")?;
    let members = Arc::new(SqliteMemberStore::new(&db));
    let campaigns = Arc::new(SqliteCampaignStore::new(&db));
    campaigns.recover_interrupted().await?;

    let status = StatusHub::new();
    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
    let factory = Arc::new(GatewayFactory::new(cfg.gateway.clone()));
    let session = ConnectionManager::new(cfg.clone(), factory, status.clone(), inbound_tx);
    let sender: Arc<dyn MessageSender> = Arc::new(session.clone());
    let audit = Some(AuditLogger::new(
        cfg.audit_log_path.clone(),
        cfg.audit_log_json,
    ));

    let registry = Arc::new(CommandRegistry::with_defaults(cfg.coop.clone())?);
    let pipeline = InboundPipeline::new(
        cfg.pipeline.clone(),
        cfg.coop.clone(),
        MemberDirectory::new(members),
        registry,
        sender.clone(),
        status.clone(),
        audit.clone(),
    );
    let broadcaster = BroadcastSender::new(cfg.broadcast.clone(), campaigns, sender, audit);

    let shutdown = CancellationToken::new();
    let tasks = vec![
        spawn_status_printer(status.subscribe(), shutdown.clone()),
        pipeline.spawn_runner(inbound_rx, shutdown.clone()),
        broadcaster.spawn_delivery_tracker(status.subscribe(), shutdown.clone()),
        broadcaster.spawn(shutdown.clone()),
    ];

    session
        .initialize()
        .await
        .context("starting messaging transport")?;
    info!(coop = %cfg.coop.name, "assistant running; ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    shutdown.cancel();
    session.shutdown().await;
    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "background task ended abnormally");
        }
    }
    Ok(())
}

/// Show pairing codes to the operator and log lifecycle changes.
fn spawn_status_printer(
    mut events: broadcast::Receiver<StatusEvent>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
              _ = shutdown.cancelled() => break,
              ev = events.recv() => match ev {
                Ok(StatusEvent::Pairing { rendered, cycle, .. }) => {
                    println!("\nScan to link the account (attempt {cycle}):\n{rendered}");
                }
                Ok(StatusEvent::Connected { principal, degraded, .. }) => {
                    info!(principal = principal.as_deref().unwrap_or("-"), degraded, "connected");
                }
                Ok(StatusEvent::ConnectionFailed { attempts }) => {
                    warn!(attempts, "messaging transport gave up reconnecting");
                }
                Ok(StatusEvent::LoggedOut) => warn!("account logged out; restart to pair again"),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
              }
            }
        }
    })
}
