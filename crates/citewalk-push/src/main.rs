//! Citewalk push service
//!
//! gRPC intake for device registrations and notifications, plus the
//! bus-driven delivery worker that fans notifications out to APNs and FCM.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tonic::transport::Server;
use tracing::{info, warn};

use citewalk_bus::{BusDatabase, BusOptions, EventBus, SqliteEventBus};
use citewalk_core::config::{ApnsConfig, FcmConfig, load_config};
use citewalk_core::tracing_init::init_tracing;
use citewalk_crypto::FieldCipher;
use citewalk_proto::v1::push_service_server::PushServiceServer;

use citewalk_push::outbox::PushOutbox;
use citewalk_push::senders::{ApnsSender, DisabledSender, FcmSender, PushSender, SenderRegistry};
use citewalk_push::server::PushServiceImpl;
use citewalk_push::storage::{Provider, PushDatabase};
use citewalk_push::tokens::TokenStore;
use citewalk_push::worker::PushWorker;

#[derive(Parser, Debug)]
#[command(name = "citewalk-push")]
#[command(
    version,
    about = "Citewalk push service - device registry, outbox and delivery worker"
)]
struct Args {
    /// Address to listen on.
    #[arg(long, env = "CITEWALK_PUSH_ADDR", default_value = "0.0.0.0:50061")]
    addr: SocketAddr,

    /// Path to a JSON settings file.
    #[arg(long, env = "CITEWALK_CONFIG")]
    config: Option<PathBuf>,

    /// Path to the push SQLite database file.
    #[arg(long, env = "CITEWALK_PUSH_DB")]
    push_db: Option<PathBuf>,

    /// Path to the event bus SQLite database file.
    #[arg(long, env = "CITEWALK_BUS_DB")]
    bus_db: Option<PathBuf>,

    /// Owned bus partitions processed concurrently by the worker.
    #[arg(long, env = "CITEWALK_WORKER_CONCURRENCY")]
    worker_concurrency: Option<usize>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut config = load_config(args.config.as_deref())?;
    if let Some(concurrency) = args.worker_concurrency {
        config.worker.concurrency = concurrency;
    }

    init_tracing("citewalk_push=info,citewalk_bus=info", args.log_json);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %args.addr,
        "Starting citewalk-push"
    );

    let push_path = resolve_db_path(
        args.push_db.as_ref().or(config.database.push_path.as_ref()),
        "push.db",
    )?;
    info!(path = %push_path.display(), "Opening push database");
    let db = PushDatabase::open(&push_path).await?;

    let bus_path = resolve_db_path(
        args.bus_db.as_ref().or(config.database.bus_path.as_ref()),
        "bus.db",
    )?;
    info!(path = %bus_path.display(), "Opening bus database");
    let bus_db = BusDatabase::open(&bus_path).await?;

    let cipher = Arc::new(FieldCipher::new(
        config.security.field_encryption_key.as_deref(),
    )?);
    let tokens = TokenStore::new(db.clone(), cipher);

    let senders = SenderRegistry::new(apple_sender(&config.apns), google_sender(&config.fcm));

    let bus = Arc::new(SqliteEventBus::new(bus_db, BusOptions::from(&config.bus)));
    let outbox = PushOutbox::new(db.clone(), Arc::clone(&bus) as Arc<dyn EventBus>);

    PushWorker::new(
        db.clone(),
        tokens.clone(),
        senders,
        Duration::from_secs(config.worker.send_timeout_secs),
    )
    .start(bus.as_ref(), config.worker.concurrency)
    .await?;

    // Outbox relay: re-publish items whose job was lost.
    let sweep_outbox = outbox.clone();
    let requeue_after = Duration::from_secs(config.worker.requeue_after_secs);
    let requeue_every = Duration::from_secs(config.worker.requeue_interval_secs.max(1));
    let sweep = tokio::spawn(async move {
        let mut interval = tokio::time::interval(requeue_every);
        interval.tick().await; // Skip first immediate tick
        loop {
            interval.tick().await;
            if let Err(e) = sweep_outbox.requeue_stale_pending(requeue_after).await {
                warn!(error = %e, "Outbox requeue sweep failed");
            }
        }
    });

    let (health_reporter, health_service) = tonic_health::server::health_reporter();
    health_reporter
        .set_serving::<PushServiceServer<PushServiceImpl>>()
        .await;

    let push = PushServiceImpl::new(tokens, outbox);
    let grpc_router = Server::builder()
        .http2_keepalive_interval(Some(Duration::from_secs(30)))
        .http2_keepalive_timeout(Some(Duration::from_secs(10)))
        .add_service(health_service)
        .add_service(PushServiceServer::new(push));

    info!(addr = %args.addr, "Push server listening");
    let served = tokio::select! {
        result = grpc_router.serve(args.addr) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            Ok(())
        }
    };

    sweep.abort();
    bus.shutdown().await;
    db.close().await;

    served?;
    info!("Push service stopped");
    Ok(())
}

fn resolve_db_path(configured: Option<&PathBuf>, file_name: &str) -> anyhow::Result<PathBuf> {
    if let Some(path) = configured {
        return Ok(path.clone());
    }
    let home =
        dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Cannot determine home directory"))?;
    Ok(home.join(".citewalk").join(file_name))
}

fn apple_sender(config: &ApnsConfig) -> Arc<dyn PushSender> {
    let (Some(key_id), Some(team_id), Some(key_path), Some(bundle_id)) = (
        config.key_id.as_deref(),
        config.team_id.as_deref(),
        config.key_path.as_deref(),
        config.bundle_id.as_deref(),
    ) else {
        return Arc::new(DisabledSender::new(
            Provider::Apple,
            "APNs key id, team id, key path and bundle id must all be configured",
        ));
    };

    match ApnsSender::from_key_file(
        key_id,
        team_id,
        bundle_id,
        key_path,
        Duration::from_secs(config.request_timeout_secs),
    ) {
        Ok(sender) => Arc::new(sender),
        Err(e) => Arc::new(DisabledSender::new(Provider::Apple, e.to_string())),
    }
}

fn google_sender(config: &FcmConfig) -> Arc<dyn PushSender> {
    let Some(path) = config.service_account_path.as_deref() else {
        return Arc::new(DisabledSender::new(
            Provider::Google,
            "FCM service account path is not configured",
        ));
    };

    match FcmSender::from_credentials_file(
        path,
        config.access_token.clone(),
        Duration::from_secs(config.request_timeout_secs),
    ) {
        Ok(sender) => Arc::new(sender),
        Err(e) => Arc::new(DisabledSender::new(Provider::Google, e.to_string())),
    }
}
