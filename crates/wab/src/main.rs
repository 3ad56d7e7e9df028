use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use wab_core::{
    commands::{builtin_commands, CommandRegistry},
    config::Config,
    credentials::FileCredentialStore,
    messaging::{
        port::GroupDirectory,
        queue::{OutboundQueue, QueueConfig},
    },
    permissions::OwnerPolicy,
    router::{Router, RouterConfig},
    settings::{Settings, SettingsStore},
    supervisor::{ConnectionStatus, ConnectionSupervisor, SessionFaults, SupervisorConfig},
};
use wab_sidecar::{SidecarConfig, SidecarTransport};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    wab_core::logging::init("wab")?;

    let cfg = Arc::new(Config::load()?);
    info!(
        sidecar = %cfg.sidecar_url,
        owners = cfg.owners.len(),
        "starting WhatsApp bot"
    );
    if cfg.owners.is_empty() {
        warn!("OWNER_NUMBER is not set; admin commands are limited to group admins");
    }

    let settings = Arc::new(
        SettingsStore::load(
            &cfg.settings_file,
            Settings {
                prefix: cfg.default_prefix.clone(),
                ..Settings::default()
            },
        )
        .with_context(|| format!("loading settings from {}", cfg.settings_file.display()))?,
    );
    let credentials = Arc::new(FileCredentialStore::new(cfg.credentials_file()));

    let transport = Arc::new(SidecarTransport::new(SidecarConfig {
        url: cfg.sidecar_url.clone(),
        request_timeout: cfg.request_timeout,
    }));
    let status = Arc::new(ConnectionStatus::new());

    let (queue, queue_worker) = OutboundQueue::spawn(
        transport.clone(),
        QueueConfig {
            min_interval: cfg.send_interval,
        },
        Some(status.subscribe()),
    );

    let registry = Arc::new(CommandRegistry::new(builtin_commands())?);
    info!(commands = registry.len(), "command registry loaded");

    let directory: Arc<dyn GroupDirectory> = transport.clone();
    let policy = Arc::new(OwnerPolicy::new(cfg.owners.clone(), Some(directory)));

    let shutdown = CancellationToken::new();
    let faults = SessionFaults::new();
    let router = Arc::new(
        Router::new(
            registry,
            settings.clone(),
            queue.clone(),
            policy,
            RouterConfig {
                ignore_self: cfg.ignore_self_messages,
            },
            cfg.clone(),
        )
        .with_session_faults(faults.clone()),
    );
    let (inbox, router_loop) = router.spawn_inbox(shutdown.clone());

    let supervisor = ConnectionSupervisor::new(
        transport,
        credentials,
        queue.clone(),
        settings.clone(),
        Arc::new(inbox),
        status,
        SupervisorConfig {
            retry_delay: cfg.reconnect_delay,
            notify: cfg.primary_owner().cloned(),
        },
    )
    .with_session_faults(faults);

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("bot shutting down...");
                shutdown.cancel();
            }
        });
    }

    let outcome = supervisor.run(shutdown.clone()).await;

    shutdown.cancel();
    queue.shutdown();
    let _ = router_loop.await;
    let _ = queue_worker.await;

    if let Err(e) = settings.persist().await {
        warn!("failed to flush settings on shutdown: {e}");
    }

    let counters = queue.counters();
    info!(
        enqueued = counters.enqueued,
        sent = counters.sent,
        failed = counters.failed,
        "outbound queue stopped"
    );

    if let Err(e) = outcome {
        if e.is_fatal() {
            error!(
                "session logged out; delete {} and restart to pair again",
                cfg.credentials_file().display()
            );
        } else {
            error!("bot stopped: {e}");
        }
        return Err(e.into());
    }
    Ok(())
}
