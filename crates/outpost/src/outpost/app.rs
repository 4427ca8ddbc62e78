use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use tokio::{sync::watch, task::JoinSet};

use crate::outpost::{
    admin,
    auth::{Authenticator, StaticAuthenticator},
    config::{self, LoggingConfig, RelayConfig},
    gateway::{self, Gateway, GatewayOptions, OfflinePage},
    logging, net,
    quota::MemoryUsageCounter,
    telemetry::{self, BatchOptions, BatchSink, ClickHouseWriter, EventSink, Fanout, RecentEvents},
    tunnel::{
        client::{Client, ClientOptions, ClientState},
        registry::Registry,
        server::{self, RelayOptions, RelayState},
    },
};

type Tasks = JoinSet<anyhow::Result<()>>;

/// Handles the reload loop and admin API need from a running relay.
struct RelayHandles {
    registry: Arc<Registry>,
    auth: Arc<StaticAuthenticator>,
    recent: Arc<RecentEvents>,
}

pub async fn run(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;

    let created = config::ensure_config_file(&resolved.path)?;

    let cfg = config::load_config(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;

    let _logrt = logging::init(&cfg.logging)?;

    if created {
        tracing::warn!(path = %resolved.path.display(), source = %resolved.source, "config: created new config file");
    }

    if cfg.relay.is_none() && cfg.client.is_none() {
        anyhow::bail!("config: nothing to run (add a relay and/or client section)");
    }

    tracing::info!(
        config = %resolved.path.display(),
        relay_enabled = cfg.relay.is_some(),
        client_enabled = cfg.client.is_some(),
        admin_addr = %cfg.admin_addr,
        "outpost: starting"
    );

    let prom = Arc::new(telemetry::init_prometheus()?);

    let (reload_tx, reload_rx) = watch::channel(0u64);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut tasks: Tasks = JoinSet::new();

    let relay = match &cfg.relay {
        Some(rc) => Some(start_relay(rc, &mut tasks, &shutdown_rx)?),
        None => None,
    };

    if let Some(cc) = &cfg.client {
        let client = Arc::new(Client::new(ClientOptions::from(cc))?);
        tasks.spawn(run_client(client, shutdown_rx.clone()));
    }

    // Config reload loop (polling + admin-triggered).
    {
        let config_path = resolved.path.clone();
        let initial = cfg.relay.clone();
        let auth = relay.as_ref().map(|r| r.auth.clone());
        let mut reload_rx = reload_rx.clone();
        let mut shutdown = shutdown_rx.clone();
        let mut enabled = cfg.reload.enabled;
        let mut poll = cfg.reload.poll_interval;

        tasks.spawn(async move {
            reload_loop(
                config_path,
                initial,
                auth,
                &mut reload_rx,
                &mut shutdown,
                &mut enabled,
                &mut poll,
            )
            .await;
            Ok(())
        });
    }

    if !cfg.admin_addr.trim().is_empty() {
        let admin_addr = net::normalize_bind_addr(&cfg.admin_addr);
        let addr: SocketAddr = admin_addr
            .parse()
            .with_context(|| format!("invalid admin_addr: {}", cfg.admin_addr))?;

        let admin_state = admin::AdminState {
            prom: prom.clone(),
            config_path: resolved.path.clone(),
            reload_tx: reload_tx.clone(),
            registry: relay.as_ref().map(|r| r.registry.clone()),
            recent: relay.as_ref().map(|r| r.recent.clone()),
        };

        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { admin::serve_with_shutdown(addr, admin_state, shutdown).await });
    }

    // Wait for shutdown signal (Ctrl-C / SIGTERM) or unexpected task termination.
    let outcome = tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
            Ok(())
        }
        res = tasks.join_next() => match res {
            Some(Ok(Ok(()))) | None => Ok(()),
            Some(Ok(Err(err))) => Err(err),
            Some(Err(join_err)) => Err(join_err.into()),
        }
    };
    shutdown_tx.send_replace(true);

    // Drain tasks: exit as soon as they complete; only enforce a timeout if something hangs.
    let drain = async { while tasks.join_next().await.is_some() {} };
    if tokio::time::timeout(Duration::from_secs(5), drain)
        .await
        .is_err()
    {
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    outcome
}

/// Runs a single tunnel client without a config file, logging as text to stderr.
pub async fn run_http_client(opts: ClientOptions) -> anyhow::Result<()> {
    let _logrt = logging::init(&LoggingConfig {
        format: "text".into(),
        ..LoggingConfig::default()
    })?;

    let scheme_ok = url::Url::parse(&opts.server_url)
        .map(|u| matches!(u.scheme(), "ws" | "wss"))
        .unwrap_or(false);
    if !scheme_ok {
        anyhow::bail!(
            "--server must be a ws:// or wss:// URL, got {:?}",
            opts.server_url
        );
    }

    let client = Arc::new(Client::new(opts)?);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let signal = tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("shutdown: signal");
        shutdown_tx.send_replace(true);
    });

    let res = run_client(client, shutdown_rx).await;
    signal.abort();
    res
}

fn start_relay(
    rc: &RelayConfig,
    tasks: &mut Tasks,
    shutdown_rx: &watch::Receiver<bool>,
) -> anyhow::Result<RelayHandles> {
    let registry = Arc::new(Registry::new(rc.request_timeout));
    let auth = Arc::new(StaticAuthenticator::new(
        &rc.organizations,
        rc.require_api_key,
    ));
    let recent = Arc::new(RecentEvents::new(rc.events.recent_capacity));

    let mut sinks: Vec<Arc<dyn EventSink>> = vec![Arc::new(telemetry::LogSink), recent.clone()];
    if !rc.events.endpoint.trim().is_empty() {
        let writer = ClickHouseWriter::new(&rc.events.endpoint, &rc.events.table)?;
        let (sink, flusher) = BatchSink::spawn(
            writer,
            BatchOptions {
                batch_size: rc.events.batch_size,
                flush_interval: rc.events.flush_interval,
                ..BatchOptions::default()
            },
            shutdown_rx.clone(),
        );
        sinks.push(Arc::new(sink));
        tasks.spawn(async move { flusher.await.context("events: flusher") });
        tracing::info!(endpoint = %rc.events.endpoint, table = %rc.events.table, "events: batching enabled");
    }

    let gw = Arc::new(Gateway::new(
        registry.clone(),
        Arc::new(MemoryUsageCounter::new()),
        Arc::new(Fanout::new(sinks)),
        OfflinePage::load(rc.offline_page.as_deref()),
        GatewayOptions {
            base_domain: rc.base_domain.clone(),
            block_over_quota_responses: rc.block_over_quota_responses,
            max_body_bytes: rc.max_body_bytes,
        },
    ));
    {
        let listen_addr = rc.listen_addr.clone();
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { gateway::serve_with_shutdown(&listen_addr, gw, shutdown).await });
    }

    let state = RelayState {
        registry: registry.clone(),
        auth: auth.clone() as Arc<dyn Authenticator>,
        opts: Arc::new(RelayOptions {
            base_domain: rc.base_domain.clone(),
            public_scheme: rc.public_scheme.clone(),
            handshake_timeout: rc.handshake_timeout,
            max_body_bytes: rc.max_body_bytes,
            ping_interval: rc.ping_interval,
            idle_timeout: rc.idle_timeout,
        }),
        shutdown: shutdown_rx.clone(),
    };
    {
        let tunnel_addr = rc.tunnel_addr.clone();
        tasks.spawn(async move { server::serve_with_shutdown(&tunnel_addr, state).await });
    }

    Ok(RelayHandles {
        registry,
        auth,
        recent,
    })
}

async fn run_client(client: Arc<Client>, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let mut state = client.subscribe();
    let announce = tokio::spawn(async move {
        while state.changed().await.is_ok() {
            let url = match &*state.borrow_and_update() {
                ClientState::Open { url } => url.clone(),
                _ => continue,
            };
            tracing::info!(url = %url, "outpost: forwarding public traffic");
        }
    });

    let run = client.run();
    tokio::pin!(run);
    let res = tokio::select! {
        res = &mut run => res,
        true = net::shutdown_requested(&mut shutdown) => {
            client.stop();
            run.await
        }
    };
    announce.abort();
    res.context("tunnel client")
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(err = %err, "shutdown: SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

async fn reload_loop(
    config_path: PathBuf,
    initial: Option<RelayConfig>,
    auth: Option<Arc<StaticAuthenticator>>,
    reload_rx: &mut watch::Receiver<u64>,
    shutdown: &mut watch::Receiver<bool>,
    enabled: &mut bool,
    poll_interval: &mut Duration,
) {
    let mut last_sig = file_sig(&config_path).ok();

    loop {
        let sleep_dur = if *enabled {
            (*poll_interval).max(Duration::from_millis(200))
        } else {
            Duration::from_secs(3600)
        };

        tokio::select! {
            true = net::shutdown_requested(shutdown) => break,
            changed = reload_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                apply_reload(&config_path, initial.as_ref(), auth.as_deref(), enabled, poll_interval);
                last_sig = file_sig(&config_path).ok();
            }
            _ = tokio::time::sleep(sleep_dur) => {
                if !*enabled {
                    continue;
                }
                let Ok(sig) = file_sig(&config_path) else {
                    continue;
                };
                if last_sig.is_some_and(|prev| prev == sig) {
                    continue;
                }
                apply_reload(&config_path, initial.as_ref(), auth.as_deref(), enabled, poll_interval);
                last_sig = Some(sig);
            }
        }
    }
}

fn apply_reload(
    config_path: &Path,
    initial: Option<&RelayConfig>,
    auth: Option<&StaticAuthenticator>,
    enabled: &mut bool,
    poll_interval: &mut Duration,
) {
    let cfg = match config::load_config(config_path) {
        Ok(c) => c,
        Err(err) => {
            tracing::warn!(path = %config_path.display(), err = %format!("{err:#}"), "reload: config load failed");
            return;
        }
    };

    match (initial, cfg.relay.as_ref()) {
        (Some(old), Some(new)) => {
            if !listeners_equal(old, new) {
                tracing::warn!(
                    "reload: relay listeners or domain changed; restart required to apply them"
                );
            }
            if let Some(auth) = auth {
                auth.replace(&new.organizations, new.require_api_key);
                tracing::info!(organizations = new.organizations.len(), "reload: organizations applied");
            }
        }
        (None, None) => {}
        _ => tracing::warn!("reload: relay section added or removed; restart required"),
    }

    *enabled = cfg.reload.enabled;
    *poll_interval = cfg.reload.poll_interval;

    tracing::info!("reload: applied");
}

fn listeners_equal(a: &RelayConfig, b: &RelayConfig) -> bool {
    a.listen_addr.trim() == b.listen_addr.trim()
        && a.tunnel_addr.trim() == b.tunnel_addr.trim()
        && a.base_domain == b.base_domain
}

fn file_sig(path: &Path) -> anyhow::Result<(u64, u64)> {
    let meta = std::fs::metadata(path)?;
    let len = meta.len();
    let m = meta
        .modified()?
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    Ok((m, len))
}
