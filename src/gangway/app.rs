use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::task::JoinSet;

use crate::gangway::{
    admin, config, logging, telemetry,
    tunnel::{client::Client, server::Service, transport},
};

pub async fn run(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;
    let created = config::ensure_config_file(&resolved.path)?;

    let cfg = config::load_config(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;

    let _logrt = logging::init(&cfg.logging)?;

    if created {
        tracing::warn!(path = %resolved.path.display(), source = %resolved.source, "config: created new config file");
    }

    tracing::info!(
        config = %resolved.path.display(),
        server = cfg.server.is_some(),
        client = cfg.client.is_some(),
        admin_addr = %cfg.admin_addr,
        "gangway: starting"
    );

    let prom = telemetry::init_prometheus()?;
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut tasks = JoinSet::new();

    let mut manager = None;
    if let Some(sc) = &cfg.server {
        let service = Service::bind(sc.to_options(), Arc::new(sc.users.clone())).await?;
        tracing::info!(
            bind_addr = %service.local_addr()?,
            http_addr = ?service.http_addr(),
            https_addr = ?service.https_addr(),
            users = sc.users.len(),
            "server: listening"
        );
        manager = Some(service.manager());
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { service.serve(shutdown).await });
    }

    let mut client = None;
    if let Some(cc) = &cfg.client {
        let c = Arc::new(Client::new(cc.to_options())?);
        client = Some(c.clone());
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { c.run(shutdown).await });
    }

    if !cfg.admin_addr.trim().is_empty() {
        let addr: SocketAddr = transport::listen_addr(&cfg.admin_addr)
            .parse()
            .with_context(|| format!("invalid admin_addr: {}", cfg.admin_addr))?;
        let state = admin::AdminState {
            prom,
            server: manager,
            client,
        };
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { admin::serve_with_shutdown(addr, state, shutdown).await });
    }

    tokio::select! {
        res = shutdown_signal() => {
            res?;
            tracing::info!("shutdown: signal");
            let _ = shutdown_tx.send(true);
        }
        res = tasks.join_next() => {
            let _ = shutdown_tx.send(true);
            match res {
                Some(Ok(Err(err))) => return Err(err),
                Some(Err(join_err)) => return Err(join_err.into()),
                Some(Ok(Ok(()))) | None => {}
            }
        }
    }

    let drain = async { while tasks.join_next().await.is_some() {} };
    if tokio::time::timeout(Duration::from_secs(5), drain).await.is_err() {
        tracing::warn!("shutdown: tasks did not stop in time; aborting");
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    Ok(())
}

async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res.context("wait for ctrl-c")?,
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    }

    Ok(())
}
