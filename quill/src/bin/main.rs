// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) the Quill developers. All rights reserved.

mod args;
mod config;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use node::database::rocksdb::RocksBackend;
use node::etl::{self, EtlService};
use node::peer::pool::LoadBalancer;
use node::peer::{NetworkValidatedLedgers, Peer, PeerSrv};
use node::storage::{loader, Store};
use node::subscriptions::SubscriptionManager;
use node::{LongLivedService, Node};
use quill::http::HttpServer;
use quill::rpc::dos_guard::DosGuard;
use quill::rpc::RpcEngine;
use quill::{AppContext, LogReloadFn};
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter};

use args::Args;
use config::Config;

fn main() {
    let args = Args::parse();
    std::process::exit(run(args));
}

fn run(args: Args) -> i32 {
    let config = match Config::load(&args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err:#}");
            return 1;
        }
    };

    let log_reload = match init_logging(&config) {
        Ok(log_reload) => log_reload,
        Err(err) => {
            eprintln!("logging setup failed: {err:#}");
            return 1;
        }
    };

    if let Some(name) = &args.migrate {
        return match run_migration(name, &config) {
            Ok(()) => {
                info!(event = "migration finished", name);
                0
            }
            Err(err) => {
                error!(event = "migration failed", name, err = %err);
                2
            }
        };
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(event = "runtime setup failed", err = %err);
            return 1;
        }
    };

    match runtime.block_on(bootstrap(config, log_reload)) {
        Ok(()) => 0,
        Err(err) => {
            error!(event = "fatal", err = format!("{err:#}"));
            1
        }
    }
}

/// Install the tracing subscriber with a reloadable filter; the handle
/// backs the admin `log_level` method.
fn init_logging(config: &Config) -> anyhow::Result<LogReloadFn> {
    let directives = if config.log_filter().is_empty() {
        config.log_level()?.to_string()
    } else {
        config.log_filter()
    };
    let filter =
        EnvFilter::try_new(&directives).context("invalid log filter")?;
    let (filter, handle) = reload::Layer::new(filter);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(Arc::new(move |level: &str| {
        let filter =
            EnvFilter::try_new(level).map_err(|err| err.to_string())?;
        handle.reload(filter).map_err(|err| err.to_string())
    }))
}

/// Named maintenance migrations, run offline against the store.
fn run_migration(name: &str, config: &Config) -> anyhow::Result<()> {
    let backend = RocksBackend::create_or_open(
        &config.database.path,
        config.database.options(),
    );

    match name {
        "rebuild_ledger_range" => {
            match backend.rebuild_ledger_range()? {
                Some(range) => {
                    info!(event = "range rebuilt", range = %range)
                }
                None => info!(event = "store is empty, nothing to do"),
            }
            Ok(())
        }
        _ => anyhow::bail!("unknown migration '{name}'"),
    }
}

async fn bootstrap(
    config: Config,
    log_reload: LogReloadFn,
) -> anyhow::Result<()> {
    info!(
        event = "starting",
        version = env!("CARGO_PKG_VERSION"),
        peers = config.peers.len(),
    );

    let metrics_handle = match PrometheusBuilder::new().install_recorder()
    {
        Ok(handle) => Some(handle),
        Err(err) => {
            warn!(event = "metrics recorder unavailable", err = %err);
            None
        }
    };

    let backend = Arc::new(RocksBackend::create_or_open(
        &config.database.path,
        config.database.options(),
    ));
    let store = Arc::new(
        Store::open(backend, config.storage.clone())
            .context("opening the storage facade")?,
    );

    let subscriptions = SubscriptionManager::new();
    let validated = NetworkValidatedLedgers::new();
    let etl_state = etl::State::new();

    let peers: Vec<Arc<Peer>> = config
        .peers
        .iter()
        .map(|peer| {
            Peer::new(
                peer.clone(),
                validated.clone(),
                subscriptions.clone(),
            )
        })
        .collect();
    if peers.is_empty() {
        warn!(event = "no peers configured; serving stored data only");
    }
    let balancer = LoadBalancer::new(
        peers.clone(),
        config.forwarding.cache_ttl,
        config.forwarding.cache_size,
    );

    let app = AppContext::with_log_reload(
        store.clone(),
        subscriptions.clone(),
        balancer.clone(),
        etl_state.clone(),
        validated.clone(),
        log_reload,
    );
    let dos = Arc::new(DosGuard::new(config.dos_guard.clone()));
    let engine = RpcEngine::new(app.clone(), dos, config.rpc.clone());
    let http = HttpServer::new(
        config.http.clone(),
        app,
        engine,
        metrics_handle,
    );

    let node = Node::new();

    // Warm the cache from the persisted tip before (or alongside) the
    // pipeline, per the configured style.
    if let Some(range) = store.ledger_range() {
        let params = config.cache_loader.clone();
        match params.style {
            loader::Style::Sync => {
                loader::load(
                    store.clone(),
                    range.max_sequence,
                    params,
                    node.token(),
                )
                .await
                .context("synchronous cache load")?;
            }
            loader::Style::Async => {
                let store = store.clone();
                let token = node.token();
                tokio::spawn(async move {
                    if let Err(err) = loader::load(
                        store,
                        range.max_sequence,
                        params,
                        token,
                    )
                    .await
                    {
                        warn!(event = "cache load failed", err = %err);
                    }
                });
            }
            loader::Style::None => {}
        }
    }

    let etl_service = EtlService::new(
        config.etl.clone(),
        store,
        balancer,
        validated,
        subscriptions,
        etl_state,
        config.storage.keep_ledgers,
        config.storage.online_delete_interval,
    );

    let services: Vec<Box<dyn LongLivedService>> = vec![
        Box::new(PeerSrv::new(peers)),
        Box::new(etl_service),
        Box::new(http),
    ];
    node.spawn_all(services).await
}
