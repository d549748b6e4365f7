// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) the Quill developers. All rights reserved.

pub mod database;
pub mod etl;
pub mod exec;
pub mod peer;
pub mod storage;
pub mod subscriptions;

use async_trait::async_trait;
use exec::StopToken;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinSet;
use tracing::{error, info};

/// A service that runs for the node's whole lifetime (ETL, peers, the web
/// server). Its `execute` observes the stop token at every suspension
/// point and drains cleanly when it fires.
#[async_trait]
pub trait LongLivedService: Send + Sync {
    async fn execute(&mut self, token: StopToken) -> anyhow::Result<usize>;

    /// Returns service name.
    fn name(&self) -> &'static str;
}

/// Owns the service set and the shutdown sequence.
#[derive(Default)]
pub struct Node {
    token: StopToken,
}

impl Node {
    pub fn new() -> Self {
        Self {
            token: StopToken::new(),
        }
    }

    pub fn token(&self) -> StopToken {
        self.token.clone()
    }

    /// Sets up and runs a list of services, then join-waits for their
    /// termination. SIGINT (and SIGTERM) trigger a cooperative stop; a
    /// service finishing on its own stops the rest as well.
    pub async fn spawn_all(
        &self,
        services: Vec<Box<dyn LongLivedService>>,
    ) -> anyhow::Result<()> {
        let mut set = JoinSet::new();

        {
            let token = self.token.clone();
            set.spawn(async move {
                let mut interrupt = signal(SignalKind::interrupt())?;
                let mut terminate = signal(SignalKind::terminate())?;
                tokio::select! {
                    _ = interrupt.recv() => {}
                    _ = terminate.recv() => {}
                    _ = token.cancelled() => {}
                }
                info!(event = "shutdown signal");
                token.cancel();
                Ok(0usize)
            });
        }

        for mut service in services.into_iter() {
            let name = service.name();
            let token = self.token.clone();
            info!("starting service {}", name);

            set.spawn(async move {
                let result = service.execute(token.clone()).await;
                // One service ending takes the node down with it.
                token.cancel();
                result
            });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => {
                    error!("service terminated with err {}", err);
                }
                Err(err) if err.is_cancelled() => {}
                Err(err) => {
                    error!("service panicked: {}", err);
                }
            }
        }

        info!("shutdown ...");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    struct OneShot;

    #[async_trait]
    impl LongLivedService for OneShot {
        async fn execute(
            &mut self,
            _token: StopToken,
        ) -> anyhow::Result<usize> {
            Ok(0)
        }

        fn name(&self) -> &'static str {
            "one-shot"
        }
    }

    struct WaitsForStop;

    #[async_trait]
    impl LongLivedService for WaitsForStop {
        async fn execute(
            &mut self,
            token: StopToken,
        ) -> anyhow::Result<usize> {
            token.cancelled().await;
            Ok(0)
        }

        fn name(&self) -> &'static str {
            "waits-for-stop"
        }
    }

    #[tokio::test]
    async fn finished_service_stops_the_node() {
        let node = Node::new();
        let services: Vec<Box<dyn LongLivedService>> =
            vec![Box::new(OneShot), Box::new(WaitsForStop)];

        tokio::time::timeout(
            Duration::from_secs(5),
            node.spawn_all(services),
        )
        .await
        .expect("node drains once a service finishes")
        .unwrap();
    }
}
