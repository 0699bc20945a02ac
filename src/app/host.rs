// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Application host (§2.18): loads a [`Config`], starts whichever of
//! `gate-master`/`gate`/a registered service the config's `services` table
//! names, and drives a per-frame tick until shutdown.
//!
//! The original dynamically loads service implementations from shared
//! libraries (`service_loader.cpp`) by name; that's explicitly out of scope
//! here (§1 Non-goals). This crate substitutes the idiomatic Rust
//! equivalent — a static [`ServiceFactory`] registry the embedding binary
//! populates at compile time, no `dlopen` involved.

use std::{collections::HashMap, sync::Arc};

use anyhow::{Context, Result, bail};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    cfg::config::{Config, ServiceConfig},
    gate::{Gate, GateMaster},
    runtime::scheduler::FrameTicker,
};

/// Built by an embedding binary to turn a `services` table entry whose name
/// isn't one of the built-in `gate`/`gate-master` kinds into a running
/// task. Implementors spawn their own async work and return the handle;
/// `spawn` itself stays a plain (non-async) method so this trait needs no
/// extra async-in-traits dependency.
pub trait ServiceFactory: Send + Sync {
    fn spawn(
        &self,
        cfg: ServiceConfig,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<Result<()>>;
}

/// Owns every component one config file starts in this process.
pub struct Host {
    config: Config,
    factories: HashMap<String, Arc<dyn ServiceFactory>>,
    cancel: CancellationToken,
    tasks: Vec<tokio::task::JoinHandle<Result<()>>>,
}

impl Host {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            factories: HashMap::new(),
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }

    /// Registers a factory for services named `name` in the config.
    pub fn register(&mut self, name: impl Into<String>, factory: Arc<dyn ServiceFactory>) {
        self.factories.insert(name.into(), factory);
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Starts every configured service (in `order`), then drives the
    /// per-frame tick until `Ctrl-C` or [`Self::stop`].
    pub async fn run(&mut self, only: Option<&str>) -> Result<()> {
        let services: Vec<ServiceConfig> = self
            .config
            .services_in_start_order()
            .into_iter()
            .filter(|s| only.is_none_or(|f| s.name.contains(f)))
            .cloned()
            .collect();

        for svc in services {
            self.start_one(svc)?;
        }

        let mut ticker = FrameTicker::new(std::time::Duration::from_millis(self.config.frame_interval));
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::signal::ctrl_c() => {
                    info!("received ctrl-c, shutting down");
                    self.cancel.cancel();
                    break;
                }
                _ = ticker.tick() => {}
            }
        }

        for task in self.tasks.drain(..) {
            task.abort();
        }
        Ok(())
    }

    /// Cancels every running component without waiting for `Ctrl-C`.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    fn start_one(&mut self, svc: ServiceConfig) -> Result<()> {
        match svc.name.as_str() {
            "gate-master" => self.start_gate_master(&svc),
            "gate" => self.start_gate(&svc),
            other => {
                let Some(factory) = self.factories.get(other).cloned() else {
                    bail!("no ServiceFactory registered for service \"{other}\" (id {})", svc.id);
                };
                let handle = factory.spawn(svc, self.cancel.child_token());
                self.tasks.push(handle);
                Ok(())
            }
        }
    }

    fn start_gate_master(&mut self, svc: &ServiceConfig) -> Result<()> {
        let args = svc.gate_master_args()?;
        let addr = args
            .listen_address
            .parse()
            .with_context(|| format!("invalid gate-master listen_address {:?}", args.listen_address))?;
        let master = GateMaster::new();
        let cancel = self.cancel.child_token();
        info!(%addr, "starting gate master");
        self.tasks.push(tokio::spawn(async move { master.serve(addr, cancel).await }));
        Ok(())
    }

    fn start_gate(&mut self, svc: &ServiceConfig) -> Result<()> {
        let args = svc.gate_args()?;
        let master_addr = args
            .master_address
            .parse()
            .with_context(|| format!("invalid gate master_address {:?}", args.master_address))?;
        let local_addr = format!("0.0.0.0:{}", args.local_port)
            .parse()
            .context("invalid local_port")?;
        let remote_addr = format!("0.0.0.0:{}", args.remote_port)
            .parse()
            .context("invalid remote_port")?;

        let mut advertise = args.remote_hosts.clone();
        if advertise.is_empty() {
            warn!(
                service_id = svc.id,
                "gate has no remote_hosts configured; peer gates won't be able to dial it back"
            );
        }
        advertise.retain(|h| !h.is_empty());

        let gate = Gate::new(svc.id, advertise);
        let cancel = self.cancel.child_token();

        info!(%master_addr, %local_addr, %remote_addr, "starting gate");
        let connect_gate = Arc::clone(&gate);
        let connect_cancel = cancel.child_token();
        self.tasks.push(tokio::spawn(async move {
            connect_gate.connect_master(master_addr, connect_cancel).await
        }));

        let local_gate = Arc::clone(&gate);
        let local_cancel = cancel.child_token();
        self.tasks
            .push(tokio::spawn(async move { local_gate.serve_local(local_addr, local_cancel).await }));

        let remote_gate = Arc::clone(&gate);
        let remote_cancel = cancel.child_token();
        self.tasks
            .push(tokio::spawn(async move { remote_gate.serve_remote(remote_addr, remote_cancel).await }));

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            frame_interval: 10,
            thread_pool_num: 1,
            service_path: vec![],
            services: vec![],
            log_config: None,
        }
    }

    #[test]
    fn unregistered_service_name_is_rejected() {
        let mut host = Host::new(base_config());
        let svc = ServiceConfig {
            id: 1,
            service_type: 1,
            name: "no-such-service".into(),
            order: 0,
            interval: None,
            args: toml::Value::Table(Default::default()),
        };
        assert!(host.start_one(svc).is_err());
    }

    #[tokio::test]
    async fn registered_factory_gets_spawned() {
        struct NoopFactory;
        impl ServiceFactory for NoopFactory {
            fn spawn(&self, _cfg: ServiceConfig, _cancel: CancellationToken) -> tokio::task::JoinHandle<Result<()>> {
                tokio::spawn(async { Ok(()) })
            }
        }

        let mut host = Host::new(base_config());
        host.register("echo", Arc::new(NoopFactory));
        let svc = ServiceConfig {
            id: 1,
            service_type: 1,
            name: "echo".into(),
            order: 0,
            interval: None,
            args: toml::Value::Table(Default::default()),
        };
        host.start_one(svc).expect("starts");
        assert_eq!(host.tasks.len(), 1);
        let result = host.tasks.pop().expect("task").await.expect("join");
        assert!(result.is_ok());
    }
}
