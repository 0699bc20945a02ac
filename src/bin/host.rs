// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! `gatemesh-host`: loads a config file and runs whichever
//! gate/gate-master/service components it names until `Ctrl-C`.

use anyhow::Result;
use clap::Parser;
use gatemesh::{
    app::Host,
    cfg::{cli::HostArgs, config::Config, logger},
};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let args = HostArgs::parse();
    let config_path = gatemesh::cfg::cli::resolve_config_path(&args.config)?;
    let config = Config::load_from_file(&config_path)?;

    let _guard = logger::init_logger(config.log_config.as_deref())?;
    info!(path = %config_path.display(), "loaded config");

    let mut host = Host::new(config);
    host.run(args.only.as_deref()).await
}
