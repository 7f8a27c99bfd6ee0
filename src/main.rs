// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
use anyhow::Result;
use dataflow_controller::config::ControllerConfig;
use dataflow_controller::dataflowengine_types::DataflowEngine;
use dataflow_controller::shim_layer::run_controller;
use kube::CustomResourceExt;
use std::env;
use tracing::*;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = env::args().collect();
    match args.get(1).map(String::as_str) {
        Some("export") => {
            info!("exporting custom resource definition");
            println!("{}", serde_yaml::to_string(&DataflowEngine::crd())?);
        }
        Some("run") => {
            let config = ControllerConfig::from_env()?;
            info!(
                requeue_after = ?config.requeue_after,
                error_requeue_after = ?config.error_requeue_after,
                "running dataflow-controller"
            );
            run_controller(config).await?;
        }
        _ => warn!("wrong command; please use \"export\" or \"run\""),
    }
    Ok(())
}
