use std::sync::Arc;

use anyhow::Context as _;
use futures::{StreamExt, stream};
use kube::{
    Api, Client,
    config::KubeConfigOptions,
    runtime::{
        Controller, WatchStreamExt,
        controller::{Action, Config as ControllerConfig, Error as ControllerError},
        reflector::{self, ObjectRef},
        watcher,
    },
};
use regex::Regex;
use tracing::{debug, error, info, warn};

pub mod applier;
pub mod compute;
pub mod config;
pub mod controller;
pub mod correlation;
pub mod crds;
pub mod deletion;
pub mod error;
pub mod health;
pub mod hub;
pub mod leader;
pub mod predicates;
pub mod status;
pub mod throttle;

#[cfg(test)]
mod fake;

pub use error::Error;

use crds::RegisteredCluster;
use predicates::{WatchEvent, changed_objects, hub_events, registration_changed};

pub async fn run() -> anyhow::Result<()> {
    let config = config::Config::from_env()?;
    let label_excludes = config
        .sync_target_label_excludes
        .iter()
        .map(|pattern| Regex::new(pattern).with_context(|| format!("invalid label exclude {pattern:?}")))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let readiness = health::Readiness::default();
    tokio::spawn({
        let readiness = readiness.clone();
        let addr = config.health_addr;
        async move {
            if let Err(e) = health::serve_health(addr, readiness).await {
                error!(error = %e, "health endpoints stopped");
            }
        }
    });

    let options = KubeConfigOptions::default();

    // Load kubeconfig if it's present otherwise fall back to cluster config
    let kube_config = kube::Config::from_kubeconfig(&options)
        .await
        .or_else(|_| kube::Config::incluster())?;
    let client = Client::try_from(kube_config)?;

    let hubs = hub::HubRegistry::build(&client, &config.namespace).await?;
    let compute = compute::ComputeClientSet::connect(&client, &config.namespace, &config.apiexport_name).await?;
    info!(
        hubs = hubs.len(),
        namespace = %config.namespace,
        export = %config.apiexport_name,
        "starting registration controller"
    );

    let hub_streams: Vec<_> = hubs
        .bindings()
        .iter()
        .filter_map(|binding| {
            let kube = binding.kube.clone()?;
            Some(hub_events(kube, binding.name.clone()).boxed())
        })
        .collect();
    let hub_triggers = stream::select_all(hub_streams).map(WatchEvent::into_registration);

    let (reader, writer) = reflector::store::<RegisteredCluster>();
    let registrations = changed_objects(
        watcher(Api::<RegisteredCluster>::all(compute.client()), watcher::Config::default())
            .default_backoff()
            .reflect(writer),
        registration_changed,
    );

    let ctx = Arc::new(controller::Context::new(Arc::new(hubs), Arc::new(compute), label_excludes));
    readiness.set(true);

    let mut leadership = if config.enable_leader_election {
        let elector = leader::LeaderElector::new(client.clone(), &config.namespace, &config.identity());
        Some(elector.acquire().await?)
    } else {
        None
    };

    let controller = Controller::for_stream(registrations, reader)
        .reconcile_on(hub_triggers)
        .with_config(ControllerConfig::default().concurrency(config.controller_concurrency))
        .shutdown_on_signal()
        .run(controller::reconcile, controller::error_policy, ctx.clone())
        .for_each(|result| {
            log_reconcile_result(&ctx, result);
            futures::future::ready(())
        });

    match leadership.as_mut() {
        Some(held) => {
            tokio::select! {
                _ = controller => {}
                _ = held.lost() => {
                    readiness.set(false);
                    anyhow::bail!("lost leadership");
                }
            }
        }
        None => controller.await,
    }

    if let Some(held) = leadership {
        held.release().await;
    }
    info!("controller stopped");
    Ok(())
}

fn log_reconcile_result(
    ctx: &controller::Context,
    result: Result<(ObjectRef<RegisteredCluster>, Action), ControllerError<Error, watcher::Error>>,
) {
    match result {
        Ok((key, _)) => debug!(registration = %key, "reconciled"),
        Err(ControllerError::ObjectNotFound(key)) => {
            ctx.forget(&key);
            debug!(registration = %key, "registration no longer exists")
        }
        Err(ControllerError::ReconcilerFailed(e, key)) => {
            if e.is_not_found() {
                debug!(registration = %key, error = %e, "waiting for dependent");
            } else {
                error!(registration = %key, error = %e, "reconcile failed");
            }
        }
        Err(e) => warn!(error = %e, "controller error"),
    }
}
