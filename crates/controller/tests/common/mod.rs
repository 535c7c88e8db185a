#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use steward_controller::ingress::{self, IngressTemplate};
use steward_controller::{Controller, ControllerConfig};
use steward_core::ObjectKey;
use steward_kubehub::{MemoryApi, MemoryEventSink};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Poll `cond` until it holds or five seconds pass.
pub async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Fast retries so bounded-retry runs finish quickly.
pub fn test_config(max_retries: u32) -> ControllerConfig {
    ControllerConfig {
        workers: 3,
        max_retries,
        retry_base: Duration::from_millis(1),
        retry_max: Duration::from_millis(20),
        qps: 1000.0,
        burst: 1000,
        ..Default::default()
    }
}

pub fn service(name: &str, annotations: &[(&str, &str)]) -> Service {
    let mut s = Service::default();
    s.metadata.name = Some(name.into());
    s.metadata.namespace = Some("default".into());
    if !annotations.is_empty() {
        s.metadata.annotations =
            Some(annotations.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect::<BTreeMap<_, _>>());
    }
    s
}

pub fn key(name: &str) -> ObjectKey { ObjectKey::new("default", name) }

pub struct IngressHarness {
    pub services: Arc<MemoryApi<Service>>,
    pub ingresses: Arc<MemoryApi<Ingress>>,
    pub events: Arc<MemoryEventSink>,
    pub shutdown: CancellationToken,
    pub controller: Arc<Controller<Service>>,
    task: JoinHandle<anyhow::Result<()>>,
}

impl IngressHarness {
    pub async fn start(config: ControllerConfig, template: IngressTemplate) -> Self {
        Self::start_with(config, template, MemoryApi::shared(), MemoryApi::shared()).await
    }

    /// Start against pre-populated stores.
    pub async fn start_with(
        config: ControllerConfig,
        template: IngressTemplate,
        services: Arc<MemoryApi<Service>>,
        ingresses: Arc<MemoryApi<Ingress>>,
    ) -> Self {
        let events = Arc::new(MemoryEventSink::new());
        let shutdown = CancellationToken::new();
        let controller = Arc::new(ingress::controller(
            config,
            template,
            services.clone(),
            ingresses.clone(),
            events.clone(),
            shutdown.clone(),
        ));
        let task = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move { controller.run().await })
        };
        assert!(controller.wait_for_sync().await, "caches never synced");
        Self { services, ingresses, events, shutdown, controller, task }
    }

    pub fn ingress(&self, name: &str) -> Option<Ingress> { self.ingresses.object(&key(name)) }

    pub async fn stop(self) {
        self.shutdown.cancel();
        let res = tokio::time::timeout(Duration::from_secs(5), self.task).await;
        assert!(matches!(res, Ok(Ok(Ok(())))), "controller did not stop cleanly: {res:?}");
    }
}
