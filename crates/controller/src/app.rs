//! App → Deployment + Service.
//!
//! An `App` (group `appcontroller.k8s.io`) declares a deployment template and
//! a service template. Each non-empty template yields one owned dependent; the
//! App status mirrors what the dependents report.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec, Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use steward_kubehub::{EventSink, ResourceApi};
use tokio_util::sync::CancellationToken;

use crate::{Controller, ControllerBuilder, ControllerConfig, Primary, Template};

pub const CONTROLLER_NAME: &str = "app-controller";
pub const APP_LABEL: &str = "appcontroller.k8s.io/app";
pub const CONTAINER_NAME: &str = "app-deploy-container";
pub const SERVICE_PORT_NAME: &str = "app-service";
pub const DEFAULT_SERVICE_PORT: i32 = 8080;

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "appcontroller.k8s.io",
    version = "v1",
    kind = "App",
    namespaced,
    status = "AppStatus",
    shortname = "app",
    derive = "PartialEq",
    printcolumn = r#"{"name":"Deployment","type":"string","jsonPath":".spec.deploymentTemplate.name"}"#,
    printcolumn = r#"{"name":"Service","type":"string","jsonPath":".spec.serviceTemplate.name"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AppSpec {
    #[serde(default)]
    pub deployment_template: DeploymentTemplate,
    #[serde(default)]
    pub service_template: ServiceTemplate,
}

/// An empty name means no Deployment.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentTemplate {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
}

/// An empty name means no Service.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceTemplate {
    #[serde(default)]
    pub name: String,
    /// Defaults to 8080.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AppStatus {
    /// `null` once the Deployment is no longer wanted, so a merge patch clears it.
    pub deployment: Option<DeploymentSummary>,
    pub service: Option<ServiceSummary>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentSummary {
    pub replicas: i32,
    pub ready_replicas: i32,
    pub available_replicas: i32,
    pub updated_replicas: i32,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSummary {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_ip: Option<String>,
    /// IPs or hostnames published by the load balancer.
    #[serde(default)]
    pub load_balancer_ingress: Vec<String>,
}

impl Primary for App {
    type Status = AppStatus;

    fn status(&self) -> AppStatus { self.status.clone().unwrap_or_default() }

    fn set_status(&mut self, status: AppStatus) { self.status = Some(status); }

    fn affects_dependents(old: &Self, new: &Self) -> bool {
        old.spec != new.spec || old.metadata.uid != new.metadata.uid
    }
}

fn selector(app: &App) -> Option<BTreeMap<String, String>> {
    let name = app.metadata.name.clone()?;
    Some(BTreeMap::from([(APP_LABEL.to_string(), name)]))
}

/// Renders `spec.deploymentTemplate`.
#[derive(Debug, Clone, Copy, Default)]
pub struct AppDeployment;

impl Template<App> for AppDeployment {
    type Object = Deployment;

    fn render(&self, app: &App) -> Option<Deployment> {
        let t = &app.spec.deployment_template;
        if t.name.is_empty() {
            return None;
        }
        let labels = selector(app)?;
        Some(Deployment {
            metadata: ObjectMeta { name: Some(t.name.clone()), labels: Some(labels.clone()), ..Default::default() },
            spec: Some(DeploymentSpec {
                replicas: t.replicas,
                selector: LabelSelector { match_labels: Some(labels.clone()), ..Default::default() },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta { labels: Some(labels), ..Default::default() }),
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: CONTAINER_NAME.to_string(),
                            image: Some(t.image.clone()),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    fn observe(&self, deployment: &Deployment, status: &mut AppStatus) {
        let s = deployment.status.clone().unwrap_or_default();
        status.deployment = Some(DeploymentSummary {
            replicas: s.replicas.unwrap_or(0),
            ready_replicas: s.ready_replicas.unwrap_or(0),
            available_replicas: s.available_replicas.unwrap_or(0),
            updated_replicas: s.updated_replicas.unwrap_or(0),
        });
    }

    fn clear(&self, status: &mut AppStatus) { status.deployment = None; }
}

/// Renders `spec.serviceTemplate`.
#[derive(Debug, Clone, Copy, Default)]
pub struct AppService;

impl Template<App> for AppService {
    type Object = Service;

    fn render(&self, app: &App) -> Option<Service> {
        let t = &app.spec.service_template;
        if t.name.is_empty() {
            return None;
        }
        let labels = selector(app)?;
        Some(Service {
            metadata: ObjectMeta { name: Some(t.name.clone()), labels: Some(labels.clone()), ..Default::default() },
            spec: Some(ServiceSpec {
                selector: Some(labels),
                ports: Some(vec![ServicePort {
                    name: Some(SERVICE_PORT_NAME.to_string()),
                    port: t.port.unwrap_or(DEFAULT_SERVICE_PORT),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    fn observe(&self, svc: &Service, status: &mut AppStatus) {
        let load_balancer_ingress = svc
            .status
            .as_ref()
            .and_then(|s| s.load_balancer.as_ref())
            .and_then(|lb| lb.ingress.as_ref())
            .map(|ingress| ingress.iter().filter_map(|i| i.ip.clone().or_else(|| i.hostname.clone())).collect())
            .unwrap_or_default();
        status.service = Some(ServiceSummary {
            cluster_ip: svc.spec.as_ref().and_then(|s| s.cluster_ip.clone()),
            load_balancer_ingress,
        });
    }

    fn clear(&self, status: &mut AppStatus) { status.service = None; }
}

pub fn controller(
    config: ControllerConfig,
    apps: Arc<dyn ResourceApi<App>>,
    deployments: Arc<dyn ResourceApi<Deployment>>,
    services: Arc<dyn ResourceApi<Service>>,
    events: Arc<dyn EventSink>,
    shutdown: CancellationToken,
) -> Controller<App> {
    ControllerBuilder::new(CONTROLLER_NAME, config, apps, events, shutdown)
        .owns(AppDeployment, deployments)
        .owns(AppService, services)
        .build()
}

#[cfg(test)]
mod tests {
    use kube::CustomResourceExt;

    use super::*;

    fn app(deploy: &str, svc: &str) -> App {
        let mut a = App::new(
            "web",
            AppSpec {
                deployment_template: DeploymentTemplate {
                    name: deploy.into(),
                    image: "nginx:1.27".into(),
                    replicas: Some(2),
                },
                service_template: ServiceTemplate { name: svc.into(), port: None },
            },
        );
        a.metadata.namespace = Some("default".into());
        a
    }

    #[test]
    fn empty_template_names_render_nothing() {
        let a = app("", "");
        assert!(AppDeployment.render(&a).is_none());
        assert!(AppService.render(&a).is_none());
    }

    #[test]
    fn selectors_tie_pods_to_the_app() {
        let a = app("web-deploy", "web-svc");
        let d = AppDeployment.render(&a).unwrap();
        let spec = d.spec.unwrap();
        let labels = spec.selector.match_labels.unwrap();
        assert_eq!(labels.get(APP_LABEL).map(String::as_str), Some("web"));
        assert_eq!(spec.template.metadata.unwrap().labels.unwrap(), labels);
        assert_eq!(spec.replicas, Some(2));
        assert_eq!(spec.template.spec.unwrap().containers[0].image.as_deref(), Some("nginx:1.27"));

        let s = AppService.render(&a).unwrap().spec.unwrap();
        assert_eq!(s.selector.unwrap(), labels);
        let port = &s.ports.unwrap()[0];
        assert_eq!((port.name.as_deref(), port.port), (Some("app-service"), 8080));
    }

    #[test]
    fn status_changes_do_not_affect_dependents() {
        let old = app("web-deploy", "web-svc");
        let mut new = old.clone();
        new.status = Some(AppStatus { deployment: Some(DeploymentSummary::default()), service: None });
        assert!(!App::affects_dependents(&old, &new));
        new.spec.service_template.port = Some(9090);
        assert!(App::affects_dependents(&old, &new));
    }

    #[test]
    fn crd_is_namespaced_with_status() {
        let crd = App::crd();
        assert_eq!(crd.metadata.name.as_deref(), Some("apps.appcontroller.k8s.io"));
        assert_eq!(crd.spec.scope, "Namespaced");
        let v = &crd.spec.versions[0];
        assert_eq!(v.name, "v1");
        assert!(v.subresources.as_ref().and_then(|s| s.status.as_ref()).is_some());
    }
}
