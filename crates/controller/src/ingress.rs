//! Service → Ingress: every Service carrying the ingress annotation gets an
//! owned Ingress of the same name routing `/` to it.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule, IngressServiceBackend, IngressSpec,
    ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use steward_kubehub::{EventSink, ResourceApi};
use tokio_util::sync::CancellationToken;

use crate::{Controller, ControllerBuilder, ControllerConfig, Primary, Template};

pub const CONTROLLER_NAME: &str = "service-ingress";
pub const DEFAULT_ANNOTATION: &str = "ingress/http";
pub const DEFAULT_CLASS: &str = "ingress";
pub const DEFAULT_HOST: &str = "example.com";
pub const DEFAULT_PORT: i32 = 80;

/// How the annotation value is judged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnnotationMatch {
    /// Any value, including empty.
    Presence,
    Exact(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressPolicy {
    pub annotation: String,
    pub matcher: AnnotationMatch,
}

impl Default for IngressPolicy {
    fn default() -> Self { Self { annotation: DEFAULT_ANNOTATION.to_string(), matcher: AnnotationMatch::Presence } }
}

impl IngressPolicy {
    pub fn wants_ingress(&self, meta: &ObjectMeta) -> bool {
        let value = meta.annotations.as_ref().and_then(|a| a.get(&self.annotation));
        match (&self.matcher, value) {
            (_, None) => false,
            (AnnotationMatch::Presence, Some(_)) => true,
            (AnnotationMatch::Exact(want), Some(v)) => v == want,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngressTemplate {
    pub policy: IngressPolicy,
    pub class: String,
    pub host: String,
    pub path: String,
    pub port: i32,
}

impl Default for IngressTemplate {
    fn default() -> Self {
        Self {
            policy: IngressPolicy::default(),
            class: DEFAULT_CLASS.to_string(),
            host: DEFAULT_HOST.to_string(),
            path: "/".to_string(),
            port: DEFAULT_PORT,
        }
    }
}

/// Service status belongs to the cloud controller; nothing is mirrored.
impl Primary for Service {
    type Status = ();

    fn status(&self) {}
    fn set_status(&mut self, _status: ()) {}

    fn affects_dependents(old: &Self, new: &Self) -> bool {
        old.metadata.annotations != new.metadata.annotations || old.metadata.uid != new.metadata.uid
    }
}

impl Template<Service> for IngressTemplate {
    type Object = Ingress;

    fn render(&self, svc: &Service) -> Option<Ingress> {
        if !self.policy.wants_ingress(&svc.metadata) {
            return None;
        }
        let name = svc.metadata.name.clone()?;
        let backend = IngressBackend {
            service: Some(IngressServiceBackend {
                name: name.clone(),
                port: Some(ServiceBackendPort { number: Some(self.port), ..Default::default() }),
            }),
            ..Default::default()
        };
        let rule = IngressRule {
            host: Some(self.host.clone()),
            http: Some(HTTPIngressRuleValue {
                paths: vec![HTTPIngressPath {
                    path: Some(self.path.clone()),
                    path_type: "Prefix".to_string(),
                    backend,
                }],
            }),
        };
        Some(Ingress {
            metadata: ObjectMeta { name: Some(name), ..Default::default() },
            spec: Some(IngressSpec {
                ingress_class_name: Some(self.class.clone()),
                rules: Some(vec![rule]),
                ..Default::default()
            }),
            ..Default::default()
        })
    }
}

pub fn controller(
    config: ControllerConfig,
    template: IngressTemplate,
    services: Arc<dyn ResourceApi<Service>>,
    ingresses: Arc<dyn ResourceApi<Ingress>>,
    events: Arc<dyn EventSink>,
    shutdown: CancellationToken,
) -> Controller<Service> {
    ControllerBuilder::new(CONTROLLER_NAME, config, services, events, shutdown)
        .owns(template, ingresses)
        .build()
}
