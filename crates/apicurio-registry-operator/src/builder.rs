//! Desired-state builder
//!
//! Pure translation of an `ApicurioRegistry3` into the dependent objects
//! that realize it. No cluster access happens here; the output is
//! deterministic for a given input.

use crate::crd::{
    ApicurioRegistry3, ApicurioRegistry3Spec, Component, IngressSpec, StorageSpec, StorageType,
    API_VERSION, KIND,
};
use crate::error::{OperatorError, Result};
use crate::kinds::{to_dynamic, ManagedKind, ResourceId};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Capabilities, ConfigMap, ConfigMapEnvSource, Container, ContainerPort, EmptyDirVolumeSource,
    EnvFromSource, EnvVar, EnvVarSource, HTTPGetAction, PodSpec, PodTemplateSpec, Probe,
    SecretKeySelector, SecurityContext, Service, ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec as K8sIngressSpec, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::DynamicObject;
use kube::ResourceExt;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use validator::Validate;

/// Pod template annotation carrying the hash of the app ConfigMap data
pub const CONFIG_HASH_ANNOTATION: &str = "registry.apicur.io/config-hash";

/// HTTP port of both the registry backend and the UI
pub const HTTP_PORT: i32 = 8080;

/// Registry release used when no image is given
pub const DEFAULT_REGISTRY_VERSION: &str = "3.0.6";

const APP_IMAGE_REPOSITORY: &str = "quay.io/apicurio/apicurio-registry";
const UI_IMAGE_REPOSITORY: &str = "quay.io/apicurio/apicurio-registry-ui";

/// Images used when the spec leaves `image` unset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuilderDefaults {
    pub app_image: String,
    pub ui_image: String,
}

impl BuilderDefaults {
    pub fn for_version(version: &str) -> Self {
        Self {
            app_image: format!("{}:{}", APP_IMAGE_REPOSITORY, version),
            ui_image: format!("{}:{}", UI_IMAGE_REPOSITORY, version),
        }
    }
}

impl Default for BuilderDefaults {
    fn default() -> Self {
        Self::for_version(DEFAULT_REGISTRY_VERSION)
    }
}

/// Every dependent one registry should have, keyed in apply order
#[derive(Debug, Clone, Default)]
pub struct DesiredState {
    resources: BTreeMap<ResourceId, DynamicObject>,
}

impl DesiredState {
    fn insert(&mut self, kind: ManagedKind, object: DynamicObject) {
        let id = ResourceId::new(kind, object.name_any());
        self.resources.insert(id, object);
    }

    pub fn get(&self, id: &ResourceId) -> Option<&DynamicObject> {
        self.resources.get(id)
    }

    pub fn contains(&self, id: &ResourceId) -> bool {
        self.resources.contains_key(id)
    }

    /// Resources in apply order
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = (&ResourceId, &DynamicObject)> {
        self.resources.iter()
    }

    pub fn ids(&self) -> impl Iterator<Item = &ResourceId> {
        self.resources.keys()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Byte-stable serialization of the whole set
    pub fn to_canonical_json(&self) -> Result<String> {
        let objects: Vec<&DynamicObject> = self.resources.values().collect();
        Ok(serde_json::to_string(&objects)?)
    }
}

/// Name of a dependent: `<registry>-<component>-<suffix>`
pub fn resource_name(registry_name: &str, component: Component, suffix: &str) -> String {
    format!("{}-{}-{}", registry_name, component.as_str(), suffix)
}

/// Validate the spec, including rules that span several fields
pub fn validate_spec(spec: &ApicurioRegistry3Spec) -> Result<()> {
    spec.validate()
        .map_err(|e| OperatorError::Validation(e.to_string()))?;

    validate_storage(&spec.app.storage)?;

    if spec.ui.ingress.effective_host().is_some() && !spec.ui.enabled {
        return Err(OperatorError::Validation(
            "ui.ingress.host is set but ui.enabled is false".to_string(),
        ));
    }

    if let (Some(app_host), Some(ui_host)) = (
        spec.app.ingress.effective_host(),
        spec.ui.ingress.effective_host(),
    ) {
        if spec.ui.enabled && app_host == ui_host {
            return Err(OperatorError::Validation(format!(
                "app and ui ingress hosts must differ (both are '{}')",
                app_host
            )));
        }
    }

    Ok(())
}

fn validate_storage(storage: &StorageSpec) -> Result<()> {
    if storage.sql.is_some() && storage.kafkasql.is_some() {
        return Err(OperatorError::Validation(
            "storage.sql and storage.kafkasql are mutually exclusive".to_string(),
        ));
    }

    match storage.storage_type {
        StorageType::InMemory => {
            if storage.sql.is_some() || storage.kafkasql.is_some() {
                return Err(OperatorError::Validation(
                    "storage.type is inmemory but a sql or kafkasql block is set".to_string(),
                ));
            }
        }
        StorageType::Sql => {
            if storage.kafkasql.is_some() {
                return Err(OperatorError::Validation(
                    "storage.type is sql but storage.kafkasql is set".to_string(),
                ));
            }
            if storage.sql.as_ref().map_or(true, |s| s.url.is_empty()) {
                return Err(OperatorError::Validation(
                    "storage.type sql requires storage.sql.url".to_string(),
                ));
            }
        }
        StorageType::KafkaSql => {
            if storage.sql.is_some() {
                return Err(OperatorError::Validation(
                    "storage.type is kafkasql but storage.sql is set".to_string(),
                ));
            }
            if storage
                .kafkasql
                .as_ref()
                .map_or(true, |k| k.bootstrap_servers.is_empty())
            {
                return Err(OperatorError::Validation(
                    "storage.type kafkasql requires storage.kafkasql.bootstrapServers".to_string(),
                ));
            }
        }
    }
    Ok(())
}

/// Build the desired dependents of a registry
pub fn build(registry: &ApicurioRegistry3, defaults: &BuilderDefaults) -> Result<DesiredState> {
    validate_spec(&registry.spec)?;

    let spec = &registry.spec;
    let mut desired = DesiredState::default();

    let configmap = build_app_configmap(registry);
    let config_hash = config_hash(configmap.data.as_ref());
    desired.insert(ManagedKind::ConfigMap, to_dynamic(&configmap)?);
    desired.insert(
        ManagedKind::Deployment,
        to_dynamic(&build_app_deployment(registry, defaults, &config_hash))?,
    );
    desired.insert(
        ManagedKind::Service,
        to_dynamic(&build_service(registry, Component::App))?,
    );
    if spec.app.ingress.effective_host().is_some() {
        desired.insert(
            ManagedKind::Ingress,
            to_dynamic(&build_ingress(registry, Component::App, &spec.app.ingress))?,
        );
    }

    if spec.ui.enabled {
        desired.insert(
            ManagedKind::Deployment,
            to_dynamic(&build_ui_deployment(registry, defaults))?,
        );
        desired.insert(
            ManagedKind::Service,
            to_dynamic(&build_service(registry, Component::Ui))?,
        );
        if spec.ui.ingress.effective_host().is_some() {
            desired.insert(
                ManagedKind::Ingress,
                to_dynamic(&build_ingress(registry, Component::Ui, &spec.ui.ingress))?,
            );
        }
    }

    Ok(desired)
}

fn namespace_of(registry: &ApicurioRegistry3) -> String {
    registry
        .namespace()
        .unwrap_or_else(|| "default".to_string())
}

fn object_meta(registry: &ApicurioRegistry3, name: String, component: Component) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: Some(namespace_of(registry)),
        labels: Some(registry.spec.get_labels(&registry.name_any(), component)),
        owner_references: Some(vec![owner_reference(registry)]),
        ..Default::default()
    }
}

/// Controller owner reference pointing at the registry
pub fn owner_reference(registry: &ApicurioRegistry3) -> OwnerReference {
    OwnerReference {
        api_version: API_VERSION.to_string(),
        kind: KIND.to_string(),
        name: registry.name_any(),
        uid: registry.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Environment derived from the storage selection
fn storage_settings(storage: &StorageSpec) -> BTreeMap<String, String> {
    let mut data = BTreeMap::new();
    match storage.storage_type {
        StorageType::InMemory => {
            data.insert("APICURIO_STORAGE_KIND".to_string(), "sql".to_string());
            data.insert("APICURIO_STORAGE_SQL_KIND".to_string(), "h2".to_string());
        }
        StorageType::Sql => {
            data.insert("APICURIO_STORAGE_KIND".to_string(), "sql".to_string());
            if let Some(sql) = &storage.sql {
                data.insert(
                    "APICURIO_STORAGE_SQL_KIND".to_string(),
                    sql.sql_kind().to_string(),
                );
                data.insert("APICURIO_DATASOURCE_URL".to_string(), sql.url.clone());
                if let Some(username) = &sql.username {
                    data.insert("APICURIO_DATASOURCE_USERNAME".to_string(), username.clone());
                }
            }
        }
        StorageType::KafkaSql => {
            data.insert("APICURIO_STORAGE_KIND".to_string(), "kafkasql".to_string());
            if let Some(kafkasql) = &storage.kafkasql {
                data.insert(
                    "APICURIO_KAFKASQL_BOOTSTRAP_SERVERS".to_string(),
                    kafkasql.bootstrap_servers.clone(),
                );
            }
        }
    }
    data
}

fn build_app_configmap(registry: &ApicurioRegistry3) -> ConfigMap {
    let mut data = storage_settings(&registry.spec.app.storage);
    data.insert("QUARKUS_HTTP_PORT".to_string(), HTTP_PORT.to_string());

    ConfigMap {
        metadata: object_meta(
            registry,
            resource_name(&registry.name_any(), Component::App, "config"),
            Component::App,
        ),
        data: Some(data),
        ..Default::default()
    }
}

/// SHA-256 over the sorted ConfigMap entries
pub fn config_hash(data: Option<&BTreeMap<String, String>>) -> String {
    let mut hasher = Sha256::new();
    for (key, value) in data.into_iter().flatten() {
        hasher.update(key.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

fn http_probe(path: &str, initial_delay: i32) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(path.to_string()),
            port: IntOrString::Int(HTTP_PORT),
            ..Default::default()
        }),
        initial_delay_seconds: Some(initial_delay),
        period_seconds: Some(10),
        timeout_seconds: Some(5),
        failure_threshold: Some(3),
        ..Default::default()
    }
}

fn restricted_security_context(read_only_root: bool) -> SecurityContext {
    SecurityContext {
        run_as_non_root: Some(true),
        read_only_root_filesystem: Some(read_only_root),
        allow_privilege_escalation: Some(false),
        capabilities: Some(Capabilities {
            drop: Some(vec!["ALL".to_string()]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Operator-provided variables first, then user entries with new names
fn merge_env(mut env: Vec<EnvVar>, user: &[EnvVar]) -> Vec<EnvVar> {
    for e in user {
        if !env.iter().any(|existing| existing.name == e.name) {
            env.push(e.clone());
        }
    }
    env
}

fn build_app_container(registry: &ApicurioRegistry3, defaults: &BuilderDefaults) -> Container {
    let app = &registry.spec.app;
    let name = registry.name_any();

    let mut env = Vec::new();
    if let Some(secret) = app
        .storage
        .sql
        .as_ref()
        .and_then(|s| s.password_secret_ref.as_ref())
    {
        env.push(EnvVar {
            name: "APICURIO_DATASOURCE_PASSWORD".to_string(),
            value_from: Some(EnvVarSource {
                secret_key_ref: Some(SecretKeySelector {
                    name: secret.name.clone(),
                    key: secret.key.clone(),
                    optional: Some(false),
                }),
                ..Default::default()
            }),
            ..Default::default()
        });
    }
    let env = merge_env(env, &app.env);

    Container {
        name: "apicurio-registry-app".to_string(),
        image: Some(app.image.clone().unwrap_or_else(|| defaults.app_image.clone())),
        image_pull_policy: Some(app.image_pull_policy.clone()),
        // an empty list still clears variables removed from the spec
        env: Some(env),
        env_from: Some(vec![EnvFromSource {
            config_map_ref: Some(ConfigMapEnvSource {
                name: resource_name(&name, Component::App, "config"),
                optional: Some(false),
            }),
            ..Default::default()
        }]),
        ports: Some(vec![ContainerPort {
            name: Some("http".to_string()),
            container_port: HTTP_PORT,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        liveness_probe: Some(http_probe("/health/live", 15)),
        readiness_probe: Some(http_probe("/health/ready", 15)),
        resources: app.resources.clone(),
        volume_mounts: Some(vec![VolumeMount {
            name: "tmp".to_string(),
            mount_path: "/tmp".to_string(),
            ..Default::default()
        }]),
        security_context: Some(restricted_security_context(true)),
        ..Default::default()
    }
}

fn build_app_deployment(
    registry: &ApicurioRegistry3,
    defaults: &BuilderDefaults,
    config_hash: &str,
) -> Deployment {
    let name = registry.name_any();
    let spec = &registry.spec;
    let selector_labels = spec.get_selector_labels(&name, Component::App);

    let pod_spec = PodSpec {
        containers: vec![build_app_container(registry, defaults)],
        volumes: Some(vec![Volume {
            name: "tmp".to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        }]),
        automount_service_account_token: Some(false),
        ..Default::default()
    };

    Deployment {
        metadata: object_meta(
            registry,
            resource_name(&name, Component::App, "deployment"),
            Component::App,
        ),
        spec: Some(DeploymentSpec {
            replicas: Some(spec.app.replicas),
            selector: LabelSelector {
                match_labels: Some(selector_labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(selector_labels),
                    annotations: Some(BTreeMap::from([(
                        CONFIG_HASH_ANNOTATION.to_string(),
                        config_hash.to_string(),
                    )])),
                    ..Default::default()
                }),
                spec: Some(pod_spec),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// URL the UI uses to reach the REST API
fn registry_api_url(registry: &ApicurioRegistry3) -> String {
    match registry.spec.app.ingress.effective_host() {
        Some(host) => format!("http://{}/apis/registry/v3", host),
        None => format!(
            "http://{}.{}.svc.cluster.local:{}/apis/registry/v3",
            resource_name(&registry.name_any(), Component::App, "service"),
            namespace_of(registry),
            HTTP_PORT
        ),
    }
}

fn build_ui_deployment(registry: &ApicurioRegistry3, defaults: &BuilderDefaults) -> Deployment {
    let name = registry.name_any();
    let ui = &registry.spec.ui;
    let selector_labels = registry.spec.get_selector_labels(&name, Component::Ui);

    let env = merge_env(
        vec![EnvVar {
            name: "REGISTRY_API_URL".to_string(),
            value: Some(registry_api_url(registry)),
            ..Default::default()
        }],
        &ui.env,
    );

    let container = Container {
        name: "apicurio-registry-ui".to_string(),
        image: Some(ui.image.clone().unwrap_or_else(|| defaults.ui_image.clone())),
        image_pull_policy: Some(ui.image_pull_policy.clone()),
        env: Some(env),
        ports: Some(vec![ContainerPort {
            name: Some("http".to_string()),
            container_port: HTTP_PORT,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        liveness_probe: Some(http_probe("/", 5)),
        readiness_probe: Some(http_probe("/", 5)),
        resources: ui.resources.clone(),
        // nginx rewrites its config at startup
        security_context: Some(restricted_security_context(false)),
        ..Default::default()
    };

    Deployment {
        metadata: object_meta(
            registry,
            resource_name(&name, Component::Ui, "deployment"),
            Component::Ui,
        ),
        spec: Some(DeploymentSpec {
            replicas: Some(ui.replicas),
            selector: LabelSelector {
                match_labels: Some(selector_labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(selector_labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    automount_service_account_token: Some(false),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn build_service(registry: &ApicurioRegistry3, component: Component) -> Service {
    let name = registry.name_any();
    Service {
        metadata: object_meta(registry, resource_name(&name, component, "service"), component),
        spec: Some(ServiceSpec {
            selector: Some(registry.spec.get_selector_labels(&name, component)),
            ports: Some(vec![ServicePort {
                name: Some("http".to_string()),
                port: HTTP_PORT,
                target_port: Some(IntOrString::Int(HTTP_PORT)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            type_: Some("ClusterIP".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn build_ingress(registry: &ApicurioRegistry3, component: Component, spec: &IngressSpec) -> Ingress {
    let name = registry.name_any();
    let mut metadata = object_meta(registry, resource_name(&name, component, "ingress"), component);
    if !spec.annotations.is_empty() {
        metadata.annotations = Some(spec.annotations.clone());
    }

    let backend = IngressBackend {
        service: Some(IngressServiceBackend {
            name: resource_name(&name, component, "service"),
            port: Some(ServiceBackendPort {
                number: Some(HTTP_PORT),
                ..Default::default()
            }),
        }),
        ..Default::default()
    };

    Ingress {
        metadata,
        spec: Some(K8sIngressSpec {
            ingress_class_name: spec.ingress_class_name.clone(),
            rules: Some(vec![IngressRule {
                host: spec.effective_host().map(str::to_string),
                http: Some(HTTPIngressRuleValue {
                    paths: vec![HTTPIngressPath {
                        path: Some("/".to_string()),
                        path_type: "Prefix".to_string(),
                        backend,
                    }],
                }),
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}
