//! Custom Resource Definition for the Apicurio Registry operator
//!
//! This module defines the `ApicurioRegistry3` CRD that represents an
//! Apicurio Registry deployment (REST API backend plus optional web UI).

use k8s_openapi::api::core::v1::{EnvVar, ResourceRequirements};
use kube::CustomResource;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;
use validator::{Validate, ValidationError};

/// API group of the registry CRD
pub const API_GROUP: &str = "registry.apicur.io";

/// API version of the registry CRD
pub const API_VERSION: &str = "registry.apicur.io/v1";

/// Kind of the registry CRD
pub const KIND: &str = "ApicurioRegistry3";

/// Value of the `app.kubernetes.io/managed-by` label on every dependent
pub const MANAGED_BY: &str = "apicurio-registry-operator";

/// Regex for validating container image references
static IMAGE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9._/-]*(:[a-zA-Z0-9._-]+)?(@sha256:[a-f0-9]{64})?$").unwrap()
});

/// Regex for validating DNS hostnames (RFC 1123, optional leading wildcard)
static HOST_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\*\.)?[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$")
        .unwrap()
});

/// Regex for validating Kubernetes names (RFC 1123 label)
static NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").unwrap());

/// Validate a container image reference
fn validate_image(value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Ok(()); // Empty means "use the default image"
    }
    if value.len() > 255 {
        return Err(ValidationError::new("image_too_long")
            .with_message("image reference exceeds 255 characters".into()));
    }
    if value.contains("..") || !IMAGE_REGEX.is_match(value) {
        return Err(ValidationError::new("invalid_image")
            .with_message(format!("'{}' is not a valid container image", value).into()));
    }
    Ok(())
}

/// Validate image pull policy
fn validate_pull_policy(policy: &str) -> Result<(), ValidationError> {
    match policy {
        "Always" | "IfNotPresent" | "Never" => Ok(()),
        _ => Err(ValidationError::new("invalid_pull_policy")
            .with_message("imagePullPolicy must be Always, IfNotPresent, or Never".into())),
    }
}

/// Validate an ingress host
fn validate_host(host: &str) -> Result<(), ValidationError> {
    if host.is_empty() {
        return Ok(());
    }
    if host.len() > 253 || !HOST_REGEX.is_match(host) {
        return Err(ValidationError::new("invalid_host")
            .with_message(format!("'{}' is not a valid RFC 1123 hostname", host).into()));
    }
    Ok(())
}

/// Validate a Kubernetes object name
fn validate_k8s_name(value: &str) -> Result<(), ValidationError> {
    if value.len() > 63 {
        return Err(
            ValidationError::new("name_too_long").with_message("name exceeds 63 characters".into())
        );
    }
    if !NAME_REGEX.is_match(value) {
        return Err(ValidationError::new("invalid_name").with_message(
            format!("'{}' is not a valid Kubernetes name (RFC 1123)", value).into(),
        ));
    }
    Ok(())
}

/// Validate user supplied environment variables
fn validate_env_vars(vars: &[EnvVar]) -> Result<(), ValidationError> {
    const MAX_ENV_VARS: usize = 100;
    if vars.len() > MAX_ENV_VARS {
        return Err(ValidationError::new("too_many_env_vars").with_message(
            format!("maximum {} environment variables allowed", MAX_ENV_VARS).into(),
        ));
    }
    for var in vars {
        if var.name.is_empty() || var.name.len() > 256 {
            return Err(ValidationError::new("invalid_env_name")
                .with_message("environment variable name must be 1-256 characters".into()));
        }
        if var.name.starts_with("LD_") && var.value.is_some() {
            return Err(ValidationError::new("forbidden_env_var").with_message(
                format!(
                    "environment variable '{}' is not allowed for security",
                    var.name
                )
                .into(),
            ));
        }
    }
    Ok(())
}

/// Validate annotations map
fn validate_annotations(annotations: &BTreeMap<String, String>) -> Result<(), ValidationError> {
    if annotations.len() > 50 {
        return Err(ValidationError::new("too_many_annotations")
            .with_message("maximum 50 annotations allowed".into()));
    }
    for key in annotations.keys() {
        if key.len() > 253 {
            return Err(ValidationError::new("annotation_key_too_long")
                .with_message(format!("annotation key '{}' exceeds 253 characters", key).into()));
        }
    }
    Ok(())
}

/// Validate a JDBC connection URL
fn validate_jdbc_url(url: &str) -> Result<(), ValidationError> {
    if !url.starts_with("jdbc:") {
        return Err(ValidationError::new("invalid_jdbc_url")
            .with_message(format!("'{}' is not a JDBC URL (expected jdbc:...)", url).into()));
    }
    Ok(())
}

/// ApicurioRegistry3 custom resource definition
///
/// Declares one Apicurio Registry installation. The operator derives a
/// configuration ConfigMap, Deployments, Services and (optionally) Ingresses
/// from it and keeps them converged.
#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "registry.apicur.io",
    version = "v1",
    kind = "ApicurioRegistry3",
    plural = "apicurioregistries3",
    shortname = "ar3",
    namespaced,
    status = "ApicurioRegistry3Status",
    printcolumn = r#"{"name":"Replicas", "type":"integer", "jsonPath":".spec.app.replicas"}"#,
    printcolumn = r#"{"name":"Ready", "type":"integer", "jsonPath":".status.readyReplicas"}"#,
    printcolumn = r#"{"name":"Storage", "type":"string", "jsonPath":".spec.app.storage.type"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ApicurioRegistry3Spec {
    /// Registry backend (REST API) component
    #[serde(default)]
    #[validate(nested)]
    pub app: AppSpec,

    /// Web console component
    #[serde(default)]
    #[validate(nested)]
    pub ui: UiSpec,
}

/// Registry backend configuration
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct AppSpec {
    /// Number of backend replicas (0-50)
    #[serde(default = "default_replicas")]
    #[validate(range(min = 0, max = 50, message = "replicas must be between 0 and 50"))]
    pub replicas: i32,

    /// Container image (overrides the version-based default)
    #[serde(default)]
    #[validate(custom(function = "validate_image"))]
    pub image: Option<String>,

    /// Image pull policy (Always, IfNotPresent, Never)
    #[serde(default = "default_image_pull_policy")]
    #[validate(custom(function = "validate_pull_policy"))]
    pub image_pull_policy: String,

    /// Additional environment variables
    #[serde(default)]
    #[validate(custom(function = "validate_env_vars"))]
    pub env: Vec<EnvVar>,

    /// Resource requests and limits
    #[serde(default)]
    pub resources: Option<ResourceRequirements>,

    /// Storage backend selection
    #[serde(default)]
    #[validate(nested)]
    pub storage: StorageSpec,

    /// Ingress exposure
    #[serde(default)]
    #[validate(nested)]
    pub ingress: IngressSpec,
}

impl Default for AppSpec {
    fn default() -> Self {
        Self {
            replicas: default_replicas(),
            image: None,
            image_pull_policy: default_image_pull_policy(),
            env: vec![],
            resources: None,
            storage: StorageSpec::default(),
            ingress: IngressSpec::default(),
        }
    }
}

/// Web console configuration
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct UiSpec {
    /// Deploy the web console
    #[serde(default)]
    pub enabled: bool,

    /// Number of UI replicas (0-10)
    #[serde(default = "default_replicas")]
    #[validate(range(min = 0, max = 10, message = "ui replicas must be between 0 and 10"))]
    pub replicas: i32,

    /// Container image (overrides the version-based default)
    #[serde(default)]
    #[validate(custom(function = "validate_image"))]
    pub image: Option<String>,

    /// Image pull policy (Always, IfNotPresent, Never)
    #[serde(default = "default_image_pull_policy")]
    #[validate(custom(function = "validate_pull_policy"))]
    pub image_pull_policy: String,

    /// Additional environment variables
    #[serde(default)]
    #[validate(custom(function = "validate_env_vars"))]
    pub env: Vec<EnvVar>,

    /// Resource requests and limits
    #[serde(default)]
    pub resources: Option<ResourceRequirements>,

    /// Ingress exposure
    #[serde(default)]
    #[validate(nested)]
    pub ingress: IngressSpec,
}

impl Default for UiSpec {
    fn default() -> Self {
        Self {
            enabled: false,
            replicas: default_replicas(),
            image: None,
            image_pull_policy: default_image_pull_policy(),
            env: vec![],
            resources: None,
            ingress: IngressSpec::default(),
        }
    }
}

/// Storage backend selector
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    /// Volatile in-memory storage (development only)
    #[default]
    InMemory,
    /// JDBC database (PostgreSQL, MySQL, SQL Server)
    Sql,
    /// Kafka topic backed journal
    KafkaSql,
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageType::InMemory => write!(f, "inmemory"),
            StorageType::Sql => write!(f, "sql"),
            StorageType::KafkaSql => write!(f, "kafkasql"),
        }
    }
}

/// Storage configuration; exactly the block matching `type` may be set
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpec {
    /// Backend type
    #[serde(default, rename = "type")]
    pub storage_type: StorageType,

    /// SQL settings (required when type is `sql`)
    #[serde(default)]
    #[validate(nested)]
    pub sql: Option<SqlStorageSpec>,

    /// KafkaSQL settings (required when type is `kafkasql`)
    #[serde(default)]
    #[validate(nested)]
    pub kafkasql: Option<KafkaSqlStorageSpec>,
}

/// JDBC datasource settings
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SqlStorageSpec {
    /// JDBC URL, e.g. `jdbc:postgresql://db:5432/registry`
    #[validate(length(min = 1, max = 2048), custom(function = "validate_jdbc_url"))]
    pub url: String,

    /// Database user
    #[serde(default)]
    pub username: Option<String>,

    /// Secret holding the database password
    #[serde(default)]
    #[validate(nested)]
    pub password_secret_ref: Option<SecretKeyRef>,
}

impl SqlStorageSpec {
    /// Database flavour derived from the JDBC URL
    pub fn sql_kind(&self) -> &'static str {
        let rest = self.url.trim_start_matches("jdbc:");
        if rest.starts_with("postgresql:") {
            "postgresql"
        } else if rest.starts_with("mysql:") || rest.starts_with("mariadb:") {
            "mysql"
        } else if rest.starts_with("sqlserver:") {
            "mssql"
        } else {
            "h2"
        }
    }
}

/// Reference to a key inside a Secret
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SecretKeyRef {
    /// Secret name
    #[validate(custom(function = "validate_k8s_name"))]
    pub name: String,

    /// Key within the Secret
    #[validate(length(min = 1, max = 253))]
    pub key: String,
}

/// KafkaSQL settings
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct KafkaSqlStorageSpec {
    /// Comma separated `host:port` list
    #[validate(length(min = 1, max = 2048, message = "bootstrapServers must not be empty"))]
    pub bootstrap_servers: String,
}

/// Ingress exposure for a component
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct IngressSpec {
    /// Host name; an Ingress is created only when this is set
    #[serde(default)]
    #[validate(custom(function = "validate_host"))]
    pub host: Option<String>,

    /// Ingress class
    #[serde(default)]
    pub ingress_class_name: Option<String>,

    /// Extra annotations for the Ingress object
    #[serde(default)]
    #[validate(custom(function = "validate_annotations"))]
    pub annotations: BTreeMap<String, String>,
}

impl IngressSpec {
    /// The configured host, if it is non-empty
    pub fn effective_host(&self) -> Option<&str> {
        self.host.as_deref().filter(|h| !h.is_empty())
    }
}

/// Status of an ApicurioRegistry3 resource
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApicurioRegistry3Status {
    /// Generation the conditions were computed for
    #[serde(default)]
    pub observed_generation: i64,

    /// Conditions (at most one per type)
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Dependent resources currently managed for this registry
    #[serde(default)]
    pub managed_resources: Vec<ManagedResourceRef>,

    /// Desired backend replicas
    #[serde(default)]
    pub replicas: i32,

    /// Ready backend replicas
    #[serde(default)]
    pub ready_replicas: i32,

    /// Externally reachable URL of the REST API, if exposed
    #[serde(default)]
    pub app_url: Option<String>,
}

impl ApicurioRegistry3Status {
    /// Look up a condition by type
    pub fn condition(&self, condition_type: &str) -> Option<&Condition> {
        self.conditions
            .iter()
            .find(|c| c.condition_type == condition_type)
    }

    /// Whether the `Ready` condition is True and current for `generation`
    pub fn is_ready(&self, generation: i64) -> bool {
        self.condition(CONDITION_READY)
            .map(|c| c.status == ConditionStatus::True && !c.is_stale(generation))
            .unwrap_or(false)
    }
}

/// Reference to a dependent resource
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub struct ManagedResourceRef {
    /// Resource kind
    pub kind: String,
    /// Resource name
    pub name: String,
}

/// Condition type: every dependent reports ready
pub const CONDITION_READY: &str = "Ready";

/// Condition type: convergence in flight
pub const CONDITION_PROGRESSING: &str = "Progressing";

/// Condition type: nonrecoverable failure
pub const CONDITION_DEGRADED: &str = "Degraded";

/// Tri-state condition status
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> Self {
        if value {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        }
    }
}

/// Condition describing an aspect of registry state
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition
    #[serde(rename = "type")]
    pub condition_type: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason
    #[serde(default)]
    pub reason: String,

    /// Human-readable message
    #[serde(default)]
    pub message: String,

    /// Last time `status` changed
    #[serde(default)]
    pub last_transition_time: Option<String>,

    /// Generation this condition was computed for
    #[serde(default)]
    pub observed_generation: i64,
}

impl Condition {
    /// A condition older than `generation` must be recomputed before use
    pub fn is_stale(&self, generation: i64) -> bool {
        self.observed_generation < generation
    }
}

fn default_replicas() -> i32 {
    1
}

fn default_image_pull_policy() -> String {
    "IfNotPresent".to_string()
}

/// Component of a registry installation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Component {
    App,
    Ui,
}

impl Component {
    pub fn as_str(&self) -> &'static str {
        match self {
            Component::App => "app",
            Component::Ui => "ui",
        }
    }
}

impl ApicurioRegistry3Spec {
    /// Get labels for managed resources
    pub fn get_labels(&self, registry_name: &str, component: Component) -> BTreeMap<String, String> {
        let mut labels = self.get_selector_labels(registry_name, component);
        labels.insert(
            "app.kubernetes.io/managed-by".to_string(),
            MANAGED_BY.to_string(),
        );
        labels.insert(
            "app.kubernetes.io/part-of".to_string(),
            "apicurio-registry".to_string(),
        );
        labels
    }

    /// Get selector labels for managed resources
    pub fn get_selector_labels(
        &self,
        registry_name: &str,
        component: Component,
    ) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert(
            "app.kubernetes.io/name".to_string(),
            "apicurio-registry".to_string(),
        );
        labels.insert(
            "app.kubernetes.io/instance".to_string(),
            registry_name.to_string(),
        );
        labels.insert(
            "app.kubernetes.io/component".to_string(),
            component.as_str().to_string(),
        );
        labels
    }
}

/// Label selector matching every dependent of one registry
pub fn instance_selector(registry_name: &str) -> String {
    format!(
        "app.kubernetes.io/instance={},app.kubernetes.io/managed-by={}",
        registry_name, MANAGED_BY
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    #[test]
    fn test_spec_defaults_from_empty_yaml() {
        let spec: ApicurioRegistry3Spec = serde_yaml::from_str("{}").unwrap();
        assert_eq!(spec.app.replicas, 1);
        assert_eq!(spec.app.storage.storage_type, StorageType::InMemory);
        assert!(!spec.ui.enabled);
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_storage_type_serialization() {
        let spec: StorageSpec = serde_yaml::from_str(
            "type: kafkasql\nkafkasql:\n  bootstrapServers: kafka:9092\n",
        )
        .unwrap();
        assert_eq!(spec.storage_type, StorageType::KafkaSql);
        assert_eq!(
            spec.kafkasql.unwrap().bootstrap_servers,
            "kafka:9092".to_string()
        );
        assert_eq!(StorageType::Sql.to_string(), "sql");
    }

    #[test]
    fn test_invalid_pull_policy_rejected() {
        let mut spec = ApicurioRegistry3Spec::default();
        spec.app.image_pull_policy = "Sometimes".to_string();
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_invalid_host_rejected() {
        let mut spec = ApicurioRegistry3Spec::default();
        spec.app.ingress.host = Some("Not_A_Host".to_string());
        assert!(spec.validate().is_err());

        spec.app.ingress.host = Some("registry.apps.example.com".to_string());
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_invalid_jdbc_url_rejected() {
        let mut spec = ApicurioRegistry3Spec::default();
        spec.app.storage.storage_type = StorageType::Sql;
        spec.app.storage.sql = Some(SqlStorageSpec {
            url: "postgresql://db/registry".to_string(),
            username: None,
            password_secret_ref: None,
        });
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_sql_kind_from_url() {
        let sql = |url: &str| SqlStorageSpec {
            url: url.to_string(),
            username: None,
            password_secret_ref: None,
        };
        assert_eq!(sql("jdbc:postgresql://db:5432/r").sql_kind(), "postgresql");
        assert_eq!(sql("jdbc:mysql://db:3306/r").sql_kind(), "mysql");
        assert_eq!(sql("jdbc:sqlserver://db;databaseName=r").sql_kind(), "mssql");
        assert_eq!(sql("jdbc:h2:mem:r").sql_kind(), "h2");
    }

    #[test]
    fn test_forbidden_env_var_rejected() {
        let mut spec = ApicurioRegistry3Spec::default();
        spec.app.env.push(EnvVar {
            name: "LD_PRELOAD".to_string(),
            value: Some("/tmp/x.so".to_string()),
            ..Default::default()
        });
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_get_labels() {
        let spec = ApicurioRegistry3Spec::default();
        let labels = spec.get_labels("my-registry", Component::Ui);
        assert_eq!(
            labels.get("app.kubernetes.io/instance"),
            Some(&"my-registry".to_string())
        );
        assert_eq!(
            labels.get("app.kubernetes.io/component"),
            Some(&"ui".to_string())
        );
        assert_eq!(
            labels.get("app.kubernetes.io/managed-by"),
            Some(&MANAGED_BY.to_string())
        );

        let selector = spec.get_selector_labels("my-registry", Component::Ui);
        assert_eq!(selector.len(), 3);
        assert!(!selector.contains_key("app.kubernetes.io/managed-by"));
    }

    #[test]
    fn test_condition_staleness() {
        let cond = Condition {
            condition_type: CONDITION_READY.to_string(),
            status: ConditionStatus::True,
            reason: "AllDependentsReady".to_string(),
            message: String::new(),
            last_transition_time: None,
            observed_generation: 2,
        };
        assert!(!cond.is_stale(2));
        assert!(cond.is_stale(3));

        let status = ApicurioRegistry3Status {
            conditions: vec![cond],
            ..Default::default()
        };
        assert!(status.is_ready(2));
        assert!(!status.is_ready(3));
    }

    #[test]
    fn test_crd_generation() {
        let crd = ApicurioRegistry3::crd();
        assert_eq!(
            crd.metadata.name.as_deref(),
            Some("apicurioregistries3.registry.apicur.io")
        );
        assert_eq!(crd.spec.group, API_GROUP);
        assert_eq!(crd.spec.names.kind, KIND);
    }
}
