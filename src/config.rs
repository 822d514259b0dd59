//! Configuration types for chronos-db.
//!
//! The [`Config`] struct controls router, pipeline, counter, fallback, and
//! write-optimizer behavior. Loading it from YAML/env and admin-facing
//! schema validation live outside this crate; `Config` only needs to be
//! constructed (by any means) and validated before it is handed to
//! [`crate::engine::Engine::open`].
//!
//! # Example
//! ```rust
//! use chronos_db::Config;
//!
//! let config = Config::default();
//! config.validate().unwrap();
//! ```

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Top-level configuration, mirroring `spec.md` §6 "Configuration
/// (enumerated options)" field-for-field.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Metadata backend connections, keyed by connection name
    /// (`mongoConns[]` in the source taxonomy; renamed here since the
    /// metadata backend is redb, not Mongo).
    pub metadata_conns: Vec<MetadataConn>,

    /// Blob backend connections, keyed by connection name
    /// (`spacesConnections{}`).
    pub blob_conns: HashMap<String, BlobConn>,

    /// Static database-type assignments for the six non-tenant-tiered
    /// database types.
    pub databases: DatabasesConfig,

    /// Local-filesystem blob adapter settings. The adapter itself is an
    /// out-of-scope external collaborator; only its config shape lives
    /// here so `Config` stays a complete, typed mirror of the source
    /// options.
    pub local_storage: LocalStorageConfig,

    /// Hashing and key-choice routing options.
    pub routing: RoutingConfig,

    /// Retention windows for version rows and counter rows.
    pub retention: RetentionConfig,

    /// Collection backup/rollup scheduling.
    pub rollup: RollupConfig,

    /// Per-collection indexed-property / externalization maps.
    pub collection_maps: HashMap<String, CollectionMap>,

    /// Conditional counter rules.
    pub counter_rules: CounterRulesConfig,

    /// Dev-shadow inline-snapshot settings.
    pub dev_shadow: DevShadowConfig,

    /// Whether hard-delete admin operations are permitted at all. The
    /// operations themselves are an out-of-scope external collaborator.
    pub hard_delete_enabled: bool,

    /// Durable fallback queue settings.
    pub fallback: FallbackConfig,

    /// Blob-batch and counter-debounce settings.
    pub write_optimization: WriteOptimizationConfig,

    /// Metadata-store transaction capability flags.
    pub transactions: TransactionsConfig,

    /// Dynamic (templated) tenant resolution settings.
    pub dynamic_tenants: DynamicTenantsConfig,
}

impl Config {
    /// Creates a new Config with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates the configuration.
    ///
    /// Called automatically by `Engine::open()`. Checks the invariants
    /// `spec.md` §7 assigns to `ConfigError`: bucket counts, URI
    /// presence, and cross-references between `databases` and the
    /// declared connections.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.metadata_conns.is_empty() {
            return Err(ValidationError::invalid_field(
                "metadata_conns",
                "at least one metadata connection is required",
            ));
        }
        for conn in &self.metadata_conns {
            if conn.name.is_empty() {
                return Err(ValidationError::required_field("metadata_conns[].name"));
            }
            if conn.path.is_empty() {
                return Err(ValidationError::required_field("metadata_conns[].path"));
            }
        }

        if self.blob_conns.is_empty() {
            return Err(ValidationError::invalid_field(
                "blob_conns",
                "at least one blob connection is required",
            ));
        }
        for (name, conn) in &self.blob_conns {
            conn.buckets.validate(name)?;
        }

        self.databases.validate(&self.metadata_conns, &self.blob_conns)?;

        if self.fallback.enabled {
            if self.fallback.max_attempts == 0 {
                return Err(ValidationError::invalid_field(
                    "fallback.max_attempts",
                    "must be greater than 0 when fallback is enabled",
                ));
            }
            if self.fallback.base_delay_ms == 0 {
                return Err(ValidationError::invalid_field(
                    "fallback.base_delay_ms",
                    "must be greater than 0",
                ));
            }
            if self.fallback.max_delay_ms < self.fallback.base_delay_ms {
                return Err(ValidationError::invalid_field(
                    "fallback.max_delay_ms",
                    "must be >= base_delay_ms",
                ));
            }
            if self.fallback.dead_letter_collection.is_empty() {
                return Err(ValidationError::required_field(
                    "fallback.dead_letter_collection",
                ));
            }
        }

        if self.write_optimization.batch_window_ms == 0 {
            return Err(ValidationError::invalid_field(
                "write_optimization.batch_window_ms",
                "must be greater than 0",
            ));
        }
        if self.write_optimization.debounce_counters_ms == 0 {
            return Err(ValidationError::invalid_field(
                "write_optimization.debounce_counters_ms",
                "must be greater than 0",
            ));
        }

        if self.dynamic_tenants.enabled {
            if self.dynamic_tenants.max_cache_size == 0 {
                return Err(ValidationError::invalid_field(
                    "dynamic_tenants.max_cache_size",
                    "must be greater than 0",
                ));
            }
            for (tier, spec) in &self.dynamic_tenants.tiers {
                if spec.db_name_template.is_empty() {
                    return Err(ValidationError::required_field(format!(
                        "dynamic_tenants.tiers.{tier}.db_name_template"
                    )));
                }
            }
        }

        for (name, map) in &self.collection_maps {
            if let Some(base64) = &map.base64_props {
                for prop in base64.keys() {
                    if prop.is_empty() {
                        return Err(ValidationError::invalid_field(
                            format!("collection_maps.{name}.base64_props"),
                            "property name must not be empty",
                        ));
                    }
                }
            }
        }

        Ok(())
    }
}

/// One metadata backend connection: a path to a redb database file plus a
/// symbolic name used by routing and by `databases.*` references.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetadataConn {
    /// Symbolic name referenced from `databases.*` and routing tables.
    pub name: String,
    /// Filesystem path to the redb database file.
    pub path: String,
    /// Maximum pooled open handles (mirrors the source's pool-size knob;
    /// redb itself needs only one `Database` per path, kept for config
    /// compatibility and future sharding).
    pub max_pool_size: usize,
}

impl Default for MetadataConn {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            path: "chronos.redb".to_string(),
            max_pool_size: 10,
        }
    }
}

/// One blob backend connection: an `object_store` location plus the bucket
/// quadruple it serves.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlobConn {
    /// Symbolic name referenced from `databases.*`.
    pub name: String,
    /// Bucket quadruple this connection serves.
    pub buckets: BucketSet,
}

/// Bucket quadruple `{records, versions, content, backups}`, with `bucket`
/// accepted as a legacy single-bucket alias per `spec.md` §4.3 and §9
/// ("documented bit-exact bucket quadruple... with `bucket` as a legacy
/// alias").
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BucketSet {
    /// Bucket for `item.json` record blobs.
    pub records: String,
    /// Bucket for version-index blob copies, when kept separate from `records`.
    pub versions: String,
    /// Bucket for externalized base64 content blobs.
    pub content: String,
    /// Bucket for collection backup manifests.
    pub backups: String,
    /// Legacy single-bucket alias; if set, all four fields above default to it.
    pub bucket: Option<String>,
}

impl BucketSet {
    fn validate(&self, conn_name: &str) -> Result<(), ValidationError> {
        if self.bucket.is_none()
            && (self.records.is_empty()
                || self.versions.is_empty()
                || self.content.is_empty()
                || self.backups.is_empty())
        {
            return Err(ValidationError::invalid_field(
                format!("blob_conns.{conn_name}.buckets"),
                "all four buckets (records/versions/content/backups) must be set, or legacy `bucket` must be set",
            ));
        }
        Ok(())
    }

    /// Resolves the effective bucket for each role, applying the legacy
    /// `bucket` alias when the specific field is empty.
    pub fn resolve(&self) -> ResolvedBuckets {
        let legacy = self.bucket.clone().unwrap_or_default();
        ResolvedBuckets {
            records: non_empty_or(&self.records, &legacy),
            versions: non_empty_or(&self.versions, &legacy),
            content: non_empty_or(&self.content, &legacy),
            backups: non_empty_or(&self.backups, &legacy),
        }
    }
}

fn non_empty_or(primary: &str, fallback: &str) -> String {
    if primary.is_empty() {
        fallback.to_string()
    } else {
        primary.to_string()
    }
}

/// A [`BucketSet`] after legacy-alias resolution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedBuckets {
    pub records: String,
    pub versions: String,
    pub content: String,
    pub backups: String,
}

/// The six non-tenant-tiered database types plus the tenant-tiered
/// `metadata`/`knowledge`/`runtime` assignments, per `spec.md` §4.3.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DatabasesConfig {
    pub metadata: DatabaseTypeConfig,
    pub knowledge: DatabaseTypeConfig,
    pub runtime: DatabaseTypeConfig,
    pub logs: FlatDatabaseConfig,
    pub messaging: FlatDatabaseConfig,
    pub identities: FlatDatabaseConfig,
}

impl DatabasesConfig {
    fn validate(
        &self,
        metadata_conns: &[MetadataConn],
        blob_conns: &HashMap<String, BlobConn>,
    ) -> Result<(), ValidationError> {
        self.metadata.validate("metadata", metadata_conns, blob_conns)?;
        self.knowledge.validate("knowledge", metadata_conns, blob_conns)?;
        self.runtime.validate("runtime", metadata_conns, blob_conns)?;
        self.logs.validate("logs", metadata_conns, blob_conns)?;
        self.messaging.validate("messaging", metadata_conns, blob_conns)?;
        self.identities.validate("identities", metadata_conns, blob_conns)?;
        Ok(())
    }
}

/// Tiered configuration for a `databaseType` that supports
/// `generic | domain | tenant`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DatabaseTypeConfig {
    pub generic: Option<TierAssignment>,
    pub domain: HashMap<String, TierAssignment>,
    pub tenant: HashMap<String, TierAssignment>,
}

impl DatabaseTypeConfig {
    fn validate(
        &self,
        label: &str,
        metadata_conns: &[MetadataConn],
        blob_conns: &HashMap<String, BlobConn>,
    ) -> Result<(), ValidationError> {
        if let Some(assignment) = &self.generic {
            assignment.validate(&format!("databases.{label}.generic"), metadata_conns, blob_conns)?;
        }
        for (domain, assignment) in &self.domain {
            assignment.validate(
                &format!("databases.{label}.domain.{domain}"),
                metadata_conns,
                blob_conns,
            )?;
        }
        for (tenant, assignment) in &self.tenant {
            assignment.validate(
                &format!("databases.{label}.tenant.{tenant}"),
                metadata_conns,
                blob_conns,
            )?;
        }
        Ok(())
    }
}

/// Non-tiered `databaseType` config (`logs`, `messaging`, `identities`
/// have no tiers per `spec.md` §4.3).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FlatDatabaseConfig {
    pub assignment: Option<TierAssignment>,
}

impl FlatDatabaseConfig {
    fn validate(
        &self,
        label: &str,
        metadata_conns: &[MetadataConn],
        blob_conns: &HashMap<String, BlobConn>,
    ) -> Result<(), ValidationError> {
        if let Some(assignment) = &self.assignment {
            assignment.validate(&format!("databases.{label}"), metadata_conns, blob_conns)?;
        }
        Ok(())
    }
}

/// Binds a `(metadataConn, blobConn, resolvedDbName)` triple for one static
/// routing slot.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TierAssignment {
    pub metadata_conn: String,
    pub blob_conn: String,
    pub resolved_db_name: String,
    pub analytics_db_name: Option<String>,
}

impl TierAssignment {
    fn validate(
        &self,
        path: &str,
        metadata_conns: &[MetadataConn],
        blob_conns: &HashMap<String, BlobConn>,
    ) -> Result<(), ValidationError> {
        if !metadata_conns.iter().any(|c| c.name == self.metadata_conn) {
            return Err(ValidationError::invalid_field(
                format!("{path}.metadata_conn"),
                format!("references undeclared metadata connection '{}'", self.metadata_conn),
            ));
        }
        if !blob_conns.contains_key(&self.blob_conn) {
            return Err(ValidationError::invalid_field(
                format!("{path}.blob_conn"),
                format!("references undeclared blob connection '{}'", self.blob_conn),
            ));
        }
        if self.resolved_db_name.is_empty() {
            return Err(ValidationError::required_field(format!("{path}.resolved_db_name")));
        }
        Ok(())
    }
}

/// Out-of-scope local-filesystem blob adapter shape, retained so `Config`
/// stays a complete mirror of the source options.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LocalStorageConfig {
    pub base_path: Option<String>,
    pub enabled: bool,
}

/// Hash algorithm and key-choice routing knobs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoutingConfig {
    pub hash_algo: HashAlgo,
    pub choose_key: ChooseKey,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            hash_algo: HashAlgo::Rendezvous,
            choose_key: ChooseKey::CollectionObjectId,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum HashAlgo {
    #[default]
    Rendezvous,
    JumpConsistent,
}

/// Selects which key-DSL field (`spec.md` §4.1) feeds the hash.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChooseKey {
    TenantId,
    DbName,
    #[default]
    CollectionObjectId,
}

/// Retention windows for version rows and counter rows. Enforcement is an
/// out-of-scope external collaborator; this crate only carries the config.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetentionConfig {
    pub ver_days: Option<u32>,
    pub counters_days: Option<u32>,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            ver_days: None,
            counters_days: None,
        }
    }
}

/// Collection backup/rollup manifest scheduling.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RollupConfig {
    pub enabled: bool,
    pub manifest_period: ManifestPeriod,
}

impl Default for RollupConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            manifest_period: ManifestPeriod::Monthly,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ManifestPeriod {
    Daily,
    #[default]
    Monthly,
}

/// Per-collection indexed-property and externalization map, per `spec.md`
/// §4.4.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CollectionMap {
    /// Dot paths to extract into `metaIndexed`; `foo[]` means "the whole
    /// array". Empty means "index every top-level property except `_system`".
    pub indexed_props: Vec<String>,
    /// Base64 properties to externalize, keyed by property name.
    pub base64_props: Option<HashMap<String, Base64PropConfig>>,
    /// Required-indexed-field validation.
    pub validation: Option<CollectionValidation>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Base64PropConfig {
    pub content_type: String,
    pub preferred_text: Option<bool>,
    pub text_charset: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CollectionValidation {
    pub required_indexed: Vec<String>,
}

/// Conditional counter rule set, per `spec.md` §4.8.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CounterRulesConfig {
    pub rules: Vec<CounterRule>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CounterRule {
    pub name: String,
    pub on: Vec<CounterOp>,
    pub scope: PredicateScope,
    pub when: HashMap<String, serde_json::Value>,
    pub count_unique: Option<Vec<String>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CounterOp {
    Create,
    Update,
    Delete,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PredicateScope {
    Meta,
    Payload,
}

/// Dev-shadow inline-snapshot settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DevShadowConfig {
    pub enabled: bool,
    pub ttl_hours: u32,
    pub max_bytes_per_doc: usize,
}

impl Default for DevShadowConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl_hours: 24,
            max_bytes_per_doc: 100 * 1024,
        }
    }
}

/// Durable fallback queue settings, per `spec.md` §4.9.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FallbackConfig {
    pub enabled: bool,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub dead_letter_collection: String,
    /// How often the worker polls for due ops.
    pub poll_interval_ms: u64,
    /// How many due ops the worker dequeues per poll.
    pub batch_size: usize,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 8,
            base_delay_ms: 500,
            max_delay_ms: 60_000,
            dead_letter_collection: "chronos_dead_letter".to_string(),
            poll_interval_ms: 1_000,
            batch_size: 20,
        }
    }
}

/// Blob-write batching and counter-debounce settings, per `spec.md` §4.10.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WriteOptimizationConfig {
    pub batch_s3: bool,
    pub batch_window_ms: u64,
    pub debounce_counters_ms: u64,
    pub allow_shadow_skip: bool,
}

impl Default for WriteOptimizationConfig {
    fn default() -> Self {
        Self {
            batch_s3: false,
            batch_window_ms: 50,
            debounce_counters_ms: 200,
            allow_shadow_skip: true,
        }
    }
}

/// Metadata-store transaction capability flags, per `spec.md` §4.6.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransactionsConfig {
    pub enabled: bool,
    pub auto_detect: bool,
}

impl Default for TransactionsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_detect: true,
        }
    }
}

/// Dynamic (templated) tenant resolution settings, per `spec.md` §4.3.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DynamicTenantsConfig {
    pub enabled: bool,
    pub auto_create: bool,
    pub cache_expiry_secs: u64,
    pub max_cache_size: usize,
    pub tiers: HashMap<String, TenantTierSpec>,
    pub validation: Option<TenantIdValidation>,
}

/// A tenant tier's templates, per `spec.md` §4.3 "Template engine".
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TenantTierSpec {
    pub db_name_template: String,
    pub analytics_db_name_template: Option<String>,
    pub records_bucket_template: Option<String>,
    pub versions_bucket_template: Option<String>,
    pub content_bucket_template: Option<String>,
    pub backups_bucket_template: Option<String>,
    /// Legacy single-bucket template alias.
    pub bucket_template: Option<String>,
}

/// Tenant id validation rules.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TenantIdValidation {
    pub pattern: Option<String>,
    pub min_length: Option<usize>,
    pub max_length: Option<usize>,
    pub allowed_chars: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> Config {
        let mut blob_conns = HashMap::new();
        blob_conns.insert(
            "default".to_string(),
            BlobConn {
                name: "default".to_string(),
                buckets: BucketSet {
                    records: String::new(),
                    versions: String::new(),
                    content: String::new(),
                    backups: String::new(),
                    bucket: Some("chronos-bucket".to_string()),
                },
            },
        );

        Config {
            metadata_conns: vec![MetadataConn::default()],
            blob_conns,
            databases: DatabasesConfig {
                metadata: DatabaseTypeConfig {
                    generic: Some(TierAssignment {
                        metadata_conn: "default".to_string(),
                        blob_conn: "default".to_string(),
                        resolved_db_name: "chronos_metadata".to_string(),
                        analytics_db_name: None,
                    }),
                    ..Default::default()
                },
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.metadata_conns.is_empty());
        assert!(config.fallback.enabled);
        assert_eq!(config.fallback.max_attempts, 8);
    }

    #[test]
    fn test_validate_success() {
        let config = sample_config();
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_requires_metadata_conns() {
        let err = Config::default().validate().unwrap_err();
        assert!(matches!(err, ValidationError::InvalidField { field, .. } if field == "metadata_conns"));
    }

    #[test]
    fn test_validate_requires_blob_conns() {
        let mut config = sample_config();
        config.blob_conns.clear();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ValidationError::InvalidField { field, .. } if field == "blob_conns"));
    }

    #[test]
    fn test_validate_rejects_dangling_metadata_conn_reference() {
        let mut config = sample_config();
        config
            .databases
            .metadata
            .generic
            .as_mut()
            .unwrap()
            .metadata_conn = "missing".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_fallback_requires_max_attempts() {
        let mut config = sample_config();
        config.fallback.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bucket_set_legacy_alias_resolves_all_four() {
        let set = BucketSet {
            records: String::new(),
            versions: String::new(),
            content: String::new(),
            backups: String::new(),
            bucket: Some("shared".to_string()),
        };
        let resolved = set.resolve();
        assert_eq!(resolved.records, "shared");
        assert_eq!(resolved.versions, "shared");
        assert_eq!(resolved.content, "shared");
        assert_eq!(resolved.backups, "shared");
    }

    #[test]
    fn test_bucket_set_explicit_fields_override_legacy() {
        let set = BucketSet {
            records: "records-bucket".to_string(),
            versions: String::new(),
            content: String::new(),
            backups: String::new(),
            bucket: Some("shared".to_string()),
        };
        let resolved = set.resolve();
        assert_eq!(resolved.records, "records-bucket");
        assert_eq!(resolved.versions, "shared");
    }

    #[test]
    fn test_counter_rule_serialization() {
        let rule = CounterRule {
            name: "active".to_string(),
            on: vec![CounterOp::Create, CounterOp::Update],
            scope: PredicateScope::Meta,
            when: HashMap::from([("status".to_string(), serde_json::json!("active"))]),
            count_unique: None,
        };
        let bytes = bincode::serialize(&rule).unwrap();
        let restored: CounterRule = bincode::deserialize(&bytes).unwrap();
        assert_eq!(restored.name, "active");
        assert_eq!(restored.on.len(), 2);
    }
}
