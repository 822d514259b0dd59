//! The multi-backend router (`spec.md` §4.3): resolves a [`RouteContext`]
//! to a concrete metadata+blob pair, owning the tenant resolution cache and
//! the template engine for on-demand tenant creation.

pub mod cache;
pub mod template;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use regex::Regex;

use crate::config::{Config, ResolvedBuckets, TenantIdValidation, TierAssignment};
use crate::error::{ChronosError, Result, RouteError};
use crate::hash::{resolve_key, KeyContext};
use crate::types::Timestamp;

use cache::TenantCache;
use template::{render_template, TemplateContext};

/// The six non-tenant-tiered database types, per `spec.md` §4.3.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DatabaseType {
    Metadata,
    Knowledge,
    Runtime,
    Logs,
    Messaging,
    Identities,
}

/// Tiers within a tiered `databaseType`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Tier {
    Generic,
    Domain,
    Tenant,
}

/// Input to [`Router::route`].
#[derive(Clone, Debug, Default)]
pub struct RouteContext {
    pub db_name: Option<String>,
    pub collection: String,
    pub object_id: Option<String>,
    /// Admin-override: bypasses tier resolution entirely.
    pub forced_index: Option<String>,
    /// Direct exact-match connection name.
    pub key: Option<String>,
    pub database_type: Option<DatabaseType>,
    pub tier: Option<Tier>,
    pub tenant_id: Option<String>,
    pub domain: Option<String>,
    /// Dynamic-tenant tier spec name (selects among `dynamic_tenants.tiers`).
    pub tenant_tier: Option<String>,
    pub tenant_meta: HashMap<String, String>,
}

/// A fully resolved backend pair for one request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedRoute {
    pub metadata_path: String,
    pub resolved_buckets: ResolvedBuckets,
    pub resolved_db_name: String,
    pub analytics_db_name: Option<String>,
    pub routing_key: String,
}

/// Resolves route contexts against a [`Config`]; owns the tenant resolution
/// cache (`spec.md` §4.3 "Tenant resolution cache").
pub struct Router {
    config: Arc<Config>,
    tenant_cache: Mutex<TenantCache<ResolvedRoute>>,
}

impl Router {
    pub fn new(config: Arc<Config>) -> Self {
        let (max_size, ttl_secs) = if config.dynamic_tenants.enabled {
            (config.dynamic_tenants.max_cache_size, config.dynamic_tenants.cache_expiry_secs)
        } else {
            (10_000, 3_600)
        };
        Self {
            config,
            tenant_cache: Mutex::new(TenantCache::new(max_size, ttl_secs)),
        }
    }

    /// Removes `tenant_id`'s cached resolution, forcing the next `route`
    /// call to re-resolve (including re-validating the tenant id).
    pub fn invalidate_tenant(&self, tenant_id: &str) {
        self.tenant_cache.lock().unwrap().invalidate(tenant_id);
    }

    pub fn route(&self, ctx: &RouteContext) -> Result<ResolvedRoute> {
        if let Some(forced) = &ctx.forced_index {
            return self.resolve_by_connection_name(forced, ctx);
        }
        if let Some(key) = &ctx.key {
            return self.resolve_by_connection_name(key, ctx);
        }

        let database_type = ctx
            .database_type
            .ok_or_else(|| ChronosError::Route(RouteError::NoMatch("no databaseType given".to_string())))?;
        let tier = ctx.tier.unwrap_or(Tier::Generic);

        if let Some(assignment) = self.static_assignment(database_type, tier, ctx)? {
            return self.build_resolved_route(assignment, ctx);
        }

        if tier == Tier::Tenant {
            let tenant_id = ctx
                .tenant_id
                .as_deref()
                .ok_or_else(|| ChronosError::Route(RouteError::NoMatch("tenant tier requires tenantId".to_string())))?;
            return self.resolve_dynamic_tenant(tenant_id, ctx);
        }

        Err(ChronosError::Route(RouteError::NoMatch(format!(
            "no static match for {database_type:?}/{tier:?}"
        ))))
    }

    fn resolve_by_connection_name(&self, name: &str, ctx: &RouteContext) -> Result<ResolvedRoute> {
        let metadata_conn = self
            .config
            .metadata_conns
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| ChronosError::Route(RouteError::NoMatch(format!("no metadata connection named '{name}'"))))?;
        let blob_conn = self
            .config
            .blob_conns
            .get(name)
            .ok_or_else(|| ChronosError::Route(RouteError::NoMatch(format!("no blob connection named '{name}'"))))?;

        let resolved_db_name = ctx.db_name.clone().unwrap_or_else(|| name.to_string());
        let routing_key = self.compute_routing_key(&resolved_db_name, ctx);
        Ok(ResolvedRoute {
            metadata_path: metadata_conn.path.clone(),
            resolved_buckets: blob_conn.buckets.resolve(),
            resolved_db_name,
            analytics_db_name: None,
            routing_key,
        })
    }

    fn static_assignment<'a>(
        &'a self,
        database_type: DatabaseType,
        tier: Tier,
        ctx: &RouteContext,
    ) -> Result<Option<&'a TierAssignment>> {
        let databases = &self.config.databases;
        let flat = match database_type {
            DatabaseType::Logs => Some(&databases.logs),
            DatabaseType::Messaging => Some(&databases.messaging),
            DatabaseType::Identities => Some(&databases.identities),
            _ => None,
        };
        if let Some(flat) = flat {
            return Ok(flat.assignment.as_ref());
        }

        let tiered = match database_type {
            DatabaseType::Metadata => &databases.metadata,
            DatabaseType::Knowledge => &databases.knowledge,
            DatabaseType::Runtime => &databases.runtime,
            _ => unreachable!("flat types handled above"),
        };

        Ok(match tier {
            Tier::Generic => tiered.generic.as_ref(),
            Tier::Domain => ctx.domain.as_ref().and_then(|d| tiered.domain.get(d)),
            Tier::Tenant => ctx.tenant_id.as_ref().and_then(|t| tiered.tenant.get(t)),
        })
    }

    fn build_resolved_route(&self, assignment: &TierAssignment, ctx: &RouteContext) -> Result<ResolvedRoute> {
        let metadata_conn = self
            .config
            .metadata_conns
            .iter()
            .find(|c| c.name == assignment.metadata_conn)
            .ok_or_else(|| {
                ChronosError::Route(RouteError::NoMatch(format!(
                    "metadata connection '{}' not found",
                    assignment.metadata_conn
                )))
            })?;
        let blob_conn = self.config.blob_conns.get(&assignment.blob_conn).ok_or_else(|| {
            ChronosError::Route(RouteError::NoMatch(format!(
                "blob connection '{}' not found",
                assignment.blob_conn
            )))
        })?;
        let routing_key = self.compute_routing_key(&assignment.resolved_db_name, ctx);
        Ok(ResolvedRoute {
            metadata_path: metadata_conn.path.clone(),
            resolved_buckets: blob_conn.buckets.resolve(),
            resolved_db_name: assignment.resolved_db_name.clone(),
            analytics_db_name: assignment.analytics_db_name.clone(),
            routing_key,
        })
    }

    fn resolve_dynamic_tenant(&self, tenant_id: &str, ctx: &RouteContext) -> Result<ResolvedRoute> {
        if !self.config.dynamic_tenants.enabled {
            return Err(ChronosError::Route(RouteError::DynamicTenantsDisabled(tenant_id.to_string())));
        }

        let now = Timestamp::now();
        if let Some(cached) = self.tenant_cache.lock().unwrap().get(tenant_id, now) {
            return Ok(cached);
        }

        if let Some(validation) = &self.config.dynamic_tenants.validation {
            validate_tenant_id(tenant_id, validation)?;
        }

        let tier_name = ctx.tenant_tier.as_deref().unwrap_or("default");
        let spec = self
            .config
            .dynamic_tenants
            .tiers
            .get(tier_name)
            .ok_or_else(|| ChronosError::Route(RouteError::NoMatch(format!("no tenant tier spec named '{tier_name}'"))))?;

        let tctx = TemplateContext {
            tenant_id,
            tier: tier_name,
            env: None,
            region: None,
            meta: &ctx.tenant_meta,
            now,
        };

        let resolved_db_name = render_template(&spec.db_name_template, &tctx, tenant_id)?;
        let analytics_db_name = spec
            .analytics_db_name_template
            .as_deref()
            .map(|t| render_template(t, &tctx, tenant_id))
            .transpose()?;

        let legacy_bucket = spec
            .bucket_template
            .as_deref()
            .map(|t| render_template(t, &tctx, tenant_id))
            .transpose()?
            .unwrap_or_default();
        let records = render_optional_bucket(&spec.records_bucket_template, &tctx, tenant_id, &legacy_bucket)?;
        let versions = render_optional_bucket(&spec.versions_bucket_template, &tctx, tenant_id, &legacy_bucket)?;
        let content = render_optional_bucket(&spec.content_bucket_template, &tctx, tenant_id, &legacy_bucket)?;
        let backups = render_optional_bucket(&spec.backups_bucket_template, &tctx, tenant_id, &legacy_bucket)?;

        // Dynamic tenants share the first declared metadata/blob connection;
        // only the database/bucket names vary per tenant.
        let metadata_conn = self
            .config
            .metadata_conns
            .first()
            .ok_or_else(|| ChronosError::Route(RouteError::NoMatch("no metadata connections configured".to_string())))?;

        let routing_key = self.compute_routing_key(&resolved_db_name, ctx);
        let resolved = ResolvedRoute {
            metadata_path: metadata_conn.path.clone(),
            resolved_buckets: ResolvedBuckets {
                records,
                versions,
                content,
                backups,
            },
            resolved_db_name,
            analytics_db_name,
            routing_key,
        };

        self.tenant_cache.lock().unwrap().put(tenant_id.to_string(), resolved.clone(), now);
        Ok(resolved)
    }

    fn compute_routing_key(&self, resolved_db_name: &str, ctx: &RouteContext) -> String {
        use crate::config::ChooseKey;
        let spec = match self.config.routing.choose_key {
            ChooseKey::TenantId => "tenantId|collection:objectId",
            ChooseKey::DbName => "dbName|collection:objectId",
            ChooseKey::CollectionObjectId => "collection:objectId",
        };
        resolve_key(
            spec,
            &KeyContext {
                tenant_id: ctx.tenant_id.as_deref(),
                db_name: Some(resolved_db_name),
                collection: Some(&ctx.collection),
                object_id: ctx.object_id.as_deref(),
                ctx: ctx.tenant_meta.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect(),
            },
        )
    }
}

fn render_optional_bucket(
    template: &Option<String>,
    ctx: &TemplateContext<'_>,
    tenant_id: &str,
    legacy: &str,
) -> Result<String> {
    match template {
        Some(t) => render_template(t, ctx, tenant_id),
        None => Ok(legacy.to_string()),
    }
}

fn validate_tenant_id(tenant_id: &str, validation: &TenantIdValidation) -> Result<()> {
    if let Some(min) = validation.min_length {
        if tenant_id.len() < min {
            return Err(ChronosError::Route(RouteError::InvalidTenantId(
                tenant_id.to_string(),
                format!("shorter than minimum length {min}"),
            )));
        }
    }
    if let Some(max) = validation.max_length {
        if tenant_id.len() > max {
            return Err(ChronosError::Route(RouteError::InvalidTenantId(
                tenant_id.to_string(),
                format!("longer than maximum length {max}"),
            )));
        }
    }
    if let Some(allowed) = &validation.allowed_chars {
        if !tenant_id.chars().all(|c| allowed.contains(c)) {
            return Err(ChronosError::Route(RouteError::InvalidTenantId(
                tenant_id.to_string(),
                "contains a character outside allowed_chars".to_string(),
            )));
        }
    }
    if let Some(pattern) = &validation.pattern {
        let re = Regex::new(pattern)
            .map_err(|e| ChronosError::Route(RouteError::InvalidTenantId(tenant_id.to_string(), e.to_string())))?;
        if !re.is_match(tenant_id) {
            return Err(ChronosError::Route(RouteError::InvalidTenantId(
                tenant_id.to_string(),
                format!("does not match pattern '{pattern}'"),
            )));
        }
    }
    Ok(())
}
