//! Template engine for dynamic tenant resolution (`spec.md` §4.3).
//!
//! Placeholders: `{tenantId}`, `{tier}`, `{timestamp}` (`YYYYMMDD` UTC),
//! `{env}`, `{region}`, and arbitrary `{meta.<key>}` lookups. An undefined
//! placeholder is a fatal resolution error, never a silent empty string.

use std::collections::HashMap;

use crate::error::{ChronosError, Result, RouteError};
use crate::types::Timestamp;

/// Values a tenant template may reference.
#[derive(Clone, Debug, Default)]
pub struct TemplateContext<'a> {
    pub tenant_id: &'a str,
    pub tier: &'a str,
    pub env: Option<&'a str>,
    pub region: Option<&'a str>,
    pub meta: &'a HashMap<String, String>,
    /// Instant used to render `{timestamp}`; passed in rather than read
    /// from the clock so resolution stays deterministic for callers that
    /// need it (e.g. tests).
    pub now: Timestamp,
}

/// Renders `template`, substituting every `{placeholder}` it contains.
/// Fails with `RouteError::UndefinedPlaceholder` on the first placeholder
/// that cannot be resolved.
pub fn render_template(template: &str, ctx: &TemplateContext<'_>, tenant_id_for_error: &str) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after_brace = &rest[start + 1..];
        let Some(end) = after_brace.find('}') else {
            out.push_str(&rest[start..]);
            rest = "";
            break;
        };
        let placeholder = &after_brace[..end];
        let value = resolve_placeholder(placeholder, ctx).ok_or_else(|| {
            ChronosError::Route(RouteError::UndefinedPlaceholder(
                placeholder.to_string(),
                tenant_id_for_error.to_string(),
            ))
        })?;
        out.push_str(&value);
        rest = &after_brace[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

fn resolve_placeholder(name: &str, ctx: &TemplateContext<'_>) -> Option<String> {
    match name {
        "tenantId" => Some(ctx.tenant_id.to_string()),
        "tier" => Some(ctx.tier.to_string()),
        "timestamp" => Some(format_yyyymmdd(ctx.now)),
        "env" => ctx.env.map(str::to_string),
        "region" => ctx.region.map(str::to_string),
        other => other
            .strip_prefix("meta.")
            .and_then(|key| ctx.meta.get(key))
            .cloned(),
    }
}

fn format_yyyymmdd(ts: Timestamp) -> String {
    const DAYS_PER_400Y: i64 = 146097;
    let days_since_epoch = ts.as_millis().div_euclid(86_400_000);
    let mut z = days_since_epoch + 719_468;
    let era = z.div_euclid(DAYS_PER_400Y);
    z -= era * DAYS_PER_400Y;
    let doe = z;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let year = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = if month <= 2 { year + 1 } else { year };
    format!("{year:04}{month:02}{day:02}")
}
