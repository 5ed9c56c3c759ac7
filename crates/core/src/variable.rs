//! Environment templating
//!
//! Resolves POSIX-style `$VAR` and `${VAR}` references against an environment
//! mapping. Supported forms:
//!
//! - `$NAME` and `${NAME}`: value of `NAME`, error when missing
//! - `${NAME:-default}`: value of `NAME`, or `default` when missing or empty
//! - `$$`: a literal `$`
//!
//! A `$` that does not start any of these forms is kept as is. References that
//! start with `${` but are not well formed are rejected.

use crate::errors::TemplateError;
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::trace;

/// Ordered environment mapping
pub type EnvMap = IndexMap<String, String>;

static REFERENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$(?:(\$)|\{([^{}]*)\}|([A-Za-z_][A-Za-z0-9_]*))")
        .unwrap_or_else(|e| panic!("invalid reference pattern: {e}"))
});

static NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap_or_else(|e| panic!("invalid name pattern: {e}"))
});

/// Snapshot of the supervisor's own environment
pub fn os_env() -> EnvMap {
    std::env::vars().collect()
}

/// Substitute every reference in `text` using `env` as the lookup source
pub fn resolve(env: &EnvMap, text: &str) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;

    for caps in REFERENCE.captures_iter(text) {
        let whole = caps.get(0).map_or(0..0, |m| m.range());
        check_gap(&text[last..whole.start])?;
        out.push_str(&text[last..whole.start]);
        last = whole.end;

        if caps.get(1).is_some() {
            out.push('$');
        } else if let Some(braced) = caps.get(2) {
            out.push_str(&resolve_braced(env, braced.as_str(), &text[whole.clone()])?);
        } else if let Some(name) = caps.get(3) {
            let value = env
                .get(name.as_str())
                .ok_or_else(|| TemplateError::Unresolved {
                    fragment: text[whole.clone()].to_string(),
                })?;
            out.push_str(value);
        }
    }

    check_gap(&text[last..])?;
    out.push_str(&text[last..]);
    Ok(out)
}

fn check_gap(gap: &str) -> Result<(), TemplateError> {
    match gap.find("${") {
        Some(pos) => Err(TemplateError::Malformed {
            fragment: gap[pos..].to_string(),
        }),
        None => Ok(()),
    }
}

fn resolve_braced(env: &EnvMap, inner: &str, fragment: &str) -> Result<String, TemplateError> {
    let (name, default) = match inner.split_once(":-") {
        Some((name, default)) => (name, Some(default)),
        None => (inner, None),
    };
    if !NAME.is_match(name) {
        return Err(TemplateError::Malformed {
            fragment: fragment.to_string(),
        });
    }
    match (env.get(name), default) {
        (Some(value), Some(default)) if value.is_empty() => Ok(default.to_string()),
        (Some(value), _) => Ok(value.clone()),
        (None, Some(default)) => Ok(default.to_string()),
        (None, None) => Err(TemplateError::Unresolved {
            fragment: fragment.to_string(),
        }),
    }
}

/// Resolve every value of `overrides` against `base`
///
/// Overrides only see `base`, never each other. The result is returned for
/// the caller to merge.
pub fn template_env_set(base: &EnvMap, overrides: &EnvMap) -> Result<EnvMap, TemplateError> {
    overrides
        .iter()
        .map(|(key, value)| {
            let resolved = resolve(base, value)?;
            trace!(key = %key, "Resolved environment value");
            Ok((key.clone(), resolved))
        })
        .collect()
}

/// Resolve every argument against `env`
pub fn template_args(env: &EnvMap, args: &[String]) -> Result<Vec<String>, TemplateError> {
    args.iter().map(|arg| resolve(env, arg)).collect()
}

/// Merge `overlay` into `base`, later keys winning
pub fn merge_env(base: &mut EnvMap, overlay: &EnvMap) {
    for (key, value) in overlay {
        base.insert(key.clone(), value.clone());
    }
}

/// Resolve `overrides` against `base` and return the merged mapping
pub fn override_env(base: &EnvMap, overrides: &EnvMap) -> Result<EnvMap, TemplateError> {
    let resolved = template_env_set(base, overrides)?;
    let mut merged = base.clone();
    merge_env(&mut merged, &resolved);
    Ok(merged)
}
