//! Environment resolution.
//!
//! The effective environment of a build is the plan's `ENV` defaults with
//! caller overrides applied on top. Overrides win and may introduce names the
//! plan never declared.

use std::collections::BTreeMap;

use noby_common::{NobyError, NobyResult};

use crate::nobyfile::{BuildPlan, is_valid_env_name};

/// Resolved environment: name to value, iterated in name order.
pub type EnvSet = BTreeMap<String, String>;

/// Merge plan defaults with caller overrides.
#[must_use]
pub fn resolve(plan: &BuildPlan, overrides: &EnvSet) -> EnvSet {
    let mut env: EnvSet = plan
        .env()
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect();

    for (name, value) in overrides {
        if let Some(default) = env.insert(name.clone(), value.clone()) {
            tracing::debug!(name, default, value, "Environment override applied");
        }
    }

    env
}

/// Parse a `NAME=value` override, as given to `-e`.
///
/// A bare `NAME` takes its value from the calling process environment.
pub fn parse_override(arg: &str) -> NobyResult<(String, String)> {
    let (name, value) = match arg.split_once('=') {
        Some((name, value)) => (name, value.to_string()),
        None => {
            let value = std::env::var(arg).map_err(|_| NobyError::Config {
                message: format!("Environment variable '{arg}' is not set; use NAME=value"),
            })?;
            (arg, value)
        }
    };

    if !is_valid_env_name(name) {
        return Err(NobyError::Config {
            message: format!("Invalid environment variable name '{name}'"),
        });
    }

    Ok((name.to_string(), value))
}

/// Parse every `-e` argument into an override set. Later entries win.
pub fn parse_overrides<I, S>(args: I) -> NobyResult<EnvSet>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    args.into_iter()
        .map(|arg| parse_override(arg.as_ref()))
        .collect()
}
