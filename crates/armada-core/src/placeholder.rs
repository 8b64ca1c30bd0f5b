//! `((name))` placeholder scanning and interpolation.
//!
//! A string that is exactly one placeholder is replaced by the resolved
//! value with its JSON type preserved; placeholders embedded in a larger
//! string are substituted textually and must resolve to scalars.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::error::{CoreError, CoreResult};

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\(\(\s*([!/A-Za-z0-9_.\-]+)\s*\)\)").expect("placeholder regex is valid")
});

/// Every placeholder name referenced anywhere in `value`.
pub fn scan(value: &Value) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    collect(value, &mut names);
    names
}

fn collect(value: &Value, names: &mut BTreeSet<String>) {
    match value {
        Value::String(s) => {
            for cap in PLACEHOLDER.captures_iter(s) {
                names.insert(strip_bang(&cap[1]).to_string());
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect(v, names)),
        Value::Object(map) => map.values().for_each(|v| collect(v, names)),
        _ => {}
    }
}

/// `((!name))` opts out of the director prefix in some tooling; the bang
/// carries no meaning here.
fn strip_bang(name: &str) -> &str {
    name.strip_prefix('!').unwrap_or(name)
}

/// Replace every placeholder using `values` (keyed by placeholder name).
pub fn interpolate(value: &Value, values: &BTreeMap<String, Value>) -> CoreResult<Value> {
    Ok(match value {
        Value::String(s) => interpolate_str(s, values)?,
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| interpolate(v, values))
                .collect::<CoreResult<_>>()?,
        ),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), interpolate(v, values)?);
            }
            Value::Object(out)
        }
        other => other.clone(),
    })
}

fn interpolate_str(s: &str, values: &BTreeMap<String, Value>) -> CoreResult<Value> {
    let lookup = |name: &str| {
        values
            .get(strip_bang(name))
            .ok_or_else(|| CoreError::Manifest(format!("unresolved placeholder '(({name}))'")))
    };

    if let Some(cap) = PLACEHOLDER.captures(s)
        && cap.get(0).is_some_and(|m| m.start() == 0 && m.end() == s.len())
    {
        return lookup(&cap[1]).cloned();
    }

    let mut out = String::with_capacity(s.len());
    let mut last = 0;
    for cap in PLACEHOLDER.captures_iter(s) {
        let Some(m) = cap.get(0) else { continue };
        out.push_str(&s[last..m.start()]);
        match lookup(&cap[1])? {
            Value::String(v) => out.push_str(v),
            Value::Number(n) => out.push_str(&n.to_string()),
            Value::Bool(b) => out.push_str(&b.to_string()),
            _ => {
                return Err(CoreError::Manifest(format!(
                    "placeholder '(({}))' inside '{s}' must resolve to a scalar",
                    &cap[1]
                )));
            }
        }
        last = m.end();
    }
    out.push_str(&s[last..]);
    Ok(Value::String(out))
}
