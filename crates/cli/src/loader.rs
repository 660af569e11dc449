//! Declaration loading: multi-document YAML plus variable resolution.
//!
//! A document whose only top-level key is `variables` declares variables with
//! defaults; every other document is a resource (apiVersion, kind,
//! metadata.name required). `${var.name}` expressions are substituted before
//! graph construction; cross-resource `${kind/.../name:path}` references pass
//! through untouched for the graph builder.

use anyhow::{anyhow, bail, Context, Result};
use konverge_core::{Resource, ResourceId};
use regex::Regex;
use serde_json::Value as Json;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;

fn var_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{var\.([A-Za-z0-9_-]+)\}").expect("var regex"))
}

#[derive(Debug, Default)]
pub struct LoadOptions {
    /// Namespace applied to resource docs that carry none.
    pub default_namespace: Option<String>,
    /// `NAME=VALUE` overrides from the command line.
    pub overrides: Vec<String>,
}

pub fn load_file(path: &Path, opts: &LoadOptions) -> Result<Vec<Resource>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading declarations from {}", path.display()))?;
    load_str(&text, opts)
}

pub fn load_str(text: &str, opts: &LoadOptions) -> Result<Vec<Resource>> {
    let mut docs: Vec<Json> = Vec::new();
    for doc in serde_yaml::Deserializer::from_str(text) {
        let val: serde_yaml::Value =
            serde::Deserialize::deserialize(doc).context("parsing YAML document")?;
        if matches!(val, serde_yaml::Value::Null) {
            continue;
        }
        docs.push(serde_json::to_value(val).context("converting YAML to JSON")?);
    }

    let mut vars: BTreeMap<String, Json> = BTreeMap::new();
    let mut resources: Vec<Json> = Vec::new();
    for doc in docs {
        match doc.get("variables") {
            Some(decl) if doc.as_object().map(|o| o.len()) == Some(1) => {
                collect_variables(decl, &mut vars)?;
            }
            _ => resources.push(doc),
        }
    }
    apply_overrides(&mut vars, &opts.overrides)?;

    resources
        .into_iter()
        .map(|doc| {
            let doc = substitute_vars(&doc, &vars)?;
            to_resource(doc, opts.default_namespace.as_deref())
        })
        .collect()
}

/// `variables: {replicas: 2, image: {default: nginx}}` — either a bare
/// default or a `{default: ...}` mapping.
fn collect_variables(decl: &Json, out: &mut BTreeMap<String, Json>) -> Result<()> {
    let map = decl
        .as_object()
        .ok_or_else(|| anyhow!("`variables` must be a mapping"))?;
    for (name, v) in map {
        let default = match v.get("default") {
            Some(d) => d.clone(),
            None if v.is_object() => bail!("variable {name} has no default"),
            None => v.clone(),
        };
        out.insert(name.clone(), default);
    }
    Ok(())
}

fn apply_overrides(vars: &mut BTreeMap<String, Json>, overrides: &[String]) -> Result<()> {
    for kv in overrides {
        let (name, value) = kv
            .split_once('=')
            .ok_or_else(|| anyhow!("--var expects NAME=VALUE, got `{kv}`"))?;
        // Overrides parse as YAML scalars so numbers and bools keep their type.
        let parsed: serde_yaml::Value = serde_yaml::from_str(value)?;
        vars.insert(name.to_string(), serde_json::to_value(parsed)?);
    }
    Ok(())
}

fn substitute_vars(v: &Json, vars: &BTreeMap<String, Json>) -> Result<Json> {
    Ok(match v {
        Json::Object(map) => Json::Object(
            map.iter()
                .map(|(k, vv)| Ok((k.clone(), substitute_vars(vv, vars)?)))
                .collect::<Result<_>>()?,
        ),
        Json::Array(arr) => {
            Json::Array(arr.iter().map(|vv| substitute_vars(vv, vars)).collect::<Result<_>>()?)
        }
        Json::String(s) => {
            // A string that is exactly one variable keeps the value's type.
            if let Some(cap) = var_re().captures(s) {
                if cap[0].len() == s.len() {
                    return lookup(vars, &cap[1]).cloned();
                }
            }
            let mut err = None;
            let replaced = var_re().replace_all(s, |cap: &regex::Captures<'_>| {
                match lookup(vars, &cap[1]) {
                    Ok(Json::String(s)) => s.clone(),
                    Ok(other) => other.to_string(),
                    Err(e) => {
                        err.get_or_insert(e);
                        String::new()
                    }
                }
            });
            if let Some(e) = err {
                return Err(e);
            }
            Json::String(replaced.into_owned())
        }
        other => other.clone(),
    })
}

fn lookup<'a>(vars: &'a BTreeMap<String, Json>, name: &str) -> Result<&'a Json> {
    vars.get(name).ok_or_else(|| anyhow!("undefined variable `{name}`"))
}

fn to_resource(doc: Json, default_ns: Option<&str>) -> Result<Resource> {
    let api_version = doc
        .get("apiVersion")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow!("document missing apiVersion"))?;
    let kind = doc
        .get("kind")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow!("document missing kind"))?;
    let name = doc
        .pointer("/metadata/name")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow!("document missing metadata.name"))?;
    let ns = doc
        .pointer("/metadata/namespace")
        .and_then(|v| v.as_str())
        .or(default_ns);
    let id = ResourceId::new(format!("{api_version}/{kind}"), ns, name);
    Ok(Resource { id, payload: doc })
}
