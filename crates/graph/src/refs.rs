//! Reference expressions embedded in resource payloads.
//!
//! A reference is a string of the form `${<target>:<output>}` where
//! `<target>` is a slash-separated resource identity (`v1/Namespace/main`,
//! `apps/v1/Deployment/main/api`) and `<output>` is a dotted path into the
//! producer's observed payload (`metadata.uid`). The kind prefix of the
//! target is the shortest 2- or 3-segment prefix whose last segment starts
//! with an uppercase letter; kind names are capitalized, API groups and
//! versions are not.

use konverge_core::{BuildError, ResourceId};
use regex::Regex;
use serde_json::Value as Json;
use std::sync::OnceLock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefExpr {
    pub target: ResourceId,
    pub output: String,
}

fn re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{([^}:]+):([^}]+)\}").expect("ref regex"))
}

/// Parse the inside of a `${...}` expression.
pub fn parse(target: &str, output: &str) -> Option<RefExpr> {
    let segs: Vec<&str> = target.split('/').collect();
    let kind_len = if segs.len() >= 2 && starts_upper(segs[1]) {
        2
    } else if segs.len() >= 3 && starts_upper(segs[2]) {
        3
    } else {
        return None;
    };
    let rest = &segs[kind_len..];
    let kind = segs[..kind_len].join("/");
    let id = match rest {
        [name] => ResourceId::new(kind, None, *name),
        [ns, name] => ResourceId::new(kind, Some(ns), *name),
        _ => return None,
    };
    if output.is_empty() {
        return None;
    }
    Some(RefExpr { target: id, output: output.to_string() })
}

fn starts_upper(s: &str) -> bool {
    s.chars().next().map(|c| c.is_ascii_uppercase()).unwrap_or(false)
}

/// Walk a payload and collect `(attr_path, RefExpr)` for every embedded
/// reference expression. Malformed expressions fail the build rather than
/// passing through as literal strings.
pub fn extract(owner: &ResourceId, payload: &Json) -> Result<Vec<(String, RefExpr)>, BuildError> {
    let mut out = Vec::new();
    walk(owner, payload, String::new(), &mut out)?;
    Ok(out)
}

fn walk(
    owner: &ResourceId,
    v: &Json,
    path: String,
    out: &mut Vec<(String, RefExpr)>,
) -> Result<(), BuildError> {
    match v {
        Json::Object(map) => {
            for (k, vv) in map {
                let p = if path.is_empty() { k.clone() } else { format!("{path}.{k}") };
                walk(owner, vv, p, out)?;
            }
        }
        Json::Array(arr) => {
            for (i, vv) in arr.iter().enumerate() {
                walk(owner, vv, format!("{path}[{i}]"), out)?;
            }
        }
        Json::String(s) => {
            for cap in re().captures_iter(s) {
                let expr = parse(&cap[1], &cap[2]).ok_or_else(|| BuildError::MalformedReference {
                    id: owner.clone(),
                    expr: cap[0].to_string(),
                })?;
                out.push((path.clone(), expr));
            }
        }
        _ => {}
    }
    Ok(())
}

/// Replace reference expressions using `lookup`. A string that is exactly one
/// expression takes the looked-up value with its JSON type intact; an
/// expression embedded in a longer string is rendered inline. Expressions the
/// lookup cannot satisfy are left in place for a later phase.
pub fn substitute(v: &Json, lookup: &dyn Fn(&RefExpr) -> Option<Json>) -> Json {
    match v {
        Json::Object(map) => Json::Object(
            map.iter().map(|(k, vv)| (k.clone(), substitute(vv, lookup))).collect(),
        ),
        Json::Array(arr) => Json::Array(arr.iter().map(|vv| substitute(vv, lookup)).collect()),
        Json::String(s) => {
            // Whole-string expression keeps the value's JSON type.
            if let Some(cap) = re().captures(s) {
                if cap[0].len() == s.len() {
                    if let Some(expr) = parse(&cap[1], &cap[2]) {
                        if let Some(val) = lookup(&expr) {
                            return val;
                        }
                    }
                    return v.clone();
                }
            }
            let replaced = re().replace_all(s, |cap: &regex::Captures<'_>| {
                match parse(&cap[1], &cap[2]).and_then(|e| lookup(&e)) {
                    Some(Json::String(s)) => s,
                    Some(other) => other.to_string(),
                    None => cap[0].to_string(),
                }
            });
            Json::String(replaced.into_owned())
        }
        _ => v.clone(),
    }
}

/// True when the payload still contains at least one reference expression.
pub fn has_pending(v: &Json) -> bool {
    match v {
        Json::Object(map) => map.values().any(has_pending),
        Json::Array(arr) => arr.iter().any(has_pending),
        Json::String(s) => re().is_match(s),
        _ => false,
    }
}

/// Read a dotted path (with `[i]` array indices) out of a JSON value.
pub fn resolve_path<'a>(v: &'a Json, path: &str) -> Option<&'a Json> {
    let mut cur = v;
    for seg in path.split('.') {
        let (field, indices) = split_indices(seg)?;
        if !field.is_empty() {
            cur = cur.get(field)?;
        }
        for idx in indices {
            cur = cur.get(idx)?;
        }
    }
    Some(cur)
}

fn split_indices(seg: &str) -> Option<(&str, Vec<usize>)> {
    match seg.find('[') {
        None => Some((seg, Vec::new())),
        Some(pos) => {
            let field = &seg[..pos];
            let mut rest = &seg[pos..];
            let mut out = Vec::new();
            while let Some(stripped) = rest.strip_prefix('[') {
                let end = stripped.find(']')?;
                out.push(stripped[..end].parse().ok()?);
                rest = &stripped[end + 1..];
            }
            if rest.is_empty() {
                Some((field, out))
            } else {
                None
            }
        }
    }
}
