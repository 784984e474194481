// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! Addon registries (Modrinth / CurseForge style)
//!
//! A package describes each registry with a search URL template and the
//! JSON fields to pick out of the results. Installs are delegated to the
//! node's download-url file operation.

use reqwest::{Method, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::info;

use super::client::NodeClient;
use crate::error::{AxisError, Result};
use crate::ssrf::check_url;

const SEARCH_TIMEOUT: Duration = Duration::from_secs(15);
const MAX_RESULTS: usize = 50;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AddonSource {
    pub name: String,
    /// `{{query}}` is replaced with the url-encoded search text
    pub search_url: String,
    /// Dotted path to the result array; empty when the body is the array
    #[serde(default)]
    pub results_path: String,
    pub id_field: String,
    pub name_field: String,
    pub download_url_field: String,
    /// Directory inside the server root
    pub install_path: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AddonResult {
    pub id: String,
    pub name: String,
    pub download_url: Option<String>,
}

fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .filter(|p| !p.is_empty())
        .try_fold(value, |v, key| match v {
            Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => v.get(key),
        })
}

fn as_text(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl AddonSource {
    pub fn search_url(&self, query: &str) -> Result<Url> {
        check_url(&self.search_url.replace("{{query}}", &urlencoding::encode(query)))
    }

    /// Pick results out of a registry response
    pub fn parse_results(&self, body: &Value) -> Result<Vec<AddonResult>> {
        let items = lookup(body, &self.results_path)
            .and_then(Value::as_array)
            .ok_or_else(|| AxisError::driver(format!("Addon source {} returned no result list", self.name)))?;
        Ok(items.iter()
            .filter_map(|item| {
                let id = lookup(item, &self.id_field).and_then(as_text)?;
                let name = lookup(item, &self.name_field).and_then(as_text).unwrap_or_else(|| id.clone());
                let download_url = lookup(item, &self.download_url_field).and_then(as_text);
                Some(AddonResult { id, name, download_url })
            })
            .take(MAX_RESULTS)
            .collect())
    }
}

pub fn find_source<'a>(sources: &'a [AddonSource], name: &str) -> Result<&'a AddonSource> {
    sources.iter()
        .find(|s| s.name.eq_ignore_ascii_case(name))
        .ok_or_else(|| AxisError::not_found(format!("Unknown addon source: {}", name)))
}

pub async fn search(source: &AddonSource, query: &str) -> Result<Vec<AddonResult>> {
    let url = source.search_url(query)?;
    let client = reqwest::Client::builder()
        .timeout(SEARCH_TIMEOUT)
        .user_agent(concat!("axis/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| AxisError::internal(format!("HTTP client error: {}", e)))?;
    let resp = client.get(url).send().await
        .map_err(|e| AxisError::driver(format!("Addon search failed: {}", e)))?;
    if !resp.status().is_success() {
        return Err(AxisError::driver(format!("Addon source {} returned HTTP {}", source.name, resp.status())));
    }
    let body: Value = resp.json().await
        .map_err(|e| AxisError::driver(format!("Addon source returned invalid JSON: {}", e)))?;
    source.parse_results(&body)
}

/// Have the server's node fetch `url` into the source's install path
pub async fn install(client: &NodeClient, server_id: &str, source: &AddonSource, url: &str, filename: Option<&str>) -> Result<()> {
    check_url(url)?;
    let body = serde_json::json!({
        "url": url,
        "path": source.install_path,
        "filename": filename,
    });
    client.proxy(server_id, Method::POST, "/files/download-url", Some(&body)).await?.into_result()?;
    info!("Addon from {} installed into {} on {}", source.name, source.install_path, server_id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn modrinth() -> AddonSource {
        AddonSource {
            name: "Modrinth".into(),
            search_url: "https://api.modrinth.com/v2/search?query={{query}}".into(),
            results_path: "hits".into(),
            id_field: "project_id".into(),
            name_field: "title".into(),
            download_url_field: "files.0.url".into(),
            install_path: "/mods".into(),
        }
    }

    #[test]
    fn query_is_encoded_and_guarded() {
        let url = modrinth().search_url("fabric api").unwrap();
        assert_eq!(url.as_str(), "https://api.modrinth.com/v2/search?query=fabric%20api");

        let mut local = modrinth();
        local.search_url = "http://127.0.0.1/search?q={{query}}".into();
        assert!(local.search_url("x").is_err());
    }

    #[test]
    fn results_follow_field_paths() {
        let body = json!({
            "hits": [
                {"project_id": "P7dR8mSH", "title": "Fabric API", "files": [{"url": "https://cdn.example.com/fabric.jar"}]},
                {"project_id": 42, "title": "Numbered"},
                {"title": "no id"}
            ]
        });
        let results = modrinth().parse_results(&body).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].download_url.as_deref(), Some("https://cdn.example.com/fabric.jar"));
        assert_eq!(results[1].id, "42");
        assert_eq!(results[1].download_url, None);
    }

    #[test]
    fn root_array_and_missing_list() {
        let mut src = modrinth();
        src.results_path.clear();
        assert_eq!(src.parse_results(&json!([{"project_id": "a", "title": "A"}])).unwrap().len(), 1);
        assert!(modrinth().parse_results(&json!({"data": []})).is_err());
    }

    #[test]
    fn sources_match_case_insensitively() {
        let sources = vec![modrinth()];
        assert!(find_source(&sources, "modrinth").is_ok());
        assert!(matches!(find_source(&sources, "curseforge"), Err(AxisError::NotFound(_))));
    }
}
