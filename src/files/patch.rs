// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! Template interpolation and config-file patches applied before container creation

use std::collections::BTreeMap;
use std::fs;
use tracing::{debug, info};

use super::ServerFiles;
use crate::error::Result;
use crate::protocol::{ConfigFilePatch, ConfigParser};

/// Replace every `{{key}}` with its variable value; unknown placeholders stay
pub fn interpolate(template: &str, vars: &BTreeMap<String, String>) -> String {
    let mut out = template.to_string();
    for (k, v) in vars {
        out = out.replace(&format!("{{{{{}}}}}", k), v);
    }
    out
}

/// Apply every patch whose file exists; missing files are skipped
pub fn apply_config_patches(files: &ServerFiles, patches: &[ConfigFilePatch], vars: &BTreeMap<String, String>) -> Result<usize> {
    let mut applied = 0;
    for patch in patches {
        let path = files.path_followed(&patch.file)?;
        let Ok(original) = fs::read_to_string(&path) else {
            debug!("Config patch target {} missing, skipped", patch.file);
            continue;
        };
        let replace: BTreeMap<String, String> = patch.replace.iter()
            .map(|(k, v)| (k.clone(), interpolate(v, vars)))
            .collect();
        let patched = match patch.parser {
            ConfigParser::Properties => patch_properties(&original, &replace),
            ConfigParser::Json => patch_json(&original, &replace)?,
        };
        if patched != original {
            fs::write(&path, patched)?;
            info!("Patched {} ({} keys)", patch.file, replace.len());
        }
        applied += 1;
    }
    Ok(applied)
}

/// `key=value` lines; keys not present are appended
pub fn patch_properties(original: &str, replace: &BTreeMap<String, String>) -> String {
    let mut seen = std::collections::HashSet::new();
    let mut lines: Vec<String> = original
        .lines()
        .map(|line| {
            let trimmed = line.trim_start();
            if trimmed.starts_with('#') || trimmed.starts_with('!') {
                return line.to_string();
            }
            match line.split_once('=') {
                Some((key, _)) => match replace.get(key.trim()) {
                    Some(v) => {
                        seen.insert(key.trim().to_string());
                        format!("{}={}", key.trim(), v)
                    }
                    None => line.to_string(),
                },
                None => line.to_string(),
            }
        })
        .collect();
    for (k, v) in replace {
        if !seen.contains(k) {
            lines.push(format!("{}={}", k, v));
        }
    }
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// Dotted keys (`server.port`) address nested objects, created as needed.
/// Values that parse as JSON (numbers, booleans) keep their type.
pub fn patch_json(original: &str, replace: &BTreeMap<String, String>) -> Result<String> {
    let mut doc: serde_json::Value = serde_json::from_str(original)?;
    for (key, raw) in replace {
        let value = serde_json::from_str::<serde_json::Value>(raw)
            .ok()
            .filter(|v| !v.is_object() && !v.is_array())
            .unwrap_or_else(|| serde_json::Value::String(raw.clone()));
        let parts: Vec<&str> = key.split('.').collect();
        let Some((last, parents)) = parts.split_last() else { continue };
        let mut cursor = &mut doc;
        for part in parents {
            if !cursor.is_object() {
                *cursor = serde_json::json!({});
            }
            match { cursor } {
                serde_json::Value::Object(map) => {
                    cursor = map.entry(part.to_string()).or_insert_with(|| serde_json::json!({}));
                }
                other => {
                    cursor = other;
                    break;
                }
            }
        }
        if !cursor.is_object() {
            *cursor = serde_json::json!({});
        }
        if let Some(map) = cursor.as_object_mut() {
            map.insert(last.to_string(), value);
        }
    }
    Ok(serde_json::to_string_pretty(&doc)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> BTreeMap<String, String> {
        let mut v = BTreeMap::new();
        v.insert("SERVER_PORT".into(), "25570".into());
        v.insert("MOTD".into(), "Hello".into());
        v
    }

    #[test]
    fn interpolation_replaces_known_keys_only() {
        assert_eq!(
            interpolate("java -Dport={{SERVER_PORT}} {{UNKNOWN}} {{MOTD}}", &vars()),
            "java -Dport=25570 {{UNKNOWN}} Hello"
        );
    }

    #[test]
    fn properties_patch_replaces_and_appends() {
        let mut replace = BTreeMap::new();
        replace.insert("server-port".to_string(), "25570".to_string());
        replace.insert("motd".to_string(), "Hello".to_string());
        let out = patch_properties("#comment\nserver-port=25565\nonline-mode=true\n", &replace);
        assert_eq!(out, "#comment\nserver-port=25570\nonline-mode=true\nmotd=Hello\n");
    }

    #[test]
    fn json_patch_nested_and_typed() {
        let mut replace = BTreeMap::new();
        replace.insert("server.port".to_string(), "25570".to_string());
        replace.insert("name".to_string(), "My Server".to_string());
        let out = patch_json(r#"{"server":{"port":1,"host":"0.0.0.0"}}"#, &replace).unwrap();
        let v: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["server"]["port"], 25570);
        assert_eq!(v["server"]["host"], "0.0.0.0");
        assert_eq!(v["name"], "My Server");
    }

    #[test]
    fn patches_apply_through_sandbox() {
        let dir = tempfile::TempDir::new().unwrap();
        let files = ServerFiles::new(dir.path());
        fs::write(dir.path().join("server.properties"), "server-port=1\n").unwrap();
        let mut replace = BTreeMap::new();
        replace.insert("server-port".to_string(), "{{SERVER_PORT}}".to_string());
        let patches = vec![
            ConfigFilePatch { file: "server.properties".into(), parser: ConfigParser::Properties, replace: replace.clone() },
            ConfigFilePatch { file: "missing.json".into(), parser: ConfigParser::Json, replace },
        ];
        assert_eq!(apply_config_patches(&files, &patches, &vars()).unwrap(), 1);
        assert_eq!(fs::read_to_string(dir.path().join("server.properties")).unwrap(), "server-port=25570\n");
    }
}
