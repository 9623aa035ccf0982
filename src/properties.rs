//! # `server.properties` editing.
//!
//! Minimal line-oriented codec for the game server's own configuration
//! file. Comments and unknown keys are preserved on update; only the values
//! the operator touched are rewritten.

use std::collections::BTreeMap;
use std::path::Path;

use crate::error::Result;

/// Reads `server.properties` into a sorted key→value map. A missing file
/// yields an empty map (fresh servers have none until first boot).
pub fn load(dir: &Path) -> Result<BTreeMap<String, String>> {
    let path = dir.join("server.properties");
    let text = match std::fs::read_to_string(&path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(err) => return Err(err.into()),
    };

    let mut map = BTreeMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            map.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    Ok(map)
}

/// Applies `updates` to `server.properties`, keeping comments and the
/// existing order; new keys are appended at the end.
pub fn update(dir: &Path, updates: &BTreeMap<String, String>) -> Result<()> {
    let path = dir.join("server.properties");
    let original = std::fs::read_to_string(&path).unwrap_or_default();

    let mut remaining = updates.clone();
    let mut lines: Vec<String> = Vec::new();
    for line in original.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with('!') {
            lines.push(line.to_string());
            continue;
        }
        match trimmed.split_once('=') {
            Some((key, _)) => {
                let key = key.trim();
                match remaining.remove(key) {
                    Some(value) => lines.push(format!("{key}={value}")),
                    None => lines.push(line.to_string()),
                }
            }
            None => lines.push(line.to_string()),
        }
    }
    for (key, value) in remaining {
        lines.push(format!("{key}={value}"));
    }

    let mut text = lines.join("\n");
    text.push('\n');
    std::fs::write(&path, text)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_skips_comments_and_blank_lines() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("server.properties"),
            "#Minecraft server properties\nmotd=Hello\n\nmax-players=20\n",
        )
        .unwrap();

        let map = load(dir.path()).unwrap();
        assert_eq!(map.get("motd").map(String::as_str), Some("Hello"));
        assert_eq!(map.get("max-players").map(String::as_str), Some("20"));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn update_preserves_comments_and_appends_new_keys() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("server.properties"),
            "#header\nmotd=Old\nmax-players=20\n",
        )
        .unwrap();

        let mut updates = BTreeMap::new();
        updates.insert("motd".to_string(), "New".to_string());
        updates.insert("pvp".to_string(), "false".to_string());
        update(dir.path(), &updates).unwrap();

        let text = std::fs::read_to_string(dir.path().join("server.properties")).unwrap();
        assert!(text.starts_with("#header\n"));
        assert!(text.contains("motd=New\n"));
        assert!(text.contains("max-players=20\n"));
        assert!(text.contains("pvp=false\n"));
    }
}
