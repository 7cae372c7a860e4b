use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

pub fn now_utc_string() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn utc_compact_string(ts: DateTime<Utc>) -> String {
    ts.format("%Y%m%dT%H%M%SZ").to_string()
}

pub fn ensure_directory(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .with_context(|| format!("failed to create directory: {}", path.display()))
}

pub fn write_json_pretty<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut data = serde_json::to_vec_pretty(value)
        .with_context(|| format!("failed to serialize json: {}", path.display()))?;
    data.push(b'\n');
    write_bytes(path, &data)
}

pub fn write_text(path: &Path, text: &str) -> Result<()> {
    write_bytes(path, text.as_bytes())
}

fn write_bytes(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_directory(parent)?;
    }

    let mut file =
        File::create(path).with_context(|| format!("failed to create file: {}", path.display()))?;
    file.write_all(data)
        .with_context(|| format!("failed to write file: {}", path.display()))?;

    Ok(())
}

/// Newest `report_run_*.json` by file name; names embed a compact UTC stamp.
pub fn latest_run_manifest(manifest_dir: &Path) -> Result<Option<PathBuf>> {
    Ok(run_manifests_newest_first(manifest_dir)?.into_iter().next())
}

pub fn run_manifests_newest_first(manifest_dir: &Path) -> Result<Vec<PathBuf>> {
    if !manifest_dir.exists() {
        return Ok(Vec::new());
    }

    let entries = fs::read_dir(manifest_dir)
        .with_context(|| format!("failed to read {}", manifest_dir.display()))?;

    let mut manifests = Vec::new();
    for entry in entries {
        let entry =
            entry.with_context(|| format!("failed to read entry in {}", manifest_dir.display()))?;
        let path = entry.path();
        let is_run_manifest = path
            .file_name()
            .and_then(|name| name.to_str())
            .map(|name| name.starts_with("report_run_") && name.ends_with(".json"))
            .unwrap_or(false);

        if is_run_manifest {
            manifests.push(path);
        }
    }

    manifests.sort_by(|a, b| b.cmp(a));
    Ok(manifests)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latest_run_manifest_picks_newest_stamp() {
        let dir = tempfile::tempdir().unwrap();
        assert!(latest_run_manifest(&dir.path().join("missing")).unwrap().is_none());

        write_json_pretty(
            &dir.path().join("report_run_20240301T000000Z.json"),
            &serde_json::json!({ "status": "completed" }),
        )
        .unwrap();
        write_json_pretty(
            &dir.path().join("report_run_20240308T000000Z.json"),
            &serde_json::json!({ "status": "failed" }),
        )
        .unwrap();
        write_text(&dir.path().join("report.wiki"), "text").unwrap();

        let latest = latest_run_manifest(dir.path()).unwrap().unwrap();
        assert!(latest.ends_with("report_run_20240308T000000Z.json"));

        let all = run_manifests_newest_first(dir.path()).unwrap();
        assert_eq!(all.len(), 2);
        assert!(all[1].ends_with("report_run_20240301T000000Z.json"));
    }

    #[test]
    fn write_json_pretty_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifests").join("run.json");
        write_json_pretty(&path, &serde_json::json!({ "rows": 2 })).unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.ends_with("}\n"));
        assert!(raw.contains("\"rows\": 2"));
    }
}
