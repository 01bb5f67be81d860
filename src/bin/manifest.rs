//! Laiska Manifest - release authoring tool
//!
//! Recomputes manifest checksums with the same engine the node verifies with.

use anyhow::{Context, Result};
use clap::Parser;
use laiska_lib::engine::{
    cli::{
        formatter::{describe_status, format_size, CliFormatter},
        recompute_checksums, Cli, Commands, OutputFormat,
    },
    updater::{
        layout::DeviceLayout, manifest::VersionManifest, state::UpdateStatus,
        verify::{checksum_file, find_invalid},
    },
};
use std::path::{Path, PathBuf};

fn main() {
    let cli = Cli::parse();

    if let Err(e) = run_cli(cli) {
        CliFormatter::error(&format!("{:#}", e));
        std::process::exit(1);
    }
}

fn run_cli(cli: Cli) -> Result<()> {
    let dir = cli.get_dir();
    let json_output = cli.format == OutputFormat::Json;

    match cli.command {
        Commands::Update { manifest, bump } => cmd_update(&dir.join(manifest), &dir, bump, json_output),
        Commands::Checksum { files } => cmd_checksum(&dir, &files, json_output),
        Commands::Verify { manifest, root } => cmd_verify(&dir.join(manifest), &root, json_output),
        Commands::Status { root } => cmd_status(&root, json_output),
    }
}

fn cmd_update(manifest_path: &Path, source_dir: &Path, bump: bool, json: bool) -> Result<()> {
    let mut manifest = VersionManifest::load(manifest_path)
        .with_context(|| format!("loading {}", manifest_path.display()))?;
    let changed = recompute_checksums(&mut manifest, source_dir)?;
    if bump {
        manifest.version += 1;
    }
    manifest.store(manifest_path)?;

    if json {
        println!(
            "{}",
            serde_json::json!({
                "version": manifest.version,
                "files": manifest.files_included.len(),
                "changed": changed,
            })
        );
    } else {
        CliFormatter::success("Re-calculated checksums");
        CliFormatter::kv("Version", &manifest.version.to_string());
        CliFormatter::kv("Files", &manifest.files_included.len().to_string());
        CliFormatter::kv("Changed", &changed.to_string());
    }
    Ok(())
}

fn cmd_checksum(dir: &Path, files: &[PathBuf], json: bool) -> Result<()> {
    let mut results = Vec::new();
    for file in files {
        let path = dir.join(file);
        let digest = checksum_file(&path)
            .computed()
            .with_context(|| format!("{} is missing or unreadable", path.display()))?;
        let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        results.push((file.display().to_string(), digest, size));
    }

    if json {
        let entries: Vec<_> = results
            .iter()
            .map(|(file, digest, size)| serde_json::json!({ "file": file, "check": digest, "size": size }))
            .collect();
        println!("{}", serde_json::to_string_pretty(&entries)?);
    } else {
        for (file, digest, size) in &results {
            CliFormatter::checksum(digest, &format!("{} ({})", file, format_size(*size)));
        }
    }
    Ok(())
}

fn cmd_verify(manifest_path: &Path, root: &Path, json: bool) -> Result<()> {
    let manifest = VersionManifest::load(manifest_path)
        .with_context(|| format!("loading {}", manifest_path.display()))?;
    let invalid: Vec<&str> = find_invalid(&manifest, root)
        .into_iter()
        .map(|e| e.local_path.as_str())
        .collect();

    if json {
        println!(
            "{}",
            serde_json::json!({ "version": manifest.version, "valid": invalid.is_empty(), "invalid": invalid })
        );
    } else if invalid.is_empty() {
        CliFormatter::success(&format!(
            "All {} files of version {} match",
            manifest.files_included.len(),
            manifest.version
        ));
    } else {
        CliFormatter::header("Invalid or missing");
        for path in &invalid {
            CliFormatter::item(path);
        }
    }

    if invalid.is_empty() {
        Ok(())
    } else {
        anyhow::bail!("{} of {} files invalid", invalid.len(), manifest.files_included.len())
    }
}

fn cmd_status(root: &Path, json: bool) -> Result<()> {
    let layout = DeviceLayout::new(root);
    let installed = VersionManifest::load(&layout.live_manifest()).ok().map(|m| m.version);
    let status = UpdateStatus::load(&layout.status_path());
    let staged = layout.staging_dir().is_dir();
    let backup = VersionManifest::load(&layout.backup_manifest()).ok().map(|m| m.version);

    if json {
        println!(
            "{}",
            serde_json::json!({
                "installed": installed,
                "status": status,
                "staging": staged,
                "backup": backup,
            })
        );
        return Ok(());
    }

    CliFormatter::header("Device");
    CliFormatter::kv(
        "Installed",
        &installed.map_or_else(|| "unknown".to_string(), |v| v.to_string()),
    );
    match status {
        Some(s) => CliFormatter::kv("Update status", describe_status(s.ok, s.rollback)),
        None => CliFormatter::kv("Update status", "no update has run"),
    }
    CliFormatter::kv("Staging tree", if staged { "present" } else { "absent" });
    CliFormatter::kv(
        "Backup",
        &backup.map_or_else(|| "none".to_string(), |v| format!("version {}", v)),
    );
    if status.is_some_and(|s| s.rollback) {
        CliFormatter::warning("Live tree may be inconsistent; restore from backup_version/ manually");
    }
    Ok(())
}
