use crate::db::DB_FILE_NAME;
use anyhow::{anyhow, Context};
use rusqlite::{Connection, OpenFlags};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

const MANIFEST_ENTRY: &str = "manifest.json";
const DB_ENTRY: &str = "db/registrar.sqlite3";
pub const BUNDLE_FORMAT: &str = "registrar-workspace-v1";

#[derive(Debug, Clone)]
pub struct ExportSummary {
    pub bundle_format: String,
    pub db_sha256: String,
    pub db_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct ImportSummary {
    pub bundle_format_detected: String,
    pub db_sha256: String,
}

fn sha256_file(path: &Path) -> anyhow::Result<(String, u64)> {
    let mut f = File::open(path)
        .with_context(|| format!("failed to open {}", path.to_string_lossy()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = f.read(&mut buf).context("failed to read database")?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((hex::encode(hasher.finalize()), total))
}

pub fn export_workspace_bundle(
    workspace_path: &Path,
    out_path: &Path,
) -> anyhow::Result<ExportSummary> {
    let db_path = workspace_path.join(DB_FILE_NAME);
    if !db_path.is_file() {
        return Err(anyhow!(
            "workspace database not found: {}",
            db_path.to_string_lossy()
        ));
    }
    let (db_sha256, db_bytes) = sha256_file(&db_path)?;

    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.to_string_lossy()))?;
    }
    let out_file = File::create(out_path).with_context(|| {
        format!(
            "failed to create output file {}",
            out_path.to_string_lossy()
        )
    })?;
    let mut zip = ZipWriter::new(out_file);
    let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);

    let manifest = json!({
        "format": BUNDLE_FORMAT,
        "appVersion": env!("CARGO_PKG_VERSION"),
        "schemaVersion": crate::db::SCHEMA_VERSION,
        "exportedAt": crate::db::now_utc(),
        "dbEntry": DB_ENTRY,
        "dbSha256": db_sha256,
        "dbBytes": db_bytes,
    });
    zip.start_file(MANIFEST_ENTRY, opts)
        .context("failed to start manifest entry")?;
    zip.write_all(
        serde_json::to_string_pretty(&manifest)
            .context("failed to serialize manifest")?
            .as_bytes(),
    )
    .context("failed to write manifest entry")?;

    zip.start_file(DB_ENTRY, opts)
        .context("failed to start database entry")?;
    let mut db_file = File::open(&db_path)
        .with_context(|| format!("failed to open database {}", db_path.to_string_lossy()))?;
    std::io::copy(&mut db_file, &mut zip).context("failed to write database entry")?;

    zip.finish().context("failed to finalize zip bundle")?;

    Ok(ExportSummary {
        bundle_format: BUNDLE_FORMAT.to_string(),
        db_sha256,
        db_bytes,
    })
}

/// Restores a bundle (or a bare sqlite file) into `workspace_path`. The
/// database is extracted next to the live one and only swapped in once its
/// digest matches the manifest.
pub fn import_workspace_bundle(
    in_path: &Path,
    workspace_path: &Path,
) -> anyhow::Result<ImportSummary> {
    std::fs::create_dir_all(workspace_path).with_context(|| {
        format!(
            "failed to create workspace {}",
            workspace_path.to_string_lossy()
        )
    })?;
    let dst = workspace_path.join(DB_FILE_NAME);
    let tmp_dst = workspace_path.join(format!("{}.importing", DB_FILE_NAME));
    if tmp_dst.exists() {
        let _ = std::fs::remove_file(&tmp_dst);
    }

    let format = if is_zip_file(in_path)? {
        let in_file = File::open(in_path)
            .with_context(|| format!("failed to open bundle {}", in_path.to_string_lossy()))?;
        let mut archive = ZipArchive::new(in_file).context("invalid zip archive")?;

        let mut manifest_text = String::new();
        archive
            .by_name(MANIFEST_ENTRY)
            .context("bundle missing manifest.json")?
            .read_to_string(&mut manifest_text)
            .context("failed to read manifest.json")?;
        let manifest: serde_json::Value =
            serde_json::from_str(&manifest_text).context("manifest.json is invalid JSON")?;
        let format = manifest
            .get("format")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        if format != BUNDLE_FORMAT {
            return Err(anyhow!("unsupported bundle format: {}", format));
        }
        let expected = manifest
            .get("dbSha256")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("manifest.json missing dbSha256"))?
            .to_ascii_lowercase();

        let mut db_out = File::create(&tmp_dst).with_context(|| {
            format!(
                "failed to create temp database {}",
                tmp_dst.to_string_lossy()
            )
        })?;
        {
            let mut db_entry = archive
                .by_name(DB_ENTRY)
                .with_context(|| format!("bundle missing {}", DB_ENTRY))?;
            std::io::copy(&mut db_entry, &mut db_out)
                .context("failed to extract database entry")?;
        }
        db_out
            .flush()
            .context("failed to flush extracted database")?;
        drop(db_out);

        let (actual, _) = sha256_file(&tmp_dst)?;
        if actual != expected {
            let _ = std::fs::remove_file(&tmp_dst);
            return Err(anyhow!(
                "database checksum mismatch: manifest {}, bundle {}",
                expected,
                actual
            ));
        }
        BUNDLE_FORMAT.to_string()
    } else {
        std::fs::copy(in_path, &tmp_dst).with_context(|| {
            format!(
                "failed to copy sqlite backup from {}",
                in_path.to_string_lossy()
            )
        })?;
        "plain-sqlite3".to_string()
    };

    if let Err(e) = check_restorable(&tmp_dst) {
        let _ = std::fs::remove_file(&tmp_dst);
        return Err(e.context(format!(
            "{} is not a registrar database",
            in_path.to_string_lossy()
        )));
    }

    let (db_sha256, _) = sha256_file(&tmp_dst)?;
    if dst.exists() {
        std::fs::remove_file(&dst).with_context(|| {
            format!(
                "failed to remove existing database {}",
                dst.to_string_lossy()
            )
        })?;
    }
    std::fs::rename(&tmp_dst, &dst).with_context(|| {
        format!(
            "failed to move extracted database to {}",
            dst.to_string_lossy()
        )
    })?;

    Ok(ImportSummary {
        bundle_format_detected: format,
        db_sha256,
    })
}

/// The live database is only replaced by a file sqlite accepts whole and
/// that carries the accounts table.
fn check_restorable(path: &Path) -> anyhow::Result<()> {
    let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
        .context("failed to open restored database")?;
    let status: String = conn
        .query_row("PRAGMA integrity_check", [], |r| r.get(0))
        .context("integrity check failed")?;
    if status != "ok" {
        return Err(anyhow!("integrity check failed: {}", status));
    }
    let has_users: bool = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'users')",
            [],
            |r| r.get(0),
        )
        .context("failed to read schema")?;
    if !has_users {
        return Err(anyhow!("users table missing"));
    }
    Ok(())
}

fn is_zip_file(path: &Path) -> anyhow::Result<bool> {
    let mut f = File::open(path)
        .with_context(|| format!("failed to open input file {}", path.to_string_lossy()))?;
    let mut sig = [0u8; 4];
    let read = f.read(&mut sig).context("failed to read file signature")?;
    if read < 4 {
        return Ok(false);
    }
    Ok(sig == [0x50, 0x4B, 0x03, 0x04])
}
