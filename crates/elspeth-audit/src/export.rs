//! Audit export: write a run's full `AuditExport` to a file as JSON, or
//! to a directory of per-record-kind CSVs (per `export.sink`/
//! `export.format`), optionally signed with an HMAC fingerprint written
//! alongside as a `.sig` file.

use std::fs;
use std::path::Path;

use elspeth_core::audit::AuditExport;
use elspeth_core::error::{ElspethError, ErrorKind, ErrorReason};

use crate::fingerprint::FingerprintKey;

fn io_err(context: &str, err: std::io::Error) -> ElspethError {
    ElspethError::Infrastructure(ErrorReason::new(ErrorKind::Infrastructure, format!("{context}: {err}"), false))
}

fn write_signature(path: &Path, export: &AuditExport, signing_key: Option<&FingerprintKey>) -> Result<(), ElspethError> {
    let Some(key) = signing_key else { return Ok(()) };
    let signature = key.fingerprint(export);
    let sig_path = path.with_extension(format!("{}.sig", path.extension().and_then(|e| e.to_str()).unwrap_or("")));
    fs::write(&sig_path, signature).map_err(|e| io_err("writing audit export signature", e))
}

/// Write the export as a single JSON document at `path`.
pub fn export_json(export: &AuditExport, path: &Path, signing_key: Option<&FingerprintKey>) -> Result<(), ElspethError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| io_err("creating audit export directory", e))?;
    }
    let body = serde_json::to_string_pretty(export)
        .map_err(|e| ElspethError::Invariant(ErrorReason::new(ErrorKind::InvariantViolation, format!("audit export serialization failed: {e}"), false)))?;
    fs::write(path, body).map_err(|e| io_err("writing audit export", e))?;
    write_signature(path, export, signing_key)?;
    Ok(())
}

/// Write one CSV file per record kind under `dir`.
pub fn export_csv(export: &AuditExport, dir: &Path, signing_key: Option<&FingerprintKey>) -> Result<(), ElspethError> {
    fs::create_dir_all(dir).map_err(|e| io_err("creating audit export directory", e))?;

    if let Some(run) = &export.run {
        write_csv_rows(&dir.join("runs.csv"), std::slice::from_ref(run))?;
    }
    write_csv_rows(&dir.join("nodes.csv"), &export.nodes)?;
    write_csv_rows(&dir.join("node_states.csv"), &export.node_states)?;
    write_csv_rows(&dir.join("external_calls.csv"), &export.external_calls)?;
    write_csv_rows(&dir.join("routing_events.csv"), &export.routing_events)?;
    write_csv_rows(&dir.join("batches.csv"), &export.batches)?;
    write_csv_rows(&dir.join("secret_resolutions.csv"), &export.secret_resolutions)?;
    write_csv_rows(&dir.join("validation_errors.csv"), &export.validation_errors)?;

    if let Some(key) = signing_key {
        let signature = key.fingerprint(export);
        fs::write(dir.join("export.sig"), signature).map_err(|e| io_err("writing audit export signature", e))?;
    }
    Ok(())
}

fn write_csv_rows<T: serde::Serialize>(path: &Path, rows: &[T]) -> Result<(), ElspethError> {
    if rows.is_empty() {
        return Ok(());
    }
    let mut writer = csv::Writer::from_path(path)
        .map_err(|e| ElspethError::Infrastructure(ErrorReason::new(ErrorKind::Infrastructure, format!("opening {}: {e}", path.display()), false)))?;
    for row in rows {
        writer
            .serialize(row)
            .map_err(|e| ElspethError::Infrastructure(ErrorReason::new(ErrorKind::Infrastructure, format!("writing {}: {e}", path.display()), false)))?;
    }
    writer
        .flush()
        .map_err(|e| io_err(&format!("flushing {}", path.display()), e))?;
    Ok(())
}
