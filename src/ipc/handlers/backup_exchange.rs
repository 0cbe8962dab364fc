use crate::backup;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::path::PathBuf;

fn path_param(req: &Request, key: &str) -> Option<PathBuf> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
}

fn handle_backup_export(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(out) = path_param(req, "outPath") else {
        return err(&req.id, "bad_params", "missing outPath", None);
    };
    let Some(workspace) = state.workspace.clone() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    if let Some(conn) = state.db.as_ref() {
        if let Err(e) = conn.execute_batch("PRAGMA wal_checkpoint(FULL)") {
            tracing::warn!(error = %e, "checkpoint before export failed");
        }
    }

    match backup::export_workspace_bundle(&workspace, &out) {
        Ok(summary) => {
            tracing::info!(path = %out.display(), bytes = summary.db_bytes, "workspace exported");
            ok(
                &req.id,
                json!({
                    "ok": true,
                    "path": out.to_string_lossy(),
                    "bundleFormat": summary.bundle_format,
                    "sha256": summary.db_sha256,
                    "bytes": summary.db_bytes
                }),
            )
        }
        Err(e) => err(
            &req.id,
            "backup_failed",
            format!("{:#}", e),
            Some(json!({ "path": out.to_string_lossy() })),
        ),
    }
}

fn handle_backup_import(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(src) = path_param(req, "inPath") else {
        return err(&req.id, "bad_params", "missing inPath", None);
    };
    let Some(workspace) = state.workspace.clone() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    if !src.is_file() {
        return err(
            &req.id,
            "not_found",
            "bundle file not found",
            Some(json!({ "path": src.to_string_lossy() })),
        );
    }

    // The open handle must be released before the file is replaced.
    state.db = None;
    let imported = backup::import_workspace_bundle(&src, &workspace);

    // Reopen in both cases; a failed import leaves the old database in place.
    let conn = match db::open_db(&workspace) {
        Ok(conn) => conn,
        Err(e) => return err(&req.id, "db_open_failed", format!("{:#}", e), None),
    };
    state.db = Some(conn);

    match imported {
        Ok(summary) => {
            tracing::info!(path = %src.display(), sha256 = %summary.db_sha256, "workspace imported");
            ok(
                &req.id,
                json!({
                    "ok": true,
                    "workspacePath": workspace.to_string_lossy(),
                    "bundleFormat": summary.bundle_format,
                    "sha256": summary.db_sha256
                }),
            )
        }
        Err(e) => err(
            &req.id,
            "backup_failed",
            format!("{:#}", e),
            Some(json!({ "path": src.to_string_lossy() })),
        ),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "backup.export" => Some(handle_backup_export(state, req)),
        "backup.import" => Some(handle_backup_import(state, req)),
        _ => None,
    }
}
