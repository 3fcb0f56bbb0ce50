use crate::directory::{self, ResourceDirectory, ResourceKind, SqliteDirectory};
use crate::error::OrganizerError;
use crate::ipc::error::{err, fail, ok, reply};
use crate::ipc::types::{AppState, Request};
use crate::merge::{self, MergeKind};
use serde_json::json;

fn kind_param(req: &Request) -> Result<ResourceKind, OrganizerError> {
    let raw = req
        .params
        .get("kind")
        .and_then(|v| v.as_str())
        .ok_or_else(|| OrganizerError::BadParams("missing kind".into()))?;
    ResourceKind::parse(raw)
        .ok_or_else(|| OrganizerError::BadParams(format!("unknown resource kind: {}", raw)))
}

fn handle_resources_upsert(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let kind = match kind_param(req) {
        Ok(k) => k,
        Err(e) => return fail(&req.id, e),
    };
    let Some(fields) = req.params.get("resource").filter(|v| v.is_object()) else {
        return err(&req.id, "bad_params", "resource must be an object", None);
    };
    match directory::upsert(conn, kind, fields) {
        Ok(id) => ok(&req.id, json!({ "id": id })),
        Err(e) => fail(&req.id, e),
    }
}

fn handle_resources_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let kind = match kind_param(req) {
        Ok(k) => k,
        Err(e) => return fail(&req.id, e),
    };
    let id = match req.i64_param("resourceId") {
        Ok(v) => v,
        Err(e) => return fail(&req.id, e),
    };
    reply(&req.id, directory::get(conn, kind, id))
}

fn handle_resources_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let kind = match kind_param(req) {
        Ok(k) => k,
        Err(e) => return fail(&req.id, e),
    };
    match directory::list(conn, kind) {
        Ok(rows) => ok(&req.id, json!({ "kind": kind.plural(), "items": rows })),
        Err(e) => fail(&req.id, e),
    }
}

fn handle_resources_resolve(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let kind = match kind_param(req) {
        Ok(k) => k,
        Err(e) => return fail(&req.id, e),
    };
    let Some(code) = req.params.get("code").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing code", None);
    };
    match SqliteDirectory::new(conn).resolve(kind, code) {
        Ok(id) => ok(&req.id, json!({ "id": id })),
        Err(e) => fail(&req.id, e),
    }
}

fn handle_resources_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let kind = match kind_param(req) {
        Ok(k) => k,
        Err(e) => return fail(&req.id, e),
    };
    let id = match req.i64_param("resourceId") {
        Ok(v) => v,
        Err(e) => return fail(&req.id, e),
    };
    match directory::delete(conn, kind, id) {
        Ok(deleted) => ok(&req.id, json!({ "deleted": deleted })),
        Err(e) => fail(&req.id, e),
    }
}

fn handle_resources_merge(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(kind_raw) = req.params.get("kind").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing kind", None);
    };
    let Some(kind) = MergeKind::parse(kind_raw) else {
        return err(
            &req.id,
            "bad_params",
            "kind must be one of: groups, persons, rooms",
            None,
        );
    };
    let ids = match req.ids_param("ids") {
        Ok(v) => v,
        Err(e) => return fail(&req.id, e),
    };
    let patch = req.params.get("patch").and_then(|v| v.as_object());
    reply(&req.id, merge::merge(conn, &req.ctx(), kind, &ids, patch))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "resources.upsert" => Some(handle_resources_upsert(state, req)),
        "resources.get" => Some(handle_resources_get(state, req)),
        "resources.list" => Some(handle_resources_list(state, req)),
        "resources.resolve" => Some(handle_resources_resolve(state, req)),
        "resources.delete" => Some(handle_resources_delete(state, req)),
        "resources.merge" => Some(handle_resources_merge(state, req)),
        _ => None,
    }
}
