use crate::activation;
use crate::importer::{self, UploadRequest};
use crate::ipc::error::{err, fail, ok, reply};
use crate::ipc::types::{AppState, Request};
use serde_json::json;

fn handle_schedules_upload(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let upload = match UploadRequest::from_params(&req.params) {
        Ok(u) => u,
        Err(e) => return fail(&req.id, e),
    };
    reply(&req.id, importer::import(conn, &req.ctx(), &upload))
}

fn handle_schedules_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match activation::list_schedules(
        conn,
        req.opt_i64_param("organizationId"),
        req.opt_i64_param("termId"),
    ) {
        Ok(rows) => ok(&req.id, json!({ "schedules": rows })),
        Err(e) => fail(&req.id, e),
    }
}

fn handle_schedules_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let schedule_id = match req.i64_param("scheduleId") {
        Ok(v) => v,
        Err(e) => return fail(&req.id, e),
    };
    let meta = match activation::load_meta(conn, schedule_id) {
        Ok(m) => m,
        Err(e) => return fail(&req.id, e),
    };
    let snapshot = match activation::load_snapshot(conn, schedule_id) {
        Ok(s) => s,
        Err(e) => return fail(&req.id, e),
    };
    ok(
        &req.id,
        json!({
            "meta": meta,
            "associationCount": snapshot.flatten().len(),
            "schedule": snapshot,
        }),
    )
}

fn handle_schedule_action(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let schedule_id = match req.i64_param("scheduleId") {
        Ok(v) => v,
        Err(e) => return fail(&req.id, e),
    };
    let ctx = req.ctx();
    match req.method.as_str() {
        "schedules.activate" => reply(&req.id, activation::activate(conn, &ctx, schedule_id)),
        "schedules.deactivate" => reply(&req.id, activation::deactivate(conn, &ctx, schedule_id)),
        "schedules.toggle" => reply(&req.id, activation::toggle(conn, &ctx, schedule_id)),
        _ => err(&req.id, "not_implemented", "unknown schedule action", None),
    }
}

fn handle_schedules_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let ids = match req.ids_param("scheduleIds") {
        Ok(v) => v,
        Err(e) => return fail(&req.id, e),
    };
    match activation::delete(conn, &req.ctx(), &ids) {
        Ok(deleted) => ok(&req.id, json!({ "deleted": deleted })),
        Err(e) => fail(&req.id, e),
    }
}

fn handle_schedules_reference(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let reference_id = match req.i64_param("referenceId") {
        Ok(v) => v,
        Err(e) => return fail(&req.id, e),
    };
    reply(&req.id, activation::set_reference(conn, &req.ctx(), reference_id))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "schedules.upload" => Some(handle_schedules_upload(state, req)),
        "schedules.list" => Some(handle_schedules_list(state, req)),
        "schedules.get" => Some(handle_schedules_get(state, req)),
        "schedules.activate" | "schedules.deactivate" | "schedules.toggle" => {
            Some(handle_schedule_action(state, req))
        }
        "schedules.delete" => Some(handle_schedules_delete(state, req)),
        "schedules.reference" => Some(handle_schedules_reference(state, req)),
        _ => None,
    }
}
