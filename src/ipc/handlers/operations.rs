use crate::ipc::error::{err, fail, ok};
use crate::ipc::types::{AppState, Request};
use crate::oplog;
use serde_json::json;

fn handle_operations_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let limit = req.opt_i64_param("limit").unwrap_or(50).clamp(1, 500);
    match oplog::list(conn, req.opt_i64_param("organizationId"), limit) {
        Ok(entries) => ok(&req.id, json!({ "operations": entries })),
        Err(e) => fail(&req.id, e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "operations.list" => Some(handle_operations_list(state, req)),
        _ => None,
    }
}
