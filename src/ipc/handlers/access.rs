use crate::access::{self, Grant};
use crate::ipc::error::{err, fail, ok, reply};
use crate::ipc::types::{AppState, Request};
use serde_json::json;

fn handle_access_grant(state: &mut AppState, req: &Request, revoke: bool) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let target = match req.i64_param("targetUserId") {
        Ok(v) => v,
        Err(e) => return fail(&req.id, e),
    };
    let grant = match Grant::from_params(&req.params) {
        Ok(g) => g,
        Err(e) => return fail(&req.id, e),
    };
    let ctx = req.ctx();
    if revoke {
        match access::revoke(conn, &ctx, target, grant) {
            Ok(removed) => ok(&req.id, json!({ "removed": removed })),
            Err(e) => fail(&req.id, e),
        }
    } else {
        match access::grant(conn, &ctx, target, grant) {
            Ok(()) => ok(&req.id, json!({ "ok": true })),
            Err(e) => fail(&req.id, e),
        }
    }
}

fn handle_access_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    reply(&req.id, access::list(conn))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "access.grant" => Some(handle_access_grant(state, req, false)),
        "access.revoke" => Some(handle_access_grant(state, req, true)),
        "access.list" => Some(handle_access_list(state, req)),
        _ => None,
    }
}
