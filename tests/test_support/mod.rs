#![allow(dead_code)]

use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

pub const ADMIN: i64 = 1;

pub fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

pub fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_organizerd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn organizerd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

pub fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

pub fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown error")
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

/// Sends a request that must fail and returns its `error` object.
pub fn request_err(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(false),
        "{} unexpectedly succeeded: {}",
        method,
        value
    );
    value.get("error").cloned().expect("error object")
}

/// Opens `workspace` and seeds one scope: organization 1, term 1, unit 1 with
/// instances 100 and 101, persons 7/8/9, groups 3/5 and room 4. User 1 is the
/// administrator.
pub fn seed_scope(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>, workspace: &Path) {
    request_ok(
        stdin,
        reader,
        "seed-ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    request_ok(
        stdin,
        reader,
        "seed-admin",
        "access.grant",
        json!({ "targetUserId": ADMIN, "role": "admin" }),
    );
    let resources = [
        ("organizations", json!({ "id": 1, "code": "ORG1", "name": "Faculty" })),
        ("terms", json!({ "id": 1, "code": "WS24", "name": "Winter" })),
        ("units", json!({ "id": 1, "code": "U1", "organizationId": 1, "termId": 1 })),
        ("instances", json!({ "id": 100, "code": "I100", "unitId": 1 })),
        ("instances", json!({ "id": 101, "code": "I101", "unitId": 1 })),
        ("persons", json!({ "id": 7, "code": "P7", "surname": "Adler", "forename": "Ada" })),
        ("persons", json!({ "id": 8, "code": "P8", "surname": "Berg", "forename": "Ben" })),
        ("persons", json!({ "id": 9, "code": "P9", "surname": "Cole", "forename": "Cy" })),
        ("groups", json!({ "id": 3, "code": "G3", "name": "Group 3" })),
        ("groups", json!({ "id": 5, "code": "G5", "name": "Group 5" })),
        ("rooms", json!({ "id": 4, "code": "R4", "name": "Room 4" })),
    ];
    for (i, (kind, resource)) in resources.into_iter().enumerate() {
        request_ok(
            stdin,
            reader,
            &format!("seed-{}", i),
            "resources.upsert",
            json!({ "kind": kind, "resource": resource }),
        );
    }
}

/// Uploads a schedule for scope (1, 1) as the administrator and returns its id.
pub fn upload(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    schedule: serde_json::Value,
) -> i64 {
    let res = request_ok(
        stdin,
        reader,
        id,
        "schedules.upload",
        json!({
            "userId": ADMIN,
            "organizationId": 1,
            "termId": 1,
            "schedule": schedule,
            "validation": { "errors": [], "warnings": [] }
        }),
    );
    res.get("scheduleId")
        .and_then(|v| v.as_i64())
        .expect("scheduleId")
}

pub fn activate(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    schedule_id: i64,
) -> serde_json::Value {
    request_ok(
        stdin,
        reader,
        id,
        "schedules.activate",
        json!({ "userId": ADMIN, "scheduleId": schedule_id }),
    )
}

pub fn open_db(workspace: &Path) -> Connection {
    Connection::open(workspace.join("organizer.sqlite3")).expect("open workspace db")
}

pub fn person_status(db: &Connection, instance_id: i64, person_id: i64) -> Option<String> {
    db.query_row(
        "SELECT delta FROM instance_persons WHERE instance_id = ? AND person_id = ?",
        (instance_id, person_id),
        |r| r.get(0),
    )
    .optional()
    .expect("query person association")
}

/// Status of a group (`instance_groups`/`group_id`) or room
/// (`instance_rooms`/`room_id`) row under an instance-person association.
pub fn child_status(
    db: &Connection,
    table: &str,
    column: &str,
    instance_id: i64,
    person_id: i64,
    resource_id: i64,
) -> Option<String> {
    let sql = format!(
        "SELECT c.delta FROM {table} c
         JOIN instance_persons ip ON ip.id = c.assoc_id
         WHERE ip.instance_id = ? AND ip.person_id = ? AND c.{column} = ?",
        table = table,
        column = column
    );
    db.query_row(&sql, (instance_id, person_id, resource_id), |r| r.get(0))
        .optional()
        .expect("query child association")
}
