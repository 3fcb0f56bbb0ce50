mod test_support;

use serde_json::json;
use test_support::{
    open_db, person_status, request_err, request_ok, seed_scope, spawn_sidecar, temp_dir, upload,
    ADMIN,
};

#[test]
fn code_keyed_upload_resolves_and_can_activate_immediately() {
    let workspace = temp_dir("organizer-upload-codes");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    seed_scope(&mut stdin, &mut reader, &workspace);
    let db = open_db(&workspace);

    let res = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "schedules.upload",
        json!({
            "userId": ADMIN,
            "organizationId": 1,
            "termId": 1,
            "keyedBy": "code",
            "activate": true,
            "schedule": {
                "I100": { "P7": { "roleID": 2, "groups": ["G3", "G5"], "rooms": ["R4"] } },
                "I101": { "P8": { "groups": ["G3"] } }
            },
            "validation": { "errors": [], "warnings": [{ "code": "w1", "message": "late upload" }] }
        }),
    );
    assert_eq!(res["associationCount"], 2);
    assert_eq!(res["instanceCount"], 2);
    assert_eq!(res["warnings"][0]["code"], "w1");
    assert_eq!(res["activation"]["alreadyActive"], false);
    assert_eq!(person_status(&db, 100, 7).as_deref(), Some("new"));

    let schedule_id = res["scheduleId"].as_i64().expect("scheduleId");
    let stored = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "schedules.get",
        json!({ "scheduleId": schedule_id }),
    );
    assert_eq!(stored["meta"]["active"], true);
    assert_eq!(stored["schedule"]["100"]["7"]["roleID"], 2);
    assert_eq!(stored["schedule"]["100"]["7"]["groups"], json!([3, 5]));
    assert_eq!(stored["schedule"]["101"]["8"]["rooms"], json!([]));

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn unresolved_codes_fail_closed_and_are_all_listed() {
    let workspace = temp_dir("organizer-upload-unresolved");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    seed_scope(&mut stdin, &mut reader, &workspace);
    let db = open_db(&workspace);

    let error = request_err(
        &mut stdin,
        &mut reader,
        "1",
        "schedules.upload",
        json!({
            "userId": ADMIN,
            "organizationId": 1,
            "termId": 1,
            "keyedBy": "code",
            "schedule": {
                "I100": { "P7": { "groups": ["G3", "GX"], "rooms": ["RX"] }, "PX": {} },
                "IX": { "P7": {} }
            }
        }),
    );
    assert_eq!(error["code"], "validation_failed");
    let mut refs: Vec<String> = error["details"]["unresolved"]
        .as_array()
        .expect("unresolved list")
        .iter()
        .filter_map(|u| u["ref"].as_str().map(str::to_string))
        .collect();
    refs.sort();
    assert_eq!(refs, vec!["GX", "IX", "PX", "RX"]);

    let count: i64 = db
        .query_row("SELECT COUNT(*) FROM schedules", [], |r| r.get(0))
        .expect("count");
    assert_eq!(count, 0);

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn validator_errors_and_empty_snapshots_are_refused() {
    let workspace = temp_dir("organizer-upload-refused");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    seed_scope(&mut stdin, &mut reader, &workspace);

    let error = request_err(
        &mut stdin,
        &mut reader,
        "1",
        "schedules.upload",
        json!({
            "userId": ADMIN,
            "organizationId": 1,
            "termId": 1,
            "schedule": { "100": { "7": {} } },
            "validation": { "errors": [{ "code": "bad_date", "message": "block out of term" }] }
        }),
    );
    assert_eq!(error["code"], "validation_failed");
    assert_eq!(error["details"]["errors"][0]["code"], "bad_date");

    let error = request_err(
        &mut stdin,
        &mut reader,
        "2",
        "schedules.upload",
        json!({ "userId": ADMIN, "organizationId": 1, "termId": 1, "schedule": {} }),
    );
    assert_eq!(error["code"], "validation_failed");

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn instance_from_another_scope_is_rejected() {
    let workspace = temp_dir("organizer-upload-scope");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    seed_scope(&mut stdin, &mut reader, &workspace);

    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "resources.upsert",
        json!({ "kind": "terms", "resource": { "id": 2, "code": "SS25" } }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "resources.upsert",
        json!({ "kind": "units", "resource": { "id": 2, "code": "U2", "organizationId": 1, "termId": 2 } }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "resources.upsert",
        json!({ "kind": "instances", "resource": { "id": 200, "unitId": 2 } }),
    );

    let error = request_err(
        &mut stdin,
        &mut reader,
        "4",
        "schedules.upload",
        json!({
            "userId": ADMIN,
            "organizationId": 1,
            "termId": 1,
            "schedule": { "100": { "7": {} }, "200": { "7": {} } }
        }),
    );
    assert_eq!(error["code"], "validation_failed");
    assert_eq!(error["details"]["unresolved"][0]["ref"], "200");
    assert_eq!(error["details"]["unresolved"][0]["reason"], "out_of_scope");

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn identical_upload_warns_and_unauthorized_upload_is_forbidden() {
    let workspace = temp_dir("organizer-upload-identical");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    seed_scope(&mut stdin, &mut reader, &workspace);

    let schedule = json!({ "100": { "7": { "groups": [3] } } });
    let first = upload(&mut stdin, &mut reader, "1", schedule.clone());
    let res = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "schedules.upload",
        json!({ "userId": ADMIN, "organizationId": 1, "termId": 1, "schedule": schedule }),
    );
    assert_eq!(res["warnings"][0]["code"], "identical_snapshot");
    assert_eq!(res["warnings"][0]["scheduleId"], first);

    let error = request_err(
        &mut stdin,
        &mut reader,
        "3",
        "schedules.upload",
        json!({ "userId": 77, "organizationId": 1, "termId": 1, "schedule": { "100": { "7": {} } } }),
    );
    assert_eq!(error["code"], "forbidden");

    request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "access.grant",
        json!({ "userId": ADMIN, "targetUserId": 77, "role": "scheduler", "organizationId": 1 }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "schedules.upload",
        json!({ "userId": 77, "organizationId": 1, "termId": 1, "schedule": { "100": { "7": {} } } }),
    );

    let deleted = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "schedules.delete",
        json!({ "userId": 77, "scheduleIds": [first] }),
    );
    assert_eq!(deleted["deleted"], 1);

    let _ = std::fs::remove_dir_all(workspace);
}
