mod test_support;

use serde_json::json;
use test_support::{
    activate, child_status, open_db, person_status, request_ok, seed_scope, spawn_sidecar,
    temp_dir, upload, ADMIN,
};

#[test]
fn added_room_is_new_while_person_stays_none() {
    let workspace = temp_dir("organizer-activation-room");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    seed_scope(&mut stdin, &mut reader, &workspace);
    let db = open_db(&workspace);

    let s1 = upload(
        &mut stdin,
        &mut reader,
        "1",
        json!({ "100": { "7": { "roleID": 1, "groups": [3], "rooms": [] } } }),
    );
    let first = activate(&mut stdin, &mut reader, "2", s1);
    assert_eq!(first["alreadyActive"], false);
    assert_eq!(first["summary"]["persons"]["created"], 1);
    assert_eq!(person_status(&db, 100, 7).as_deref(), Some("new"));
    assert_eq!(
        child_status(&db, "instance_groups", "group_id", 100, 7, 3).as_deref(),
        Some("new")
    );

    let s2 = upload(
        &mut stdin,
        &mut reader,
        "3",
        json!({ "100": { "7": { "roleID": 1, "groups": [3], "rooms": [4] } } }),
    );
    let second = activate(&mut stdin, &mut reader, "4", s2);
    assert_eq!(second["previousActiveId"], s1);
    assert_eq!(second["summary"]["rooms"]["created"], 1);
    assert_eq!(second["summary"]["persons"]["changed"], 0);

    assert_eq!(person_status(&db, 100, 7).as_deref(), Some("none"));
    assert_eq!(
        child_status(&db, "instance_rooms", "room_id", 100, 7, 4).as_deref(),
        Some("new")
    );
    assert_eq!(
        child_status(&db, "instance_groups", "group_id", 100, 7, 3).as_deref(),
        Some("none")
    );

    let list = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "schedules.list",
        json!({ "organizationId": 1, "termId": 1 }),
    );
    let schedules = list["schedules"].as_array().expect("schedules");
    let active: Vec<i64> = schedules
        .iter()
        .filter(|s| s["active"] == true)
        .filter_map(|s| s["id"].as_i64())
        .collect();
    assert_eq!(active, vec![s2]);

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn omitted_association_is_removed_with_its_groups_and_rooms() {
    let workspace = temp_dir("organizer-activation-removed");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    seed_scope(&mut stdin, &mut reader, &workspace);
    let db = open_db(&workspace);

    let s1 = upload(
        &mut stdin,
        &mut reader,
        "1",
        json!({
            "100": {
                "7": { "groups": [3], "rooms": [4] },
                "8": { "groups": [3] }
            }
        }),
    );
    activate(&mut stdin, &mut reader, "2", s1);

    let s3 = upload(
        &mut stdin,
        &mut reader,
        "3",
        json!({ "100": { "8": { "groups": [3] } } }),
    );
    let res = activate(&mut stdin, &mut reader, "4", s3);
    assert_eq!(res["summary"]["persons"]["removed"], 1);

    assert_eq!(person_status(&db, 100, 7).as_deref(), Some("removed"));
    assert_eq!(
        child_status(&db, "instance_groups", "group_id", 100, 7, 3).as_deref(),
        Some("removed")
    );
    assert_eq!(
        child_status(&db, "instance_rooms", "room_id", 100, 7, 4).as_deref(),
        Some("removed")
    );
    assert_eq!(person_status(&db, 100, 8).as_deref(), Some("none"));

    // Every association of the active snapshot is live; every other one is removed.
    let mut stmt = db
        .prepare("SELECT instance_id, person_id, delta FROM instance_persons")
        .expect("prepare");
    let rows: Vec<(i64, i64, String)> = stmt
        .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
        .expect("query")
        .collect::<Result<_, _>>()
        .expect("rows");
    for (instance_id, person_id, delta) in rows {
        let in_active = instance_id == 100 && person_id == 8;
        assert_eq!(delta == "removed", !in_active, "{}/{}", instance_id, person_id);
    }

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn activating_twice_changes_nothing_the_second_time() {
    let workspace = temp_dir("organizer-activation-idempotent");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    seed_scope(&mut stdin, &mut reader, &workspace);
    let db = open_db(&workspace);

    let s1 = upload(
        &mut stdin,
        &mut reader,
        "1",
        json!({ "100": { "7": { "groups": [3] } }, "101": { "8": { "rooms": [4] } } }),
    );
    activate(&mut stdin, &mut reader, "2", s1);
    let snapshot = |db: &rusqlite::Connection| -> Vec<(i64, String, String)> {
        let mut stmt = db
            .prepare("SELECT id, delta, modified FROM instance_persons ORDER BY id")
            .expect("prepare");
        let rows = stmt
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
            .expect("query")
            .collect::<Result<Vec<_>, _>>()
            .expect("rows");
        rows
    };
    let before = snapshot(&db);

    let again = activate(&mut stdin, &mut reader, "3", s1);
    assert_eq!(again["alreadyActive"], true);
    assert_eq!(again["summary"]["transitions"], 0);
    assert_eq!(snapshot(&db), before);

    let ops = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "operations.list",
        json!({ "organizationId": 1 }),
    );
    let activations = ops["operations"]
        .as_array()
        .expect("operations")
        .iter()
        .filter(|o| o["kind"] == "activate")
        .count();
    assert_eq!(activations, 1);

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn role_change_marks_association_changed() {
    let workspace = temp_dir("organizer-activation-role");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    seed_scope(&mut stdin, &mut reader, &workspace);
    let db = open_db(&workspace);

    let s1 = upload(&mut stdin, &mut reader, "1", json!({ "100": { "7": { "roleID": 1 } } }));
    activate(&mut stdin, &mut reader, "2", s1);
    let s2 = upload(&mut stdin, &mut reader, "3", json!({ "100": { "7": { "roleID": 2 } } }));
    let res = activate(&mut stdin, &mut reader, "4", s2);
    assert_eq!(res["summary"]["persons"]["changed"], 1);

    assert_eq!(person_status(&db, 100, 7).as_deref(), Some("changed"));
    let role: i64 = db
        .query_row(
            "SELECT role_id FROM instance_persons WHERE instance_id = 100 AND person_id = 7",
            [],
            |r| r.get(0),
        )
        .expect("role");
    assert_eq!(role, 2);

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn toggle_and_deactivate_leave_statuses_alone() {
    let workspace = temp_dir("organizer-activation-toggle");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    seed_scope(&mut stdin, &mut reader, &workspace);
    let db = open_db(&workspace);

    let s1 = upload(&mut stdin, &mut reader, "1", json!({ "100": { "7": { "groups": [3] } } }));
    let on = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "schedules.toggle",
        json!({ "userId": ADMIN, "scheduleId": s1 }),
    );
    assert_eq!(on["active"], true);
    assert_eq!(person_status(&db, 100, 7).as_deref(), Some("new"));

    let off = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "schedules.toggle",
        json!({ "userId": ADMIN, "scheduleId": s1 }),
    );
    assert_eq!(off["active"], false);
    assert_eq!(person_status(&db, 100, 7).as_deref(), Some("new"));

    let res = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "schedules.deactivate",
        json!({ "userId": ADMIN, "scheduleId": s1 }),
    );
    assert_eq!(res["wasActive"], false);

    // Reactivating the same snapshot against itself as baseline settles to none.
    activate(&mut stdin, &mut reader, "5", s1);
    assert_eq!(person_status(&db, 100, 7).as_deref(), Some("none"));

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn instance_listing_hides_removed_rows_outside_the_window() {
    let workspace = temp_dir("organizer-activation-listing");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    seed_scope(&mut stdin, &mut reader, &workspace);
    let db = open_db(&workspace);

    let s1 = upload(
        &mut stdin,
        &mut reader,
        "1",
        json!({ "100": { "7": { "groups": [3] }, "8": { "groups": [3] } } }),
    );
    activate(&mut stdin, &mut reader, "2", s1);
    let s2 = upload(&mut stdin, &mut reader, "3", json!({ "100": { "8": { "groups": [3] } } }));
    activate(&mut stdin, &mut reader, "4", s2);

    let person_ids = |v: &serde_json::Value| -> Vec<i64> {
        v["instances"]
            .as_array()
            .expect("instances")
            .iter()
            .filter(|i| i["id"] == 100)
            .flat_map(|i| i["persons"].as_array().cloned().unwrap_or_default())
            .filter_map(|p| p["personId"].as_i64())
            .collect()
    };

    let recent = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "instances.list",
        json!({ "organizationId": 1, "termId": 1 }),
    );
    assert_eq!(recent["deltaDays"], 5);
    assert_eq!(person_ids(&recent), vec![7, 8]);

    let hidden = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "instances.list",
        json!({ "organizationId": 1, "termId": 1, "deltaDays": 0 }),
    );
    assert_eq!(person_ids(&hidden), vec![8]);

    // Age the removal beyond the window.
    db.execute(
        "UPDATE instance_persons SET modified = '2000-01-01 00:00:00' WHERE delta = 'removed'",
        [],
    )
    .expect("age removal");
    let aged = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "instances.list",
        json!({ "organizationId": 1, "termId": 1 }),
    );
    assert_eq!(person_ids(&aged), vec![8]);

    let detail = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "instances.get",
        json!({ "instanceId": 100 }),
    );
    let statuses: Vec<(i64, String)> = detail["persons"]
        .as_array()
        .expect("persons")
        .iter()
        .map(|p| {
            (
                p["personId"].as_i64().unwrap_or(0),
                p["status"].as_str().unwrap_or("").to_string(),
            )
        })
        .collect();
    assert_eq!(
        statuses,
        vec![(7, "removed".to_string()), (8, "none".to_string())]
    );

    let empty = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "instances.list",
        json!({ "organizationId": 42, "termId": 1 }),
    );
    assert_eq!(empty["instances"], json!([]));

    let _ = std::fs::remove_dir_all(workspace);
}
