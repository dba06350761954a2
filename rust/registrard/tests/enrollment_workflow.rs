mod test_support;

use serde_json::json;
use test_support::{
    open_db, register_student, seed_school, str_of, submit_enrollment, temp_dir, Sidecar,
};

#[test]
fn enroll_assigns_section_and_links_classes() {
    let workspace = temp_dir("registrard-enroll");
    let mut sc = Sidecar::with_workspace(&workspace);
    let school = seed_school(&mut sc);

    // No profile, no enrollment.
    sc.ok(
        "auth.register",
        json!({ "username": "noprofile", "password": test_support::PASSWORD, "fullName": "N" }),
        None,
    );
    let np = sc.login("noprofile", test_support::PASSWORD);
    assert_eq!(
        sc.err_code(
            "enrollments.submit",
            json!({ "strandId": school.strand_id, "gradeLevel": 11 }),
            Some(&np),
        ),
        "profile_required"
    );

    let (_, student) = register_student(&mut sc, "ana", "100000000001");
    let enrollment_id = submit_enrollment(&mut sc, &school, &student, false);
    assert_eq!(
        sc.err_code(
            "enrollments.submit",
            json!({ "strandId": school.strand_id, "gradeLevel": 11 }),
            Some(&student),
        ),
        "duplicate"
    );

    let enrolled = sc.ok(
        "enrollments.enroll",
        json!({ "enrollmentId": enrollment_id, "sectionId": school.section_id, "remarks": "welcome" }),
        Some(&school.coordinator),
    );
    assert_eq!(enrolled["enrollment"]["status"], json!("enrolled"));
    assert_eq!(enrolled["enrollment"]["sectionId"], json!(school.section_id));
    assert_eq!(enrolled["classesLinked"], json!(2));

    let conn = open_db(&workspace);
    let details: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM class_details WHERE enrollment_id = ?",
            [&enrollment_id],
            |r| r.get(0),
        )
        .expect("count class_details");
    assert_eq!(details, 2);

    let schedule = sc.ok("enrollments.schedule", json!({}), Some(&student));
    let classes = schedule["classes"].as_array().expect("classes");
    assert_eq!(classes.len(), 2);
    assert_eq!(classes[0]["dayOfWeek"], json!("MON"));
    assert_eq!(classes[1]["subjectCode"], json!("PRECAL"));

    let got = sc.ok(
        "enrollments.get",
        json!({ "enrollmentId": enrollment_id }),
        Some(&student),
    );
    let history = got["history"].as_array().expect("history");
    assert_eq!(history.len(), 2);
    assert!(history[0]["fromStatus"].is_null());
    assert_eq!(history[1]["fromStatus"], json!("pending"));
    assert_eq!(history[1]["toStatus"], json!("enrolled"));
    assert_eq!(history[1]["note"], json!("welcome"));

    let inbox = sc.ok("notifications.list", json!({ "unreadOnly": true }), Some(&student));
    assert_eq!(inbox["unread"], json!(2));
    assert!(str_of(&inbox["notifications"][0], "message").contains("officially enrolled"));
    sc.ok("notifications.markRead", json!({}), Some(&student));
    let inbox = sc.ok("notifications.list", json!({}), Some(&student));
    assert_eq!(inbox["unread"], json!(0));

    // Other students cannot peek.
    let (_, other) = register_student(&mut sc, "ben", "100000000002");
    assert_eq!(
        sc.err_code("enrollments.get", json!({ "enrollmentId": enrollment_id }), Some(&other)),
        "forbidden"
    );
    let mine = sc.ok("enrollments.list", json!({}), Some(&other));
    assert_eq!(mine["enrollments"].as_array().map(|a| a.len()), Some(0));

    drop(conn);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn illegal_and_stale_transitions_leave_the_row_alone() {
    let workspace = temp_dir("registrard-transitions");
    let mut sc = Sidecar::with_workspace(&workspace);
    let school = seed_school(&mut sc);
    let (_, student) = register_student(&mut sc, "carla", "100000000003");
    let id = submit_enrollment(&mut sc, &school, &student, false);

    // Students cannot review their own enrollment.
    assert_eq!(
        sc.err_code("enrollments.approve", json!({ "enrollmentId": id }), Some(&student)),
        "forbidden"
    );
    // Faculty without the coordinator flag cannot either.
    assert_eq!(
        sc.err_code("enrollments.approve", json!({ "enrollmentId": id }), Some(&school.faculty)),
        "forbidden"
    );
    assert_eq!(
        sc.err_code("enrollments.resubmit", json!({ "enrollmentId": id }), Some(&student)),
        "illegal_transition"
    );
    assert_eq!(
        sc.err_code("enrollments.reject", json!({ "enrollmentId": id }), Some(&school.registrar)),
        "bad_params"
    );

    sc.ok(
        "enrollments.return",
        json!({ "enrollmentId": id, "remarks": "attach your report card" }),
        Some(&school.registrar),
    );
    // A second reviewer acting on what they saw as pending loses.
    assert_eq!(
        sc.err_code("enrollments.approve", json!({ "enrollmentId": id }), Some(&school.coordinator)),
        "illegal_transition"
    );
    let resubmitted = sc.ok(
        "enrollments.resubmit",
        json!({ "enrollmentId": id, "remarks": "attached" }),
        Some(&student),
    );
    assert_eq!(resubmitted["enrollment"]["status"], json!("pending"));

    sc.ok(
        "enrollments.reject",
        json!({ "enrollmentId": id, "reason": "incomplete requirements" }),
        Some(&school.registrar),
    );
    for method in ["enrollments.approve", "enrollments.enroll", "enrollments.return"] {
        let code = sc.err_code(
            method,
            json!({ "enrollmentId": id, "sectionId": school.section_id, "remarks": "x" }),
            Some(&school.registrar),
        );
        assert_eq!(code, "illegal_transition", "{} from rejected", method);
    }

    let got = sc.ok("enrollments.get", json!({ "enrollmentId": id }), Some(&school.registrar));
    assert_eq!(got["enrollment"]["status"], json!("rejected"));
    assert_eq!(got["enrollment"]["remarks"], json!("incomplete requirements"));
    assert!(got["enrollment"]["sectionId"].is_null());
    assert_eq!(got["history"].as_array().map(|h| h.len()), Some(4));

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn section_guards_capacity_and_strand() {
    let workspace = temp_dir("registrard-capacity");
    let mut sc = Sidecar::with_workspace(&workspace);
    let school = seed_school(&mut sc);
    let reg = Some(school.registrar.as_str());

    let humss = sc.ok("strands.create", json!({ "code": "HUMSS", "name": "Humanities" }), reg);
    let humss_section = sc.ok(
        "sections.create",
        json!({ "strandId": str_of(&humss["strand"], "id"), "gradeLevel": 11, "name": "Mabini" }),
        reg,
    );
    let humss_section_id = str_of(&humss_section["section"], "id").to_string();

    let mut ids = Vec::new();
    for (i, name) in ["dan", "eva", "fay"].iter().enumerate() {
        let (_, token) = register_student(&mut sc, name, &format!("20000000000{}", i));
        ids.push(submit_enrollment(&mut sc, &school, &token, false));
    }

    assert_eq!(
        sc.err_code(
            "enrollments.enroll",
            json!({ "enrollmentId": ids[0], "sectionId": humss_section_id }),
            reg,
        ),
        "section_mismatch"
    );

    // Capacity is 2.
    for id in &ids[..2] {
        sc.ok(
            "enrollments.approve",
            json!({ "enrollmentId": id }),
            reg,
        );
        sc.ok(
            "enrollments.enroll",
            json!({ "enrollmentId": id, "sectionId": school.section_id }),
            reg,
        );
    }
    assert_eq!(
        sc.err_code(
            "enrollments.enroll",
            json!({ "enrollmentId": ids[2], "sectionId": school.section_id }),
            reg,
        ),
        "capacity_full"
    );
    let still = sc.ok("enrollments.get", json!({ "enrollmentId": ids[2] }), reg);
    assert_eq!(still["enrollment"]["status"], json!("pending"));

    let listed = sc.ok(
        "enrollments.list",
        json!({ "status": "enrolled", "sectionId": school.section_id }),
        reg,
    );
    assert_eq!(listed["enrollments"].as_array().map(|a| a.len()), Some(2));

    let summary = sc.ok("reports.enrollmentSummary", json!({}), reg);
    assert_eq!(summary["total"], json!(3));
    assert_eq!(summary["byStatus"]["enrolled"], json!(2));
    assert_eq!(summary["byStatus"]["pending"], json!(1));
    assert_eq!(summary["byStatus"]["rejected"], json!(0));

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn transferee_needs_approved_evaluation_before_enrollment() {
    let workspace = temp_dir("registrard-transferee");
    let mut sc = Sidecar::with_workspace(&workspace);
    let school = seed_school(&mut sc);
    let (_, student) = register_student(&mut sc, "gio", "300000000001");
    let id = submit_enrollment(&mut sc, &school, &student, true);

    let got = sc.ok("enrollments.get", json!({ "enrollmentId": id }), Some(&student));
    assert_eq!(got["enrollment"]["isTransferee"], json!(true));
    assert_eq!(got["enrollment"]["evaluationStatus"], json!("evaluation_pending"));

    assert_eq!(
        sc.err_code(
            "enrollments.enroll",
            json!({ "enrollmentId": id, "sectionId": school.section_id }),
            Some(&school.coordinator),
        ),
        "evaluation_required"
    );

    let evaluated = sc.ok(
        "enrollments.evaluateTransferee",
        json!({
            "enrollmentId": id,
            "decision": "approved",
            "credits": [{ "subjectId": school.subject_ids[0], "grade": 88 }]
        }),
        Some(&school.coordinator),
    );
    assert_eq!(evaluated["enrollment"]["evaluationStatus"], json!("evaluation_approved"));
    assert_eq!(evaluated["credits"][0]["subjectCode"], json!("ORALCOM"));

    assert_eq!(
        sc.err_code(
            "enrollments.evaluateTransferee",
            json!({ "enrollmentId": id, "decision": "rejected" }),
            Some(&school.coordinator),
        ),
        "illegal_transition"
    );

    let enrolled = sc.ok(
        "enrollments.enroll",
        json!({ "enrollmentId": id, "sectionId": school.section_id }),
        Some(&school.coordinator),
    );
    assert_eq!(enrolled["enrollment"]["status"], json!("enrolled"));

    // Regular enrollments have nothing to evaluate.
    let (_, other) = register_student(&mut sc, "hana", "300000000002");
    let regular = submit_enrollment(&mut sc, &school, &other, false);
    assert_eq!(
        sc.err_code(
            "enrollments.evaluateTransferee",
            json!({ "enrollmentId": regular, "decision": "approved" }),
            Some(&school.registrar),
        ),
        "bad_params"
    );

    sc.ok(
        "setup.update",
        json!({ "section": "enrollment", "patch": { "allowTransferees": false } }),
        Some(&school.registrar),
    );
    let (_, late) = register_student(&mut sc, "ivy", "300000000003");
    assert_eq!(
        sc.err_code(
            "enrollments.submit",
            json!({ "strandId": school.strand_id, "gradeLevel": 11, "isTransferee": true }),
            Some(&late),
        ),
        "bad_params"
    );

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn approval_can_be_required_before_enrollment() {
    let workspace = temp_dir("registrard-policy");
    let mut sc = Sidecar::with_workspace(&workspace);
    let school = seed_school(&mut sc);
    sc.ok(
        "setup.update",
        json!({ "section": "enrollment", "patch": { "requireApprovalBeforeEnroll": true } }),
        Some(&school.registrar),
    );
    let (_, student) = register_student(&mut sc, "jun", "400000000001");
    let id = submit_enrollment(&mut sc, &school, &student, false);
    assert_eq!(
        sc.err_code(
            "enrollments.enroll",
            json!({ "enrollmentId": id, "sectionId": school.section_id }),
            Some(&school.registrar),
        ),
        "illegal_transition"
    );
    sc.ok("enrollments.approve", json!({ "enrollmentId": id }), Some(&school.registrar));
    sc.ok(
        "enrollments.enroll",
        json!({ "enrollmentId": id, "sectionId": school.section_id }),
        Some(&school.registrar),
    );

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn last_seat_goes_to_one_sidecar_only() {
    let workspace = temp_dir("registrard-last-seat");
    let mut first = Sidecar::with_workspace(&workspace);
    let school = seed_school(&mut first);
    let reg = Some(school.registrar.as_str());
    first.ok(
        "sections.update",
        json!({ "sectionId": school.section_id, "capacity": 1 }),
        reg,
    );
    let (_, ana) = register_student(&mut first, "ana", "210000000001");
    let (_, ben) = register_student(&mut first, "ben", "210000000002");
    let ana_id = submit_enrollment(&mut first, &school, &ana, false);
    let ben_id = submit_enrollment(&mut first, &school, &ben, false);

    // A second process on the same workspace shares the sessions table.
    let mut second = Sidecar::with_workspace(&workspace);
    first.ok(
        "enrollments.enroll",
        json!({ "enrollmentId": ana_id, "sectionId": school.section_id }),
        reg,
    );
    let full = second.call(
        "enrollments.enroll",
        json!({ "enrollmentId": ben_id, "sectionId": school.section_id }),
        reg,
    );
    assert_eq!(full["error"]["code"], json!("capacity_full"));
    assert_eq!(full["error"]["details"]["enrolled"], json!(1));

    let listed = second.ok(
        "enrollments.list",
        json!({ "status": "enrolled", "sectionId": school.section_id }),
        reg,
    );
    assert_eq!(listed["enrollments"].as_array().map(|a| a.len()), Some(1));

    let _ = std::fs::remove_dir_all(workspace);
}
