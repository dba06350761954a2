mod test_support;

use serde_json::{json, Value};
use test_support::{register_student, seed_school, submit_enrollment, temp_dir, Sidecar, School, PASSWORD};

fn enroll(sc: &mut Sidecar, school: &School, username: &str, lrn: &str) -> (String, String) {
    let (id, token) = register_student(sc, username, lrn);
    let enrollment = submit_enrollment(sc, school, &token, false);
    sc.ok(
        "enrollments.enroll",
        json!({ "enrollmentId": enrollment, "sectionId": school.section_id }),
        Some(&school.registrar),
    );
    (id, token)
}

fn row_for<'a>(roster: &'a Value, student_id: &str) -> &'a Value {
    roster["students"]
        .as_array()
        .expect("students")
        .iter()
        .find(|r| r["studentId"] == json!(student_id))
        .expect("student on roster")
}

#[test]
fn encode_submit_return_approve() {
    let workspace = temp_dir("registrard-grades");
    let mut sc = Sidecar::with_workspace(&workspace);
    let school = seed_school(&mut sc);
    let (ana, ana_token) = enroll(&mut sc, &school, "ana", "500000000001");
    let (ben, ben_token) = enroll(&mut sc, &school, "ben", "500000000002");
    let load = school.load_ids[0].clone();
    let faculty = Some(school.faculty.as_str());
    let registrar = Some(school.registrar.as_str());

    let roster = sc.ok("grades.roster", json!({ "facultyLoadId": load }), faculty);
    assert_eq!(roster["students"].as_array().map(|a| a.len()), Some(2));
    assert_eq!(row_for(&roster, &ana)["status"], json!("draft"));

    let encoded = sc.ok(
        "grades.encode",
        json!({
            "facultyLoadId": load,
            "entries": [
                { "studentId": ana, "q1": 85, "q2": 90 },
                { "studentId": ben, "q1": 70 }
            ]
        }),
        faculty,
    );
    // 87.5 rounds half up.
    assert_eq!(row_for(&encoded, &ana)["semesterGrade"], json!(88));
    assert_eq!(row_for(&encoded, &ana)["remarks"], json!("Passed"));
    assert!(row_for(&encoded, &ben)["semesterGrade"].is_null());

    let incomplete = sc.call("grades.submit", json!({ "facultyLoadId": load }), faculty);
    assert_eq!(incomplete["error"]["code"], json!("incomplete_grades"));
    assert_eq!(incomplete["error"]["details"]["studentIds"], json!([ben]));

    let encoded = sc.ok(
        "grades.encode",
        json!({ "facultyLoadId": load, "entries": [{ "studentId": ben, "q2": 74 }] }),
        faculty,
    );
    assert_eq!(row_for(&encoded, &ben)["q1"], json!(70.0));
    assert_eq!(row_for(&encoded, &ben)["semesterGrade"], json!(72));
    assert_eq!(row_for(&encoded, &ben)["remarks"], json!("Failed"));

    let submitted = sc.ok("grades.submit", json!({ "facultyLoadId": load }), faculty);
    assert_eq!(submitted["submitted"], json!(2));

    // Submitted grades are locked.
    assert_eq!(
        sc.err_code(
            "grades.encode",
            json!({ "facultyLoadId": load, "entries": [{ "studentId": ben, "q2": 80 }] }),
            faculty,
        ),
        "illegal_transition"
    );
    assert_eq!(
        sc.err_code("grades.submit", json!({ "facultyLoadId": load }), faculty),
        "illegal_transition"
    );
    // Nothing is visible to students before approval.
    let early = sc.ok("grades.student", json!({}), Some(&ana_token));
    assert_eq!(early["terms"], json!([]));

    assert_eq!(
        sc.err_code("grades.return", json!({ "facultyLoadId": load }), registrar),
        "bad_params"
    );
    assert_eq!(
        sc.err_code(
            "grades.approve",
            json!({ "facultyLoadId": load }),
            Some(&school.coordinator),
        ),
        "forbidden"
    );
    sc.ok(
        "grades.return",
        json!({ "facultyLoadId": load, "remarks": "check Ben's second quarter" }),
        registrar,
    );
    let roster = sc.ok("grades.roster", json!({ "facultyLoadId": load }), registrar);
    assert_eq!(row_for(&roster, &ben)["status"], json!("returned"));
    assert_eq!(row_for(&roster, &ben)["returnNote"], json!("check Ben's second quarter"));

    let encoded = sc.ok(
        "grades.encode",
        json!({ "facultyLoadId": load, "entries": [{ "studentId": ben, "q2": 80 }] }),
        faculty,
    );
    assert_eq!(row_for(&encoded, &ben)["semesterGrade"], json!(75));
    assert_eq!(row_for(&encoded, &ben)["remarks"], json!("Passed"));
    sc.ok("grades.submit", json!({ "facultyLoadId": load }), faculty);
    let approved = sc.ok("grades.approve", json!({ "facultyLoadId": load }), registrar);
    assert_eq!(approved["approved"], json!(2));
    assert_eq!(
        sc.err_code("grades.approve", json!({ "facultyLoadId": load }), registrar),
        "illegal_transition"
    );

    let report = sc.ok("grades.student", json!({}), Some(&ana_token));
    let terms = report["terms"].as_array().expect("terms");
    assert_eq!(terms.len(), 1);
    assert_eq!(terms[0]["yearStart"], json!(2025));
    assert_eq!(terms[0]["semester"], json!(1));
    assert_eq!(terms[0]["grades"][0]["subjectCode"], json!("ORALCOM"));
    assert_eq!(terms[0]["grades"][0]["semesterGrade"], json!(88));
    assert_eq!(terms[0]["generalAverage"], json!(88.0));
    assert_eq!(terms[0]["remarks"], json!("Passed"));

    assert_eq!(
        sc.err_code("grades.student", json!({ "studentId": ana }), Some(&ben_token)),
        "forbidden"
    );
    let by_staff = sc.ok("grades.student", json!({ "studentId": ben }), registrar);
    assert_eq!(by_staff["terms"][0]["grades"][0]["semesterGrade"], json!(75));

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn encoding_guards() {
    let workspace = temp_dir("registrard-grade-guards");
    let mut sc = Sidecar::with_workspace(&workspace);
    let school = seed_school(&mut sc);
    let (ana, _) = enroll(&mut sc, &school, "ana", "600000000001");
    let (stray, stray_token) = register_student(&mut sc, "stray", "600000000002");
    submit_enrollment(&mut sc, &school, &stray_token, false);
    let load = school.load_ids[1].clone();
    let faculty = Some(school.faculty.as_str());

    assert_eq!(
        sc.err_code(
            "grades.encode",
            json!({ "facultyLoadId": load, "entries": [{ "studentId": ana, "q1": 59 }] }),
            faculty,
        ),
        "bad_params"
    );
    assert_eq!(
        sc.err_code(
            "grades.encode",
            json!({ "facultyLoadId": load, "entries": [{ "studentId": ana, "q1": 100.5 }] }),
            faculty,
        ),
        "bad_params"
    );
    // Pending enrollments are not on the roster.
    assert_eq!(
        sc.err_code(
            "grades.encode",
            json!({ "facultyLoadId": load, "entries": [{ "studentId": stray, "q1": 80 }] }),
            faculty,
        ),
        "bad_params"
    );
    assert_eq!(
        sc.err_code("grades.submit", json!({ "facultyLoadId": load }), faculty),
        "incomplete_grades"
    );

    // Only the assigned instructor encodes.
    sc.ok(
        "users.create",
        json!({ "username": "other", "password": PASSWORD, "fullName": "Lim, Jose", "role": "faculty" }),
        Some(&school.registrar),
    );
    let other = sc.login("other", PASSWORD);
    assert_eq!(
        sc.err_code(
            "grades.encode",
            json!({ "facultyLoadId": load, "entries": [{ "studentId": ana, "q1": 80 }] }),
            Some(&other),
        ),
        "forbidden"
    );
    assert_eq!(
        sc.err_code("grades.roster", json!({ "facultyLoadId": load }), Some(&other)),
        "forbidden"
    );

    sc.ok(
        "setup.update",
        json!({ "section": "grading", "patch": { "gradeEntryOpen": false } }),
        Some(&school.registrar),
    );
    assert_eq!(
        sc.err_code(
            "grades.encode",
            json!({ "facultyLoadId": load, "entries": [{ "studentId": ana, "q1": 80 }] }),
            faculty,
        ),
        "grade_entry_closed"
    );

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn submitting_an_untouched_empty_load_reports_no_grades() {
    let workspace = temp_dir("registrard-no-grades");
    let mut sc = Sidecar::with_workspace(&workspace);
    let school = seed_school(&mut sc);
    // No students enrolled: the roster is trivially complete but empty.
    assert_eq!(
        sc.err_code(
            "grades.submit",
            json!({ "facultyLoadId": school.load_ids[0] }),
            Some(&school.faculty),
        ),
        "no_grades"
    );
    let _ = std::fs::remove_dir_all(workspace);
}
