mod test_support;

use serde_json::json;
use test_support::{
    register_student, seed_school, submit_enrollment, temp_dir, Sidecar, School, PASSWORD,
};

fn enroll(sc: &mut Sidecar, school: &School, username: &str, lrn: &str) -> String {
    let (id, token) = register_student(sc, username, lrn);
    let enrollment = submit_enrollment(sc, school, &token, false);
    sc.ok(
        "enrollments.enroll",
        json!({ "enrollmentId": enrollment, "sectionId": school.section_id }),
        Some(&school.registrar),
    );
    id
}

#[test]
fn roster_grade_sheet_and_load_summary() {
    let workspace = temp_dir("registrard-reports");
    let mut sc = Sidecar::with_workspace(&workspace);
    let school = seed_school(&mut sc);
    let reg = Some(school.registrar.as_str());
    let ana = enroll(&mut sc, &school, "ana", "800000000001");
    enroll(&mut sc, &school, "ben", "800000000002");

    let out = workspace.join("exports").join("rizal.csv");
    let roster = sc.ok(
        "reports.sectionRoster",
        json!({ "sectionId": school.section_id, "outPath": out.to_string_lossy() }),
        Some(&school.faculty),
    );
    assert_eq!(roster["rowsExported"], json!(2));
    let csv = roster["csv"].as_str().expect("csv");
    let lines: Vec<&str> = csv.lines().collect();
    assert_eq!(
        lines,
        vec![
            "no,lrn,last_name,first_name,middle_name,sex,strand,grade_level,section,type",
            "1,800000000001,ANA,Test,Middle,F,STEM,11,Rizal,regular",
            "2,800000000002,BEN,Test,Middle,F,STEM,11,Rizal,regular",
        ]
    );
    assert_eq!(std::fs::read_to_string(&out).expect("written csv"), csv);

    sc.ok(
        "grades.encode",
        json!({
            "facultyLoadId": school.load_ids[0],
            "entries": [{ "studentId": ana, "q1": 85, "q2": 90.5 }]
        }),
        Some(&school.faculty),
    );
    let sheet = sc.ok(
        "reports.gradeSheet",
        json!({ "facultyLoadId": school.load_ids[0] }),
        Some(&school.faculty),
    );
    let lines: Vec<&str> = sheet["csv"].as_str().expect("csv").lines().collect();
    assert_eq!(lines[0], "lrn,student_name,q1,q2,semester_grade,remarks,status");
    assert_eq!(lines[1], "800000000001,\"ANA, Test\",85,90.50,88,Passed,draft");
    assert_eq!(lines[2], "800000000002,\"BEN, Test\",,,,,draft");
    assert!(sheet["path"].is_null());

    sc.ok(
        "users.create",
        json!({ "username": "lim", "password": PASSWORD, "fullName": "Lim, Jose", "role": "faculty" }),
        reg,
    );
    let lim = sc.login("lim", PASSWORD);
    assert_eq!(
        sc.err_code("reports.gradeSheet", json!({ "facultyLoadId": school.load_ids[0] }), Some(&lim)),
        "forbidden"
    );
    assert_eq!(
        sc.err_code("reports.facultyLoadSummary", json!({}), Some(&lim)),
        "forbidden"
    );

    let summary = sc.ok("reports.facultyLoadSummary", json!({}), Some(&school.coordinator));
    let faculty = summary["faculty"].as_array().expect("faculty");
    assert_eq!(faculty.len(), 1);
    assert_eq!(faculty[0]["facultyName"], json!("Santos, Maria"));
    assert_eq!(faculty[0]["loadCount"], json!(2));
    assert_eq!(faculty[0]["totalHours"], json!(160));
    assert_eq!(faculty[0]["weeklyMinutes"], json!(150));
    assert_eq!(faculty[0]["subjects"], json!(["ORALCOM", "PRECAL"]));
    assert_eq!(faculty[0]["sections"], json!(["Rizal"]));

    let enrollment = sc.ok("reports.enrollmentSummary", json!({}), reg);
    assert_eq!(enrollment["sections"][0]["enrolled"], json!(2));
    assert_eq!(enrollment["sections"][0]["available"], json!(0));
    assert_eq!(enrollment["byStrand"][0]["strandCode"], json!("STEM"));
    assert_eq!(enrollment["byStrand"][0]["enrolled"], json!(2));

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn backup_round_trip_over_ipc() {
    let workspace = temp_dir("registrard-backup");
    let mut sc = Sidecar::with_workspace(&workspace);
    let school = seed_school(&mut sc);
    let reg = Some(school.registrar.as_str());

    let bundle = workspace.join("backups").join("snapshot.zip");
    let exported = sc.ok(
        "backup.exportWorkspace",
        json!({ "outPath": bundle.to_string_lossy() }),
        reg,
    );
    assert_eq!(exported["bundleFormat"], json!("registrar-workspace-v1"));
    assert!(bundle.is_file());
    let digest = exported["dbSha256"].as_str().expect("digest").to_string();

    // Changes after the export are rolled back by the import.
    sc.ok("strands.create", json!({ "code": "ABM", "name": "Accountancy" }), reg);
    assert_eq!(
        sc.ok("strands.list", json!({}), reg)["strands"].as_array().map(|a| a.len()),
        Some(2)
    );

    assert_eq!(
        sc.err_code(
            "backup.importWorkspace",
            json!({ "inPath": bundle.to_string_lossy() }),
            Some(&school.faculty),
        ),
        "forbidden"
    );
    let imported = sc.ok(
        "backup.importWorkspace",
        json!({ "inPath": bundle.to_string_lossy() }),
        reg,
    );
    assert_eq!(imported["bundleFormatDetected"], json!("registrar-workspace-v1"));
    assert_eq!(imported["dbSha256"], json!(digest));

    // The session was in the snapshot, so the token still works.
    let strands = sc.ok("strands.list", json!({}), reg);
    let codes: Vec<&str> = strands["strands"]
        .as_array()
        .expect("strands")
        .iter()
        .filter_map(|s| s["code"].as_str())
        .collect();
    assert_eq!(codes, vec!["STEM"]);

    let missing = workspace.join("nope.zip");
    assert_eq!(
        sc.err_code(
            "backup.importWorkspace",
            json!({ "inPath": missing.to_string_lossy() }),
            reg,
        ),
        "import_failed"
    );
    // A failed import leaves the workspace usable.
    sc.ok("auth.me", json!({}), reg);

    let notes = workspace.join("notes.txt");
    std::fs::write(&notes, "hello, this is not a database").expect("write notes");
    assert_eq!(
        sc.err_code(
            "backup.importWorkspace",
            json!({ "inPath": notes.to_string_lossy() }),
            reg,
        ),
        "import_failed"
    );
    let strands = sc.ok("strands.list", json!({}), reg);
    assert_eq!(strands["strands"][0]["code"], json!("STEM"));

    let _ = std::fs::remove_dir_all(workspace);
}
