mod test_support;

use serde_json::json;
use test_support::{
    open_db, register_student, seed_school, str_of, submit_enrollment, temp_dir, Sidecar,
};

#[test]
fn cor_is_issued_verified_and_rendered() {
    let workspace = temp_dir("registrard-cor");
    let mut sc = Sidecar::with_workspace(&workspace);
    let school = seed_school(&mut sc);
    let reg = Some(school.registrar.as_str());
    sc.ok(
        "setup.update",
        json!({ "section": "school", "patch": { "schoolName": "Rizal <National> High School", "schoolId": "301234" } }),
        reg,
    );

    let (_, student) = register_student(&mut sc, "ana", "700000000001");
    let enrollment = submit_enrollment(&mut sc, &school, &student, false);

    assert_eq!(
        sc.err_code("cor.generate", json!({ "enrollmentId": enrollment }), reg),
        "not_enrolled"
    );
    sc.ok(
        "enrollments.enroll",
        json!({ "enrollmentId": enrollment, "sectionId": school.section_id }),
        reg,
    );
    assert_eq!(
        sc.err_code("cor.generate", json!({ "enrollmentId": enrollment }), Some(&student)),
        "forbidden"
    );

    let first = sc.ok("cor.generate", json!({ "enrollmentId": enrollment }), reg);
    let cor = &first["cor"];
    assert_eq!(cor["corNo"], json!("COR-2025-00001"));
    assert_eq!(cor["version"], json!(1));
    assert_eq!(cor["snapshot"]["student"]["name"], json!("ANA, Test M."));
    assert_eq!(cor["snapshot"]["student"]["lrn"], json!("700000000001"));
    assert_eq!(cor["snapshot"]["section"], json!("Rizal"));
    assert_eq!(cor["snapshot"]["adviser"], json!("Santos, Maria"));
    assert_eq!(cor["snapshot"]["school"]["schoolId"], json!("301234"));
    let subjects = cor["snapshot"]["subjects"].as_array().expect("subjects");
    assert_eq!(subjects.len(), 2);
    assert_eq!(subjects[0]["code"], json!("ORALCOM"));
    assert_eq!(subjects[0]["schedule"][0]["day"], json!("MON"));
    assert_eq!(subjects[1]["schedule"][0]["start"], json!("10:00"));
    assert_eq!(cor["totalHours"], json!(160));
    let checksum = str_of(cor, "checksum").to_string();
    assert_eq!(checksum.len(), 64);

    let verified = sc.ok(
        "cor.verify",
        json!({ "corNo": "COR-2025-00001", "checksum": checksum.to_uppercase() }),
        Some(&student),
    );
    assert_eq!(verified["valid"], json!(true));
    assert!(verified["reason"].is_null());
    assert_eq!(verified["studentName"], json!("ANA, Test M."));

    let wrong = sc.ok(
        "cor.verify",
        json!({ "corNo": "COR-2025-00001", "checksum": "00".repeat(32) }),
        reg,
    );
    assert_eq!(wrong["reason"], json!("checksum_mismatch"));
    let unknown = sc.ok("cor.verify", json!({ "corNo": "COR-1999-00001" }), reg);
    assert_eq!(unknown["valid"], json!(false));
    assert_eq!(unknown["reason"], json!("unknown"));

    let out = workspace.join("print").join("cor.html");
    let rendered = sc.ok(
        "cor.renderHtml",
        json!({ "enrollmentId": enrollment, "outPath": out.to_string_lossy() }),
        Some(&student),
    );
    let html = rendered["html"].as_str().expect("html");
    assert!(html.contains("COR-2025-00001"));
    assert!(html.contains("Rizal &lt;National&gt; High School"));
    assert!(html.contains(&checksum));
    let on_disk = std::fs::read_to_string(&out).expect("written html");
    assert_eq!(on_disk, html);

    // Regenerating keeps the old version and issues a new number.
    let second = sc.ok("cor.generate", json!({ "enrollmentId": enrollment }), Some(&school.coordinator));
    assert_eq!(second["cor"]["version"], json!(2));
    assert_eq!(second["cor"]["corNo"], json!("COR-2025-00002"));
    let latest = sc.ok("cor.get", json!({ "enrollmentId": enrollment }), Some(&student));
    assert_eq!(latest["cor"]["version"], json!(2));
    let older = sc.ok("cor.get", json!({ "enrollmentId": enrollment, "version": 1 }), reg);
    assert_eq!(older["cor"]["corNo"], json!("COR-2025-00001"));

    // Another student cannot read it.
    let (_, other) = register_student(&mut sc, "ben", "700000000002");
    assert_eq!(
        sc.err_code("cor.get", json!({ "corNo": "COR-2025-00001" }), Some(&other)),
        "forbidden"
    );
    assert_eq!(
        sc.err_code("cor.renderHtml", json!({ "enrollmentId": enrollment }), Some(&other)),
        "forbidden"
    );

    // Editing the stored snapshot is detected.
    let conn = open_db(&workspace);
    conn.execute(
        "UPDATE certificates_of_registration
         SET snapshot_json = json_set(snapshot_json, '$.section', 'Mabini')
         WHERE cor_no = 'COR-2025-00001'",
        [],
    )
    .expect("tamper");
    let tampered = sc.ok("cor.verify", json!({ "corNo": "COR-2025-00001" }), reg);
    assert_eq!(tampered["valid"], json!(false));
    assert_eq!(tampered["reason"], json!("tampered"));
    let intact = sc.ok("cor.verify", json!({ "corNo": "COR-2025-00002" }), reg);
    assert_eq!(intact["valid"], json!(true));

    let inbox = sc.ok("notifications.list", json!({}), Some(&student));
    assert!(inbox["notifications"][0]["message"]
        .as_str()
        .is_some_and(|m| m.contains("COR-2025-00002")));

    drop(conn);
    let _ = std::fs::remove_dir_all(workspace);
}
