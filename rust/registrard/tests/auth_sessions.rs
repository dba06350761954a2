mod test_support;

use serde_json::json;
use test_support::{open_db, str_of, temp_dir, Sidecar, PASSWORD};

#[test]
fn health_and_bad_json_work_without_a_workspace() {
    let mut sc = Sidecar::spawn();
    let health = sc.ok("health", json!({}), None);
    assert!(health["version"].is_string());
    assert!(health["workspacePath"].is_null());

    assert_eq!(sc.err_code("auth.me", json!({}), Some("whatever")), "no_workspace");

    let bad = sc.send_raw("{not json");
    assert_eq!(bad["ok"], json!(false));
    assert_eq!(bad["error"]["code"], json!("bad_json"));

    let unknown = sc.call("nope.nothing", json!({}), None);
    assert_eq!(unknown["error"]["code"], json!("not_implemented"));
}

#[test]
fn bootstrap_login_and_role_gate() {
    let workspace = temp_dir("registrard-auth");
    let mut sc = Sidecar::spawn();
    let sel = sc.ok(
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
        None,
    );
    assert_eq!(sel["needsBootstrap"], json!(true));

    let short = sc.err_code(
        "auth.bootstrap",
        json!({ "username": "registrar", "password": "short", "fullName": "R" }),
        None,
    );
    assert_eq!(short, "bad_params");
    sc.ok(
        "auth.bootstrap",
        json!({ "username": "Registrar", "password": PASSWORD, "fullName": "Reyes, Rosa" }),
        None,
    );
    assert_eq!(
        sc.err_code(
            "auth.bootstrap",
            json!({ "username": "other", "password": PASSWORD, "fullName": "X" }),
            None,
        ),
        "already_bootstrapped"
    );

    assert_eq!(
        sc.err_code(
            "auth.login",
            json!({ "username": "registrar", "password": "wrong-password" }),
            None,
        ),
        "invalid_credentials"
    );
    // Usernames are case-insensitive.
    let registrar = sc.login("REGISTRAR", PASSWORD);
    let me = sc.ok("auth.me", json!({}), Some(&registrar));
    assert_eq!(me["user"]["role"], json!("registrar"));

    assert_eq!(sc.err_code("auth.me", json!({}), None), "unauthenticated");
    assert_eq!(sc.err_code("auth.me", json!({}), Some("forged")), "unauthenticated");

    sc.ok(
        "auth.register",
        json!({ "username": "stud", "password": PASSWORD, "fullName": "Student One" }),
        None,
    );
    let student = sc.login("stud", PASSWORD);
    for (method, params) in [
        ("users.list", json!({})),
        ("users.create", json!({ "username": "x", "password": PASSWORD, "fullName": "X", "role": "faculty" })),
        ("schoolYears.create", json!({ "yearStart": 2025, "semester": 1 })),
        ("strands.create", json!({ "code": "ABM", "name": "ABM" })),
        ("setup.update", json!({ "section": "grading", "patch": { "passingGrade": 60 } })),
        ("reports.enrollmentSummary", json!({})),
        ("backup.exportWorkspace", json!({ "outPath": "/tmp/x.zip" })),
    ] {
        assert_eq!(
            sc.err_code(method, params, Some(&student)),
            "forbidden",
            "{} should be closed to students",
            method
        );
    }

    let users = sc.ok("users.list", json!({ "role": "student" }), Some(&registrar));
    assert_eq!(users["users"].as_array().map(|a| a.len()), Some(1));

    sc.ok("auth.logout", json!({}), Some(&student));
    assert_eq!(sc.err_code("auth.me", json!({}), Some(&student)), "unauthenticated");

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn deactivated_users_lose_their_sessions() {
    let workspace = temp_dir("registrard-deactivate");
    let mut sc = Sidecar::with_workspace(&workspace);
    sc.ok(
        "auth.bootstrap",
        json!({ "username": "registrar", "password": PASSWORD, "fullName": "Reyes, Rosa" }),
        None,
    );
    let registrar = sc.login("registrar", PASSWORD);
    let created = sc.ok(
        "users.create",
        json!({ "username": "instructor", "password": PASSWORD, "fullName": "Santos, Maria", "role": "faculty" }),
        Some(&registrar),
    );
    let instructor_id = str_of(&created["user"], "id").to_string();
    let instructor = sc.login("instructor", PASSWORD);

    let me = sc.ok("auth.me", json!({}), Some(&registrar));
    let registrar_id = str_of(&me["user"], "id").to_string();
    assert_eq!(
        sc.err_code(
            "users.setActive",
            json!({ "userId": registrar_id, "active": false }),
            Some(&registrar),
        ),
        "bad_params"
    );

    sc.ok(
        "users.setActive",
        json!({ "userId": instructor_id, "active": false }),
        Some(&registrar),
    );
    assert_eq!(sc.err_code("auth.me", json!({}), Some(&instructor)), "unauthenticated");
    assert_eq!(
        sc.err_code(
            "auth.login",
            json!({ "username": "instructor", "password": PASSWORD }),
            None,
        ),
        "invalid_credentials"
    );

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn password_reset_goes_through_the_outbox() {
    let workspace = temp_dir("registrard-reset");
    let mut sc = Sidecar::with_workspace(&workspace);
    sc.ok(
        "auth.bootstrap",
        json!({
            "username": "registrar", "password": PASSWORD, "fullName": "Reyes, Rosa",
            "email": "registrar@example.edu"
        }),
        None,
    );

    // Unknown accounts get the same answer and nothing is queued.
    let queued = sc.ok(
        "auth.requestPasswordReset",
        json!({ "username": "nobody" }),
        None,
    );
    assert_eq!(queued["queued"], json!(true));
    let conn = open_db(&workspace);
    let mails: i64 = conn
        .query_row("SELECT COUNT(*) FROM mail_outbox", [], |r| r.get(0))
        .expect("count");
    assert_eq!(mails, 0);

    sc.ok(
        "auth.requestPasswordReset",
        json!({ "username": "registrar@example.edu" }),
        None,
    );
    let (to, body): (String, String) = conn
        .query_row("SELECT to_address, body FROM mail_outbox", [], |r| {
            Ok((r.get(0)?, r.get(1)?))
        })
        .expect("mail");
    assert_eq!(to, "registrar@example.edu");
    let otp: String = body
        .split("Your password reset code is ")
        .nth(1)
        .expect("otp line")
        .chars()
        .take(6)
        .collect();
    assert!(otp.chars().all(|c| c.is_ascii_digit()));

    assert_eq!(
        sc.err_code(
            "auth.resetPassword",
            json!({ "username": "registrar", "otp": "000000x", "newPassword": "brand-new-pass" }),
            None,
        ),
        "invalid_credentials"
    );
    sc.ok(
        "auth.resetPassword",
        json!({ "username": "registrar", "otp": otp, "newPassword": "brand-new-pass" }),
        None,
    );
    // A code works once.
    assert_eq!(
        sc.err_code(
            "auth.resetPassword",
            json!({ "username": "registrar", "otp": otp, "newPassword": "another-pass-1" }),
            None,
        ),
        "invalid_credentials"
    );
    assert_eq!(
        sc.err_code(
            "auth.login",
            json!({ "username": "registrar", "password": PASSWORD }),
            None,
        ),
        "invalid_credentials"
    );
    sc.login("registrar", "brand-new-pass");

    drop(conn);
    let _ = std::fs::remove_dir_all(workspace);
}

fn latest_otp(conn: &rusqlite::Connection) -> String {
    let body: String = conn
        .query_row(
            "SELECT body FROM mail_outbox ORDER BY rowid DESC LIMIT 1",
            [],
            |r| r.get(0),
        )
        .expect("mail");
    body.split("Your password reset code is ")
        .nth(1)
        .expect("otp line")
        .chars()
        .take(6)
        .collect()
}

#[test]
fn reset_codes_are_spent_after_repeated_misses() {
    let workspace = temp_dir("registrard-reset-lockout");
    let mut sc = Sidecar::with_workspace(&workspace);
    sc.ok(
        "auth.bootstrap",
        json!({
            "username": "registrar", "password": PASSWORD, "fullName": "Reyes, Rosa",
            "email": "registrar@example.edu"
        }),
        None,
    );
    sc.ok("auth.requestPasswordReset", json!({ "username": "registrar" }), None);
    let conn = open_db(&workspace);
    let otp = latest_otp(&conn);
    let wrong = if otp == "000000" { "000001" } else { "000000" };

    for _ in 0..5 {
        assert_eq!(
            sc.err_code(
                "auth.resetPassword",
                json!({ "username": "registrar", "otp": wrong, "newPassword": "brand-new-pass" }),
                None,
            ),
            "invalid_credentials"
        );
    }
    // The right code no longer works.
    assert_eq!(
        sc.err_code(
            "auth.resetPassword",
            json!({ "username": "registrar", "otp": otp, "newPassword": "brand-new-pass" }),
            None,
        ),
        "invalid_credentials"
    );
    let (attempts, spent): (i64, bool) = conn
        .query_row(
            "SELECT attempts, used_at IS NOT NULL FROM password_resets",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .expect("reset row");
    assert_eq!(attempts, 5);
    assert!(spent);
    sc.login("registrar", PASSWORD);

    // A fresh code starts a fresh count.
    sc.ok("auth.requestPasswordReset", json!({ "username": "registrar" }), None);
    let fresh = latest_otp(&conn);
    let wrong = if fresh == "000000" { "000001" } else { "000000" };
    assert_eq!(
        sc.err_code(
            "auth.resetPassword",
            json!({ "username": "registrar", "otp": wrong, "newPassword": "brand-new-pass" }),
            None,
        ),
        "invalid_credentials"
    );
    sc.ok(
        "auth.resetPassword",
        json!({ "username": "registrar", "otp": fresh, "newPassword": "brand-new-pass" }),
        None,
    );
    sc.login("registrar", "brand-new-pass");

    drop(conn);
    let _ = std::fs::remove_dir_all(workspace);
}
