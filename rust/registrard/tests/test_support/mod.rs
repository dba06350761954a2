#![allow(dead_code)]

use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

pub const PASSWORD: &str = "correct-horse-1";

pub fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}-{}",
        prefix,
        std::process::id(),
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

pub struct Sidecar {
    child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    next_id: u64,
}

impl Sidecar {
    pub fn spawn() -> Self {
        let exe = env!("CARGO_BIN_EXE_registrard");
        let mut child = Command::new(exe)
            .arg("serve")
            .env_remove("REGISTRARD_WORKSPACE")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn registrard");
        let stdin = child.stdin.take().expect("child stdin");
        let stdout = child.stdout.take().expect("child stdout");
        Sidecar {
            child,
            stdin,
            reader: BufReader::new(stdout),
            next_id: 0,
        }
    }

    /// Spawns the sidecar with `workspace` already selected.
    pub fn with_workspace(workspace: &Path) -> Self {
        let mut sc = Self::spawn();
        sc.ok(
            "workspace.select",
            json!({ "path": workspace.to_string_lossy() }),
            None,
        );
        sc
    }

    pub fn send_raw(&mut self, line: &str) -> Value {
        writeln!(self.stdin, "{}", line).expect("write request");
        self.stdin.flush().expect("flush request");
        let mut out = String::new();
        self.reader.read_line(&mut out).expect("read response line");
        assert!(!out.trim().is_empty(), "empty response");
        serde_json::from_str(out.trim()).expect("parse response json")
    }

    /// Full response envelope.
    pub fn call(&mut self, method: &str, params: Value, token: Option<&str>) -> Value {
        self.next_id += 1;
        let id = self.next_id.to_string();
        let mut payload = json!({ "id": id, "method": method, "params": params });
        if let Some(t) = token {
            payload["token"] = json!(t);
        }
        let value = self.send_raw(&payload.to_string());
        assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id.as_str()));
        value
    }

    pub fn ok(&mut self, method: &str, params: Value, token: Option<&str>) -> Value {
        let value = self.call(method, params, token);
        assert_eq!(
            value.get("ok").and_then(|v| v.as_bool()),
            Some(true),
            "{} failed: {}",
            method,
            value
        );
        value.get("result").cloned().unwrap_or(Value::Null)
    }

    /// Error code of a call that must fail.
    pub fn err_code(&mut self, method: &str, params: Value, token: Option<&str>) -> String {
        let value = self.call(method, params, token);
        assert_eq!(
            value.get("ok").and_then(|v| v.as_bool()),
            Some(false),
            "{} unexpectedly succeeded: {}",
            method,
            value
        );
        value["error"]["code"]
            .as_str()
            .expect("error code")
            .to_string()
    }

    pub fn login(&mut self, username: &str, password: &str) -> String {
        let res = self.ok(
            "auth.login",
            json!({ "username": username, "password": password }),
            None,
        );
        res["token"].as_str().expect("token").to_string()
    }
}

impl Drop for Sidecar {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

pub fn open_db(workspace: &Path) -> rusqlite::Connection {
    rusqlite::Connection::open(workspace.join("registrar.sqlite3")).expect("open db")
}

pub fn str_of<'a>(v: &'a Value, key: &str) -> &'a str {
    v[key]
        .as_str()
        .unwrap_or_else(|| panic!("missing string {} in {}", key, v))
}

/// A school with one open semester, a STEM grade 11 section, two subjects
/// taught by one faculty member, and a MON/WED schedule.
pub struct School {
    pub registrar: String,
    pub coordinator: String,
    pub faculty: String,
    pub faculty_id: String,
    pub school_year_id: String,
    pub strand_id: String,
    pub section_id: String,
    pub subject_ids: Vec<String>,
    pub load_ids: Vec<String>,
}

pub fn seed_school(sc: &mut Sidecar) -> School {
    sc.ok(
        "auth.bootstrap",
        json!({ "username": "registrar", "password": PASSWORD, "fullName": "Reyes, Rosa" }),
        None,
    );
    let registrar = sc.login("registrar", PASSWORD);
    let reg = Some(registrar.as_str());

    let faculty = sc.ok(
        "users.create",
        json!({
            "username": "instructor", "password": PASSWORD, "fullName": "Santos, Maria",
            "role": "faculty", "email": "instructor@example.edu"
        }),
        reg,
    );
    let faculty_id = str_of(&faculty["user"], "id").to_string();
    sc.ok(
        "users.create",
        json!({
            "username": "coord", "password": PASSWORD, "fullName": "Cruz, Carlo",
            "role": "coordinator"
        }),
        reg,
    );

    let sy = sc.ok(
        "schoolYears.create",
        json!({ "yearStart": 2025, "semester": 1, "startDate": "2025-06-16", "endDate": "2025-10-31" }),
        reg,
    );
    let school_year_id = str_of(&sy["schoolYear"], "id").to_string();
    sc.ok(
        "schoolYears.activate",
        json!({ "schoolYearId": school_year_id }),
        reg,
    );

    let strand = sc.ok(
        "strands.create",
        json!({ "code": "stem", "name": "Science, Technology, Engineering and Mathematics", "track": "Academic" }),
        reg,
    );
    let strand_id = str_of(&strand["strand"], "id").to_string();
    let section = sc.ok(
        "sections.create",
        json!({ "strandId": strand_id, "gradeLevel": 11, "name": "Rizal", "capacity": 2, "adviserId": faculty_id }),
        reg,
    );
    let section_id = str_of(&section["section"], "id").to_string();

    let mut subject_ids = Vec::new();
    let mut load_ids = Vec::new();
    let subjects = [
        ("ORALCOM", "Oral Communication", "core", None, "MON", "08:00", "09:00"),
        ("PRECAL", "Pre-Calculus", "specialized", Some(strand_id.clone()), "WED", "10:00", "11:30"),
    ];
    for (code, name, kind, strand, day, start, end) in subjects {
        let subject = sc.ok(
            "subjects.create",
            json!({
                "code": code, "name": name, "subjectType": kind, "gradeLevel": 11,
                "semester": 1, "strandId": strand
            }),
            reg,
        );
        let subject_id = str_of(&subject["subject"], "id").to_string();
        let load = sc.ok(
            "facultyLoads.assign",
            json!({ "facultyId": faculty_id, "subjectId": subject_id, "sectionId": section_id }),
            reg,
        );
        let load_id = str_of(&load["facultyLoad"], "id").to_string();
        sc.ok(
            "classes.create",
            json!({ "facultyLoadId": load_id, "dayOfWeek": day, "startTime": start, "endTime": end, "room": "R101" }),
            reg,
        );
        subject_ids.push(subject_id);
        load_ids.push(load_id);
    }

    let coordinator = sc.login("coord", PASSWORD);
    let faculty = sc.login("instructor", PASSWORD);
    School {
        registrar,
        coordinator,
        faculty,
        faculty_id,
        school_year_id,
        strand_id,
        section_id,
        subject_ids,
        load_ids,
    }
}

/// Registers a student, logs in and fills in the personal information
/// form. Returns `(user id, token)`.
pub fn register_student(sc: &mut Sidecar, username: &str, lrn: &str) -> (String, String) {
    let user = sc.ok(
        "auth.register",
        json!({
            "username": username, "password": PASSWORD, "fullName": username,
            "email": format!("{}@example.edu", username)
        }),
        None,
    );
    let id = str_of(&user["user"], "id").to_string();
    let token = sc.login(username, PASSWORD);
    sc.ok(
        "students.profile.upsert",
        json!({
            "lrn": lrn, "lastName": username.to_uppercase(), "firstName": "Test",
            "middleName": "Middle", "sex": "F", "birthDate": "2009-03-14"
        }),
        Some(&token),
    );
    (id, token)
}

/// Submits an enrollment into the seeded strand. Returns the enrollment id.
pub fn submit_enrollment(sc: &mut Sidecar, school: &School, token: &str, transferee: bool) -> String {
    let res = sc.ok(
        "enrollments.submit",
        json!({ "strandId": school.strand_id, "gradeLevel": 11, "isTransferee": transferee }),
        Some(token),
    );
    str_of(&res["enrollment"], "id").to_string()
}
