use chrono::{NaiveDate, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::time::Duration;

pub const DB_FILE_NAME: &str = "registrar.sqlite3";
pub const SCHEMA_VERSION: i64 = 3;

pub fn now_utc() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    migrate(&conn)?;
    Ok(conn)
}

pub fn migrate(conn: &Connection) -> anyhow::Result<()> {
    let before: i64 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS users(
            id TEXT PRIMARY KEY,
            username TEXT NOT NULL UNIQUE,
            email TEXT,
            full_name TEXT NOT NULL,
            role TEXT NOT NULL,
            is_coordinator INTEGER NOT NULL DEFAULT 0,
            active INTEGER NOT NULL DEFAULT 1,
            password_hash TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT
        )",
        [],
    )?;
    ensure_users_is_coordinator(conn)?;
    conn.execute("CREATE INDEX IF NOT EXISTS idx_users_role ON users(role)", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS sessions(
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            token_digest TEXT NOT NULL UNIQUE,
            created_at TEXT NOT NULL,
            expires_at TEXT NOT NULL,
            FOREIGN KEY(user_id) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS password_resets(
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            otp_digest TEXT NOT NULL,
            expires_at TEXT NOT NULL,
            used_at TEXT,
            attempts INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            FOREIGN KEY(user_id) REFERENCES users(id)
        )",
        [],
    )?;
    if !table_has_column(conn, "password_resets", "attempts")? {
        conn.execute(
            "ALTER TABLE password_resets ADD COLUMN attempts INTEGER NOT NULL DEFAULT 0",
            [],
        )?;
    }
    conn.execute(
        "CREATE TABLE IF NOT EXISTS mail_outbox(
            id TEXT PRIMARY KEY,
            to_address TEXT NOT NULL,
            subject TEXT NOT NULL,
            body TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS school_years(
            id TEXT PRIMARY KEY,
            year_start INTEGER NOT NULL,
            year_end INTEGER NOT NULL,
            semester INTEGER NOT NULL,
            start_date TEXT,
            end_date TEXT,
            is_active INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            UNIQUE(year_start, semester)
        )",
        [],
    )?;
    ensure_school_years_dates(conn)?;
    repair_multiple_active_school_years(conn)?;
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_school_years_single_active
         ON school_years(is_active) WHERE is_active = 1",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS strands(
            id TEXT PRIMARY KEY,
            code TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            track TEXT,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS sections(
            id TEXT PRIMARY KEY,
            strand_id TEXT NOT NULL,
            grade_level INTEGER NOT NULL,
            name TEXT NOT NULL,
            capacity INTEGER NOT NULL,
            adviser_id TEXT,
            FOREIGN KEY(strand_id) REFERENCES strands(id),
            FOREIGN KEY(adviser_id) REFERENCES users(id),
            UNIQUE(strand_id, grade_level, name)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sections_strand ON sections(strand_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            code TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            subject_type TEXT NOT NULL,
            grade_level INTEGER NOT NULL,
            semester INTEGER NOT NULL,
            strand_id TEXT,
            hours INTEGER NOT NULL DEFAULT 80,
            FOREIGN KEY(strand_id) REFERENCES strands(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_subjects_strand ON subjects(strand_id)",
        [],
    )?;
    // Subjects pointing at a strand that no longer exists become common subjects.
    conn.execute(
        "UPDATE subjects SET strand_id = NULL
         WHERE strand_id IS NOT NULL
           AND strand_id NOT IN (SELECT id FROM strands)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS student_personal_info(
            user_id TEXT PRIMARY KEY,
            lrn TEXT UNIQUE,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            middle_name TEXT,
            birth_date TEXT,
            sex TEXT,
            address TEXT,
            contact_no TEXT,
            guardian_name TEXT,
            guardian_contact TEXT,
            last_school TEXT,
            updated_at TEXT,
            FOREIGN KEY(user_id) REFERENCES users(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS enrollments(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            school_year_id TEXT NOT NULL,
            strand_id TEXT NOT NULL,
            grade_level INTEGER NOT NULL,
            assigned_section_id TEXT,
            status TEXT NOT NULL,
            is_transferee INTEGER NOT NULL DEFAULT 0,
            evaluation_status TEXT,
            remarks TEXT,
            reviewed_by TEXT,
            submitted_at TEXT NOT NULL,
            updated_at TEXT,
            FOREIGN KEY(student_id) REFERENCES users(id),
            FOREIGN KEY(school_year_id) REFERENCES school_years(id),
            FOREIGN KEY(strand_id) REFERENCES strands(id),
            FOREIGN KEY(assigned_section_id) REFERENCES sections(id),
            FOREIGN KEY(reviewed_by) REFERENCES users(id),
            UNIQUE(student_id, school_year_id)
        )",
        [],
    )?;
    ensure_enrollments_transferee_columns(conn)?;
    repair_enrollment_student_ids(conn)?;
    normalize_enrollment_statuses(conn)?;
    repair_section_strand_mismatch(conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollments_year_status ON enrollments(school_year_id, status)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollments_section ON enrollments(assigned_section_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS enrollment_status_history(
            id TEXT PRIMARY KEY,
            enrollment_id TEXT NOT NULL,
            from_status TEXT,
            to_status TEXT NOT NULL,
            actor_id TEXT NOT NULL,
            note TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY(enrollment_id) REFERENCES enrollments(id),
            FOREIGN KEY(actor_id) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollment_history_enrollment
         ON enrollment_status_history(enrollment_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS transferee_credits(
            id TEXT PRIMARY KEY,
            enrollment_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            grade REAL,
            FOREIGN KEY(enrollment_id) REFERENCES enrollments(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            UNIQUE(enrollment_id, subject_id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS faculty_loads(
            id TEXT PRIMARY KEY,
            faculty_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            section_id TEXT NOT NULL,
            school_year_id TEXT NOT NULL,
            FOREIGN KEY(faculty_id) REFERENCES users(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            FOREIGN KEY(section_id) REFERENCES sections(id),
            FOREIGN KEY(school_year_id) REFERENCES school_years(id),
            UNIQUE(subject_id, section_id, school_year_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_faculty_loads_faculty ON faculty_loads(faculty_id, school_year_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            faculty_load_id TEXT NOT NULL,
            day_of_week TEXT NOT NULL,
            start_time TEXT NOT NULL,
            end_time TEXT NOT NULL,
            room TEXT,
            FOREIGN KEY(faculty_load_id) REFERENCES faculty_loads(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_classes_load ON classes(faculty_load_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS class_details(
            id TEXT PRIMARY KEY,
            enrollment_id TEXT NOT NULL,
            class_id TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(enrollment_id) REFERENCES enrollments(id),
            FOREIGN KEY(class_id) REFERENCES classes(id),
            UNIQUE(enrollment_id, class_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_class_details_class ON class_details(class_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grades(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            school_year_id TEXT NOT NULL,
            faculty_id TEXT NOT NULL,
            q1 REAL,
            q2 REAL,
            semester_grade INTEGER,
            remarks TEXT,
            status TEXT NOT NULL DEFAULT 'draft',
            return_note TEXT,
            updated_at TEXT,
            FOREIGN KEY(student_id) REFERENCES users(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            FOREIGN KEY(school_year_id) REFERENCES school_years(id),
            FOREIGN KEY(faculty_id) REFERENCES users(id),
            UNIQUE(student_id, subject_id, school_year_id)
        )",
        [],
    )?;
    merge_grade_approval_status(conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_subject_year ON grades(subject_id, school_year_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS certificates_of_registration(
            id TEXT PRIMARY KEY,
            enrollment_id TEXT NOT NULL,
            cor_no TEXT NOT NULL UNIQUE,
            version INTEGER NOT NULL,
            snapshot_json TEXT NOT NULL,
            checksum TEXT NOT NULL,
            generated_by TEXT NOT NULL,
            generated_at TEXT NOT NULL,
            FOREIGN KEY(enrollment_id) REFERENCES enrollments(id),
            FOREIGN KEY(generated_by) REFERENCES users(id),
            UNIQUE(enrollment_id, version)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS notifications(
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            message TEXT NOT NULL,
            ref_id TEXT,
            created_at TEXT NOT NULL,
            read_at TEXT,
            FOREIGN KEY(user_id) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_notifications_user ON notifications(user_id, read_at)",
        [],
    )?;

    if before != SCHEMA_VERSION {
        conn.execute_batch(&format!("PRAGMA user_version = {}", SCHEMA_VERSION))?;
        tracing::info!(from = before, to = SCHEMA_VERSION, "schema migrated");
    }
    Ok(())
}

fn ensure_users_is_coordinator(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "users", "is_coordinator")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE users ADD COLUMN is_coordinator INTEGER NOT NULL DEFAULT 0",
        [],
    )?;
    // v1 stored coordinators as their own role with no faculty flag.
    conn.execute(
        "UPDATE users SET is_coordinator = 1, role = 'faculty' WHERE role = 'coordinator'",
        [],
    )?;
    Ok(())
}

fn ensure_school_years_dates(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "school_years", "start_date")? {
        conn.execute("ALTER TABLE school_years ADD COLUMN start_date TEXT", [])?;
    }
    if !table_has_column(conn, "school_years", "end_date")? {
        conn.execute("ALTER TABLE school_years ADD COLUMN end_date TEXT", [])?;
    }
    Ok(())
}

fn repair_multiple_active_school_years(conn: &Connection) -> anyhow::Result<()> {
    // Keep the most recent active year when older databases have several.
    conn.execute(
        "UPDATE school_years SET is_active = 0
         WHERE is_active = 1
           AND id <> (
             SELECT id FROM school_years
             WHERE is_active = 1
             ORDER BY year_start DESC, semester DESC
             LIMIT 1
           )",
        [],
    )?;
    Ok(())
}

fn ensure_enrollments_transferee_columns(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "enrollments", "is_transferee")? {
        conn.execute(
            "ALTER TABLE enrollments ADD COLUMN is_transferee INTEGER NOT NULL DEFAULT 0",
            [],
        )?;
    }
    if !table_has_column(conn, "enrollments", "evaluation_status")? {
        conn.execute("ALTER TABLE enrollments ADD COLUMN evaluation_status TEXT", [])?;
        conn.execute(
            "UPDATE enrollments SET evaluation_status = 'evaluation_pending'
             WHERE is_transferee = 1",
            [],
        )?;
    }
    Ok(())
}

fn repair_enrollment_student_ids(conn: &Connection) -> anyhow::Result<()> {
    // v1 enrollments were keyed by LRN and could carry a NULL student_id.
    if !table_has_column(conn, "enrollments", "lrn")? {
        return Ok(());
    }
    let fixed = conn.execute(
        "UPDATE enrollments
         SET student_id = (
           SELECT spi.user_id FROM student_personal_info spi
           WHERE spi.lrn = enrollments.lrn
         )
         WHERE (student_id IS NULL OR student_id = '')
           AND lrn IS NOT NULL",
        [],
    )?;
    if fixed > 0 {
        tracing::warn!(rows = fixed, "back-filled enrollment student ids from LRN");
    }
    Ok(())
}

const LEGACY_ENROLLMENT_STATUSES: [(&str, &[&str]); 5] = [
    (
        "pending",
        &[
            "submitted",
            "for approval",
            "for evaluation",
            "evaluation pending",
            "under evaluation",
            "for_evaluation",
        ],
    ),
    ("approved", &["accepted", "for enrollment"]),
    ("rejected", &["declined", "denied", "disapproved"]),
    ("returned", &["for revision", "for_revision", "revision"]),
    ("enrolled", &["officially enrolled"]),
];

fn normalize_enrollment_statuses(conn: &Connection) -> anyhow::Result<()> {
    conn.execute(
        "UPDATE enrollments SET status = lower(trim(status))
         WHERE status <> lower(trim(status))",
        [],
    )?;
    for (to, labels) in LEGACY_ENROLLMENT_STATUSES {
        let placeholders = vec!["?"; labels.len()].join(", ");
        let mut params: Vec<&str> = vec![to];
        params.extend_from_slice(labels);
        conn.execute(
            &format!(
                "UPDATE enrollments SET status = ? WHERE status IN ({})",
                placeholders
            ),
            rusqlite::params_from_iter(params),
        )?;
    }
    let mut stmt = conn.prepare(
        "SELECT DISTINCT status FROM enrollments
         WHERE status NOT IN ('pending', 'approved', 'rejected', 'enrolled', 'returned')
         ORDER BY status",
    )?;
    let unknown = stmt
        .query_map([], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    if !unknown.is_empty() {
        return Err(anyhow::anyhow!(
            "enrollments carry unknown statuses: {}",
            unknown.join(", ")
        ));
    }
    Ok(())
}

fn repair_section_strand_mismatch(conn: &Connection) -> anyhow::Result<()> {
    // The assigned section is authoritative for strand and grade level.
    let fixed = conn.execute(
        "UPDATE enrollments
         SET strand_id = (SELECT s.strand_id FROM sections s WHERE s.id = enrollments.assigned_section_id),
             grade_level = (SELECT s.grade_level FROM sections s WHERE s.id = enrollments.assigned_section_id)
         WHERE assigned_section_id IS NOT NULL
           AND EXISTS (
             SELECT 1 FROM sections s
             WHERE s.id = enrollments.assigned_section_id
               AND (s.strand_id <> enrollments.strand_id OR s.grade_level <> enrollments.grade_level)
           )",
        [],
    )?;
    if fixed > 0 {
        tracing::warn!(rows = fixed, "realigned enrollment strand with assigned section");
    }
    Ok(())
}

fn merge_grade_approval_status(conn: &Connection) -> anyhow::Result<()> {
    // status and approval_status carried the same information; status wins.
    if !table_has_column(conn, "grades", "approval_status")? {
        return Ok(());
    }
    conn.execute(
        "UPDATE grades
         SET status = CASE lower(trim(approval_status))
             WHEN 'approved' THEN 'approved'
             WHEN 'rejected' THEN 'returned'
             WHEN 'returned' THEN 'returned'
             WHEN 'pending' THEN 'submitted'
             ELSE status
           END
         WHERE approval_status IS NOT NULL AND trim(approval_status) <> ''",
        [],
    )?;
    conn.execute("ALTER TABLE grades DROP COLUMN approval_status", [])?;
    tracing::info!("merged grades.approval_status into grades.status");
    Ok(())
}

/// Deactivates every active school year whose end date is before `today`.
/// Returns the ids that were switched off.
pub fn deactivate_expired_school_years(
    conn: &Connection,
    today: NaiveDate,
) -> anyhow::Result<Vec<String>> {
    let today_s = today.format("%Y-%m-%d").to_string();
    let mut stmt = conn.prepare(
        "SELECT id FROM school_years
         WHERE is_active = 1 AND end_date IS NOT NULL AND end_date < ?",
    )?;
    let ids = stmt
        .query_map([&today_s], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    for id in &ids {
        conn.execute("UPDATE school_years SET is_active = 0 WHERE id = ?", [id])?;
        tracing::info!(school_year_id = %id, "deactivated expired school year");
    }
    Ok(ids)
}

pub fn settings_get_json(
    conn: &Connection,
    key: &str,
) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

pub fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
