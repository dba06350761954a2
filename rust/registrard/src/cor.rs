//! Certificate of Registration documents.
//!
//! A COR is frozen at generation time. The snapshot carries everything the
//! printed form shows and its checksum detects later edits.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct SchoolHeader {
    pub school_name: String,
    pub school_id: String,
    pub division: String,
    pub region: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CorStudent {
    pub id: String,
    pub name: String,
    pub lrn: Option<String>,
    pub sex: Option<String>,
    pub birth_date: Option<String>,
    pub address: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Meeting {
    pub day: String,
    pub start: String,
    pub end: String,
    pub room: Option<String>,
    pub faculty: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CorSubject {
    pub code: String,
    pub name: String,
    pub subject_type: String,
    pub hours: i64,
    pub schedule: Vec<Meeting>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CorSnapshot {
    pub cor_no: String,
    pub version: i64,
    pub generated_at: String,
    pub school: SchoolHeader,
    pub student: CorStudent,
    pub school_year: String,
    pub semester: i64,
    pub strand_code: String,
    pub strand_name: String,
    pub grade_level: i64,
    pub section: String,
    pub adviser: Option<String>,
    pub is_transferee: bool,
    pub subjects: Vec<CorSubject>,
}

impl CorSnapshot {
    pub fn total_hours(&self) -> i64 {
        self.subjects.iter().map(|s| s.hours).sum()
    }
}

/// `COR-<year start>-<5 digit sequence>`.
pub fn cor_number(year_start: i64, seq: i64) -> String {
    format!("COR-{}-{:05}", year_start, seq)
}

/// Hex sha256 over the snapshot's JSON form. Field order is fixed by the
/// struct, so a stored snapshot always hashes to the same value.
pub fn checksum(snapshot: &CorSnapshot) -> anyhow::Result<String> {
    let bytes = serde_json::to_vec(snapshot)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

pub fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn opt(s: &Option<String>) -> String {
    s.as_deref().map(escape_html).unwrap_or_default()
}

fn schedule_cell(schedule: &[Meeting]) -> String {
    if schedule.is_empty() {
        return "TBA".to_string();
    }
    schedule
        .iter()
        .map(|m| {
            let room = m.room.as_deref().map(|r| format!(" {}", escape_html(r))).unwrap_or_default();
            format!("{} {}-{}{}", m.day, m.start, m.end, room)
        })
        .collect::<Vec<_>>()
        .join("<br>")
}

fn instructors(schedule: &[Meeting]) -> String {
    let mut names: Vec<&str> = schedule.iter().map(|m| m.faculty.as_str()).collect();
    names.dedup();
    escape_html(&names.join(", "))
}

pub fn render_html(snapshot: &CorSnapshot, checksum: &str) -> String {
    let s = snapshot;
    let mut rows = String::new();
    for subj in &s.subjects {
        rows.push_str(&format!(
            "      <tr><td>{}</td><td>{}</td><td>{}</td><td class=\"num\">{}</td><td>{}</td><td>{}</td></tr>\n",
            escape_html(&subj.code),
            escape_html(&subj.name),
            escape_html(&subj.subject_type),
            subj.hours,
            schedule_cell(&subj.schedule),
            instructors(&subj.schedule),
        ));
    }
    let semester = if s.semester == 1 { "First" } else { "Second" };
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <title>Certificate of Registration {cor_no}</title>
  <style>
    body {{ font-family: Arial, sans-serif; font-size: 12px; margin: 24px; }}
    header {{ text-align: center; }}
    table {{ width: 100%; border-collapse: collapse; margin-top: 12px; }}
    th, td {{ border: 1px solid #444; padding: 4px 6px; vertical-align: top; }}
    .num {{ text-align: right; }}
    .meta td {{ border: none; padding: 2px 6px; }}
    footer {{ margin-top: 24px; font-size: 10px; color: #555; }}
  </style>
</head>
<body>
  <header>
    <div>Region: {region} &middot; Division: {division}</div>
    <h2>{school_name}</h2>
    <div>School ID: {school_id}</div>
    <h3>CERTIFICATE OF REGISTRATION</h3>
    <div>{school_year}, {semester} Semester</div>
  </header>
  <table class="meta">
    <tr><td>COR No.: <b>{cor_no}</b></td><td>Version: {version}</td></tr>
    <tr><td>Name: <b>{name}</b></td><td>LRN: {lrn}</td></tr>
    <tr><td>Strand: {strand_code} - {strand_name}</td><td>Grade {grade_level} - {section}</td></tr>
    <tr><td>Adviser: {adviser}</td><td>Status: {status}</td></tr>
  </table>
  <table>
    <thead>
      <tr><th>Code</th><th>Subject</th><th>Type</th><th>Hours</th><th>Schedule</th><th>Instructor</th></tr>
    </thead>
    <tbody>
{rows}      <tr><td colspan="3"><b>Total</b></td><td class="num"><b>{total_hours}</b></td><td colspan="2"></td></tr>
    </tbody>
  </table>
  <footer>
    Generated {generated_at}. Verification checksum: <code>{checksum}</code>
  </footer>
</body>
</html>
"#,
        cor_no = escape_html(&s.cor_no),
        region = escape_html(&s.school.region),
        division = escape_html(&s.school.division),
        school_name = escape_html(&s.school.school_name),
        school_id = escape_html(&s.school.school_id),
        school_year = escape_html(&s.school_year),
        semester = semester,
        version = s.version,
        name = escape_html(&s.student.name),
        lrn = opt(&s.student.lrn),
        strand_code = escape_html(&s.strand_code),
        strand_name = escape_html(&s.strand_name),
        grade_level = s.grade_level,
        section = escape_html(&s.section),
        adviser = opt(&s.adviser),
        status = if s.is_transferee { "Transferee" } else { "Regular" },
        rows = rows,
        total_hours = s.total_hours(),
        generated_at = escape_html(&s.generated_at),
        checksum = escape_html(checksum),
    )
}
