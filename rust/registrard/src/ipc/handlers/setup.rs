use crate::db;
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{run_authed, Ctx, ANYONE, REGISTRAR};
use crate::ipc::types::{AppState, Request};
use crate::workflow::WorkflowPolicy;
use rusqlite::Connection;
use serde_json::{json, Map, Value};

#[derive(Clone, Copy)]
enum SetupSection {
    Grading,
    Enrollment,
    Security,
    School,
}

impl SetupSection {
    const ALL: [SetupSection; 4] = [Self::Grading, Self::Enrollment, Self::Security, Self::School];

    fn parse(s: &str) -> Option<Self> {
        match s {
            "grading" => Some(Self::Grading),
            "enrollment" => Some(Self::Enrollment),
            "security" => Some(Self::Security),
            "school" => Some(Self::School),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Grading => "grading",
            Self::Enrollment => "enrollment",
            Self::Security => "security",
            Self::School => "school",
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Grading => "setup.grading",
            Self::Enrollment => "setup.enrollment",
            Self::Security => "setup.security",
            Self::School => "setup.school",
        }
    }
}

fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::Grading => json!({
            "passingGrade": 75,
            "minQuarterGrade": 60,
            "gradeEntryOpen": true
        }),
        SetupSection::Enrollment => json!({
            "allowTransferees": true,
            "defaultSectionCapacity": 40,
            "requireApprovalBeforeEnroll": false
        }),
        SetupSection::Security => json!({
            "sessionTtlHours": 12,
            "otpTtlMinutes": 10,
            "minPasswordLength": 8
        }),
        SetupSection::School => json!({
            "schoolName": "Senior High School",
            "schoolId": "",
            "division": "",
            "region": ""
        }),
    }
}

fn as_object_mut(value: &mut Value) -> Result<&mut Map<String, Value>, String> {
    value
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())
}

fn parse_bool(v: &Value, key: &str) -> Result<bool, String> {
    v.as_bool().ok_or_else(|| format!("{} must be boolean", key))
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v.as_i64().ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn parse_string_max(v: &Value, key: &str, max_len: usize) -> Result<String, String> {
    let s = v.as_str().ok_or_else(|| format!("{} must be string", key))?;
    let s = s.trim();
    if s.len() > max_len {
        return Err(format!("{} length must be <= {}", key, max_len));
    }
    Ok(s.to_string())
}

fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = as_object_mut(current)?;
    for (k, v) in patch {
        match section {
            SetupSection::Grading => match k.as_str() {
                "passingGrade" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 60, 100)?));
                }
                "minQuarterGrade" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 0, 75)?));
                }
                "gradeEntryOpen" => {
                    obj.insert(k.clone(), Value::Bool(parse_bool(v, k)?));
                }
                _ => return Err(format!("unknown grading field: {}", k)),
            },
            SetupSection::Enrollment => match k.as_str() {
                "allowTransferees" | "requireApprovalBeforeEnroll" => {
                    obj.insert(k.clone(), Value::Bool(parse_bool(v, k)?));
                }
                "defaultSectionCapacity" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 1, 100)?));
                }
                _ => return Err(format!("unknown enrollment field: {}", k)),
            },
            SetupSection::Security => match k.as_str() {
                "sessionTtlHours" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 1, 720)?));
                }
                "otpTtlMinutes" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 1, 120)?));
                }
                "minPasswordLength" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 6, 128)?));
                }
                _ => return Err(format!("unknown security field: {}", k)),
            },
            SetupSection::School => match k.as_str() {
                "schoolName" => {
                    let s = parse_string_max(v, k, 160)?;
                    if s.is_empty() {
                        return Err("schoolName must not be empty".into());
                    }
                    obj.insert(k.clone(), Value::String(s));
                }
                "schoolId" => {
                    obj.insert(k.clone(), Value::String(parse_string_max(v, k, 16)?));
                }
                "division" | "region" => {
                    obj.insert(k.clone(), Value::String(parse_string_max(v, k, 120)?));
                }
                _ => return Err(format!("unknown school field: {}", k)),
            },
        }
    }
    Ok(())
}

fn load_section(conn: &Connection, section: SetupSection) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // Malformed historical values fall back to defaults field by field.
            for (k, v) in saved_obj {
                let mut one = Map::new();
                one.insert(k.clone(), v.clone());
                let _ = merge_section_patch(section, &mut current, &one);
            }
        }
    }
    Ok(current)
}

fn section_i64(conn: &Connection, section: SetupSection, field: &str) -> Result<i64, HandlerErr> {
    let v = load_section(conn, section)?;
    v.get(field)
        .and_then(|x| x.as_i64())
        .or_else(|| default_section(section).get(field).and_then(|x| x.as_i64()))
        .ok_or_else(|| HandlerErr::new("internal_error", format!("setting {} missing", field)))
}

fn section_bool(conn: &Connection, section: SetupSection, field: &str) -> Result<bool, HandlerErr> {
    let v = load_section(conn, section)?;
    Ok(v.get(field).and_then(|x| x.as_bool()).unwrap_or(false))
}

#[derive(Debug, Clone, Copy)]
pub struct GradingSettings {
    pub passing_grade: i64,
    pub min_quarter_grade: i64,
    pub grade_entry_open: bool,
}

pub fn grading_settings(conn: &Connection) -> Result<GradingSettings, HandlerErr> {
    Ok(GradingSettings {
        passing_grade: section_i64(conn, SetupSection::Grading, "passingGrade")?,
        min_quarter_grade: section_i64(conn, SetupSection::Grading, "minQuarterGrade")?,
        grade_entry_open: section_bool(conn, SetupSection::Grading, "gradeEntryOpen")?,
    })
}

pub fn workflow_policy(conn: &Connection) -> Result<WorkflowPolicy, HandlerErr> {
    Ok(WorkflowPolicy {
        require_approval_before_enroll: section_bool(
            conn,
            SetupSection::Enrollment,
            "requireApprovalBeforeEnroll",
        )?,
    })
}

pub fn allow_transferees(conn: &Connection) -> Result<bool, HandlerErr> {
    section_bool(conn, SetupSection::Enrollment, "allowTransferees")
}

pub fn default_section_capacity(conn: &Connection) -> Result<i64, HandlerErr> {
    section_i64(conn, SetupSection::Enrollment, "defaultSectionCapacity")
}

pub fn session_ttl_hours(conn: &Connection) -> Result<i64, HandlerErr> {
    section_i64(conn, SetupSection::Security, "sessionTtlHours")
}

pub fn otp_ttl_minutes(conn: &Connection) -> Result<i64, HandlerErr> {
    section_i64(conn, SetupSection::Security, "otpTtlMinutes")
}

pub fn min_password_length(conn: &Connection) -> Result<usize, HandlerErr> {
    Ok(section_i64(conn, SetupSection::Security, "minPasswordLength")? as usize)
}

pub fn school_header(conn: &Connection) -> Result<Value, HandlerErr> {
    Ok(load_section(conn, SetupSection::School)?)
}

fn handle_setup_get(ctx: &Ctx, _req: &Request) -> Result<Value, HandlerErr> {
    let mut out = Map::new();
    for section in SetupSection::ALL {
        out.insert(section.name().to_string(), load_section(ctx.conn, section)?);
    }
    Ok(Value::Object(out))
}

fn handle_setup_update(ctx: &Ctx, req: &Request) -> Result<Value, HandlerErr> {
    let section_raw = req
        .params
        .get("section")
        .and_then(|v| v.as_str())
        .ok_or_else(|| HandlerErr::bad_params("missing section"))?;
    let section = SetupSection::parse(section_raw)
        .ok_or_else(|| HandlerErr::bad_params("unknown section"))?;
    let patch_obj = req
        .params
        .get("patch")
        .and_then(|v| v.as_object())
        .ok_or_else(|| HandlerErr::bad_params("patch must be an object"))?;

    let mut current = load_section(ctx.conn, section)?;
    merge_section_patch(section, &mut current, patch_obj).map_err(HandlerErr::bad_params)?;
    db::settings_set_json(ctx.conn, section.key(), &current)
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    tracing::info!(section = section.name(), by = %ctx.actor.username, "settings updated");
    let mut out = Map::new();
    out.insert(section.name().to_string(), current);
    Ok(Value::Object(out))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "setup.get" => Some(run_authed(state, req, ANYONE, handle_setup_get)),
        "setup.update" => Some(run_authed(state, req, REGISTRAR, handle_setup_update)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_validates_ranges_and_unknown_fields() {
        let mut cur = default_section(SetupSection::Grading);
        let patch = json!({ "passingGrade": 80 });
        merge_section_patch(SetupSection::Grading, &mut cur, patch.as_object().expect("obj"))
            .expect("valid patch");
        assert_eq!(cur["passingGrade"], 80);

        let bad = json!({ "passingGrade": 101 });
        assert!(merge_section_patch(SetupSection::Grading, &mut cur, bad.as_object().expect("obj")).is_err());
        let unknown = json!({ "curve": true });
        assert!(
            merge_section_patch(SetupSection::Grading, &mut cur, unknown.as_object().expect("obj"))
                .is_err()
        );
        assert_eq!(cur["passingGrade"], 80);
    }

    #[test]
    fn load_section_ignores_bad_saved_fields() {
        let conn = Connection::open_in_memory().expect("open");
        db::migrate(&conn).expect("migrate");
        db::settings_set_json(
            &conn,
            "setup.security",
            &json!({ "sessionTtlHours": "forever", "otpTtlMinutes": 5 }),
        )
        .expect("save");
        let sec = load_section(&conn, SetupSection::Security).expect("load");
        assert_eq!(sec["sessionTtlHours"], 12);
        assert_eq!(sec["otpTtlMinutes"], 5);
        assert_eq!(otp_ttl_minutes(&conn).expect("ttl"), 5);
    }
}
