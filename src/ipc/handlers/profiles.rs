use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

use crate::flow;
use crate::grade;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, now_param, now_ts, opt_str, required_str};
use crate::ipc::types::{AppState, Request};

pub struct ProfileRow {
    pub id: String,
    pub stored_grade: Option<String>,
    pub is_college_student: bool,
    pub program_name: Option<String>,
    pub grade_started_at: Option<String>,
}

pub fn get_profile(conn: &Connection, student_id: &str) -> anyhow::Result<Option<ProfileRow>> {
    let row = conn
        .query_row(
            "SELECT id, stored_grade, is_college_student, program_name, grade_started_at
             FROM student_profiles WHERE id = ?",
            [student_id],
            |row| {
                Ok(ProfileRow {
                    id: row.get(0)?,
                    stored_grade: row.get(1)?,
                    is_college_student: row.get::<_, i64>(2)? != 0,
                    program_name: row.get(3)?,
                    grade_started_at: row.get(4)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

fn handle_upsert(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let student_id = opt_str(req, "studentId").unwrap_or_else(|| Uuid::new_v4().to_string());
    let stored_grade = opt_str(req, "storedGrade");
    let program_name = opt_str(req, "programName");
    let grade_started_at = opt_str(req, "gradeStartedAt");
    let is_college = req
        .params
        .get("isCollegeStudent")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    if let Some(raw) = &grade_started_at {
        if flow::parse_timestamp(raw).is_none() {
            return err(&req.id, "bad_params", "gradeStartedAt must be RFC 3339", None);
        }
    }

    let res = conn.execute(
        "INSERT INTO student_profiles(id, stored_grade, is_college_student, program_name, grade_started_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
            stored_grade = excluded.stored_grade,
            is_college_student = excluded.is_college_student,
            program_name = excluded.program_name,
            grade_started_at = excluded.grade_started_at,
            updated_at = excluded.updated_at",
        (
            &student_id,
            &stored_grade,
            is_college as i64,
            &program_name,
            &grade_started_at,
            now_ts(),
        ),
    );
    match res {
        Ok(_) => ok(&req.id, json!({ "studentId": student_id })),
        Err(e) => err(&req.id, "db_error", format!("{e:?}"), None),
    }
}

fn profile_json(p: &ProfileRow) -> serde_json::Value {
    json!({
        "studentId": p.id,
        "storedGrade": p.stored_grade,
        "isCollegeStudent": p.is_college_student,
        "programName": p.program_name,
        "gradeStartedAt": p.grade_started_at,
    })
}

fn handle_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match get_profile(conn, &student_id) {
        Ok(Some(p)) => ok(&req.id, json!({ "profile": profile_json(&p) })),
        Ok(None) => err(&req.id, "not_found", "no such student profile", None),
        Err(e) => err(&req.id, "db_error", format!("{e:?}"), None),
    }
}

fn handle_classify(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let profile = match get_profile(conn, &student_id) {
        Ok(Some(p)) => p,
        Ok(None) => return err(&req.id, "not_found", "no such student profile", None),
        Err(e) => return err(&req.id, "db_error", format!("{e:?}"), None),
    };

    let c = grade::classify(profile.stored_grade.as_deref(), profile.is_college_student);
    ok(
        &req.id,
        json!({
            "numericGrade": c.numeric_grade,
            "bucket": c.bucket,
        }),
    )
}

fn handle_options(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let now = match now_param(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let profile = match get_profile(conn, &student_id) {
        Ok(Some(p)) => p,
        Ok(None) => return err(&req.id, "not_found", "no such student profile", None),
        Err(e) => return err(&req.id, "db_error", format!("{e:?}"), None),
    };

    let months_in_grade = profile
        .grade_started_at
        .as_deref()
        .and_then(flow::parse_timestamp)
        .map(|started| flow::months_between(started, now));

    let c = grade::classify(profile.stored_grade.as_deref(), profile.is_college_student);
    if c.bucket.is_none() {
        return err(
            &req.id,
            "profile_incomplete",
            "grade level could not be resolved; complete the profile",
            Some(json!({ "reason": "grade_unresolved" })),
        );
    }

    let tracks = grade::visible_tracks(
        c.bucket,
        c.numeric_grade,
        months_in_grade,
        profile.is_college_student,
    );
    if tracks.is_empty() {
        return err(
            &req.id,
            "no_options_available",
            "no assessment tracks match this profile",
            Some(json!({ "reason": "no_matching_tracks", "bucket": c.bucket })),
        );
    }

    let mut result = json!({
        "tracks": tracks.iter().map(|t| t.id()).collect::<Vec<_>>(),
        "numericGrade": c.numeric_grade,
        "bucket": c.bucket,
    });
    if state.debug {
        result["debug"] = json!({
            "monthsInGrade": months_in_grade,
            "isCollegeStudent": profile.is_college_student,
            "storedGrade": profile.stored_grade,
        });
    }
    ok(&req.id, result)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "profiles.upsert" => Some(handle_upsert(state, req)),
        "profiles.get" => Some(handle_get(state, req)),
        "profiles.classify" => Some(handle_classify(state, req)),
        "profiles.options" => Some(handle_options(state, req)),
        _ => None,
    }
}
