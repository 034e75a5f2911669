use rusqlite::OptionalExtension;
use serde_json::{json, Value as JsonValue};
use uuid::Uuid;

use crate::db;
use crate::flow;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, now_ts, opt_str, required_str};
use crate::ipc::types::{AppState, Request};

fn score_field(req: &Request, key: &str) -> Option<String> {
    req.params
        .get(key)
        .filter(|v| !v.is_null())
        .map(|v| v.to_string())
}

/// The external scoring process reports a completed attempt's outcome here.
/// The daemon stores the scored fields opaquely.
fn handle_record(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let attempt_id = match required_str(req, "attemptId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let attempt = match db::get_attempt(conn, &attempt_id) {
        Ok(Some(a)) => a,
        Ok(None) => return err(&req.id, "not_found", "no such attempt", None),
        Err(e) => return err(&req.id, "db_error", format!("{e:?}"), None),
    };
    if attempt.status != flow::STATUS_COMPLETED {
        return err(
            &req.id,
            "invalid_status",
            format!("attempt is {}, not completed", attempt.status),
            Some(json!({ "status": attempt.status })),
        );
    }

    let created_at = match opt_str(req, "createdAt") {
        None => now_ts(),
        Some(raw) => match flow::parse_timestamp(&raw) {
            Some(d) => d.to_rfc3339(),
            None => return err(&req.id, "bad_params", "createdAt must be RFC 3339", None),
        },
    };

    let result_id = Uuid::new_v4().to_string();
    let res = conn.execute(
        "INSERT INTO assessment_results(
            id, attempt_id, student_id, grade_level, stream_id, created_at,
            riasec_scores, big_five_scores, aptitude_scores, career_fit, roadmap)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &result_id,
            &attempt.id,
            &attempt.student_id,
            &attempt.grade_level,
            &attempt.stream_id,
            &created_at,
            score_field(req, "riasecScores"),
            score_field(req, "bigFiveScores"),
            score_field(req, "aptitudeScores"),
            score_field(req, "careerFit"),
            score_field(req, "roadmap"),
        ),
    );
    match res {
        Ok(_) => ok(&req.id, json!({ "resultId": result_id, "createdAt": created_at })),
        Err(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            err(
                &req.id,
                "already_recorded",
                "a result already exists for this attempt",
                None,
            )
        }
        Err(e) => err(&req.id, "db_error", format!("{e:?}"), None),
    }
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let mut stmt = match conn.prepare(
        "SELECT id, attempt_id, grade_level, stream_id, created_at
         FROM assessment_results WHERE student_id = ? ORDER BY created_at DESC",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_error", format!("{e:?}"), None),
    };
    let rows = stmt.query_map([&student_id], |row| {
        Ok(json!({
            "resultId": row.get::<_, String>(0)?,
            "attemptId": row.get::<_, String>(1)?,
            "gradeLevel": row.get::<_, String>(2)?,
            "streamId": row.get::<_, Option<String>>(3)?,
            "createdAt": row.get::<_, String>(4)?,
        }))
    });
    match rows.and_then(|r| r.collect::<Result<Vec<_>, _>>()) {
        Ok(results) => ok(&req.id, json!({ "results": results })),
        Err(e) => err(&req.id, "db_error", format!("{e:?}"), None),
    }
}

fn parse_stored_json(raw: Option<String>) -> JsonValue {
    raw.and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or(JsonValue::Null)
}

fn handle_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let result_id = match required_str(req, "resultId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let row = conn
        .query_row(
            "SELECT id, attempt_id, student_id, grade_level, stream_id, created_at,
                    riasec_scores, big_five_scores, aptitude_scores, career_fit, roadmap
             FROM assessment_results WHERE id = ?",
            [&result_id],
            |row| {
                Ok(json!({
                    "resultId": row.get::<_, String>(0)?,
                    "attemptId": row.get::<_, String>(1)?,
                    "studentId": row.get::<_, String>(2)?,
                    "gradeLevel": row.get::<_, String>(3)?,
                    "streamId": row.get::<_, Option<String>>(4)?,
                    "createdAt": row.get::<_, String>(5)?,
                    "riasecScores": parse_stored_json(row.get::<_, Option<String>>(6)?),
                    "bigFiveScores": parse_stored_json(row.get::<_, Option<String>>(7)?),
                    "aptitudeScores": parse_stored_json(row.get::<_, Option<String>>(8)?),
                    "careerFit": parse_stored_json(row.get::<_, Option<String>>(9)?),
                    "roadmap": parse_stored_json(row.get::<_, Option<String>>(10)?),
                }))
            },
        )
        .optional();
    match row {
        Ok(Some(result)) => ok(&req.id, json!({ "result": result })),
        Ok(None) => err(&req.id, "not_found", "no such result", None),
        Err(e) => err(&req.id, "db_error", format!("{e:?}"), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "results.record" => Some(handle_record(state, req)),
        "results.list" => Some(handle_list(state, req)),
        "results.get" => Some(handle_get(state, req)),
        _ => None,
    }
}
