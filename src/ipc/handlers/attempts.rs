use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde_json::{json, Map, Value as JsonValue};
use uuid::Uuid;

use crate::db::{self, AttemptRow};
use crate::flow;
use crate::grade::Track;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, now_param, now_ts, opt_str, required_str};
use crate::ipc::types::{AppState, Request};
use crate::progress::{self, ProgressInputs};

fn load_attempt(
    conn: &Connection,
    req: &Request,
) -> Result<AttemptRow, serde_json::Value> {
    let attempt_id = required_str(req, "attemptId")?;
    match db::get_attempt(conn, &attempt_id) {
        Ok(Some(a)) => Ok(a),
        Ok(None) => Err(err(&req.id, "not_found", "no such attempt", None)),
        Err(e) => Err(err(&req.id, "db_error", format!("{e:?}"), None)),
    }
}

fn require_in_progress(attempt: &AttemptRow, req: &Request) -> Result<(), serde_json::Value> {
    if attempt.status == flow::STATUS_IN_PROGRESS {
        return Ok(());
    }
    Err(err(
        &req.id,
        "invalid_status",
        format!("attempt is {}, not in_progress", attempt.status),
        Some(json!({ "status": attempt.status })),
    ))
}

/// Percent-complete for a stored attempt, combining the restored response
/// projection, the college v2 snapshot, and the adaptive sub-test count.
fn attempt_percent(conn: &Connection, attempt: &AttemptRow) -> anyhow::Result<(i64, ProgressInputs)> {
    let restored = db::restored_responses(&attempt.responses);
    let raw_count = db::raw_response_count(&attempt.responses);
    let snapshot = attempt
        .snapshot_v2
        .as_ref()
        .and_then(|v| serde_json::from_value(v.clone()).ok());
    let adaptive = db::adaptive_questions_answered(conn, &attempt.id)?;

    let inputs = ProgressInputs {
        grade_level: attempt.grade_level.clone(),
        restored_responses: restored,
        raw_response_count: raw_count,
        snapshot_v2: snapshot,
        adaptive_answered: adaptive,
    };
    Ok((progress::estimate(&inputs), inputs))
}

fn rfc3339_opt(d: Option<DateTime<Utc>>) -> JsonValue {
    match d {
        Some(d) => json!(d.to_rfc3339()),
        None => JsonValue::Null,
    }
}

fn attempt_json(attempt: &AttemptRow) -> JsonValue {
    json!({
        "attemptId": attempt.id,
        "studentId": attempt.student_id,
        "gradeLevel": attempt.grade_level,
        "streamId": attempt.stream_id,
        "status": attempt.status,
        "startedAt": attempt.started_at,
        "responseCount": db::raw_response_count(&attempt.responses),
        "hasSnapshot": attempt.snapshot_v2.is_some(),
    })
}

fn handle_start(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let track_id = match required_str(req, "track") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(track) = Track::from_id(&track_id) else {
        return err(&req.id, "bad_params", format!("unknown track: {}", track_id), None);
    };
    let now = match now_param(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let stream_id = opt_str(req, "streamId");

    match super::profiles::get_profile(conn, &student_id) {
        Ok(Some(_)) => {}
        Ok(None) => return err(&req.id, "not_found", "no such student profile", None),
        Err(e) => return err(&req.id, "db_error", format!("{e:?}"), None),
    }

    // Cooldown gates fresh starts only; resuming is handled elsewhere.
    let decision = match flow::decide(conn, &student_id, now) {
        Ok(d) => d,
        Err(e) => return err(&req.id, "db_error", format!("{e:?}"), None),
    };
    if !decision.can_take {
        return err(
            &req.id,
            "restricted_by_cooldown",
            "a new assessment cannot start within the cooldown window",
            Some(json!({
                "lastAttemptDate": rfc3339_opt(decision.last_attempt_date),
                "nextAvailableDate": rfc3339_opt(decision.next_available_date),
            })),
        );
    }

    match flow::find_resumable(conn, &student_id) {
        Ok(Some(existing)) => {
            return err(
                &req.id,
                "attempt_in_progress",
                "an in-progress attempt already exists; resume or abandon it",
                Some(json!({ "attemptId": existing.id })),
            );
        }
        Ok(None) => {}
        Err(e) => return err(&req.id, "db_error", format!("{e:?}"), None),
    }

    let attempt_id = Uuid::new_v4().to_string();
    let res = conn.execute(
        "INSERT INTO assessment_attempts(id, student_id, grade_level, stream_id, status, started_at, responses, updated_at)
         VALUES(?, ?, ?, ?, 'in_progress', ?, '{}', ?)",
        (
            &attempt_id,
            &student_id,
            track.id(),
            &stream_id,
            now.to_rfc3339(),
            now_ts(),
        ),
    );
    match res {
        Ok(_) => ok(
            &req.id,
            json!({
                "attemptId": attempt_id,
                "gradeLevel": track.id(),
                "startedAt": now.to_rfc3339(),
            }),
        ),
        // The partial unique index backstops concurrent starts.
        Err(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            err(
                &req.id,
                "attempt_in_progress",
                "an in-progress attempt already exists; resume or abandon it",
                None,
            )
        }
        Err(e) => err(&req.id, "db_error", format!("{e:?}"), None),
    }
}

fn handle_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let attempt = match load_attempt(conn, req) {
        Ok(a) => a,
        Err(e) => return e,
    };
    ok(&req.id, json!({ "attempt": attempt_json(&attempt) }))
}

fn handle_save_responses(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let attempt = match load_attempt(conn, req) {
        Ok(a) => a,
        Err(e) => return e,
    };
    if let Err(e) = require_in_progress(&attempt, req) {
        return e;
    }
    let Some(patch) = req.params.get("responses").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "responses must be an object", None);
    };

    let mut merged: Map<String, JsonValue> = attempt
        .responses
        .as_object()
        .cloned()
        .unwrap_or_default();
    for (key, value) in patch {
        merged.insert(key.clone(), value.clone());
    }
    let merged = JsonValue::Object(merged);

    let res = conn.execute(
        "UPDATE assessment_attempts SET responses = ?, updated_at = ? WHERE id = ?",
        (merged.to_string(), now_ts(), &attempt.id),
    );
    match res {
        Ok(_) => ok(
            &req.id,
            json!({
                "responseCount": db::raw_response_count(&merged),
                "restoredCount": db::restored_responses(&merged).len(),
            }),
        ),
        Err(e) => err(&req.id, "db_error", format!("{e:?}"), None),
    }
}

fn handle_save_snapshot(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let attempt = match load_attempt(conn, req) {
        Ok(a) => a,
        Err(e) => return e,
    };
    if let Err(e) = require_in_progress(&attempt, req) {
        return e;
    }
    let Some(snapshot) = req.params.get("snapshot").filter(|v| v.is_object()) else {
        return err(&req.id, "bad_params", "snapshot must be an object", None);
    };

    let res = conn.execute(
        "UPDATE assessment_attempts SET snapshot_v2 = ?, updated_at = ? WHERE id = ?",
        (snapshot.to_string(), now_ts(), &attempt.id),
    );
    match res {
        Ok(_) => ok(&req.id, json!({ "saved": true })),
        Err(e) => err(&req.id, "db_error", format!("{e:?}"), None),
    }
}

fn handle_adaptive_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let attempt = match load_attempt(conn, req) {
        Ok(a) => a,
        Err(e) => return e,
    };
    if let Err(e) = require_in_progress(&attempt, req) {
        return e;
    }
    let Some(answered) = req
        .params
        .get("questionsAnswered")
        .and_then(|v| v.as_i64())
        .filter(|n| *n >= 0)
    else {
        return err(
            &req.id,
            "bad_params",
            "questionsAnswered must be a non-negative integer",
            None,
        );
    };

    let session_id = attempt
        .adaptive_session_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let res = conn
        .execute(
            "INSERT INTO adaptive_sessions(id, attempt_id, questions_answered, updated_at)
             VALUES(?, ?, ?, ?)
             ON CONFLICT(attempt_id) DO UPDATE SET
                questions_answered = excluded.questions_answered,
                updated_at = excluded.updated_at",
            (&session_id, &attempt.id, answered, now_ts()),
        )
        .and_then(|_| {
            conn.execute(
                "UPDATE assessment_attempts SET adaptive_session_id = ?, updated_at = ? WHERE id = ?",
                (&session_id, now_ts(), &attempt.id),
            )
        });
    match res {
        Ok(_) => ok(
            &req.id,
            json!({ "adaptiveSessionId": session_id, "questionsAnswered": answered }),
        ),
        Err(e) => err(&req.id, "db_error", format!("{e:?}"), None),
    }
}

fn handle_progress(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let attempt = match load_attempt(conn, req) {
        Ok(a) => a,
        Err(e) => return e,
    };
    let (percent, inputs) = match attempt_percent(conn, &attempt) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_error", format!("{e:?}"), None),
    };

    let mut result = json!({
        "attemptId": attempt.id,
        "gradeLevel": attempt.grade_level,
        "percent": percent,
    });
    if state.debug {
        result["debug"] = json!({
            "restoredCount": inputs.restored_responses.len(),
            "rawResponseCount": inputs.raw_response_count,
            "adaptiveAnswered": inputs.adaptive_answered,
            "expectedTotal": progress::expected_total_questions(&inputs.grade_level),
        });
    }
    ok(&req.id, result)
}

fn transition(state: &mut AppState, req: &Request, to_status: &str) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let attempt = match load_attempt(conn, req) {
        Ok(a) => a,
        Err(e) => return e,
    };
    // Terminal states never transition again.
    if let Err(e) = require_in_progress(&attempt, req) {
        return e;
    }

    let res = conn.execute(
        "UPDATE assessment_attempts SET status = ?, updated_at = ? WHERE id = ?",
        (to_status, now_ts(), &attempt.id),
    );
    match res {
        Ok(_) => ok(&req.id, json!({ "attemptId": attempt.id, "status": to_status })),
        Err(e) => err(&req.id, "db_error", format!("{e:?}"), None),
    }
}

fn handle_dashboard_status(state: &mut AppState, req: &Request) -> serde_json::Value {
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

    let has_result = match flow::has_completed_result(conn, &student_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_error", format!("{e:?}"), None),
    };
    let resumable = match flow::find_resumable(conn, &student_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_error", format!("{e:?}"), None),
    };
    let decision = match flow::decide(conn, &student_id, now) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_error", format!("{e:?}"), None),
    };

    let cta = flow::dashboard_cta(has_result, resumable.is_some());
    let resumable_json = match &resumable {
        None => JsonValue::Null,
        Some(attempt) => match attempt_percent(conn, attempt) {
            Ok((percent, _)) => json!({
                "attemptId": attempt.id,
                "gradeLevel": attempt.grade_level,
                "startedAt": attempt.started_at,
                "percent": percent,
            }),
            Err(e) => return err(&req.id, "db_error", format!("{e:?}"), None),
        },
    };

    let mut result = json!({
        "cta": cta,
        "ctaLabel": cta.label(),
        "canTake": decision.can_take,
        "lastAttemptDate": rfc3339_opt(decision.last_attempt_date),
        "nextAvailableDate": rfc3339_opt(decision.next_available_date),
        "resumable": resumable_json,
    });
    if state.debug {
        result["debug"] = json!({
            "hasCompletedResult": has_result,
            "hasInProgressAttempt": resumable.is_some(),
        });
    }
    ok(&req.id, result)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attempts.start" => Some(handle_start(state, req)),
        "attempts.get" => Some(handle_get(state, req)),
        "attempts.saveResponses" => Some(handle_save_responses(state, req)),
        "attempts.saveSnapshot" => Some(handle_save_snapshot(state, req)),
        "attempts.adaptive.update" => Some(handle_adaptive_update(state, req)),
        "attempts.progress" => Some(handle_progress(state, req)),
        "attempts.complete" => Some(transition(state, req, flow::STATUS_COMPLETED)),
        "attempts.abandon" => Some(transition(state, req, flow::STATUS_ABANDONED)),
        "dashboard.status" => Some(handle_dashboard_status(state, req)),
        _ => None,
    }
}
