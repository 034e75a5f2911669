use serde_json::json;
use uuid::Uuid;

use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, opt_str, required_str};
use crate::ipc::types::{AppState, Request};
use crate::mail::{dispatch, OutboxMailer};

/// Bridge for the transactional-mail endpoint: the UI shell forwards
/// `{pathname, method, body}` and serves the returned JSON as the HTTP
/// response.
fn handle_route(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let pathname = match required_str(req, "pathname") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let method = opt_str(req, "method").unwrap_or_else(|| "POST".to_string());
    let body = req.params.get("body").cloned().unwrap_or(json!({}));

    let mut mailer = OutboxMailer { conn };
    let response = dispatch(conn, &mut mailer, &pathname, &method, &body);
    ok(&req.id, json!({ "response": response }))
}

fn handle_outbox_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let route_filter = opt_str(req, "route");

    let mut stmt = match conn.prepare(
        "SELECT id, route, recipient, subject, payload, created_at
         FROM mail_outbox
         WHERE (?1 IS NULL OR route = ?1)
         ORDER BY created_at, rowid",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_error", format!("{e:?}"), None),
    };
    let rows = stmt.query_map([&route_filter], |row| {
        let payload: String = row.get(4)?;
        Ok(json!({
            "id": row.get::<_, String>(0)?,
            "route": row.get::<_, String>(1)?,
            "recipient": row.get::<_, String>(2)?,
            "subject": row.get::<_, Option<String>>(3)?,
            "payload": serde_json::from_str::<serde_json::Value>(&payload)
                .unwrap_or(serde_json::Value::Null),
            "createdAt": row.get::<_, String>(5)?,
        }))
    });
    match rows.and_then(|r| r.collect::<Result<Vec<_>, _>>()) {
        Ok(messages) => ok(&req.id, json!({ "messages": messages })),
        Err(e) => err(&req.id, "db_error", format!("{e:?}"), None),
    }
}

/// Order records exist only to serve receipt lookups.
fn handle_order_upsert(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let order_id = opt_str(req, "orderId").unwrap_or_else(|| Uuid::new_v4().to_string());
    let Some(amount) = req.params.get("amount").and_then(|v| v.as_f64()) else {
        return err(&req.id, "bad_params", "missing amount", None);
    };
    let currency = opt_str(req, "currency").unwrap_or_else(|| "INR".to_string());
    let student_id = opt_str(req, "studentId");
    let description = opt_str(req, "description");
    let paid_at = opt_str(req, "paidAt");

    let res = conn.execute(
        "INSERT INTO orders(id, student_id, amount, currency, description, paid_at)
         VALUES(?, ?, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
            student_id = excluded.student_id,
            amount = excluded.amount,
            currency = excluded.currency,
            description = excluded.description,
            paid_at = excluded.paid_at",
        (&order_id, &student_id, amount, &currency, &description, &paid_at),
    );
    match res {
        Ok(_) => ok(&req.id, json!({ "orderId": order_id })),
        Err(e) => err(&req.id, "db_error", format!("{e:?}"), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "mail.route" => Some(handle_route(state, req)),
        "mail.outbox.list" => Some(handle_outbox_list(state, req)),
        "orders.upsert" => Some(handle_order_upsert(state, req)),
        _ => None,
    }
}
