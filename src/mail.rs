use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value as JsonValue};
use uuid::Uuid;

/// Routes served by the transactional-mail endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MailRoute {
    Invitation,
    Countdown,
    BulkCountdown,
    EventConfirmation,
    EventOtp,
    PasswordReset,
    GenericSend,
    DownloadReceipt { order_id: String },
}

impl MailRoute {
    pub fn id(&self) -> &'static str {
        match self {
            MailRoute::Invitation => "invitation",
            MailRoute::Countdown => "countdown",
            MailRoute::BulkCountdown => "bulk_countdown",
            MailRoute::EventConfirmation => "event_confirmation",
            MailRoute::EventOtp => "event_otp",
            MailRoute::PasswordReset => "password_reset",
            MailRoute::GenericSend => "send",
            MailRoute::DownloadReceipt { .. } => "download_receipt",
        }
    }
}

/// Match `(pathname, method)` against the known routes. Trailing slashes are
/// tolerated; method comparison is case-insensitive.
pub fn match_route(pathname: &str, method: &str) -> Option<MailRoute> {
    let path = pathname.trim_end_matches('/');
    let method = method.to_ascii_uppercase();

    if method == "GET" {
        let order_id = path.strip_prefix("/download-receipt/")?;
        if order_id.is_empty() || order_id.contains('/') {
            return None;
        }
        return Some(MailRoute::DownloadReceipt {
            order_id: order_id.to_string(),
        });
    }
    if method != "POST" {
        return None;
    }

    match path {
        "/send-invitation" => Some(MailRoute::Invitation),
        "/send-countdown" => Some(MailRoute::Countdown),
        "/send-bulk-countdown" => Some(MailRoute::BulkCountdown),
        "/send-event-confirmation" => Some(MailRoute::EventConfirmation),
        "/send-event-otp" => Some(MailRoute::EventOtp),
        "/send-password-reset" => Some(MailRoute::PasswordReset),
        "/send" => Some(MailRoute::GenericSend),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct OutboundMail {
    pub route: &'static str,
    pub recipient: String,
    pub subject: String,
    pub payload: JsonValue,
}

/// The mail-sending boundary. The daemon never talks SMTP itself; the
/// default implementation records messages into the workspace outbox for
/// pickup and inspection.
pub trait Mailer {
    fn send(&mut self, mail: &OutboundMail) -> anyhow::Result<()>;
}

pub struct OutboxMailer<'a> {
    pub conn: &'a Connection,
}

impl Mailer for OutboxMailer<'_> {
    fn send(&mut self, mail: &OutboundMail) -> anyhow::Result<()> {
        self.conn.execute(
            "INSERT INTO mail_outbox(id, route, recipient, subject, payload, created_at)
             VALUES(?, ?, ?, ?, ?, ?)",
            (
                Uuid::new_v4().to_string(),
                mail.route,
                &mail.recipient,
                &mail.subject,
                serde_json::to_string(&mail.payload)?,
                Utc::now().to_rfc3339(),
            ),
        )?;
        Ok(())
    }
}

fn failure(status: i64, message: impl Into<String>) -> JsonValue {
    json!({ "success": false, "status": status, "message": message.into() })
}

fn body_str(body: &JsonValue, key: &str) -> Option<String> {
    body.get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Dispatch one request through the route table. Returns the JSON the HTTP
/// layer would serve: `{success, message, ...}` or a 404-shaped failure.
pub fn dispatch(
    conn: &Connection,
    mailer: &mut dyn Mailer,
    pathname: &str,
    method: &str,
    body: &JsonValue,
) -> JsonValue {
    let Some(route) = match_route(pathname, method) else {
        return failure(404, format!("no route for {} {}", method, pathname));
    };

    match route {
        MailRoute::DownloadReceipt { order_id } => receipt_by_order_id(conn, &order_id),
        MailRoute::BulkCountdown => {
            let Some(recipients) = body.get("recipients").and_then(|v| v.as_array()) else {
                return failure(400, "missing recipients array");
            };
            let emails: Vec<String> = recipients
                .iter()
                .filter_map(|v| v.as_str())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if emails.is_empty() {
                return failure(400, "recipients array is empty");
            }
            for email in &emails {
                let mail = OutboundMail {
                    route: route.id(),
                    recipient: email.clone(),
                    subject: "Your assessment event is coming up".to_string(),
                    payload: body.clone(),
                };
                if let Err(e) = mailer.send(&mail) {
                    return failure(500, format!("send failed for {}: {}", email, e));
                }
            }
            json!({ "success": true, "message": format!("queued {} countdown emails", emails.len()) })
        }
        _ => {
            let Some(email) = body_str(body, "email") else {
                return failure(400, "missing email");
            };
            if let Err(msg) = validate_body(&route, body) {
                return failure(400, msg);
            }
            let mail = OutboundMail {
                route: route.id(),
                recipient: email,
                subject: subject_for(&route, body),
                payload: body.clone(),
            };
            match mailer.send(&mail) {
                Ok(()) => json!({ "success": true, "message": format!("{} email queued", route.id()) }),
                Err(e) => failure(500, format!("send failed: {}", e)),
            }
        }
    }
}

fn validate_body(route: &MailRoute, body: &JsonValue) -> Result<(), String> {
    let require = |key: &str| -> Result<(), String> {
        if body_str(body, key).is_some() {
            Ok(())
        } else {
            Err(format!("missing {}", key))
        }
    };
    match route {
        MailRoute::EventConfirmation => require("eventId"),
        MailRoute::EventOtp => require("otp"),
        MailRoute::PasswordReset => require("resetLink"),
        _ => Ok(()),
    }
}

fn subject_for(route: &MailRoute, body: &JsonValue) -> String {
    match route {
        MailRoute::Invitation => "You are invited to take your career assessment".to_string(),
        MailRoute::Countdown => "Your assessment event is coming up".to_string(),
        MailRoute::EventConfirmation => "Your event registration is confirmed".to_string(),
        MailRoute::EventOtp => "Your event verification code".to_string(),
        MailRoute::PasswordReset => "Reset your password".to_string(),
        _ => body_str(body, "subject").unwrap_or_else(|| "Notification".to_string()),
    }
}

fn receipt_by_order_id(conn: &Connection, order_id: &str) -> JsonValue {
    let row = conn
        .query_row(
            "SELECT id, student_id, amount, currency, description, paid_at
             FROM orders WHERE id = ?",
            [order_id],
            |row| {
                Ok(json!({
                    "orderId": row.get::<_, String>(0)?,
                    "studentId": row.get::<_, Option<String>>(1)?,
                    "amount": row.get::<_, f64>(2)?,
                    "currency": row.get::<_, String>(3)?,
                    "description": row.get::<_, Option<String>>(4)?,
                    "paidAt": row.get::<_, Option<String>>(5)?,
                }))
            },
        )
        .optional();

    match row {
        Ok(Some(receipt)) => json!({ "success": true, "message": "receipt ready", "receipt": receipt }),
        Ok(None) => failure(404, "order not found"),
        Err(e) => failure(500, format!("receipt lookup failed: {}", e)),
    }
}
