use rusqlite::{Connection, OptionalExtension};
use serde_json::{Map, Value as JsonValue};
use std::path::Path;

pub const DB_FILE_NAME: &str = "pathways.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS student_profiles(
            id TEXT PRIMARY KEY,
            stored_grade TEXT,
            is_college_student INTEGER NOT NULL DEFAULT 0,
            program_name TEXT,
            grade_started_at TEXT,
            updated_at TEXT
        )",
        [],
    )?;
    // Early workspaces predate program tracking. Add the column if needed.
    ensure_profiles_program_name(&conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS assessment_attempts(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            grade_level TEXT NOT NULL,
            stream_id TEXT,
            status TEXT NOT NULL,
            started_at TEXT NOT NULL,
            responses TEXT NOT NULL DEFAULT '{}',
            adaptive_session_id TEXT,
            snapshot_v2 TEXT,
            updated_at TEXT,
            FOREIGN KEY(student_id) REFERENCES student_profiles(id)
        )",
        [],
    )?;
    ensure_attempts_snapshot_columns(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attempts_student ON assessment_attempts(student_id)",
        [],
    )?;
    // One live attempt per student; races between clients land here.
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_attempts_one_in_progress
         ON assessment_attempts(student_id) WHERE status = 'in_progress'",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS adaptive_sessions(
            id TEXT PRIMARY KEY,
            attempt_id TEXT NOT NULL,
            questions_answered INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT,
            FOREIGN KEY(attempt_id) REFERENCES assessment_attempts(id),
            UNIQUE(attempt_id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS assessment_results(
            id TEXT PRIMARY KEY,
            attempt_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            grade_level TEXT NOT NULL,
            stream_id TEXT,
            created_at TEXT NOT NULL,
            riasec_scores TEXT,
            big_five_scores TEXT,
            aptitude_scores TEXT,
            career_fit TEXT,
            roadmap TEXT,
            FOREIGN KEY(attempt_id) REFERENCES assessment_attempts(id),
            FOREIGN KEY(student_id) REFERENCES student_profiles(id),
            UNIQUE(attempt_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_results_student ON assessment_results(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_results_student_created
         ON assessment_results(student_id, created_at)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS orders(
            id TEXT PRIMARY KEY,
            student_id TEXT,
            amount REAL NOT NULL,
            currency TEXT NOT NULL DEFAULT 'INR',
            description TEXT,
            paid_at TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS mail_outbox(
            id TEXT PRIMARY KEY,
            route TEXT NOT NULL,
            recipient TEXT NOT NULL,
            subject TEXT,
            payload TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_mail_outbox_route ON mail_outbox(route)",
        [],
    )?;

    Ok(conn)
}

fn ensure_profiles_program_name(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "student_profiles", "program_name")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE student_profiles ADD COLUMN program_name TEXT", [])?;
    Ok(())
}

fn ensure_attempts_snapshot_columns(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "assessment_attempts", "snapshot_v2")? {
        conn.execute("ALTER TABLE assessment_attempts ADD COLUMN snapshot_v2 TEXT", [])?;
    }
    if !table_has_column(conn, "assessment_attempts", "adaptive_session_id")? {
        conn.execute(
            "ALTER TABLE assessment_attempts ADD COLUMN adaptive_session_id TEXT",
            [],
        )?;
    }
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
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

#[derive(Debug, Clone)]
pub struct AttemptRow {
    pub id: String,
    pub student_id: String,
    pub grade_level: String,
    pub stream_id: Option<String>,
    pub status: String,
    pub started_at: String,
    pub responses: JsonValue,
    pub adaptive_session_id: Option<String>,
    pub snapshot_v2: Option<JsonValue>,
}

pub fn get_attempt(conn: &Connection, attempt_id: &str) -> anyhow::Result<Option<AttemptRow>> {
    let row = conn
        .query_row(
            "SELECT id, student_id, grade_level, stream_id, status, started_at,
                    responses, adaptive_session_id, snapshot_v2
             FROM assessment_attempts WHERE id = ?",
            [attempt_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, Option<String>>(7)?,
                    row.get::<_, Option<String>>(8)?,
                ))
            },
        )
        .optional()?;

    let Some((id, student_id, grade_level, stream_id, status, started_at, responses, adaptive, snapshot)) =
        row
    else {
        return Ok(None);
    };

    let responses: JsonValue = serde_json::from_str(&responses).unwrap_or(JsonValue::Null);
    let snapshot_v2 = snapshot.and_then(|s| serde_json::from_str(&s).ok());

    Ok(Some(AttemptRow {
        id,
        student_id,
        grade_level,
        stream_id,
        status,
        started_at,
        responses,
        adaptive_session_id: adaptive,
        snapshot_v2,
    }))
}

pub fn adaptive_questions_answered(conn: &Connection, attempt_id: &str) -> anyhow::Result<i64> {
    let n: Option<i64> = conn
        .query_row(
            "SELECT questions_answered FROM adaptive_sessions WHERE attempt_id = ?",
            [attempt_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(n.unwrap_or(0))
}

/// Collapse the historical response-key schemes into one canonical map.
///
/// Stored response maps accumulated three key shapes over time:
/// - bare question UUIDs ("8f1c...-...")
/// - section-prefixed keys ("riasec:8f1c...-...")
/// - legacy flat keys ("q12")
///
/// The canonical key is the segment after the last ':'. Duplicates collapse
/// (first entry wins, never summed). Null answer values mean "presented but
/// unanswered" and are dropped here; callers that need the raw entry count
/// read the map size directly.
pub fn restored_responses(raw: &JsonValue) -> Map<String, JsonValue> {
    let mut out = Map::new();
    let Some(obj) = raw.as_object() else {
        return out;
    };
    for (key, value) in obj {
        if value.is_null() {
            continue;
        }
        let canonical = match key.rsplit_once(':') {
            Some((_, tail)) if !tail.is_empty() => tail,
            _ => key.as_str(),
        };
        if !out.contains_key(canonical) {
            out.insert(canonical.to_string(), value.clone());
        }
    }
    out
}

/// Raw entry count of a stored response map, nulls included.
pub fn raw_response_count(raw: &JsonValue) -> usize {
    raw.as_object().map(|o| o.len()).unwrap_or(0)
}
