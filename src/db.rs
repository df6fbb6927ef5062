use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("lessonbook.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teachers(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            subjects_json TEXT NOT NULL,
            grade_min INTEGER NOT NULL,
            grade_max INTEGER NOT NULL,
            cap_week_slots INTEGER NOT NULL,
            cap_students INTEGER NOT NULL,
            allow_pair INTEGER NOT NULL DEFAULT 1,
            active INTEGER NOT NULL DEFAULT 1,
            sort_order INTEGER NOT NULL,
            updated_at TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_teachers_active ON teachers(active, sort_order)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            grade INTEGER NOT NULL,
            subjects_json TEXT NOT NULL,
            one_on_one INTEGER NOT NULL DEFAULT 0,
            ng_teacher_ids_json TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            sort_order INTEGER NOT NULL,
            updated_at TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_active ON students(active, sort_order)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS time_slots(
            id TEXT PRIMARY KEY,
            label TEXT NOT NULL,
            start_time TEXT NOT NULL,
            sort_order INTEGER NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS patterns(
            id TEXT PRIMARY KEY,
            teacher_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            weekday INTEGER NOT NULL,
            time_slot_id TEXT NOT NULL,
            subject TEXT NOT NULL,
            position INTEGER NOT NULL DEFAULT 0,
            start_date TEXT NOT NULL,
            end_date TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            FOREIGN KEY(teacher_id) REFERENCES teachers(id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(time_slot_id) REFERENCES time_slots(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_patterns_teacher ON patterns(teacher_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_patterns_student ON patterns(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS pattern_exceptions(
            id TEXT PRIMARY KEY,
            pattern_id TEXT NOT NULL,
            date TEXT NOT NULL,
            kind TEXT NOT NULL,
            moved_date TEXT,
            moved_time_slot_id TEXT,
            FOREIGN KEY(pattern_id) REFERENCES patterns(id),
            UNIQUE(pattern_id, date)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_pattern_exceptions_pattern ON pattern_exceptions(pattern_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS assignments(
            id TEXT PRIMARY KEY,
            teacher_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            date TEXT NOT NULL,
            weekday INTEGER NOT NULL,
            time_slot_id TEXT NOT NULL,
            subject TEXT NOT NULL,
            position INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'scheduled',
            pattern_id TEXT,
            created_at TEXT,
            updated_at TEXT,
            FOREIGN KEY(teacher_id) REFERENCES teachers(id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(time_slot_id) REFERENCES time_slots(id),
            FOREIGN KEY(pattern_id) REFERENCES patterns(id)
        )",
        [],
    )?;
    // Seat and student double-booking guards apply to live rows only;
    // cancelled rows keep their history without blocking the seat.
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_assignments_seat
         ON assignments(teacher_id, date, time_slot_id, position)
         WHERE status != 'cancelled'",
        [],
    )?;
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_assignments_student_slot
         ON assignments(student_id, date, time_slot_id)
         WHERE status != 'cancelled'",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assignments_date ON assignments(date)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assignments_teacher_date ON assignments(teacher_id, date)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assignments_student_date ON assignments(student_id, date)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assignments_pattern ON assignments(pattern_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    // Workspaces created before pairing seats were introduced may lack the
    // position columns. Add if needed.
    ensure_position_columns(&conn)?;

    Ok(conn)
}

fn ensure_position_columns(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "assignments", "position")? {
        conn.execute(
            "ALTER TABLE assignments ADD COLUMN position INTEGER NOT NULL DEFAULT 0",
            [],
        )?;
    }
    if !table_has_column(conn, "patterns", "position")? {
        conn.execute(
            "ALTER TABLE patterns ADD COLUMN position INTEGER NOT NULL DEFAULT 0",
            [],
        )?;
    }
    Ok(())
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row("SELECT value_json FROM settings WHERE key = ?", [key], |r| {
            r.get(0)
        })
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
