use rusqlite::Connection;
use std::path::Path;

pub const DB_FILE_NAME: &str = "academy.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    // Several daemon processes may share one workspace file; let SQLite wait
    // briefly for a writer before reporting SQLITE_BUSY.
    conn.busy_timeout(std::time::Duration::from_millis(250))?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teachers(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            email TEXT NOT NULL UNIQUE,
            pay_per_lecture REAL NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            fname TEXT NOT NULL,
            lname TEXT NOT NULL,
            grade TEXT NOT NULL,
            total_fees REAL NOT NULL,
            fees_paid REAL NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_grade ON students(grade)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS payments(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            date TEXT NOT NULL,
            amount REAL NOT NULL,
            recorded_by TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_payments_student ON payments(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_payments_date ON payments(date)",
        [],
    )?;

    // Older workspaces predate sales attribution on payments.
    ensure_payments_recorded_by(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_payments_recorded_by ON payments(recorded_by)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS schedule_templates(
            id TEXT PRIMARY KEY,
            subject TEXT NOT NULL,
            grade TEXT NOT NULL,
            teacher_id TEXT NOT NULL,
            day_of_week INTEGER NOT NULL,
            start_time TEXT NOT NULL,
            FOREIGN KEY(teacher_id) REFERENCES teachers(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_schedule_templates_teacher ON schedule_templates(teacher_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_schedule_templates_day ON schedule_templates(day_of_week)",
        [],
    )?;

    // The UNIQUE(template_id, date) key is what makes occurrences.ensure an
    // atomic create-if-absent rather than a read-then-write race.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS occurrences(
            id TEXT PRIMARY KEY,
            template_id TEXT NOT NULL,
            date TEXT NOT NULL,
            is_present INTEGER NOT NULL DEFAULT 0,
            is_proxy INTEGER NOT NULL DEFAULT 0,
            substitute_teacher_id TEXT,
            FOREIGN KEY(template_id) REFERENCES schedule_templates(id),
            FOREIGN KEY(substitute_teacher_id) REFERENCES teachers(id),
            UNIQUE(template_id, date)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_occurrences_template ON occurrences(template_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_occurrences_date ON occurrences(date)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_occurrences_substitute ON occurrences(substitute_teacher_id)",
        [],
    )?;

    Ok(conn)
}

fn ensure_payments_recorded_by(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "payments", "recorded_by")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE payments ADD COLUMN recorded_by TEXT", [])?;
    Ok(())
}

/// Opens a write transaction up front so the read-check-then-write sequences
/// inside it serialize against other writers instead of failing at commit.
pub fn immediate_tx(conn: &Connection) -> rusqlite::Result<rusqlite::Transaction<'_>> {
    rusqlite::Transaction::new_unchecked(conn, rusqlite::TransactionBehavior::Immediate)
}

/// True when the error is SQLite telling us another writer holds the file.
/// Handlers map these to a retryable `conflict` instead of a db failure.
pub fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked)
    )
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
