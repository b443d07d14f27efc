use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;

pub fn open_db(
    workspace: &Path,
    db_file_name: &str,
    busy_timeout: Duration,
) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(db_file_name);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    // The batch worker holds its own connection to the same file.
    conn.busy_timeout(busy_timeout)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            updated_at TEXT,
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class ON students(class_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS assignments(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            name TEXT NOT NULL,
            date TEXT NOT NULL,
            scale REAL,
            average REAL,
            updated_at TEXT,
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    ensure_assignments_cache_columns(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assignments_class ON assignments(class_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS questions(
            id TEXT PRIMARY KEY,
            assignment_id TEXT NOT NULL,
            number TEXT NOT NULL,
            title TEXT NOT NULL,
            points_max REAL NOT NULL,
            coefficient REAL NOT NULL DEFAULT 1,
            FOREIGN KEY(assignment_id) REFERENCES assignments(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_questions_assignment ON questions(assignment_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS scores(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            question_id TEXT NOT NULL,
            points REAL NOT NULL,
            comment TEXT,
            updated_at TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(question_id) REFERENCES questions(id),
            UNIQUE(student_id, question_id)
        )",
        [],
    )?;
    ensure_scores_comment(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_scores_question ON scores(question_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_scores_student ON scores(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS reports(
            id TEXT PRIMARY KEY,
            assignment_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            appreciation TEXT NOT NULL DEFAULT '',
            document BLOB,
            document_sha256 TEXT,
            updated_at TEXT,
            FOREIGN KEY(assignment_id) REFERENCES assignments(id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            UNIQUE(assignment_id, student_id)
        )",
        [],
    )?;
    ensure_reports_digest(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_reports_assignment ON reports(assignment_id)",
        [],
    )?;

    Ok(conn)
}

fn ensure_assignments_cache_columns(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "assignments", "scale")? {
        conn.execute("ALTER TABLE assignments ADD COLUMN scale REAL", [])?;
    }
    if !table_has_column(conn, "assignments", "average")? {
        conn.execute("ALTER TABLE assignments ADD COLUMN average REAL", [])?;
    }
    if !table_has_column(conn, "assignments", "updated_at")? {
        conn.execute("ALTER TABLE assignments ADD COLUMN updated_at TEXT", [])?;
    }
    Ok(())
}

fn ensure_scores_comment(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "scores", "comment")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE scores ADD COLUMN comment TEXT", [])?;
    Ok(())
}

fn ensure_reports_digest(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "reports", "document_sha256")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE reports ADD COLUMN document_sha256 TEXT", [])?;
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

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[cfg(test)]
pub fn open_temp() -> Connection {
    let dir = std::env::temp_dir().join(format!("notad-unit-{}", uuid::Uuid::new_v4()));
    open_db(&dir, "nota.sqlite3", Duration::from_millis(1000)).expect("open test db")
}
