//! Data-access contract the grading engine runs against, and its SQLite
//! implementation.
//!
//! Engine functions take the store as an explicit argument. A `SqliteStore`
//! built over a transaction gives one aggregate call a consistent snapshot.

use crate::calc::scoring::{sort_questions, Question, ScoreEntry};
use crate::db::now_rfc3339;
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
    #[error("{entity} not found")]
    NotFound { entity: &'static str, id: String },
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: &str) -> Self {
        StoreError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            StoreError::Db(_) => "db_query_failed",
            StoreError::NotFound { .. } => "not_found",
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Class {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Student {
    pub id: String,
    pub class_id: String,
    pub last_name: String,
    pub first_name: String,
}

impl Student {
    pub fn display_name(&self) -> String {
        format!("{} {}", self.last_name, self.first_name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Assignment {
    pub id: String,
    pub class_id: String,
    pub name: String,
    pub date: String,
    pub scale: Option<f64>,
    /// Display cache, written only by the recalculation service.
    pub average: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub id: String,
    pub assignment_id: String,
    pub student_id: String,
    pub appreciation: String,
    pub has_document: bool,
    pub document_sha256: Option<String>,
    pub updated_at: Option<String>,
}

pub trait GradeStore {
    fn list_classes(&self) -> StoreResult<Vec<Class>>;
    fn list_students_in_class(&self, class_id: &str) -> StoreResult<Vec<Student>>;
    fn list_assignments_in_class(&self, class_id: &str) -> StoreResult<Vec<Assignment>>;
    fn get_student(&self, student_id: &str) -> StoreResult<Option<Student>>;
    fn get_assignment(&self, assignment_id: &str) -> StoreResult<Option<Assignment>>;

    /// Questions in display-number order.
    fn list_questions(&self, assignment_id: &str) -> StoreResult<Vec<Question>>;

    /// One entry per question of the assignment, aligned with
    /// [`GradeStore::list_questions`]; `None` where no score is recorded.
    fn list_scores(
        &self,
        student_id: &str,
        assignment_id: &str,
    ) -> StoreResult<Vec<Option<ScoreEntry>>>;

    fn upsert_score(
        &self,
        student_id: &str,
        question_id: &str,
        points: f64,
        comment: Option<&str>,
    ) -> StoreResult<()>;
    fn delete_scores_for_question(&self, question_id: &str) -> StoreResult<usize>;
    fn delete_scores_for_assignment(&self, assignment_id: &str) -> StoreResult<usize>;
    fn write_assignment_average(&self, assignment_id: &str, value: Option<f64>)
        -> StoreResult<()>;

    fn get_report(&self, assignment_id: &str, student_id: &str) -> StoreResult<Option<Report>>;
    /// Writing without a document clears any cached one.
    fn upsert_report(
        &self,
        assignment_id: &str,
        student_id: &str,
        appreciation: &str,
        rendered_document: Option<&[u8]>,
    ) -> StoreResult<()>;
}

pub struct SqliteStore<'c> {
    conn: &'c Connection,
}

impl<'c> SqliteStore<'c> {
    /// Pass a `Transaction` (it derefs to `Connection`) when the calls must
    /// see one snapshot.
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    pub fn conn(&self) -> &Connection {
        self.conn
    }
}

pub fn document_digest(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

fn student_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<Student> {
    Ok(Student {
        id: r.get(0)?,
        class_id: r.get(1)?,
        last_name: r.get(2)?,
        first_name: r.get(3)?,
    })
}

fn assignment_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<Assignment> {
    Ok(Assignment {
        id: r.get(0)?,
        class_id: r.get(1)?,
        name: r.get(2)?,
        date: r.get(3)?,
        scale: r.get(4)?,
        average: r.get(5)?,
    })
}

fn report_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<Report> {
    Ok(Report {
        id: r.get(0)?,
        assignment_id: r.get(1)?,
        student_id: r.get(2)?,
        appreciation: r.get(3)?,
        has_document: r.get::<_, i64>(4)? != 0,
        document_sha256: r.get(5)?,
        updated_at: r.get(6)?,
    })
}

impl GradeStore for SqliteStore<'_> {
    fn list_classes(&self) -> StoreResult<Vec<Class>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name FROM classes ORDER BY name, id")?;
        let rows = stmt
            .query_map([], |r| {
                Ok(Class {
                    id: r.get(0)?,
                    name: r.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn list_students_in_class(&self, class_id: &str) -> StoreResult<Vec<Student>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, class_id, last_name, first_name
             FROM students
             WHERE class_id = ?
             ORDER BY last_name, first_name, id",
        )?;
        let rows = stmt
            .query_map([class_id], student_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn list_assignments_in_class(&self, class_id: &str) -> StoreResult<Vec<Assignment>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, class_id, name, date, scale, average
             FROM assignments
             WHERE class_id = ?
             ORDER BY date DESC, name, id",
        )?;
        let rows = stmt
            .query_map([class_id], assignment_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn get_student(&self, student_id: &str) -> StoreResult<Option<Student>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, class_id, last_name, first_name FROM students WHERE id = ?",
                [student_id],
                student_from_row,
            )
            .optional()?)
    }

    fn get_assignment(&self, assignment_id: &str) -> StoreResult<Option<Assignment>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, class_id, name, date, scale, average FROM assignments WHERE id = ?",
                [assignment_id],
                assignment_from_row,
            )
            .optional()?)
    }

    fn list_questions(&self, assignment_id: &str) -> StoreResult<Vec<Question>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, assignment_id, number, title, points_max, coefficient
             FROM questions
             WHERE assignment_id = ?",
        )?;
        let mut rows = stmt
            .query_map([assignment_id], |r| {
                Ok(Question {
                    id: r.get(0)?,
                    assignment_id: r.get(1)?,
                    number: r.get(2)?,
                    title: r.get(3)?,
                    points_max: r.get(4)?,
                    coefficient: r.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        sort_questions(&mut rows);
        Ok(rows)
    }

    fn list_scores(
        &self,
        student_id: &str,
        assignment_id: &str,
    ) -> StoreResult<Vec<Option<ScoreEntry>>> {
        let questions = self.list_questions(assignment_id)?;
        let mut stmt = self.conn.prepare(
            "SELECT s.question_id, s.points, s.comment
             FROM scores s
             JOIN questions q ON q.id = s.question_id
             WHERE s.student_id = ? AND q.assignment_id = ?",
        )?;
        let mut by_question: HashMap<String, ScoreEntry> = stmt
            .query_map((student_id, assignment_id), |r| {
                Ok(ScoreEntry {
                    question_id: r.get(0)?,
                    points: r.get(1)?,
                    comment: r.get(2)?,
                })
            })?
            .map(|row| row.map(|e| (e.question_id.clone(), e)))
            .collect::<Result<HashMap<_, _>, _>>()?;
        Ok(questions
            .iter()
            .map(|q| by_question.remove(&q.id))
            .collect())
    }

    fn upsert_score(
        &self,
        student_id: &str,
        question_id: &str,
        points: f64,
        comment: Option<&str>,
    ) -> StoreResult<()> {
        let score_id = Uuid::new_v4().to_string();
        self.conn.execute(
            "INSERT INTO scores(id, student_id, question_id, points, comment, updated_at)
             VALUES(?, ?, ?, ?, ?, ?)
             ON CONFLICT(student_id, question_id) DO UPDATE SET
               points = excluded.points,
               comment = excluded.comment,
               updated_at = excluded.updated_at",
            (
                &score_id,
                student_id,
                question_id,
                points,
                comment,
                now_rfc3339(),
            ),
        )?;
        Ok(())
    }

    fn delete_scores_for_question(&self, question_id: &str) -> StoreResult<usize> {
        Ok(self
            .conn
            .execute("DELETE FROM scores WHERE question_id = ?", [question_id])?)
    }

    fn delete_scores_for_assignment(&self, assignment_id: &str) -> StoreResult<usize> {
        Ok(self.conn.execute(
            "DELETE FROM scores
             WHERE question_id IN (SELECT id FROM questions WHERE assignment_id = ?)",
            [assignment_id],
        )?)
    }

    fn write_assignment_average(
        &self,
        assignment_id: &str,
        value: Option<f64>,
    ) -> StoreResult<()> {
        let changed = self.conn.execute(
            "UPDATE assignments SET average = ?, updated_at = ? WHERE id = ?",
            (value, now_rfc3339(), assignment_id),
        )?;
        if changed == 0 {
            return Err(StoreError::not_found("assignment", assignment_id));
        }
        Ok(())
    }

    fn get_report(&self, assignment_id: &str, student_id: &str) -> StoreResult<Option<Report>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, assignment_id, student_id, appreciation,
                        document IS NOT NULL, document_sha256, updated_at
                 FROM reports
                 WHERE assignment_id = ? AND student_id = ?",
                (assignment_id, student_id),
                report_from_row,
            )
            .optional()?)
    }

    fn upsert_report(
        &self,
        assignment_id: &str,
        student_id: &str,
        appreciation: &str,
        rendered_document: Option<&[u8]>,
    ) -> StoreResult<()> {
        let report_id = Uuid::new_v4().to_string();
        let digest = rendered_document.map(document_digest);
        self.conn.execute(
            "INSERT INTO reports(id, assignment_id, student_id, appreciation, document, document_sha256, updated_at)
             VALUES(?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(assignment_id, student_id) DO UPDATE SET
               appreciation = excluded.appreciation,
               document = excluded.document,
               document_sha256 = excluded.document_sha256,
               updated_at = excluded.updated_at",
            (
                &report_id,
                assignment_id,
                student_id,
                appreciation,
                rendered_document,
                digest,
                now_rfc3339(),
            ),
        )?;
        Ok(())
    }
}

pub fn list_reports_for_assignment(
    conn: &Connection,
    assignment_id: &str,
) -> StoreResult<Vec<(Report, Student)>> {
    let mut stmt = conn.prepare(
        "SELECT r.id, r.assignment_id, r.student_id, r.appreciation,
                r.document IS NOT NULL, r.document_sha256, r.updated_at,
                e.id, e.class_id, e.last_name, e.first_name
         FROM reports r
         JOIN students e ON e.id = r.student_id
         WHERE r.assignment_id = ?
         ORDER BY e.last_name, e.first_name, e.id",
    )?;
    let rows = stmt
        .query_map([assignment_id], |r| {
            let report = report_from_row(r)?;
            let student = Student {
                id: r.get(7)?,
                class_id: r.get(8)?,
                last_name: r.get(9)?,
                first_name: r.get(10)?,
            };
            Ok((report, student))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn read_report_document(conn: &Connection, report_id: &str) -> StoreResult<Option<Vec<u8>>> {
    let row: Option<Option<Vec<u8>>> = conn
        .query_row(
            "SELECT document FROM reports WHERE id = ?",
            [report_id],
            |r| r.get(0),
        )
        .optional()?;
    match row {
        Some(doc) => Ok(doc),
        None => Err(StoreError::not_found("report", report_id)),
    }
}
