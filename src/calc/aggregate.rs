//! Aggregates over complete (student, assignment) pairs.
//!
//! Every function recomputes from the store; the cached assignment average
//! is never read here. A pair contributes its rounded final grade, and every
//! mean is rounded once more with the same helper, so an assignment average
//! always equals the mean of its distribution.

use crate::calc::completion::{entered_count, sheet_is_complete};
use crate::calc::scoring::{self, final_grade_aligned, round_2_decimals, Question};
use crate::store::{GradeStore, Student, StoreError, StoreResult};
use serde::Serialize;

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let sum: f64 = values.iter().sum();
    Some(round_2_decimals(sum / (values.len() as f64)))
}

/// Final grade of a pair, `None` unless the pair is complete and the
/// assignment has a non-zero weighted maximum.
fn graded_pair<S: GradeStore>(
    store: &S,
    student_id: &str,
    assignment_id: &str,
    questions: &[Question],
) -> StoreResult<Option<f64>> {
    if questions.is_empty() {
        return Ok(None);
    }
    let aligned = store.list_scores(student_id, assignment_id)?;
    if !sheet_is_complete(&aligned) {
        return Ok(None);
    }
    Ok(final_grade_aligned(questions, &aligned))
}

fn require_student<S: GradeStore>(store: &S, student_id: &str) -> StoreResult<Student> {
    store
        .get_student(student_id)?
        .ok_or_else(|| StoreError::not_found("student", student_id))
}

fn require_assignment_class<S: GradeStore>(store: &S, assignment_id: &str) -> StoreResult<String> {
    store
        .get_assignment(assignment_id)?
        .map(|a| a.class_id)
        .ok_or_else(|| StoreError::not_found("assignment", assignment_id))
}

pub fn grade_for_pair<S: GradeStore>(
    store: &S,
    student_id: &str,
    assignment_id: &str,
) -> StoreResult<Option<f64>> {
    let questions = store.list_questions(assignment_id)?;
    graded_pair(store, student_id, assignment_id, &questions)
}

fn student_grades<S: GradeStore>(store: &S, student_id: &str) -> StoreResult<Vec<f64>> {
    let student = require_student(store, student_id)?;
    let mut grades = Vec::new();
    for a in store.list_assignments_in_class(&student.class_id)? {
        let questions = store.list_questions(&a.id)?;
        if let Some(g) = graded_pair(store, student_id, &a.id, &questions)? {
            grades.push(g);
        }
    }
    Ok(grades)
}

/// Mean over the student's complete assignments; 0 when there are none.
pub fn average_for_student<S: GradeStore>(store: &S, student_id: &str) -> StoreResult<f64> {
    Ok(mean(&student_grades(store, student_id)?).unwrap_or(0.0))
}

pub fn count_graded_assignments<S: GradeStore>(store: &S, student_id: &str) -> StoreResult<usize> {
    Ok(student_grades(store, student_id)?.len())
}

/// Final grades of every complete student, in student list order.
pub fn grade_distribution<S: GradeStore>(store: &S, assignment_id: &str) -> StoreResult<Vec<f64>> {
    let class_id = require_assignment_class(store, assignment_id)?;
    let questions = store.list_questions(assignment_id)?;
    let mut grades = Vec::new();
    for s in store.list_students_in_class(&class_id)? {
        if let Some(g) = graded_pair(store, &s.id, assignment_id, &questions)? {
            grades.push(g);
        }
    }
    Ok(grades)
}

/// Mean over complete students; `None` when no student is complete.
pub fn average_for_assignment<S: GradeStore>(
    store: &S,
    assignment_id: &str,
) -> StoreResult<Option<f64>> {
    Ok(mean(&grade_distribution(store, assignment_id)?))
}

fn class_pair_grades<S: GradeStore>(store: &S, class_id: &str) -> StoreResult<Vec<f64>> {
    let students = store.list_students_in_class(class_id)?;
    let mut grades = Vec::new();
    for a in store.list_assignments_in_class(class_id)? {
        let questions = store.list_questions(&a.id)?;
        for s in &students {
            if let Some(g) = graded_pair(store, &s.id, &a.id, &questions)? {
                grades.push(g);
            }
        }
    }
    Ok(grades)
}

pub fn average_for_class<S: GradeStore>(store: &S, class_id: &str) -> StoreResult<f64> {
    Ok(mean(&class_pair_grades(store, class_id)?).unwrap_or(0.0))
}

/// Mean over every complete pair of every class, pooled (classes are not
/// averaged with each other first).
pub fn global_average<S: GradeStore>(store: &S) -> StoreResult<f64> {
    let mut grades = Vec::new();
    for c in store.list_classes()? {
        grades.extend(class_pair_grades(store, &c.id)?);
    }
    Ok(mean(&grades).unwrap_or(0.0))
}

pub fn scale_total<S: GradeStore>(store: &S, assignment_id: &str) -> StoreResult<f64> {
    Ok(scoring::scale_total(&store.list_questions(assignment_id)?))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributionStats {
    pub count: usize,
    pub mean: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    /// Population standard deviation.
    pub std_dev: Option<f64>,
}

pub fn distribution_stats(values: &[f64]) -> DistributionStats {
    let Some(avg) = mean(values) else {
        return DistributionStats {
            count: 0,
            mean: None,
            min: None,
            max: None,
            std_dev: None,
        };
    };
    let n = values.len() as f64;
    let raw_mean = values.iter().sum::<f64>() / n;
    let variance = values
        .iter()
        .map(|v| (v - raw_mean) * (v - raw_mean))
        .sum::<f64>()
        / n;
    DistributionStats {
        count: values.len(),
        mean: Some(avg),
        min: values.iter().copied().reduce(f64::min),
        max: values.iter().copied().reduce(f64::max),
        std_dev: Some(round_2_decimals(variance.sqrt())),
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentProgress {
    pub student: Student,
    pub entered: usize,
    pub total: usize,
    pub complete: bool,
    pub final_grade: Option<f64>,
}

/// Per-student correction state for one assignment.
pub fn correction_progress<S: GradeStore>(
    store: &S,
    assignment_id: &str,
) -> StoreResult<Vec<StudentProgress>> {
    let class_id = require_assignment_class(store, assignment_id)?;
    let questions = store.list_questions(assignment_id)?;
    let mut out = Vec::new();
    for s in store.list_students_in_class(&class_id)? {
        let aligned = store.list_scores(&s.id, assignment_id)?;
        let complete = sheet_is_complete(&aligned);
        let final_grade = if complete {
            final_grade_aligned(&questions, &aligned)
        } else {
            None
        };
        out.push(StudentProgress {
            student: s,
            entered: entered_count(&aligned),
            total: questions.len(),
            complete,
            final_grade,
        });
    }
    Ok(out)
}

pub fn corrected_count<S: GradeStore>(store: &S, assignment_id: &str) -> StoreResult<usize> {
    Ok(correction_progress(store, assignment_id)?
        .iter()
        .filter(|p| p.complete)
        .count())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassStats {
    pub student_count: usize,
    pub assignment_count: usize,
    pub average: f64,
}

pub fn class_stats<S: GradeStore>(store: &S, class_id: &str) -> StoreResult<ClassStats> {
    Ok(ClassStats {
        student_count: store.list_students_in_class(class_id)?.len(),
        assignment_count: store.list_assignments_in_class(class_id)?.len(),
        average: average_for_class(store, class_id)?,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalStats {
    pub class_count: usize,
    pub student_count: usize,
    pub assignment_count: usize,
    /// Assignments where fewer students are complete than the class holds.
    pub assignments_to_correct: usize,
    pub global_average: f64,
}

pub fn global_stats<S: GradeStore>(store: &S) -> StoreResult<GlobalStats> {
    let classes = store.list_classes()?;
    let mut student_count = 0;
    let mut assignment_count = 0;
    let mut assignments_to_correct = 0;
    for c in &classes {
        let students = store.list_students_in_class(&c.id)?.len();
        student_count += students;
        for a in store.list_assignments_in_class(&c.id)? {
            assignment_count += 1;
            if corrected_count(store, &a.id)? < students {
                assignments_to_correct += 1;
            }
        }
    }
    Ok(GlobalStats {
        class_count: classes.len(),
        student_count,
        assignment_count,
        assignments_to_correct,
        global_average: global_average(store)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_temp;
    use crate::store::fixtures::*;
    use crate::store::SqliteStore;
    use rusqlite::Connection;

    /// Class c1: students s1..s3, assignment a1 (one question out of 20).
    /// s1 scores 12, s2 scores 16, s3 has nothing.
    fn seeded() -> Connection {
        let conn = open_temp();
        class(&conn, "c1", "3A");
        student(&conn, "s1", "c1", "Abel");
        student(&conn, "s2", "c1", "Blanc");
        student(&conn, "s3", "c1", "Colin");
        assignment(&conn, "a1", "c1", "Contrôle 1");
        question(&conn, "q1", "a1", "1", 20.0, 1.0);
        score(&conn, "s1", "q1", 12.0);
        score(&conn, "s2", "q1", 16.0);
        conn
    }

    #[test]
    fn assignment_average_ignores_incomplete_students() {
        let conn = seeded();
        let store = SqliteStore::new(&conn);
        assert_eq!(average_for_assignment(&store, "a1").expect("avg"), Some(14.0));
        let mut dist = grade_distribution(&store, "a1").expect("dist");
        dist.sort_by(|a, b| a.partial_cmp(b).expect("finite"));
        assert_eq!(dist, vec![12.0, 16.0]);
    }

    #[test]
    fn defaults_differ_between_student_and_assignment() {
        let conn = open_temp();
        class(&conn, "c1", "3A");
        student(&conn, "s1", "c1", "Abel");
        assignment(&conn, "a1", "c1", "Contrôle 1");
        question(&conn, "q1", "a1", "1", 20.0, 1.0);
        let store = SqliteStore::new(&conn);

        assert_eq!(average_for_student(&store, "s1").expect("student avg"), 0.0);
        assert_eq!(average_for_assignment(&store, "a1").expect("assignment avg"), None);
        assert_eq!(count_graded_assignments(&store, "s1").expect("count"), 0);
        assert_eq!(average_for_class(&store, "c1").expect("class avg"), 0.0);
        assert_eq!(global_average(&store).expect("global"), 0.0);
    }

    #[test]
    fn student_average_is_an_unweighted_mean_of_assignments() {
        let conn = seeded();
        // a2 has a much larger scale but weighs the same in the student mean.
        assignment(&conn, "a2", "c1", "Contrôle 2");
        question(&conn, "q2", "a2", "1", 100.0, 5.0);
        score(&conn, "s1", "q2", 50.0);
        // a3 stays incomplete for s1.
        assignment(&conn, "a3", "c1", "Contrôle 3");
        question(&conn, "q3a", "a3", "1", 10.0, 1.0);
        question(&conn, "q3b", "a3", "2", 10.0, 1.0);
        score(&conn, "s1", "q3a", 10.0);

        let store = SqliteStore::new(&conn);
        // (12 + 10) / 2
        assert_eq!(average_for_student(&store, "s1").expect("avg"), 11.0);
        assert_eq!(count_graded_assignments(&store, "s1").expect("count"), 2);
    }

    #[test]
    fn zero_question_assignments_never_count() {
        let conn = seeded();
        assignment(&conn, "empty", "c1", "Sans questions");
        let store = SqliteStore::new(&conn);
        assert_eq!(count_graded_assignments(&store, "s1").expect("count"), 1);
        assert_eq!(average_for_assignment(&store, "empty").expect("avg"), None);
        assert_eq!(scale_total(&store, "empty").expect("scale"), 0.0);
        // ...yet every student counts as corrected there.
        assert_eq!(corrected_count(&store, "empty").expect("corrected"), 3);
    }

    #[test]
    fn class_and_global_averages_pool_pairs() {
        let conn = seeded();
        class(&conn, "c2", "3B");
        student(&conn, "t1", "c2", "Dupont");
        assignment(&conn, "b1", "c2", "Interro");
        question(&conn, "r1", "b1", "1", 10.0, 1.0);
        score(&conn, "t1", "r1", 2.0);

        let store = SqliteStore::new(&conn);
        assert_eq!(average_for_class(&store, "c1").expect("c1"), 14.0);
        assert_eq!(average_for_class(&store, "c2").expect("c2"), 4.0);
        // (12 + 16 + 4) / 3, not (14 + 4) / 2.
        assert_eq!(global_average(&store).expect("global"), 10.67);
    }

    #[test]
    fn a_student_from_another_class_does_not_leak_in() {
        let conn = seeded();
        class(&conn, "c2", "3B");
        student(&conn, "t1", "c2", "Dupont");
        // A score row for a foreign student on a1 (possible after a class move).
        score(&conn, "t1", "q1", 20.0);
        let store = SqliteStore::new(&conn);
        assert_eq!(average_for_assignment(&store, "a1").expect("avg"), Some(14.0));
    }

    #[test]
    fn progress_reports_entered_counts() {
        let conn = seeded();
        question(&conn, "q1b", "a1", "2", 10.0, 1.0);
        score(&conn, "s1", "q1b", 5.0);
        let store = SqliteStore::new(&conn);
        let rows = correction_progress(&store, "a1").expect("progress");
        let by_id: Vec<(&str, usize, bool, Option<f64>)> = rows
            .iter()
            .map(|p| (p.student.id.as_str(), p.entered, p.complete, p.final_grade))
            .collect();
        assert_eq!(
            by_id,
            vec![
                ("s1", 2, true, Some(11.33)),
                ("s2", 1, false, None),
                ("s3", 0, false, None),
            ]
        );
    }

    #[test]
    fn global_stats_count_assignments_to_correct() {
        let conn = seeded();
        assignment(&conn, "a2", "c1", "Contrôle 2");
        question(&conn, "q2", "a2", "1", 10.0, 1.0);
        for s in ["s1", "s2", "s3"] {
            score(&conn, s, "q2", 5.0);
        }
        let store = SqliteStore::new(&conn);
        let stats = global_stats(&store).expect("stats");
        assert_eq!(stats.class_count, 1);
        assert_eq!(stats.student_count, 3);
        assert_eq!(stats.assignment_count, 2);
        assert_eq!(stats.assignments_to_correct, 1);
        // (12 + 16 + 10 + 10 + 10) / 5
        assert_eq!(stats.global_average, 11.6);
    }

    #[test]
    fn distribution_stats_summarize_grades() {
        let stats = distribution_stats(&[12.0, 16.0]);
        assert_eq!(stats.count, 2);
        assert_eq!(stats.mean, Some(14.0));
        assert_eq!(stats.min, Some(12.0));
        assert_eq!(stats.max, Some(16.0));
        assert_eq!(stats.std_dev, Some(2.0));

        let empty = distribution_stats(&[]);
        assert_eq!(empty.count, 0);
        assert_eq!(empty.mean, None);
    }

    #[test]
    fn unknown_student_is_not_found() {
        let conn = seeded();
        let store = SqliteStore::new(&conn);
        let e = average_for_student(&store, "ghost").expect_err("missing");
        assert_eq!(e.code(), "not_found");
    }
}
