use crate::calc::scoring::ScoreEntry;
use crate::store::{GradeStore, StoreResult};

/// A grading pass is complete when every question carries a score.
/// An empty question set is vacuously complete.
pub fn sheet_is_complete(aligned: &[Option<ScoreEntry>]) -> bool {
    aligned.iter().all(Option::is_some)
}

pub fn entered_count(aligned: &[Option<ScoreEntry>]) -> usize {
    aligned.iter().filter(|e| e.is_some()).count()
}

pub fn is_complete<S: GradeStore>(
    store: &S,
    student_id: &str,
    assignment_id: &str,
) -> StoreResult<bool> {
    let aligned = store.list_scores(student_id, assignment_id)?;
    Ok(sheet_is_complete(&aligned))
}
