use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashMap;
use thiserror::Error;

/// Grades are expressed on this scale.
pub const GRADE_SCALE: f64 = 20.0;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Question {
    pub id: String,
    pub assignment_id: String,
    pub number: String,
    pub title: String,
    pub points_max: f64,
    pub coefficient: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreEntry {
    pub question_id: String,
    pub points: f64,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InvalidScoreKind {
    #[error("score cannot be negative")]
    NegativeScore,
    #[error("score cannot exceed the question maximum")]
    ExceedsMaximum,
}

impl InvalidScoreKind {
    pub fn code(&self) -> &'static str {
        match self {
            InvalidScoreKind::NegativeScore => "negative_score",
            InvalidScoreKind::ExceedsMaximum => "exceeds_maximum",
        }
    }
}

/// Half-up rounding to 2 decimals: `floor(100*x + 0.5) / 100`.
/// Every grade and average goes through this one helper.
pub fn round_2_decimals(x: f64) -> f64 {
    ((100.0 * x) + 0.5).floor() / 100.0
}

/// Entry-time check for a score. Reads never re-validate.
pub fn validate_score(obtained: f64, max: f64) -> Result<(), InvalidScoreKind> {
    if obtained < 0.0 {
        return Err(InvalidScoreKind::NegativeScore);
    }
    if obtained > max {
        return Err(InvalidScoreKind::ExceedsMaximum);
    }
    Ok(())
}

/// `Σ pointsMax * coefficient` over the question set.
pub fn scale_total(questions: &[Question]) -> f64 {
    questions.iter().map(|q| q.points_max * q.coefficient).sum()
}

/// Coefficient-weighted grade out of 20.
///
/// Returns `None` when any question has no entry in `scores`, or when the
/// weighted maximum is zero (which includes the empty question set).
pub fn final_grade(scores: &[ScoreEntry], questions: &[Question]) -> Option<f64> {
    let by_question: HashMap<&str, f64> = scores
        .iter()
        .map(|s| (s.question_id.as_str(), s.points))
        .collect();

    let mut obtained_weighted = 0.0_f64;
    let mut max_weighted = 0.0_f64;
    for q in questions {
        let points = by_question.get(q.id.as_str())?;
        obtained_weighted += points * q.coefficient;
        max_weighted += q.points_max * q.coefficient;
    }

    if max_weighted <= 0.0 {
        return None;
    }
    Some(round_2_decimals(obtained_weighted / max_weighted * GRADE_SCALE))
}

/// Same as [`final_grade`] for a score list aligned with `questions`
/// (one optional entry per question, as the store returns them).
pub fn final_grade_aligned(questions: &[Question], aligned: &[Option<ScoreEntry>]) -> Option<f64> {
    if aligned.len() != questions.len() {
        return None;
    }
    let mut entries: Vec<ScoreEntry> = Vec::with_capacity(aligned.len());
    for entry in aligned {
        entries.push(entry.clone()?);
    }
    final_grade(&entries, questions)
}

fn first_embedded_integer(label: &str) -> Option<u64> {
    let digits: String = label
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    if digits.is_empty() {
        return None;
    }
    Some(digits.parse::<u64>().unwrap_or(u64::MAX))
}

/// Display-number ordering: labels carrying an integer come first, by that
/// integer ("2" < "10" < "10.b"); ties and integer-free labels fall back to
/// plain string order.
pub fn compare_question_numbers(a: &str, b: &str) -> Ordering {
    match (first_embedded_integer(a), first_embedded_integer(b)) {
        (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.cmp(b)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.cmp(b),
    }
}

pub fn sort_questions(questions: &mut [Question]) {
    questions.sort_by(|a, b| {
        compare_question_numbers(&a.number, &b.number).then_with(|| a.id.cmp(&b.id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(id: &str, number: &str, max: f64, coef: f64) -> Question {
        Question {
            id: id.to_string(),
            assignment_id: "a1".to_string(),
            number: number.to_string(),
            title: format!("Question {number}"),
            points_max: max,
            coefficient: coef,
        }
    }

    fn s(question_id: &str, points: f64) -> ScoreEntry {
        ScoreEntry {
            question_id: question_id.to_string(),
            points,
            comment: None,
        }
    }

    #[test]
    fn single_question_scales_to_twenty() {
        let questions = vec![q("q1", "1", 10.0, 1.0)];
        assert_eq!(final_grade(&[s("q1", 7.0)], &questions), Some(14.0));
    }

    #[test]
    fn coefficients_weight_points() {
        let questions = vec![q("q1", "1", 10.0, 1.0), q("q2", "2", 20.0, 2.0)];
        let grade = final_grade(&[s("q1", 8.0), s("q2", 15.0)], &questions).expect("grade");
        assert!((grade - 15.2).abs() < 1e-9, "got {grade}");
    }

    #[test]
    fn rescaling_all_coefficients_keeps_the_grade() {
        let base = vec![
            q("q1", "1", 4.0, 1.0),
            q("q2", "2", 6.0, 0.5),
            q("q3", "3", 3.0, 3.0),
        ];
        let scores = [s("q1", 3.0), s("q2", 2.5), s("q3", 1.0)];
        let expected = final_grade(&scores, &base).expect("grade");
        for factor in [0.1, 2.0, 7.5] {
            let scaled: Vec<Question> = base
                .iter()
                .cloned()
                .map(|mut x| {
                    x.coefficient *= factor;
                    x
                })
                .collect();
            let got = final_grade(&scores, &scaled).expect("grade");
            assert!((got - expected).abs() < 1e-9, "factor {factor}: {got} vs {expected}");
        }
    }

    #[test]
    fn any_missing_entry_means_no_grade() {
        let questions = vec![
            q("q1", "1", 5.0, 1.0),
            q("q2", "2", 5.0, 1.0),
            q("q3", "3", 5.0, 1.0),
        ];
        assert_eq!(final_grade(&[s("q1", 5.0), s("q2", 5.0)], &questions), None);
        assert_eq!(final_grade(&[], &questions), None);
        // Entries for unrelated questions do not fill the gap.
        assert_eq!(
            final_grade(&[s("q1", 5.0), s("q2", 5.0), s("zz", 5.0)], &questions),
            None
        );
    }

    #[test]
    fn zero_weighted_maximum_is_undefined() {
        assert_eq!(final_grade(&[], &[]), None);
        let questions = vec![q("q1", "1", 0.0, 1.0)];
        assert_eq!(final_grade(&[s("q1", 0.0)], &questions), None);
    }

    #[test]
    fn aligned_lists_follow_the_same_rule() {
        let questions = vec![q("q1", "1", 10.0, 1.0), q("q2", "2", 10.0, 1.0)];
        assert_eq!(
            final_grade_aligned(&questions, &[Some(s("q1", 5.0)), None]),
            None
        );
        assert_eq!(
            final_grade_aligned(&questions, &[Some(s("q1", 5.0)), Some(s("q2", 10.0))]),
            Some(15.0)
        );
    }

    #[test]
    fn rounding_is_half_up() {
        assert_eq!(round_2_decimals(0.0), 0.0);
        assert_eq!(round_2_decimals(12.344), 12.34);
        assert_eq!(round_2_decimals(12.346), 12.35);
        assert_eq!(round_2_decimals(13.125), 13.13);
        // 2/3 * 20
        assert_eq!(round_2_decimals(40.0 / 3.0), 13.33);
    }

    #[test]
    fn validate_score_bounds() {
        assert_eq!(validate_score(-0.5, 10.0), Err(InvalidScoreKind::NegativeScore));
        assert_eq!(validate_score(10.5, 10.0), Err(InvalidScoreKind::ExceedsMaximum));
        assert_eq!(validate_score(0.0, 10.0), Ok(()));
        assert_eq!(validate_score(10.0, 10.0), Ok(()));
    }

    #[test]
    fn scale_total_sums_weighted_maxima() {
        assert_eq!(scale_total(&[]), 0.0);
        let questions = vec![q("q1", "1", 10.0, 1.0), q("q2", "2", 20.0, 2.0)];
        assert_eq!(scale_total(&questions), 50.0);
    }

    #[test]
    fn question_numbers_sort_by_first_integer() {
        let mut questions = vec![
            q("a", "10", 1.0, 1.0),
            q("b", "2.1", 1.0, 1.0),
            q("c", "Bonus", 1.0, 1.0),
            q("d", "1.b", 1.0, 1.0),
            q("e", "2", 1.0, 1.0),
            q("f", "1.a", 1.0, 1.0),
        ];
        sort_questions(&mut questions);
        let order: Vec<&str> = questions.iter().map(|x| x.number.as_str()).collect();
        assert_eq!(order, vec!["1.a", "1.b", "2", "2.1", "10", "Bonus"]);
    }
}
