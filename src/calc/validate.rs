use chrono::NaiveDate;
use thiserror::Error;

pub const NAME_MAX_CHARS: usize = 100;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("{field} must not be empty")]
    Empty { field: &'static str },
    #[error("{field} is too long (max {max} characters)")]
    TooLong { field: &'static str, max: usize },
    #[error("pointsMax must be a number >= 0")]
    NegativeMaximum,
    #[error("coefficient must be a number > 0")]
    NonPositiveCoefficient,
    #[error("{field} must be a date formatted YYYY-MM-DD")]
    BadDate { field: &'static str },
}

/// Trims and checks a display name. Returns the trimmed value.
pub fn validate_name(field: &'static str, raw: &str) -> Result<String, ValidationError> {
    let t = raw.trim();
    if t.is_empty() {
        return Err(ValidationError::Empty { field });
    }
    if t.chars().count() > NAME_MAX_CHARS {
        return Err(ValidationError::TooLong {
            field,
            max: NAME_MAX_CHARS,
        });
    }
    Ok(t.to_string())
}

pub fn validate_date(field: &'static str, raw: &str) -> Result<String, ValidationError> {
    let t = raw.trim();
    NaiveDate::parse_from_str(t, "%Y-%m-%d")
        .map(|d| d.format("%Y-%m-%d").to_string())
        .map_err(|_| ValidationError::BadDate { field })
}

pub fn validate_question(
    number: &str,
    title: &str,
    points_max: f64,
    coefficient: f64,
) -> Result<(), ValidationError> {
    if number.trim().is_empty() {
        return Err(ValidationError::Empty { field: "number" });
    }
    if title.trim().is_empty() {
        return Err(ValidationError::Empty { field: "title" });
    }
    if !points_max.is_finite() || points_max < 0.0 {
        return Err(ValidationError::NegativeMaximum);
    }
    if !coefficient.is_finite() || coefficient <= 0.0 {
        return Err(ValidationError::NonPositiveCoefficient);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_trimmed_and_bounded() {
        assert_eq!(validate_name("name", "  6eme A "), Ok("6eme A".to_string()));
        assert_eq!(
            validate_name("name", "   "),
            Err(ValidationError::Empty { field: "name" })
        );
        let long = "x".repeat(NAME_MAX_CHARS + 1);
        assert!(matches!(
            validate_name("lastName", &long),
            Err(ValidationError::TooLong { field: "lastName", .. })
        ));
    }

    #[test]
    fn question_rejects_non_positive_coefficient() {
        assert_eq!(validate_question("1", "Calcul", 4.0, 1.0), Ok(()));
        assert_eq!(validate_question("1", "Calcul", 0.0, 0.5), Ok(()));
        assert_eq!(
            validate_question("1", "Calcul", 4.0, 0.0),
            Err(ValidationError::NonPositiveCoefficient)
        );
        assert_eq!(
            validate_question("1", "Calcul", -1.0, 1.0),
            Err(ValidationError::NegativeMaximum)
        );
        assert_eq!(
            validate_question(" ", "Calcul", 1.0, 1.0),
            Err(ValidationError::Empty { field: "number" })
        );
    }

    #[test]
    fn dates_are_normalized() {
        assert_eq!(validate_date("date", "2024-03-09"), Ok("2024-03-09".to_string()));
        assert!(validate_date("date", "09/03/2024").is_err());
        assert!(validate_date("date", "2024-02-30").is_err());
    }
}
