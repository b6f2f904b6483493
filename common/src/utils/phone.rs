use crate::error::AppError;

/// E.164 normalization for the messaging-routing boundary.
///
/// Accepts numbers with separators, a leading `00` international prefix, or
/// an already-normalized `+` form. Output is always `+<digits>`.
pub fn normalize(input: &str) -> Result<String, AppError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(AppError::Validation("empty phone number".into()));
    }

    let (has_plus, rest) = match trimmed.strip_prefix('+') {
        Some(rest) => (true, rest),
        None => (false, trimmed),
    };

    let digits: String = rest.chars().filter(char::is_ascii_digit).collect();
    if digits.len() != rest.chars().filter(|c| !is_separator(*c)).count() {
        return Err(AppError::Validation(format!(
            "phone number contains invalid characters: {input}"
        )));
    }

    let digits = if !has_plus {
        digits.strip_prefix("00").map(str::to_string).unwrap_or(digits)
    } else {
        digits
    };

    if digits.len() < 7 || digits.len() > 15 {
        return Err(AppError::Validation(format!(
            "phone number has {} digits, expected 7-15",
            digits.len()
        )));
    }
    if digits.starts_with('0') {
        return Err(AppError::Validation(
            "E.164 numbers cannot start with 0; include the country code".into(),
        ));
    }

    Ok(format!("+{digits}"))
}

/// Formats a number for display. For inputs already in E.164 this is the
/// identity function.
pub fn format(input: &str) -> Result<String, AppError> {
    normalize(input)
}

fn is_separator(c: char) -> bool {
    matches!(c, ' ' | '-' | '.' | '(' | ')' | '/')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn already_normalized_is_fixed_point() {
        for number in ["+491701234567", "+14155550123", "+8613812345678"] {
            assert_eq!(format(number).expect("valid"), number);
        }
    }

    #[test]
    fn strips_separators() {
        assert_eq!(
            normalize("+49 (170) 123-45.67").expect("valid"),
            "+491701234567"
        );
    }

    #[test]
    fn double_zero_prefix_becomes_plus() {
        assert_eq!(normalize("00491701234567").expect("valid"), "+491701234567");
    }

    #[test]
    fn rejects_letters_and_leading_zero() {
        assert!(normalize("+49abc123").is_err());
        assert!(normalize("0170123456").is_err());
        assert!(normalize("").is_err());
    }

    #[test]
    fn rejects_out_of_range_lengths() {
        assert!(normalize("+123456").is_err());
        assert!(normalize("+1234567890123456").is_err());
    }
}
