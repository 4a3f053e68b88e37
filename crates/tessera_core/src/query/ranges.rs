//! Range bound resolution.
//!
//! `NULL` and `*` are open bounds. A bound of the form `<type>x<digits>`
//! selects a numeric range:
//!
//! | prefix | type   |
//! |--------|--------|
//! | `Ix`   | int    |
//! | `Lx`   | long   |
//! | `Dx`   | double |
//! | `Fx`   | float  |
//!
//! Any other bound makes the range lexicographic.

use crate::error::{CoreError, CoreResult};
use crate::index::RangeValue;
use crate::query::cached_regex;
use regex::Regex;
use std::ops::Bound;
use std::sync::OnceLock;

/// Suffix a numeric range field may carry.
pub const RANGE_SUFFIX: &str = "_Range";

static RANGE_VALUE: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();

/// Whether a bound is a typed number such as `Ix10`.
#[must_use]
pub fn is_numeric_bound(bound: &str) -> bool {
    cached_regex(&RANGE_VALUE, r"^[\w\d]x[-\w\d.]+$").is_ok_and(|re| re.is_match(bound))
}

fn is_open(bound: &str) -> bool {
    bound == "NULL" || bound == "*"
}

/// Parses `Ix10`, `Lx10`, `Dx1.5` or `Fx1.5`.
///
/// # Errors
///
/// Returns [`CoreError::InvalidQuery`] for an unknown type or a value that
/// does not parse as that type.
pub fn parse_number(bound: &str) -> CoreResult<f64> {
    let invalid = || CoreError::invalid_query(format!("invalid numeric range bound {bound}"));
    let (kind, digits) = bound.split_once('x').ok_or_else(invalid)?;
    match kind {
        "I" => digits.parse::<i32>().map(f64::from).map_err(|_| invalid()),
        "L" => digits
            .parse::<i64>()
            .map(|v| v as f64)
            .map_err(|_| invalid()),
        "D" => digits.parse::<f64>().map_err(|_| invalid()),
        "F" => digits.parse::<f32>().map(f64::from).map_err(|_| invalid()),
        _ => Err(invalid()),
    }
}

/// A resolved range over one field.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedRange {
    /// Field, without a `_Range` suffix.
    pub field: String,
    /// Lower bound.
    pub lower: Bound<RangeValue>,
    /// Upper bound.
    pub upper: Bound<RangeValue>,
}

/// Resolves the bounds of `field:[lower TO upper]`.
///
/// # Errors
///
/// Returns [`CoreError::InvalidQuery`] for a malformed numeric bound.
pub fn resolve(
    field: &str,
    lower: &str,
    upper: &str,
    lower_inclusive: bool,
    upper_inclusive: bool,
) -> CoreResult<ResolvedRange> {
    let lower = (!is_open(lower)).then_some(lower);
    let upper = (!is_open(upper)).then_some(upper);
    let numeric = lower.is_some_and(is_numeric_bound) || upper.is_some_and(is_numeric_bound);

    let field = if numeric {
        field.strip_suffix(RANGE_SUFFIX).unwrap_or(field)
    } else {
        field
    };

    let to_value = |bound: &str| -> CoreResult<RangeValue> {
        if numeric {
            parse_number(bound).map(RangeValue::Number)
        } else {
            Ok(RangeValue::Text(bound.to_string()))
        }
    };
    let to_bound = |bound: Option<&str>, inclusive: bool| -> CoreResult<Bound<RangeValue>> {
        Ok(match bound {
            None => Bound::Unbounded,
            Some(b) if inclusive => Bound::Included(to_value(b)?),
            Some(b) => Bound::Excluded(to_value(b)?),
        })
    };

    Ok(ResolvedRange {
        field: field.to_string(),
        lower: to_bound(lower, lower_inclusive)?,
        upper: to_bound(upper, upper_inclusive)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_bounds_are_detected() {
        assert!(is_numeric_bound("Ix10"));
        assert!(is_numeric_bound("Dx-1.5"));
        assert!(!is_numeric_bound("10"));
        assert!(!is_numeric_bound("apple"));
    }

    #[test]
    fn typed_numbers_parse() {
        assert_eq!(parse_number("Ix42").unwrap(), 42.0);
        assert_eq!(parse_number("Lx-7").unwrap(), -7.0);
        assert_eq!(parse_number("Dx2.5").unwrap(), 2.5);
        assert_eq!(parse_number("Fx0.5").unwrap(), 0.5);
        assert!(parse_number("Ix2.5").is_err());
        assert!(parse_number("Qx1").is_err());
    }

    #[test]
    fn open_bounds() {
        let range = resolve("Age_Range", "NULL", "Ix30", true, false).unwrap();
        assert_eq!(range.field, "Age");
        assert_eq!(range.lower, Bound::Unbounded);
        assert_eq!(range.upper, Bound::Excluded(RangeValue::Number(30.0)));

        let range = resolve("Name", "a", "*", true, true).unwrap();
        assert_eq!(range.lower, Bound::Included(RangeValue::Text("a".into())));
        assert_eq!(range.upper, Bound::Unbounded);
    }

    #[test]
    fn text_range_keeps_suffix() {
        let range = resolve("Name_Range", "a", "m", true, true).unwrap();
        assert_eq!(range.field, "Name_Range");
    }
}
