//! Canonicalization of enum-like field values.
//!
//! Draft values for things like parking or laundry type arrive as free-form
//! or legacy lowercase tokens (`"street parking"`, `"in-unit"`). Before they
//! reach the backend they are mapped onto the server's canonical tokens. The
//! mapping is pure and total: anything unrecognized becomes the enum's
//! default ("none") value instead of failing.
//!
//! Canonical enums are ordinary `strum` enums:
//!
//! ```
//! use stepwise::normalize::canonicalize;
//! use strum::{AsRefStr, EnumString};
//!
//! #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, EnumString, AsRefStr)]
//! #[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
//! enum Heating {
//!     Radiant,
//!     ForcedAir,
//!     #[default]
//!     None,
//! }
//!
//! assert_eq!(canonicalize::<Heating>("forced air"), Heating::ForcedAir);
//! assert_eq!(canonicalize::<Heating>("wood stove"), Heating::None);
//! ```

use serde_json::Value as JsonValue;
use std::str::FromStr;

/// An enum with canonical server tokens and a "none" default.
pub trait CanonicalEnum: FromStr + AsRef<str> + Default + Copy + PartialEq {}

impl<T> CanonicalEnum for T where T: FromStr + AsRef<str> + Default + Copy + PartialEq {}

/// A pure, total value normalizer used by persistence projections.
pub type Normalizer = fn(Option<&JsonValue>) -> JsonValue;

/// Maps a raw token onto a canonical enum value.
///
/// Whitespace, hyphens, and slashes are folded to underscores and case is
/// ignored, so `"In-Unit"`, `"in unit"`, and `"IN_UNIT"` agree.
pub fn canonicalize<E: CanonicalEnum>(raw: &str) -> E {
    let folded: String = raw
        .trim()
        .split(|c: char| c.is_whitespace() || c == '-' || c == '/' || c == '_')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("_");
    E::from_str(&folded).unwrap_or_default()
}

/// Normalizes a single-valued field to its canonical token.
///
/// Absent, null, or non-string values map to the default token. A list
/// contributes its first entry.
pub fn normalize_scalar<E: CanonicalEnum>(value: Option<&JsonValue>) -> JsonValue {
    let canonical = match value {
        Some(JsonValue::String(raw)) => canonicalize::<E>(raw),
        Some(JsonValue::Array(items)) => items
            .iter()
            .find_map(JsonValue::as_str)
            .map(canonicalize::<E>)
            .unwrap_or_default(),
        _ => E::default(),
    };
    JsonValue::String(canonical.as_ref().to_string())
}

/// Normalizes a list-valued field to a deduplicated list of canonical
/// tokens.
///
/// A bare string is treated as a one-element list. The default token is
/// dropped when any real value is present, and is the sole entry when
/// nothing is.
pub fn normalize_list<E: CanonicalEnum>(value: Option<&JsonValue>) -> JsonValue {
    let raw: Vec<&str> = match value {
        Some(JsonValue::String(raw)) => vec![raw.as_str()],
        Some(JsonValue::Array(items)) => items.iter().filter_map(JsonValue::as_str).collect(),
        _ => Vec::new(),
    };

    let mut canonical: Vec<E> = Vec::with_capacity(raw.len());
    for token in raw {
        let value = canonicalize::<E>(token);
        if value != E::default() && !canonical.contains(&value) {
            canonical.push(value);
        }
    }
    if canonical.is_empty() {
        canonical.push(E::default());
    }

    JsonValue::Array(
        canonical
            .into_iter()
            .map(|v| JsonValue::String(v.as_ref().to_string()))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use strum::{AsRefStr, EnumString};

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, EnumString, AsRefStr)]
    #[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
    enum Laundry {
        InUnit,
        #[strum(to_string = "SHARED", serialize = "COIN_OP")]
        Shared,
        #[default]
        None,
    }

    #[test]
    fn test_canonicalize_folds_separators_and_case() {
        assert_eq!(canonicalize::<Laundry>("in-unit"), Laundry::InUnit);
        assert_eq!(canonicalize::<Laundry>("In Unit"), Laundry::InUnit);
        assert_eq!(canonicalize::<Laundry>("  IN_UNIT "), Laundry::InUnit);
        assert_eq!(canonicalize::<Laundry>("coin-op"), Laundry::Shared);
    }

    #[test]
    fn test_canonicalize_unknown_is_default() {
        assert_eq!(canonicalize::<Laundry>("laundromat nearby"), Laundry::None);
        assert_eq!(canonicalize::<Laundry>(""), Laundry::None);
    }

    #[test]
    fn test_normalize_scalar() {
        assert_eq!(normalize_scalar::<Laundry>(Some(&json!("in unit"))), json!("IN_UNIT"));
        assert_eq!(normalize_scalar::<Laundry>(None), json!("NONE"));
        assert_eq!(normalize_scalar::<Laundry>(Some(&json!(42))), json!("NONE"));
        assert_eq!(normalize_scalar::<Laundry>(Some(&json!(["shared", "in unit"]))), json!("SHARED"));
    }

    #[test]
    fn test_normalize_list_dedups_and_drops_none() {
        let raw = json!(["in-unit", "IN_UNIT", "none", "coin op", "bogus"]);
        assert_eq!(normalize_list::<Laundry>(Some(&raw)), json!(["IN_UNIT", "SHARED"]));
    }

    #[test]
    fn test_normalize_list_defaults_to_none() {
        assert_eq!(normalize_list::<Laundry>(None), json!(["NONE"]));
        assert_eq!(normalize_list::<Laundry>(Some(&json!([]))), json!(["NONE"]));
        assert_eq!(normalize_list::<Laundry>(Some(&json!(["???"]))), json!(["NONE"]));
    }

    #[test]
    fn test_normalize_list_accepts_bare_string() {
        assert_eq!(normalize_list::<Laundry>(Some(&json!("shared"))), json!(["SHARED"]));
    }
}
