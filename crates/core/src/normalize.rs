//! Value normalization: enum tokens and colors.

use gridrelay_protocol::{Color, Dimension, ValueRenderOption};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// A closed set of wire tokens.
///
/// Input is accepted in any case and with surrounding whitespace; output is
/// always the canonical variant, so `rows`, ` ROWS ` and `Rows` compile to
/// the same request bytes.
pub trait Token: Sized + Copy + 'static {
    const TOKENS: &'static [(&'static str, Self)];
}

/// Trim, uppercase, and look up a token. Unknown tokens fail `VALIDATION`
/// naming `field`.
pub fn normalize_token<T: Token>(field: &str, raw: &str) -> Result<T> {
    let wanted = raw.trim().to_ascii_uppercase();
    T::TOKENS
        .iter()
        .find(|(name, _)| *name == wanted)
        .map(|(_, value)| *value)
        .ok_or_else(|| {
            let known: Vec<&str> = T::TOKENS.iter().map(|(name, _)| *name).collect();
            CoreError::invalid_field(
                field,
                format!("unknown value '{}' (expected one of {})", raw.trim(), known.join(", ")),
            )
        })
}

/// Canonical name of a token value.
pub fn token_name<T: Token + PartialEq>(value: T) -> &'static str {
    T::TOKENS
        .iter()
        .find(|(_, v)| *v == value)
        .map(|(name, _)| *name)
        .unwrap_or("")
}

/// Optional token field with a default.
pub fn token_or<T: Token>(field: &str, raw: Option<&str>, default: T) -> Result<T> {
    match raw {
        Some(raw) => normalize_token(field, raw),
        None => Ok(default),
    }
}

/// Clamp a channel to [0, 1] and round to 4 decimal places.
pub fn clamp_channel(v: f64) -> f64 {
    if v.is_nan() {
        return 0.0;
    }
    (v.clamp(0.0, 1.0) * 10_000.0).round() / 10_000.0
}

/// Color as supplied by callers: `[r, g, b]` or `{"red":..,"green":..,"blue":..}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ColorInput {
    Triplet(Vec<f64>),
    Channels {
        #[serde(default)]
        red: f64,
        #[serde(default)]
        green: f64,
        #[serde(default)]
        blue: f64,
    },
}

pub fn normalize_color(field: &str, input: &ColorInput) -> Result<Color> {
    let (r, g, b) = match input {
        ColorInput::Triplet(channels) => match channels.as_slice() {
            [r, g, b] => (*r, *g, *b),
            _ => {
                return Err(CoreError::invalid_field(
                    field,
                    format!("expected 3 channels, got {}", channels.len()),
                ))
            }
        },
        ColorInput::Channels { red, green, blue } => (*red, *green, *blue),
    };
    Ok(Color { red: clamp_channel(r), green: clamp_channel(g), blue: clamp_channel(b) })
}

// =============================================================================
// Token sets
// =============================================================================

impl Token for Dimension {
    const TOKENS: &'static [(&'static str, Self)] =
        &[("ROWS", Dimension::Rows), ("COLUMNS", Dimension::Columns)];
}

impl Token for ValueRenderOption {
    const TOKENS: &'static [(&'static str, Self)] = &[
        ("FORMATTED_VALUE", ValueRenderOption::FormattedValue),
        ("UNFORMATTED_VALUE", ValueRenderOption::UnformattedValue),
        ("FORMULA", ValueRenderOption::Formula),
    ];
}

/// How written strings are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValueInputOption {
    /// Stored as-is, never parsed
    Raw,
    /// Parsed as if typed: `=` starts a formula, numerals become numbers
    UserEntered,
}

impl Token for ValueInputOption {
    const TOKENS: &'static [(&'static str, Self)] =
        &[("RAW", ValueInputOption::Raw), ("USER_ENTERED", ValueInputOption::UserEntered)];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HorizontalAlignment {
    Left,
    Center,
    Right,
}

impl Token for HorizontalAlignment {
    const TOKENS: &'static [(&'static str, Self)] = &[
        ("LEFT", HorizontalAlignment::Left),
        ("CENTER", HorizontalAlignment::Center),
        ("RIGHT", HorizontalAlignment::Right),
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NumberFormatType {
    Text,
    Number,
    Percent,
    Currency,
    Date,
    Time,
    DateTime,
    Scientific,
}

impl Token for NumberFormatType {
    const TOKENS: &'static [(&'static str, Self)] = &[
        ("TEXT", NumberFormatType::Text),
        ("NUMBER", NumberFormatType::Number),
        ("PERCENT", NumberFormatType::Percent),
        ("CURRENCY", NumberFormatType::Currency),
        ("DATE", NumberFormatType::Date),
        ("TIME", NumberFormatType::Time),
        ("DATE_TIME", NumberFormatType::DateTime),
        ("SCIENTIFIC", NumberFormatType::Scientific),
    ];
}

/// Boolean condition for conditional formatting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConditionType {
    NumberGreater,
    NumberLess,
    TextContains,
    Blank,
    NotBlank,
    CustomFormula,
}

impl ConditionType {
    /// Number of comparison values the condition takes.
    pub fn arity(&self) -> usize {
        match self {
            ConditionType::Blank | ConditionType::NotBlank => 0,
            _ => 1,
        }
    }
}

impl Token for ConditionType {
    const TOKENS: &'static [(&'static str, Self)] = &[
        ("NUMBER_GREATER", ConditionType::NumberGreater),
        ("NUMBER_LESS", ConditionType::NumberLess),
        ("TEXT_CONTAINS", ConditionType::TextContains),
        ("BLANK", ConditionType::Blank),
        ("NOT_BLANK", ConditionType::NotBlank),
        ("CUSTOM_FORMULA", ConditionType::CustomFormula),
    ];
}

/// Composite formatting presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Preset {
    /// Bold shaded header, frozen, columns auto-sized
    HeaderRow,
    /// Alternating row colors
    BandedRows,
}

impl Token for Preset {
    const TOKENS: &'static [(&'static str, Self)] =
        &[("HEADER_ROW", Preset::HeaderRow), ("BANDED_ROWS", Preset::BandedRows)];
}

/// What to do when a write's baseline revision no longer matches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    /// Skip the check and write anyway
    KeepLocal,
    /// Drop the write; the remote state wins
    KeepRemote,
    /// Surface CONFLICT to the caller
    #[default]
    Manual,
}

impl Token for ConflictResolution {
    const TOKENS: &'static [(&'static str, Self)] = &[
        ("KEEP_LOCAL", ConflictResolution::KeepLocal),
        ("KEEP_REMOTE", ConflictResolution::KeepRemote),
        ("MANUAL", ConflictResolution::Manual),
    ];
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use proptest::prelude::*;

    #[test]
    fn test_token_any_case() {
        let a: Dimension = normalize_token("params.dimension", "rows").unwrap();
        let b: Dimension = normalize_token("params.dimension", "  Rows ").unwrap();
        let c: Dimension = normalize_token("params.dimension", "ROWS").unwrap();
        assert_eq!(a, Dimension::Rows);
        assert_eq!(a, b);
        assert_eq!(b, c);
    }

    #[test]
    fn test_unknown_token_names_field() {
        let err = normalize_token::<Dimension>("params.dimension", "diagonal").unwrap_err();
        assert_eq!(err.code, ErrorCode::Validation);
        assert_eq!(err.field.as_deref(), Some("params.dimension"));
        assert!(err.message.contains("ROWS, COLUMNS"));
    }

    #[test]
    fn test_token_name_roundtrip() {
        assert_eq!(token_name(ConditionType::NotBlank), "NOT_BLANK");
        assert_eq!(token_name(ConflictResolution::KeepRemote), "KEEP_REMOTE");
    }

    #[test]
    fn test_color_clamped_and_rounded() {
        let input = ColorInput::Triplet(vec![1.7, -0.2, 0.123456]);
        let color = normalize_color("params.background", &input).unwrap();
        assert_eq!(color, Color { red: 1.0, green: 0.0, blue: 0.1235 });
    }

    #[test]
    fn test_color_object_form() {
        let input: ColorInput = serde_json::from_str(r#"{"red":0.5,"blue":0.25}"#).unwrap();
        let color = normalize_color("c", &input).unwrap();
        assert_eq!(color, Color { red: 0.5, green: 0.0, blue: 0.25 });
    }

    #[test]
    fn test_color_wrong_arity() {
        let input = ColorInput::Triplet(vec![0.1, 0.2]);
        let err = normalize_color("params.text_color", &input).unwrap_err();
        assert_eq!(err.field.as_deref(), Some("params.text_color"));
    }

    #[test]
    fn test_nan_channel_is_zero() {
        assert_eq!(clamp_channel(f64::NAN), 0.0);
    }

    proptest! {
        #[test]
        fn prop_case_variants_normalize_identically(
            flips in proptest::collection::vec(any::<bool>(), 16),
        ) {
            for (name, expected) in ConditionType::TOKENS {
                let mixed: String = name
                    .chars()
                    .zip(flips.iter().cycle())
                    .map(|(c, lower)| if *lower { c.to_ascii_lowercase() } else { c })
                    .collect();
                let got: ConditionType = normalize_token("params.condition", &mixed).unwrap();
                prop_assert_eq!(got, *expected);
            }
        }

        #[test]
        fn prop_channels_stay_in_unit_range(v in -10.0f64..10.0) {
            let c = clamp_channel(v);
            prop_assert!((0.0..=1.0).contains(&c));
            prop_assert_eq!(clamp_channel(c), c);
        }
    }
}
