//! Range revisions.
//!
//! The remote exposes no per-range version, so a revision is a content
//! fingerprint of the rendered values: `FORMATTED_VALUE:blake3:<hex>`. The
//! render option is part of the revision so a conflict check re-reads the
//! range the same way the caller did.

use gridrelay_protocol::ValueRenderOption;
use serde_json::Value;

const CELL_SEP: &[u8] = b"\x1f";
const ROW_SEP: &[u8] = b"\x1e";

pub fn revision(render: ValueRenderOption, values: &[Vec<Value>]) -> String {
    let mut hasher = blake3::Hasher::new();
    for row in values {
        for cell in row {
            hasher.update(cell.to_string().as_bytes());
            hasher.update(CELL_SEP);
        }
        hasher.update(ROW_SEP);
    }
    let hex = hasher.finalize().to_hex();
    format!("{}:blake3:{}", render.as_str(), &hex[..32])
}

/// Render option a revision was taken with; unprefixed revisions read as
/// formatted values.
pub fn render_of(revision: &str) -> ValueRenderOption {
    match revision.split(':').next() {
        Some("UNFORMATTED_VALUE") => ValueRenderOption::UnformattedValue,
        Some("FORMULA") => ValueRenderOption::Formula,
        _ => ValueRenderOption::FormattedValue,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stable_and_content_sensitive() {
        let a = vec![vec![json!(1), json!("x")]];
        let b = vec![vec![json!(1), json!("y")]];
        let r = revision(ValueRenderOption::FormattedValue, &a);
        assert_eq!(r, revision(ValueRenderOption::FormattedValue, &a));
        assert_ne!(r, revision(ValueRenderOption::FormattedValue, &b));
        assert!(r.starts_with("FORMATTED_VALUE:blake3:"));
        assert_eq!(r.len(), "FORMATTED_VALUE:blake3:".len() + 32);
    }

    #[test]
    fn test_row_boundaries_matter() {
        let wide = vec![vec![json!("a"), json!("b")]];
        let tall = vec![vec![json!("a")], vec![json!("b")]];
        assert_ne!(
            revision(ValueRenderOption::Formula, &wide),
            revision(ValueRenderOption::Formula, &tall)
        );
    }

    #[test]
    fn test_render_round_trip() {
        let r = revision(ValueRenderOption::Formula, &[]);
        assert_eq!(render_of(&r), ValueRenderOption::Formula);
        assert_eq!(render_of("something-else"), ValueRenderOption::FormattedValue);
    }
}
