//! Pattern-based repairs for known OCR corruption signatures.
//!
//! The rule list is closed: each entry is an exact pattern for a corruption
//! that has been observed in ingested documents, paired with its canonical
//! form. Rules run in order, broad equation repairs before token repairs, and
//! no replacement produces text that an earlier rule would match again, so
//! `normalize` is idempotent.

use crate::error::IngestError;
use regex::Regex;

/// Iron oxide reduction by carbon monoxide, with OCR spacing and `0`/`O`
/// confusion.
const HEMATITE_REDUCTION: (&str, &str) = (
    r"Fe\s*2\s*[O0]\s*3\s*\+\s*3\s*C\s*[O0]\s*(?:→|->|=)\s*2\s*Fe\s*\+\s*3\s*C\s*[O0]\s*2\b",
    "Fe2O3 + 3CO → 2Fe + 3CO2",
);

/// Carbon dioxide with a zero in place of the oxygen.
const CARBON_DIOXIDE_ZERO: (&str, &str) = (r"\bC\s?0\s?2\b", "CO2");

const LIGATURE_FI: (&str, &str) = ("\u{fb01}", "fi");
const LIGATURE_FL: (&str, &str) = ("\u{fb02}", "fl");

pub const DEFAULT_RULES: [(&str, &str); 4] = [
    HEMATITE_REDUCTION,
    CARBON_DIOXIDE_ZERO,
    LIGATURE_FI,
    LIGATURE_FL,
];

#[derive(Debug, Clone)]
struct RepairRule {
    pattern: Regex,
    replacement: String,
}

#[derive(Debug, Clone)]
pub struct TextNormalizer {
    rules: Vec<RepairRule>,
}

impl TextNormalizer {
    pub fn new(rules: &[(&str, &str)]) -> Result<Self, IngestError> {
        let rules = rules
            .iter()
            .map(|(pattern, replacement)| {
                Ok(RepairRule {
                    pattern: Regex::new(pattern)?,
                    replacement: (*replacement).to_string(),
                })
            })
            .collect::<Result<Vec<_>, IngestError>>()?;

        Ok(Self { rules })
    }

    pub fn with_default_rules() -> Result<Self, IngestError> {
        Self::new(&DEFAULT_RULES)
    }

    pub fn normalize(&self, text: &str) -> String {
        let mut repaired = text.to_string();
        for rule in &self.rules {
            if rule.pattern.is_match(&repaired) {
                repaired = rule
                    .pattern
                    .replace_all(&repaired, regex::NoExpand(&rule.replacement))
                    .into_owned();
            }
        }
        repaired
    }
}
