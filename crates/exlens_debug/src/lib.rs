//! Failure enrichment for instrumented procedures.
//!
//! [`wrap`] turns any callable into one whose failures carry the operands the
//! instrumented code remembered right before the failing operation, plus
//! "Did you mean" hints for misspelled attributes and names.

use exlens_vm::ExcKind;
use serde::{Deserialize, Serialize};

mod decorate;
mod enrich;
mod importer;
pub mod similarity;

pub use decorate::{decorate_all, decorate_class, is_wrapped};
pub use enrich::{wrap, Enricher};
pub use importer::{ImportError, ImporterConfig, ModuleImporter, ModuleSource, SourceKind};

/// How a failure is enriched, derived from its kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    OutOfRange,
    MissingKey,
    MissingAttribute,
    UndefinedName,
    Other,
}

impl FailureClass {
    pub fn of(kind: ExcKind) -> Self {
        match kind {
            ExcKind::IndexError => FailureClass::OutOfRange,
            ExcKind::KeyError | ExcKind::KeyMessage => FailureClass::MissingKey,
            ExcKind::AttributeError => FailureClass::MissingAttribute,
            ExcKind::NameError => FailureClass::UndefinedName,
            _ => FailureClass::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrichConfig {
    /// Minimum similarity ratio for a name to be suggested.
    pub similarity_threshold: f64,
    /// Cap on suggestions per failure; `None` lists every match.
    pub max_suggestions: Option<usize>,
    /// Append the `Debug info:` block when operands were recorded.
    pub debug_block: bool,
}

impl Default for EnrichConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: similarity::DEFAULT_THRESHOLD,
            max_suggestions: None,
            debug_block: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use exlens_vm::ExcKind;

    use super::{EnrichConfig, FailureClass};

    #[test]
    fn classifies_failure_kinds() {
        assert_eq!(FailureClass::of(ExcKind::IndexError), FailureClass::OutOfRange);
        assert_eq!(FailureClass::of(ExcKind::KeyMessage), FailureClass::MissingKey);
        assert_eq!(FailureClass::of(ExcKind::NameError), FailureClass::UndefinedName);
        assert_eq!(FailureClass::of(ExcKind::ZeroDivisionError), FailureClass::Other);
    }

    #[test]
    fn config_reads_partial_toml() {
        let config: EnrichConfig = toml::from_str("max_suggestions = 2\n").expect("parse config");
        assert_eq!(config.max_suggestions, Some(2));
        assert_eq!(config.similarity_threshold, 0.75);
        assert!(config.debug_block);

        let config: EnrichConfig =
            toml::from_str("similarity_threshold = 0.9\ndebug_block = false\n").expect("parse config");
        assert_eq!(config.similarity_threshold, 0.9);
        assert!(!config.debug_block);
        assert_eq!(config.max_suggestions, None);
    }
}
