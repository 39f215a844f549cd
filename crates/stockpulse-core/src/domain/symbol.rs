use std::fmt::{Display, Formatter};
use std::str::FromStr;

use crate::error::ValidationError;

/// Maximum accepted symbol length.
pub const MAX_SYMBOL_LEN: usize = 10;

/// Instrument symbol: 1-10 ASCII letters.
///
/// Constructed only through validation, so any `Symbol` in the system is
/// well-formed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Symbol(String);

impl Symbol {
    pub fn new(value: impl Into<String>) -> Result<Self, ValidationError> {
        let value = value.into();
        if value.is_empty() {
            return Err(ValidationError::EmptySymbol);
        }
        if value.len() > MAX_SYMBOL_LEN {
            return Err(ValidationError::SymbolTooLong {
                len: value.len(),
                max: MAX_SYMBOL_LEN,
            });
        }
        for (index, ch) in value.chars().enumerate() {
            if !ch.is_ascii_alphabetic() {
                return Err(ValidationError::SymbolInvalidChar { ch, index });
            }
        }

        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl Display for Symbol {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Symbol {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::new(value)
    }
}
