use std::fmt;

use serde::{Deserialize, Serialize};

/// Error returned when a string cannot be canonicalized into a [`Cnpj`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid CNPJ {input:?}: expected 14 digits, found {digits}")]
pub struct InvalidCnpj {
    /// The rejected input, as submitted.
    pub input: String,
    /// Number of digits left after stripping formatting characters.
    pub digits: usize,
}

/// A canonical 14-digit Brazilian company identifier.
///
/// Formatting characters (`.`, `/`, `-` and anything else that is not a
/// digit) are stripped on parse; leading zeros are preserved. The inner
/// string is guaranteed to be exactly 14 ASCII digits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Cnpj(String);

impl Cnpj {
    /// Canonicalize `input` into a CNPJ, stripping non-digit characters.
    pub fn parse(input: &str) -> Result<Self, InvalidCnpj> {
        let digits: String = input.chars().filter(|c| c.is_ascii_digit()).collect();
        if digits.len() != 14 {
            return Err(InvalidCnpj {
                input: input.to_string(),
                digits: digits.len(),
            });
        }
        Ok(Self(digits))
    }

    /// The canonical 14-digit representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Cnpj {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for Cnpj {
    type Err = InvalidCnpj;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Cnpj {
    type Error = InvalidCnpj;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Cnpj> for String {
    fn from(cnpj: Cnpj) -> Self {
        cnpj.0
    }
}
