//! Security identifier normalization.
//!
//! Two schemes are supported: CUSIP (8-character base plus one check digit)
//! and SEDOL (6-character base plus one weighted check digit). Panels carry
//! both the abbreviated base (`security_key_abbrev`) and the full form
//! (`security_key`); these functions convert between the two.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const CUSIP_ALPHABET: &str = "0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ*@#";
// Vowels are not valid SEDOL characters; the blanks keep the remaining indices aligned.
const SEDOL_ALPHABET: &str = "0123456789 BCD FGH JKLMN PQRST VWXYZ";
const SEDOL_WEIGHTS: [u32; 6] = [1, 3, 1, 7, 3, 9];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentifierError {
    #[error("{scheme} identifier '{value}' has length {actual}, expected {expected}")]
    InvalidLength {
        scheme: KeyScheme,
        value: String,
        expected: usize,
        actual: usize,
    },

    #[error("{scheme} identifier '{value}' contains invalid character '{ch}'")]
    InvalidCharacter {
        scheme: KeyScheme,
        value: String,
        ch: char,
    },

    #[error("unknown key scheme: {0}")]
    UnknownScheme(String),
}

/// Identifier scheme named by the panel's `security_key_name` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyScheme {
    Cusip,
    Sedol,
}

impl KeyScheme {
    pub const ALL: [KeyScheme; 2] = [KeyScheme::Cusip, KeyScheme::Sedol];

    pub fn as_str(self) -> &'static str {
        match self {
            KeyScheme::Cusip => "cusip",
            KeyScheme::Sedol => "sedol",
        }
    }

    /// Length of the abbreviated (check-digit-free) identifier.
    pub fn abbrev_len(self) -> usize {
        match self {
            KeyScheme::Cusip => 8,
            KeyScheme::Sedol => 6,
        }
    }

    pub fn full_len(self) -> usize {
        self.abbrev_len() + 1
    }

    pub fn check_digit(self, abbrev: &str) -> Result<char, IdentifierError> {
        match self {
            KeyScheme::Cusip => cusip_check_digit(abbrev),
            KeyScheme::Sedol => sedol_check_digit(abbrev),
        }
    }

    /// Append the check digit to an abbreviated identifier.
    pub fn to_full(self, abbrev: &str) -> Result<String, IdentifierError> {
        let check = self.check_digit(abbrev)?;
        let mut full = String::with_capacity(self.full_len());
        full.push_str(abbrev);
        full.push(check);
        Ok(full)
    }

    /// Strip the check digit from a full identifier.
    pub fn abbreviate(self, full: &str) -> Result<String, IdentifierError> {
        let len = full.chars().count();
        if len != self.full_len() {
            return Err(IdentifierError::InvalidLength {
                scheme: self,
                value: full.to_string(),
                expected: self.full_len(),
                actual: len,
            });
        }
        Ok(full.chars().take(self.abbrev_len()).collect())
    }

    /// True when `full` has the right length and a matching check digit.
    pub fn is_valid(self, full: &str) -> bool {
        let Ok(abbrev) = self.abbreviate(full) else {
            return false;
        };
        match (self.check_digit(&abbrev), full.chars().last()) {
            (Ok(expected), Some(actual)) => expected == actual,
            _ => false,
        }
    }
}

impl fmt::Display for KeyScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyScheme {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cusip" => Ok(KeyScheme::Cusip),
            "sedol" => Ok(KeyScheme::Sedol),
            _ => Err(IdentifierError::UnknownScheme(s.to_string())),
        }
    }
}

fn check_length(scheme: KeyScheme, abbrev: &str) -> Result<(), IdentifierError> {
    let len = abbrev.chars().count();
    if len != scheme.abbrev_len() {
        return Err(IdentifierError::InvalidLength {
            scheme,
            value: abbrev.to_string(),
            expected: scheme.abbrev_len(),
            actual: len,
        });
    }
    Ok(())
}

fn digit_char(value: u32) -> char {
    char::from_digit(value % 10, 10).unwrap_or('0')
}

/// Luhn-style CUSIP check digit: odd positions doubled, digit sums added.
pub fn cusip_check_digit(abbrev: &str) -> Result<char, IdentifierError> {
    check_length(KeyScheme::Cusip, abbrev)?;
    let mut sum = 0u32;
    for (i, ch) in abbrev.chars().enumerate() {
        let ch = ch.to_ascii_uppercase();
        let mut v = CUSIP_ALPHABET
            .find(ch)
            .ok_or_else(|| IdentifierError::InvalidCharacter {
                scheme: KeyScheme::Cusip,
                value: abbrev.to_string(),
                ch,
            })? as u32;
        if i % 2 == 1 {
            v *= 2;
        }
        sum += v / 10 + v % 10;
    }
    Ok(digit_char((10 - sum % 10) % 10))
}

/// Weighted SEDOL check digit.
pub fn sedol_check_digit(abbrev: &str) -> Result<char, IdentifierError> {
    check_length(KeyScheme::Sedol, abbrev)?;
    let mut sum = 0u32;
    for (ch, weight) in abbrev.chars().zip(SEDOL_WEIGHTS) {
        let ch = ch.to_ascii_uppercase();
        let v = match SEDOL_ALPHABET.find(ch) {
            Some(v) if ch != ' ' => v as u32,
            _ => {
                return Err(IdentifierError::InvalidCharacter {
                    scheme: KeyScheme::Sedol,
                    value: abbrev.to_string(),
                    ch,
                })
            }
        };
        sum += v * weight;
    }
    Ok(digit_char((10 - sum % 10) % 10))
}

/// Full identifiers for a list of abbreviations.
pub fn abbrevs_to_full<S: AsRef<str>>(
    scheme: KeyScheme,
    abbrevs: &[S],
) -> Result<Vec<String>, IdentifierError> {
    abbrevs.iter().map(|a| scheme.to_full(a.as_ref())).collect()
}
