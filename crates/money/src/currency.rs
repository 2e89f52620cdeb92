use std::fmt;

/// An opaque currency code, e.g. `"USD"`.
///
/// The empty code is reserved as "unspecified but not invalid"; any
/// other code must appear in the registry below to be valid.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
pub struct CurrencyCode(String);

impl CurrencyCode {
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// An empty code is always valid; a non-empty code must be registered.
    pub fn is_valid(&self) -> bool {
        self.0.is_empty() || registry(&self.0).is_some()
    }

    /// Number of minor-unit digits for this currency, if known.
    pub fn digits(&self) -> Option<u8> {
        if self.0.is_empty() {
            return None;
        }
        registry(&self.0).map(|info| info.digits)
    }
}

impl fmt::Display for CurrencyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for CurrencyCode {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CurrencyCode {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

struct CurrencyInfo {
    /// ISO 4217 numeric code, kept for parity with the source registry
    /// even though nothing in this crate reads it today.
    #[allow(dead_code)]
    numeric_code: &'static str,
    digits: u8,
}

fn registry(code: &str) -> Option<CurrencyInfo> {
    match code {
        "GEL" => Some(CurrencyInfo {
            numeric_code: "981",
            digits: 2,
        }),
        "USD" => Some(CurrencyInfo {
            numeric_code: "840",
            digits: 2,
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_codes_are_valid() {
        assert!(CurrencyCode::new("USD").is_valid());
        assert!(CurrencyCode::new("GEL").is_valid());
    }

    #[test]
    fn empty_code_is_valid_but_has_no_digits() {
        let empty = CurrencyCode::new("");
        assert!(empty.is_valid());
        assert_eq!(empty.digits(), None);
    }

    #[test]
    fn unknown_code_is_invalid() {
        assert!(!CurrencyCode::new("ZZZ").is_valid());
    }
}
