//! Fixed-point money in minor units.

use serde::{Deserialize, Serialize};

use crate::types::ValidationError;

/// Three-letter uppercase currency code (ISO-4217 style).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Currency([u8; 3]);

impl Currency {
    /// Parses a currency code. Lowercase letters are normalised to uppercase.
    pub fn new(code: &str) -> Result<Self, ValidationError> {
        let bytes = code.as_bytes();
        if bytes.len() != 3 || !bytes.iter().all(u8::is_ascii_alphabetic) {
            return Err(ValidationError::InvalidCurrency(code.to_string()));
        }
        let mut normalised = [0u8; 3];
        for (slot, b) in normalised.iter_mut().zip(bytes) {
            *slot = b.to_ascii_uppercase();
        }
        Ok(Self(normalised))
    }

    /// US dollar.
    pub const fn usd() -> Self {
        Self(*b"USD")
    }

    /// Euro.
    pub const fn eur() -> Self {
        Self(*b"EUR")
    }

    /// Returns the code as a string slice.
    pub fn as_str(&self) -> &str {
        // Only ASCII letters are ever stored.
        std::str::from_utf8(&self.0).unwrap_or("???")
    }
}

impl std::fmt::Display for Currency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Currency {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for Currency {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<Currency> for String {
    fn from(currency: Currency) -> Self {
        currency.as_str().to_string()
    }
}

/// An amount of money in integer minor units (e.g. cents) plus its currency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Money {
    minor_units: i64,
    currency: Currency,
}

impl Money {
    /// Creates an amount from minor units.
    pub fn new(minor_units: i64, currency: Currency) -> Self {
        Self {
            minor_units,
            currency,
        }
    }

    /// Returns the amount in minor units.
    pub fn minor_units(&self) -> i64 {
        self.minor_units
    }

    /// Returns the currency.
    pub fn currency(&self) -> Currency {
        self.currency
    }

    /// Returns true if the amount is strictly positive.
    pub fn is_positive(&self) -> bool {
        self.minor_units > 0
    }
}

impl std::fmt::Display for Money {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.minor_units, self.currency)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn currency_normalises_case() {
        assert_eq!(Currency::new("usd").unwrap(), Currency::usd());
        assert_eq!(Currency::new("Eur").unwrap().as_str(), "EUR");
    }

    #[test]
    fn currency_rejects_malformed_codes() {
        for bad in ["", "US", "USDD", "U$D", "12A"] {
            assert!(Currency::new(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn money_serializes_with_currency_code() {
        let amount = Money::new(5000, Currency::usd());
        let json = serde_json::to_value(amount).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"minor_units": 5000, "currency": "USD"})
        );
        let back: Money = serde_json::from_value(json).unwrap();
        assert_eq!(back, amount);
    }

    #[test]
    fn money_positive_check() {
        assert!(Money::new(1, Currency::usd()).is_positive());
        assert!(!Money::new(0, Currency::usd()).is_positive());
        assert!(!Money::new(-10, Currency::usd()).is_positive());
    }

    #[test]
    fn money_display() {
        assert_eq!(Money::new(1250, Currency::eur()).to_string(), "1250 EUR");
    }
}
