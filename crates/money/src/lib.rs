//! Currency registry and fixed-point monetary amounts.
//!
//! An [`Amount`] stores a value in a currency's minor units (e.g. cents
//! for USD). Addition is partial: it only succeeds when both amounts
//! share a currency and the sum fits in an `i64` without overflow.

mod currency;

pub use currency::CurrencyCode;

/// Errors raised by money operations.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("invalid currency code {0:?}")]
    InvalidCurrencyCode(CurrencyCode),
    #[error("incompatible currency codes, expected {expected:?}, received {received:?}")]
    IncompatibleCurrencyCodes {
        expected: CurrencyCode,
        received: CurrencyCode,
    },
}

/// A monetary value expressed in the minor units of its currency.
///
/// `number` is the integer minor-unit value; divide by
/// `10.pow(currency.digits())` to get the human-readable major-unit
/// value. That scaling is a presentation concern and lives outside the
/// core.
#[derive(Clone, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Amount {
    pub number: i64,
    pub currency_code: CurrencyCode,
}

impl Amount {
    /// Construct an amount, rejecting unknown non-empty currency codes.
    pub fn new(number: i64, currency_code: CurrencyCode) -> Result<Self, Error> {
        if !currency_code.is_valid() {
            return Err(Error::InvalidCurrencyCode(currency_code));
        }
        Ok(Self {
            number,
            currency_code,
        })
    }

    /// Add two amounts. Fails on currency mismatch or `i64` overflow;
    /// the caller treats a failed add as poisoning any running total.
    pub fn add(&self, other: &Amount) -> Option<Amount> {
        if self.currency_code != other.currency_code {
            return None;
        }
        self.number
            .checked_add(other.number)
            .map(|number| Amount {
                number,
                currency_code: self.currency_code.clone(),
            })
    }
}

/// Check that a received currency code matches the expected one.
pub fn check_currency_compatible(
    expected: CurrencyCode,
    received: CurrencyCode,
) -> Result<(), Error> {
    if expected != received {
        return Err(Error::IncompatibleCurrencyCodes { expected, received });
    }
    Ok(())
}

/// A running total that becomes permanently unknown once poisoned.
///
/// "Total is known iff every contributing addition so far was exact and
/// same-currency." Once `ok` is false it stays false; further additions
/// are no-ops.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TotalAmount {
    pub total: Amount,
    pub ok: bool,
}

impl TotalAmount {
    pub fn zero(currency_code: CurrencyCode) -> Self {
        Self {
            total: Amount {
                number: 0,
                currency_code,
            },
            ok: true,
        }
    }

    /// Add `amount` into the total. A no-op once already poisoned.
    ///
    /// The moment an addition poisons the total, `total` itself resets
    /// to zero rather than retaining the last good value — once `ok` is
    /// false the number is meaningless, and callers must not read it.
    pub fn add(&mut self, amount: &Amount) {
        if !self.ok {
            return;
        }
        match self.total.add(amount) {
            Some(total) => self.total = total,
            None => {
                self.ok = false;
                self.total = Amount {
                    number: 0,
                    currency_code: self.total.currency_code.clone(),
                };
            }
        }
    }
}
