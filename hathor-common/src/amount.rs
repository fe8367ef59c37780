//! A token-amount newtype which maintains some useful internal invariants.
//!
//! Ledger output values are conceptually 256-bit signed integers on the wire,
//! but every reachable value fits comfortably in an [`i128`]; the codec
//! rejects encoded values outside this range rather than truncating them.
//! We don't impl `From<i128>` because calling code should be explicit about
//! whether a raw value has already been range-checked.

use std::{
    fmt::{self, Display},
    iter::Sum,
};

use serde::{Deserialize, Serialize};

/// Errors that can occur when constructing a [`TokenAmount`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("token amount is negative")]
    Negative,
    #[error("token amount is zero where a positive value is required")]
    Zero,
}

/// A quantity of some token, guaranteed non-negative.
///
/// Amounts are integral: the ledger has no sub-unit fractions. Arithmetic
/// helpers are checked so that balance math can never silently wrap.
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Serialize,
    Deserialize,
)]
#[serde(transparent)]
pub struct TokenAmount(i128);

impl TokenAmount {
    pub const ZERO: Self = Self(0);
    pub const ONE: Self = Self(1);
    pub const MAX: Self = Self(i128::MAX);

    /// Construct from a value already known to be non-negative.
    #[inline]
    pub const fn from_u64(value: u64) -> Self {
        Self(value as i128)
    }

    /// Construct from a raw [`i128`], rejecting negative values.
    #[inline]
    pub const fn try_from_i128(value: i128) -> Result<Self, Error> {
        if value < 0 {
            Err(Error::Negative)
        } else {
            Ok(Self(value))
        }
    }

    /// Construct from a raw [`i128`], additionally rejecting zero. Output
    /// values on the wire must be strictly positive.
    #[inline]
    pub const fn try_from_positive(value: i128) -> Result<Self, Error> {
        match Self::try_from_i128(value) {
            Err(e) => Err(e),
            Ok(amount) if amount.0 == 0 => Err(Error::Zero),
            Ok(amount) => Ok(amount),
        }
    }

    #[inline]
    pub const fn to_i128(self) -> i128 {
        self.0
    }

    #[inline]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, rhs: Self) -> Option<Self> {
        self.0.checked_add(rhs.0).map(Self)
    }

    pub fn checked_sub(self, rhs: Self) -> Option<Self> {
        let inner = self.0.checked_sub(rhs.0)?;
        Self::try_from_i128(inner).ok()
    }

    /// `self + rhs`, saturating at [`TokenAmount::MAX`]. Used in balance
    /// accumulation where an overflow would otherwise panic on absurd inputs.
    pub fn saturating_add(self, rhs: Self) -> Self {
        Self(self.0.saturating_add(rhs.0))
    }
}

impl Display for TokenAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Sum for TokenAmount {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::ZERO, |acc, x| acc.saturating_add(x))
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl proptest::arbitrary::Arbitrary for TokenAmount {
    type Parameters = ();
    type Strategy = proptest::strategy::BoxedStrategy<Self>;

    fn arbitrary_with(_args: Self::Parameters) -> Self::Strategy {
        use proptest::strategy::Strategy;
        (0..=i128::MAX).prop_map(TokenAmount).boxed()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rejects_negative() {
        assert_eq!(TokenAmount::try_from_i128(-1), Err(Error::Negative));
        assert_eq!(TokenAmount::try_from_i128(0), Ok(TokenAmount::ZERO));
    }

    #[test]
    fn positive_rejects_zero() {
        assert_eq!(TokenAmount::try_from_positive(0), Err(Error::Zero));
        assert!(TokenAmount::try_from_positive(1).is_ok());
    }

    #[test]
    fn checked_sub_never_goes_negative() {
        let one = TokenAmount::ONE;
        let two = TokenAmount::from_u64(2);
        assert_eq!(one.checked_sub(two), None);
        assert_eq!(two.checked_sub(one), Some(one));
    }

    #[test]
    fn sum_saturates() {
        let total: TokenAmount =
            [TokenAmount::MAX, TokenAmount::MAX].into_iter().sum();
        assert_eq!(total, TokenAmount::MAX);
    }
}
