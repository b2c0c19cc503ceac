// src/core/amount.rs
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Neg, Sub, SubAssign};
use std::str::FromStr;

use num_bigint::BigInt;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Exact signed integer of unbounded width.
///
/// Serializes as a JSON number while the value fits an i128, as a decimal
/// string beyond that. Deserializes from either form; floats are rejected.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Amount(BigInt);

impl Amount {
    pub fn zero() -> Self {
        Self(BigInt::from(0))
    }

    pub fn is_zero(&self) -> bool {
        self.0 == BigInt::from(0)
    }

    pub fn is_negative(&self) -> bool {
        self.0 < BigInt::from(0)
    }

    pub fn is_positive(&self) -> bool {
        self.0 > BigInt::from(0)
    }

    pub fn inner(&self) -> &BigInt {
        &self.0
    }
}

impl From<BigInt> for Amount {
    fn from(value: BigInt) -> Self {
        Self(value)
    }
}

impl From<i64> for Amount {
    fn from(value: i64) -> Self {
        Self(BigInt::from(value))
    }
}

impl FromStr for Amount {
    type Err = num_bigint::ParseBigIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(BigInt::from_str(s)?))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Add for Amount {
    type Output = Amount;

    fn add(self, rhs: Amount) -> Amount {
        Amount(self.0 + rhs.0)
    }
}

impl<'a> Add<&'a Amount> for &'a Amount {
    type Output = Amount;

    fn add(self, rhs: &'a Amount) -> Amount {
        Amount(&self.0 + &rhs.0)
    }
}

impl AddAssign<&Amount> for Amount {
    fn add_assign(&mut self, rhs: &Amount) {
        self.0 += &rhs.0;
    }
}

impl Sub for Amount {
    type Output = Amount;

    fn sub(self, rhs: Amount) -> Amount {
        Amount(self.0 - rhs.0)
    }
}

impl<'a> Sub<&'a Amount> for &'a Amount {
    type Output = Amount;

    fn sub(self, rhs: &'a Amount) -> Amount {
        Amount(&self.0 - &rhs.0)
    }
}

impl SubAssign<&Amount> for Amount {
    fn sub_assign(&mut self, rhs: &Amount) {
        self.0 -= &rhs.0;
    }
}

impl Neg for Amount {
    type Output = Amount;

    fn neg(self) -> Amount {
        Amount(-self.0)
    }
}

impl Sum for Amount {
    fn sum<I: Iterator<Item = Amount>>(iter: I) -> Amount {
        iter.fold(Amount::zero(), |acc, x| acc + x)
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match i128::try_from(self.0.clone()) {
            Ok(n) => serializer.serialize_i128(n),
            Err(_) => serializer.serialize_str(&self.0.to_string()),
        }
    }
}

struct AmountVisitor;

impl<'de> Visitor<'de> for AmountVisitor {
    type Value = Amount;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an integer or a decimal string")
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Amount, E> {
        Ok(Amount(BigInt::from(v)))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Amount, E> {
        Ok(Amount(BigInt::from(v)))
    }

    fn visit_i128<E: de::Error>(self, v: i128) -> Result<Amount, E> {
        Ok(Amount(BigInt::from(v)))
    }

    fn visit_u128<E: de::Error>(self, v: u128) -> Result<Amount, E> {
        Ok(Amount(BigInt::from(v)))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Amount, E> {
        Err(E::custom(format!(
            "amounts must be integers, got float {}",
            v
        )))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Amount, E> {
        BigInt::from_str(v)
            .map(Amount)
            .map_err(|_| E::custom(format!("invalid integer string: {:?}", v)))
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Amount, D::Error> {
        deserializer.deserialize_any(AmountVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arithmetic_is_exact() {
        let a = Amount::from_str("170141183460469231731687303715884105728").unwrap();
        let b = Amount::from(1);
        let sum = &a + &b;
        assert_eq!(
            sum.to_string(),
            "170141183460469231731687303715884105729"
        );
        assert_eq!(&sum - &b, a);
    }

    #[test]
    fn json_number_within_i128() {
        let a = Amount::from(100);
        assert_eq!(serde_json::to_string(&a).unwrap(), "100");
        let back: Amount = serde_json::from_str("100").unwrap();
        assert_eq!(back, a);
    }

    #[test]
    fn json_string_beyond_i128() {
        let a = Amount::from_str("340282366920938463463374607431768211456").unwrap();
        let encoded = serde_json::to_string(&a).unwrap();
        assert_eq!(encoded, "\"340282366920938463463374607431768211456\"");
        let back: Amount = serde_json::from_str(&encoded).unwrap();
        assert_eq!(back, a);
    }

    #[test]
    fn json_string_always_accepted() {
        let back: Amount = serde_json::from_str("\"-42\"").unwrap();
        assert_eq!(back, Amount::from(-42));
    }

    #[test]
    fn floats_rejected() {
        assert!(serde_json::from_str::<Amount>("1.5").is_err());
    }
}
