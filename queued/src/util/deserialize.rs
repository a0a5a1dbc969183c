use serde::{
    de::{self, Visitor},
    Deserializer,
};
use std::{convert::TryFrom, fmt, marker::PhantomData};

/// Deserialize a JSON number that must hold a whole value, like `5` or `5.0`.
///
/// JSON schema's `"type": "number", "multipleOf": 1.0` lets clients send
/// floats with a zero fraction, which serde refuses to put into integers.
pub fn whole_number<'de, T, D>(deserializer: D) -> Result<T, D::Error>
where
    T: TryFrom<u64>,
    D: Deserializer<'de>,
{
    struct WholeNumber<T>(PhantomData<fn() -> T>);

    impl<'de, T> Visitor<'de> for WholeNumber<T>
    where
        T: TryFrom<u64>,
    {
        type Value = T;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a non-negative whole number")
        }

        fn visit_u64<E>(self, value: u64) -> Result<T, E>
        where
            E: de::Error,
        {
            T::try_from(value)
                .map_err(|_| E::invalid_value(de::Unexpected::Unsigned(value), &self))
        }

        fn visit_i64<E>(self, value: i64) -> Result<T, E>
        where
            E: de::Error,
        {
            let unsigned = u64::try_from(value)
                .map_err(|_| E::invalid_value(de::Unexpected::Signed(value), &self))?;
            self.visit_u64(unsigned)
        }

        fn visit_f64<E>(self, value: f64) -> Result<T, E>
        where
            E: de::Error,
        {
            if value.fract() != 0.0 || value < 0.0 || value > u64::MAX as f64 {
                return Err(E::invalid_value(de::Unexpected::Float(value), &self));
            }
            self.visit_u64(value as u64)
        }
    }

    deserializer.deserialize_any(WholeNumber(PhantomData))
}
