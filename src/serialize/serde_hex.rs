//! (De)serialize an [`Address`] as a `"0x..."` string, which is what people
//! expect to see in a profile.

use std::fmt;

use serde::{de::Visitor, Deserializer, Serializer};

use crate::Address;

pub fn serialize<S>(value: &Address, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.collect_str(&format_args!("{value:#x}"))
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Address, D::Error>
where
    D: Deserializer<'de>,
{
    struct V;

    impl<'de> Visitor<'de> for V {
        type Value = Address;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a hex address like \"0x7f00\"")
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            let digits = v
                .strip_prefix("0x")
                .ok_or_else(|| E::custom(format!("{v:?} has no 0x prefix")))?;
            Address::from_str_radix(digits, 16).map_err(E::custom)
        }
    }

    deserializer.deserialize_str(V)
}
