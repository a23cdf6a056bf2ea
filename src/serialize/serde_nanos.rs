//! `#[serde(with = "serde_nanos")]` for [`Duration`]s, written as a plain
//! integer count of nanoseconds so a chart can use them as an x axis as is.

use std::{fmt, time::Duration};

use serde::{de::Visitor, Deserializer, Serializer};

pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let nanos = u64::try_from(value.as_nanos()).unwrap_or(u64::MAX);
    serializer.serialize_u64(nanos)
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    struct V;

    impl<'de> Visitor<'de> for V {
        type Value = Duration;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a duration in nanoseconds")
        }

        fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            Ok(Duration::from_nanos(v))
        }

        fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            u64::try_from(v)
                .map(Duration::from_nanos)
                .map_err(|_| E::custom("negative duration"))
        }
    }

    deserializer.deserialize_u64(V)
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Stamp {
        #[serde(with = "super")]
        at: Duration,
    }

    #[test]
    fn durations_are_integer_nanos() {
        let json = serde_json::to_string(&Stamp {
            at: Duration::from_micros(1500),
        })
        .unwrap();
        assert_eq!(json, r#"{"at":1500000}"#);
    }

    #[test]
    fn negative_nanos_are_rejected() {
        assert!(serde_json::from_str::<Stamp>(r#"{"at":-1}"#).is_err());
        let stamp: Stamp = serde_json::from_str(r#"{"at":42}"#).unwrap();
        assert_eq!(stamp.at, Duration::from_nanos(42));
    }
}
