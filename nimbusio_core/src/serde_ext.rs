//! Extensions for serde.

/// Serializes a `Duration` as milliseconds.
///
/// Both `1500` and `"1500"` are accepted when deserializing, so that
/// hand-written YAML files do not need quoting.
pub mod duration_millis {
    use serde::de;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::num::ParseIntError;
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Millis {
        Number(u64),
        Text(String),
    }

    #[allow(clippy::trivially_copy_pass_by_ref)]
    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        to_millis(value).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Millis::deserialize(deserializer)? {
            Millis::Number(n) => Ok(Duration::from_millis(n)),
            Millis::Text(s) => from_millis(&s).map_err(de::Error::custom),
        }
    }

    pub(crate) fn to_millis(duration: &Duration) -> u64 {
        duration.as_secs() * 1000 + u64::from(duration.subsec_millis())
    }

    pub(crate) fn from_millis(millis: &str) -> Result<Duration, ParseIntError> {
        millis.trim().parse::<u64>().map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[derive(PartialEq, Debug, Serialize, Deserialize)]
    struct StopConfig {
        #[serde(with = "duration_millis")]
        pub wait: Duration,

        #[serde(default = "default_grace", with = "duration_millis")]
        pub grace: Duration,
    }
    fn default_grace() -> Duration {
        Duration::from_secs(3)
    }

    #[test]
    fn to_millis_truncates_sub_millis() {
        assert_eq!(0, duration_millis::to_millis(&Duration::from_nanos(999_999)));
        assert_eq!(1, duration_millis::to_millis(&Duration::from_nanos(1_000_001)));
        assert_eq!(2500, duration_millis::to_millis(&Duration::from_millis(2500)));
    }

    #[test]
    fn from_millis_rejects_fractions() {
        assert_eq!(
            Ok(Duration::from_millis(1000)),
            duration_millis::from_millis(" 1000 ")
        );
        assert!(duration_millis::from_millis("0.5").is_err());
    }

    #[test]
    fn numbers_and_strings_are_accepted() -> Result<(), Box<dyn std::error::Error>> {
        let config: StopConfig = serde_yaml::from_str("wait: 24\n")?;
        assert_eq!(config.wait, Duration::from_millis(24));
        assert_eq!(config.grace, default_grace());

        let config: StopConfig = serde_yaml::from_str("wait: \"30\"\ngrace: 10\n")?;
        assert_eq!(config.wait, Duration::from_millis(30));
        assert_eq!(config.grace, Duration::from_millis(10));
        Ok(())
    }

    #[test]
    fn serialized_form_reads_back() -> Result<(), Box<dyn std::error::Error>> {
        let config = StopConfig {
            wait: Duration::from_millis(42),
            grace: default_grace(),
        };
        let yaml = serde_yaml::to_string(&config)?;
        let decoded: StopConfig = serde_yaml::from_str(&yaml)?;
        assert_eq!(config, decoded);
        Ok(())
    }
}
