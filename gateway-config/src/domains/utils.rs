//! Utility functions and helpers for configuration

use serde::{Deserialize, Deserializer, Serializer};
use std::time::Duration;

/// Serde helper module for Duration serialization as seconds
pub mod serde_duration {
    use super::*;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let seconds = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(seconds))
    }
}

/// Default functions for serde
pub fn default_true() -> bool {
    true
}

pub fn default_false() -> bool {
    false
}

/// Accept either a list of strings or a single whitespace-separated string.
///
/// Configurations exported by other MCP hosts sometimes write
/// `"args": "-y my-server"` instead of a proper array.
pub fn deserialize_args<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum ArgsRepr {
        List(Vec<String>),
        Joined(String),
    }

    match ArgsRepr::deserialize(deserializer)? {
        ArgsRepr::List(list) => Ok(list),
        ArgsRepr::Joined(s) => Ok(s.split_whitespace().map(str::to_string).collect()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Deserialize)]
    struct Args {
        #[serde(deserialize_with = "deserialize_args")]
        args: Vec<String>,
    }

    #[test]
    fn test_args_as_list() {
        let parsed: Args = serde_json::from_str(r#"{"args": ["-y", "server"]}"#).unwrap();
        assert_eq!(parsed.args, vec!["-y", "server"]);
    }

    #[test]
    fn test_args_as_joined_string() {
        let parsed: Args = serde_json::from_str(r#"{"args": "-y server"}"#).unwrap();
        assert_eq!(parsed.args, vec!["-y", "server"]);
    }
}
