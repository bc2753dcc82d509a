//! Serde adapters for human readable durations such as `"5m"` or `"100ms"`.

use std::time::Duration;

use serde::{Deserialize, Deserializer, de::Error as _};

/// Deserialises a required duration string.
///
/// # Errors
///
/// Fails when the value is not a string `humantime` understands.
pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let raw = String::deserialize(deserializer)?;
    humantime::parse_duration(raw.trim()).map_err(D::Error::custom)
}

/// Adapter for `Option<Duration>` fields.
pub mod option {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, de::Error as _};

    /// Deserialises an optional duration string; empty strings mean `None`.
    ///
    /// # Errors
    ///
    /// Fails when a non-empty value is not a valid duration.
    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        match raw.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(text) => humantime::parse_duration(text)
                .map(Some)
                .map_err(D::Error::custom),
        }
    }
}
