//! Serde helpers for configuration values.

/// (De)serialize a [`std::time::Duration`] as whole milliseconds.
///
/// ```rust
/// use serde::{Deserialize, Serialize};
/// use std::time::Duration;
///
/// #[derive(Serialize, Deserialize)]
/// struct Window {
///     #[serde(with = "turboguard_core::serde_ext::duration_ms")]
///     window: Duration,
/// }
///
/// let parsed: Window = serde_json::from_str(r#"{"window": 1500}"#).unwrap();
/// assert_eq!(parsed.window, Duration::from_millis(1500));
/// ```
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// Serialize as milliseconds.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    /// Deserialize from milliseconds.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
