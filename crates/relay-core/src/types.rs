//! Identifiers and channel name validation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// A channel identifier.
pub type ChannelId = String;

/// Atomic counter for ensuring unique IDs even within the same nanosecond.
static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a unique client (connection) identifier.
#[must_use]
pub fn generate_client_id() -> String {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{:x}-{:x}", timestamp, counter)
}

/// Current unix time in seconds. Used for credential expiration checks.
#[must_use]
pub fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Validate a channel name against the configured length limit.
///
/// # Errors
///
/// Returns a static description of the violation.
pub fn validate_channel(name: &str, max_length: usize) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("channel name cannot be empty");
    }
    if max_length > 0 && name.len() > max_length {
        return Err("channel name too long");
    }
    if !name.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err("channel name contains invalid characters");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_client_ids() {
        let id1 = generate_client_id();
        let id2 = generate_client_id();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_channel_validation() {
        assert!(validate_channel("chat:room", 255).is_ok());
        assert!(validate_channel("", 255).is_err());
        assert!(validate_channel("has\ncontrol", 255).is_err());
        let long = "a".repeat(256);
        assert!(validate_channel(&long, 255).is_err());
        assert!(validate_channel(&long, 0).is_ok());
    }
}
