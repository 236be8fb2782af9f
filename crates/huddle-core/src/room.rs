//! Room identifiers.
//!
//! A room has no existence of its own: it is present while at least one
//! connection is joined to it. The only thing to check is the name.

/// Maximum room id length in bytes.
pub const MAX_ROOM_ID_LENGTH: usize = 256;

/// Validate a room id before it reaches the membership service.
///
/// # Errors
///
/// Returns an error message if the room id is invalid.
pub fn validate_room_id(room_id: &str) -> Result<(), &'static str> {
    if room_id.is_empty() {
        return Err("Room id cannot be empty");
    }
    if room_id.len() > MAX_ROOM_ID_LENGTH {
        return Err("Room id too long");
    }
    if room_id.starts_with('$') {
        return Err("Room ids starting with '$' are reserved");
    }
    if !room_id.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err("Room id contains invalid characters");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_id_validation() {
        assert!(validate_room_id("lobby").is_ok());
        assert!(validate_room_id("team:42").is_ok());
        assert!(validate_room_id("").is_err());
        assert!(validate_room_id("$internal").is_err());
        assert!(validate_room_id("tab\there").is_err());
        assert!(validate_room_id("café").is_err());

        let long = "r".repeat(MAX_ROOM_ID_LENGTH + 1);
        assert_eq!(validate_room_id(&long), Err("Room id too long"));
    }
}
