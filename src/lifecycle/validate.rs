//! # Input validation for server configuration.
//!
//! All checks are deterministic and side-effect free; a rejected value is
//! always rejected. Called at the create/import/update boundary so nothing
//! invalid ever reaches the store.

use crate::error::{Error, Result};

/// Longest accepted server name.
const MAX_NAME_LEN: usize = 64;

/// Validates a server name against `^[A-Za-z0-9_-]{1,64}$`.
pub fn server_name(name: &str) -> Result<&str> {
    if name.is_empty() {
        return Err(Error::validation("name", "name cannot be empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(Error::validation(
            "name",
            format!("name cannot exceed {MAX_NAME_LEN} characters"),
        ));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(Error::validation(
            "name",
            "name may contain only letters, digits, underscores, and hyphens",
        ));
    }
    Ok(name)
}

/// Validates a TCP port. Zero is the only invalid `u16`.
pub fn port(port: u16) -> Result<u16> {
    if port == 0 {
        return Err(Error::validation("port", "port must be between 1 and 65535"));
    }
    Ok(port)
}

/// Validates a heap-size string like `2G` or `512M` and normalizes it to
/// upper case. Bounds: at least 512M, at most 64G.
pub fn memory(memory: &str) -> Result<String> {
    let normalized = memory.trim().to_ascii_uppercase();
    let (digits, unit) = normalized.split_at(normalized.len().saturating_sub(1));
    let value: u64 = digits
        .parse()
        .map_err(|_| Error::validation("memory", "expected a number followed by M or G, e.g. 2G"))?;

    let megabytes = match unit {
        "G" => value.saturating_mul(1024),
        "M" => value,
        _ => {
            return Err(Error::validation(
                "memory",
                "expected a number followed by M or G, e.g. 2G",
            ))
        }
    };

    if megabytes < 512 {
        return Err(Error::validation("memory", "heap must be at least 512M"));
    }
    if megabytes > 64 * 1024 {
        return Err(Error::validation("memory", "heap cannot exceed 64G"));
    }
    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_well_formed_names() {
        for name in ["alpha", "Server_01", "a", "with-hyphen", "X".repeat(64).as_str()] {
            assert!(server_name(name).is_ok(), "should accept {name}");
        }
    }

    #[test]
    fn rejects_bad_names() {
        for name in [
            "",
            "has space",
            "dot.name",
            "slash/name",
            "back\\slash",
            "../escape",
            "Y".repeat(65).as_str(),
            "unicode-é",
        ] {
            assert!(server_name(name).is_err(), "should reject {name:?}");
        }
    }

    #[test]
    fn port_bounds() {
        assert!(port(0).is_err());
        assert_eq!(port(1).unwrap(), 1);
        assert_eq!(port(25565).unwrap(), 25565);
        assert_eq!(port(65535).unwrap(), 65535);
    }

    #[test]
    fn memory_normalizes_and_bounds() {
        assert_eq!(memory("2g").unwrap(), "2G");
        assert_eq!(memory("512M").unwrap(), "512M");
        assert_eq!(memory("64G").unwrap(), "64G");
        assert!(memory("256M").is_err(), "below minimum");
        assert!(memory("65G").is_err(), "above maximum");
        assert!(memory("lots").is_err());
        assert!(memory("2T").is_err());
        assert!(memory("").is_err());
    }
}
