use crate::errors::ConfigError;

/// Validate a SQL identifier (table prefix, partition key) before it is
/// spliced into DDL or DML text. Identifiers are never bound as parameters,
/// so anything outside `[A-Za-z0-9_]` is refused outright.
pub fn validate_identifier(identifier: &str, kind: &'static str) -> Result<(), ConfigError> {
    let valid = !identifier.is_empty()
        && identifier.len() <= 63
        && identifier
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !identifier.chars().next().is_some_and(|c| c.is_ascii_digit());
    if valid {
        Ok(())
    } else {
        Err(ConfigError::InvalidIdentifier {
            kind,
            value: identifier.to_string(),
        })
    }
}

/// Validate a fragment hash before it is embedded into lazy SQL text.
pub fn validate_hash(hash: &str) -> Result<(), ConfigError> {
    let valid = !hash.is_empty() && hash.chars().all(|c| c.is_ascii_hexdigit());
    if valid {
        Ok(())
    } else {
        Err(ConfigError::InvalidIdentifier {
            kind: "query hash",
            value: hash.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_are_checked() {
        assert!(validate_identifier("partitioncache", "table prefix").is_ok());
        assert!(validate_identifier("trip_id", "partition key").is_ok());
        assert!(validate_identifier("bad-prefix", "table prefix").is_err());
        assert!(validate_identifier("1leading", "table prefix").is_err());
        assert!(validate_identifier("drop table;--", "partition key").is_err());
        assert!(validate_identifier("", "partition key").is_err());
    }

    #[test]
    fn hashes_are_hex_only() {
        assert!(validate_hash("f7c3bc1d808e04732adf679965ccc34ca7ae3441").is_ok());
        assert!(validate_hash("abc'; DROP TABLE x;--").is_err());
    }
}
