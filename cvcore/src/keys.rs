use log::warn;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Length of a canonical AES media key, in characters.
pub const AES_KEY_LEN: usize = 16;

/// Length of a database key, in hex characters.
pub const DATABASE_KEY_LEN: usize = 64;

/// Which credential field a [`KeyError`] concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyField {
    DatabaseKey,
    XorKey,
    AesKey,
}

impl std::fmt::Display for KeyField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyField::DatabaseKey => write!(f, "database key"),
            KeyField::XorKey => write!(f, "XOR key"),
            KeyField::AesKey => write!(f, "AES key"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("database key must be exactly {DATABASE_KEY_LEN} hex characters, got {0}")]
    DatabaseKeyLength(usize),

    #[error("database key contains non-hex characters")]
    DatabaseKeyNotHex,

    #[error("XOR key must not be empty")]
    XorKeyEmpty,

    #[error("XOR key must be a single byte as 1-2 hex digits (optionally 0x-prefixed), got {0:?}")]
    XorKeyMalformed(String),

    #[error("AES key must be at least {AES_KEY_LEN} characters, got {0}")]
    AesKeyTooShort(usize),
}

impl KeyError {
    pub fn field(&self) -> KeyField {
        match self {
            KeyError::DatabaseKeyLength(_) | KeyError::DatabaseKeyNotHex => KeyField::DatabaseKey,
            KeyError::XorKeyEmpty | KeyError::XorKeyMalformed(_) => KeyField::XorKey,
            KeyError::AesKeyTooShort(_) => KeyField::AesKey,
        }
    }
}

pub type Result<T> = std::result::Result<T, KeyError>;

/// Validates a single-byte XOR key. Accepts an optional `0x` prefix and 1-2
/// hex digits in either case; anything else is rejected. The canonical display
/// form is produced by [`format_xor_key`].
pub fn normalize_xor_key(raw: &str) -> Result<u8> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(KeyError::XorKeyEmpty);
    }

    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);

    if digits.is_empty() || digits.len() > 2 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(KeyError::XorKeyMalformed(trimmed.to_string()));
    }

    u8::from_str_radix(digits, 16).map_err(|_| KeyError::XorKeyMalformed(trimmed.to_string()))
}

/// Canonical display form of an XOR key: `0xHH`, upper-case, zero-padded.
pub fn format_xor_key(value: u8) -> String {
    format!("0x{value:02X}")
}

/// Validates an AES media key. Empty input is valid and means "no AES key
/// supplied"; non-empty input must be at least [`AES_KEY_LEN`] characters and
/// is truncated to exactly that length.
pub fn normalize_aes_key(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(String::new());
    }

    let len = trimmed.chars().count();
    if len < AES_KEY_LEN {
        return Err(KeyError::AesKeyTooShort(len));
    }

    Ok(trimmed.chars().take(AES_KEY_LEN).collect())
}

/// Validates a database key: exactly [`DATABASE_KEY_LEN`] hex characters.
/// The string passes through unchanged; no case normalization is applied.
pub fn normalize_database_key(raw: &str) -> Result<String> {
    let trimmed = raw.trim();

    let len = trimmed.chars().count();
    if len != DATABASE_KEY_LEN {
        return Err(KeyError::DatabaseKeyLength(len));
    }

    hex::decode(trimmed).map_err(|_| KeyError::DatabaseKeyNotHex)?;

    Ok(trimmed.to_string())
}

/// The credentials accumulated across workflow phases. Fields are only ever
/// populated with values that passed normalization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyBundle {
    /// 64-char hex database key, or empty when not yet known.
    #[serde(default)]
    pub database_key: String,
    #[serde(default)]
    pub xor_key: Option<u8>,
    #[serde(default)]
    pub aes_key: Option<String>,
}

impl KeyBundle {
    /// True when at least one media key (XOR or AES) is present.
    pub fn has_media_keys(&self) -> bool {
        self.xor_key.is_some() || self.aes_key.is_some()
    }

    pub fn xor_key_display(&self) -> Option<String> {
        self.xor_key.map(format_xor_key)
    }

    /// Merges keys reported by the decrypt service or the cloud key lookup.
    /// First writer wins per field; values that fail normalization are logged
    /// and dropped, leaving any prior value untouched.
    pub fn merge_reported(
        &mut self,
        db_key: Option<&str>,
        xor_key: Option<&str>,
        aes_key: Option<&str>,
    ) {
        if self.database_key.is_empty()
            && let Some(raw) = db_key
        {
            match normalize_database_key(raw) {
                Ok(key) => self.database_key = key,
                Err(e) => warn!("Dropping reported {}: {e}", e.field()),
            }
        }

        if self.xor_key.is_none()
            && let Some(raw) = xor_key
        {
            match normalize_xor_key(raw) {
                Ok(key) => self.xor_key = Some(key),
                Err(e) => warn!("Dropping reported {}: {e}", e.field()),
            }
        }

        if self.aes_key.is_none()
            && let Some(raw) = aes_key
        {
            match normalize_aes_key(raw) {
                Ok(key) if !key.is_empty() => self.aes_key = Some(key),
                Ok(_) => {}
                Err(e) => warn!("Dropping reported {}: {e}", e.field()),
            }
        }
    }

    /// Merges a previously persisted bundle, keeping any field already set.
    pub fn merge_stored(&mut self, stored: KeyBundle) {
        if self.database_key.is_empty() {
            self.database_key = stored.database_key;
        }
        if self.xor_key.is_none() {
            self.xor_key = stored.xor_key;
        }
        if self.aes_key.is_none() {
            self.aes_key = stored.aes_key;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xor_accepts_prefixed_and_bare_hex() {
        for input in ["0xA5", "a5", "A5", "0Xa5"] {
            assert_eq!(normalize_xor_key(input), Ok(0xA5), "input {input:?}");
        }
        assert_eq!(normalize_xor_key("5"), Ok(0x05));
        assert_eq!(normalize_xor_key("00"), Ok(0x00));
        assert_eq!(normalize_xor_key("ff"), Ok(0xFF));
    }

    #[test]
    fn xor_rejects_empty_and_malformed() {
        assert_eq!(normalize_xor_key(""), Err(KeyError::XorKeyEmpty));
        assert_eq!(normalize_xor_key("   "), Err(KeyError::XorKeyEmpty));
        assert!(matches!(
            normalize_xor_key("1G"),
            Err(KeyError::XorKeyMalformed(_))
        ));
        assert!(matches!(
            normalize_xor_key("256"),
            Err(KeyError::XorKeyMalformed(_))
        ));
        assert!(matches!(
            normalize_xor_key("0x"),
            Err(KeyError::XorKeyMalformed(_))
        ));
        assert!(matches!(
            normalize_xor_key("0x1AB"),
            Err(KeyError::XorKeyMalformed(_))
        ));
    }

    #[test]
    fn xor_normalization_is_referentially_transparent() {
        for input in ["0xA5", "a5", "7", "0X0f"] {
            assert_eq!(normalize_xor_key(input), normalize_xor_key(input));
        }
        for value in [0x00u8, 0x0F, 0xA5, 0xFF] {
            assert_eq!(normalize_xor_key(&format_xor_key(value)), Ok(value));
        }
    }

    #[test]
    fn format_xor_is_canonical() {
        assert_eq!(format_xor_key(0xA5), "0xA5");
        assert_eq!(format_xor_key(0x05), "0x05");
        assert_eq!(format_xor_key(0x00), "0x00");
    }

    #[test]
    fn aes_empty_is_valid_and_means_absent() {
        assert_eq!(normalize_aes_key(""), Ok(String::new()));
        assert_eq!(normalize_aes_key("   "), Ok(String::new()));
    }

    #[test]
    fn aes_shorter_than_sixteen_is_rejected() {
        assert_eq!(
            normalize_aes_key("abcdefghijklmno"),
            Err(KeyError::AesKeyTooShort(15))
        );
        assert_eq!(normalize_aes_key("x"), Err(KeyError::AesKeyTooShort(1)));
    }

    #[test]
    fn aes_truncates_to_first_sixteen_characters() {
        assert_eq!(
            normalize_aes_key("abcdefghijklmnop"),
            Ok("abcdefghijklmnop".to_string())
        );
        assert_eq!(
            normalize_aes_key("abcdefghijklmnop1234"),
            Ok("abcdefghijklmnop".to_string())
        );
    }

    #[test]
    fn database_key_passes_through_unchanged() {
        let lower = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";
        let mixed = "0123456789ABCDEF0123456789abcdef0123456789AbCdEf0123456789abcdef";
        assert_eq!(normalize_database_key(lower), Ok(lower.to_string()));
        assert_eq!(normalize_database_key(mixed), Ok(mixed.to_string()));
    }

    #[test]
    fn database_key_rejects_wrong_length_and_non_hex() {
        assert_eq!(
            normalize_database_key(""),
            Err(KeyError::DatabaseKeyLength(0))
        );
        assert_eq!(
            normalize_database_key("abc"),
            Err(KeyError::DatabaseKeyLength(3))
        );
        let short = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcde";
        assert_eq!(
            normalize_database_key(short),
            Err(KeyError::DatabaseKeyLength(63))
        );
        let bad = "g123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";
        assert_eq!(normalize_database_key(bad), Err(KeyError::DatabaseKeyNotHex));
    }

    #[test]
    fn errors_are_field_scoped() {
        assert_eq!(
            normalize_database_key("").unwrap_err().field(),
            KeyField::DatabaseKey
        );
        assert_eq!(normalize_xor_key("").unwrap_err().field(), KeyField::XorKey);
        assert_eq!(
            normalize_aes_key("short").unwrap_err().field(),
            KeyField::AesKey
        );
    }

    #[test]
    fn merge_reported_is_first_writer_wins() {
        let mut bundle = KeyBundle {
            xor_key: Some(0x11),
            ..Default::default()
        };
        bundle.merge_reported(None, Some("0xA5"), Some("abcdefghijklmnop"));
        assert_eq!(bundle.xor_key, Some(0x11));
        assert_eq!(bundle.aes_key.as_deref(), Some("abcdefghijklmnop"));
    }

    #[test]
    fn merge_reported_drops_invalid_values() {
        let mut bundle = KeyBundle::default();
        bundle.merge_reported(Some("not-a-key"), Some("zz9"), Some("short"));
        assert_eq!(bundle, KeyBundle::default());
    }

    #[test]
    fn merge_reported_ignores_empty_aes() {
        let mut bundle = KeyBundle::default();
        bundle.merge_reported(None, None, Some(""));
        assert_eq!(bundle.aes_key, None);
    }

    #[test]
    fn merge_stored_fills_only_missing_fields() {
        let mut bundle = KeyBundle {
            database_key: "a".repeat(64),
            xor_key: None,
            aes_key: Some("abcdefghijklmnop".to_string()),
        };
        bundle.merge_stored(KeyBundle {
            database_key: "b".repeat(64),
            xor_key: Some(0x42),
            aes_key: Some("ponmlkjihgfedcba".to_string()),
        });
        assert_eq!(bundle.database_key, "a".repeat(64));
        assert_eq!(bundle.xor_key, Some(0x42));
        assert_eq!(bundle.aes_key.as_deref(), Some("abcdefghijklmnop"));
    }
}
