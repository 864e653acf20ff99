//! Random credential generation.
//!
//! Credentials are drawn from OS entropy, so prior outputs reveal nothing
//! about future ones. Only plain alphanumeric characters are used: special
//! characters (`$`, `!`, ...) in passwords break the `chpasswd` pipe and the
//! SSH login, and the SSH stack only accepts lower-case alphabetic usernames.

use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::SessionError;

/// Valid characters for generated usernames.
pub const USERNAME_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz";

/// Valid characters for generated passwords.
pub const PASSWORD_CHARSET: &[u8] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Length of both generated usernames and passwords.
pub const CREDENTIAL_LEN: usize = 15;

/// Return a random string of `length` characters drawn uniformly from
/// `charset`.
///
/// Random bytes above the largest multiple of the charset size are rejected
/// and redrawn, so every character is equally likely. Fails only if the OS
/// entropy source does, which aborts session creation at the call site.
pub fn random_string(length: usize, charset: &[u8]) -> Result<String, SessionError> {
    debug_assert!(!charset.is_empty() && charset.len() <= 256);

    let mut out = String::with_capacity(length);
    // Largest byte count evenly divisible by the charset size; bytes at or
    // above it would bias the low end of the charset.
    let limit = 256 - (256 % charset.len());
    let mut buf = [0u8; 64];

    while out.len() < length {
        OsRng
            .try_fill_bytes(&mut buf)
            .map_err(|e| SessionError::Credentials {
                reason: e.to_string(),
            })?;
        for &byte in buf.iter() {
            if (byte as usize) < limit {
                out.push(charset[byte as usize % charset.len()] as char);
                if out.len() == length {
                    break;
                }
            }
        }
    }

    Ok(out)
}

/// Return a random username of [`CREDENTIAL_LEN`] lower-case characters.
pub fn random_username() -> Result<String, SessionError> {
    random_string(CREDENTIAL_LEN, USERNAME_CHARSET)
}

/// Return a random alphanumeric password of [`CREDENTIAL_LEN`] characters.
pub fn random_password() -> Result<String, SessionError> {
    random_string(CREDENTIAL_LEN, PASSWORD_CHARSET)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_username_charset_and_length() {
        let username = random_username().unwrap();
        assert_eq!(username.len(), CREDENTIAL_LEN);
        assert!(username.chars().all(|c| c.is_ascii_lowercase()));
    }

    #[test]
    fn test_password_charset_and_length() {
        let password = random_password().unwrap();
        assert_eq!(password.len(), CREDENTIAL_LEN);
        assert!(password.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_random_strings_differ() {
        // Two draws colliding would mean 15 characters of entropy repeated.
        let a = random_password().unwrap();
        let b = random_password().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_every_charset_character_reachable() {
        // With 2000 draws of 15 characters, each of the 26 username
        // characters is overwhelmingly likely to appear at least once.
        let mut seen = std::collections::HashSet::new();
        for _ in 0..2000 {
            for c in random_username().unwrap().chars() {
                seen.insert(c);
            }
        }
        assert_eq!(seen.len(), USERNAME_CHARSET.len());
    }
}
