//! Token + optional password verification for both WebSocket planes.

use rand::Rng;

use crate::errors::AuthError;

/// Credentials carried by an `auth` message on either plane.
#[derive(Debug, Default, Clone)]
pub struct Credentials {
    pub token: Option<String>,
    pub password: Option<String>,
}

/// Holds the configured token and optional password. The token is required
/// on every connection; the password is a second factor when configured.
pub struct AuthService {
    token: String,
    password: Option<String>,
}

impl AuthService {
    pub fn new(token: String, password: Option<String>) -> Self {
        Self { token, password }
    }

    pub fn requires_password(&self) -> bool {
        self.password.is_some()
    }

    pub fn verify(&self, credentials: &Credentials) -> Result<(), AuthError> {
        let token_ok = credentials
            .token
            .as_deref()
            .map(|t| constant_time_eq(t.as_bytes(), self.token.as_bytes()))
            .unwrap_or(false);
        if !token_ok {
            return Err(AuthError::InvalidToken);
        }

        if let Some(expected) = &self.password {
            let password_ok = credentials
                .password
                .as_deref()
                .map(|p| constant_time_eq(p.as_bytes(), expected.as_bytes()))
                .unwrap_or(false);
            if !password_ok {
                return Err(AuthError::InvalidPassword);
            }
        }
        Ok(())
    }
}

/// Generate an access token: 16 random bytes, hex-encoded (128 bits,
/// URL-safe).
pub fn generate_token() -> String {
    let bytes: [u8; 16] = rand::thread_rng().gen();
    hex::encode(bytes)
}

/// Generate a client id: 12 random bytes, hex-encoded (96 bits).
pub fn generate_client_id() -> String {
    let bytes: [u8; 12] = rand::thread_rng().gen();
    hex::encode(bytes)
}

/// Length-then-bytes comparison without early exit on the byte scan.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds(token: Option<&str>, password: Option<&str>) -> Credentials {
        Credentials {
            token: token.map(String::from),
            password: password.map(String::from),
        }
    }

    #[test]
    fn test_token_only() {
        let auth = AuthService::new("secret".into(), None);
        assert!(auth.verify(&creds(Some("secret"), None)).is_ok());
        assert_eq!(
            auth.verify(&creds(Some("wrong"), None)),
            Err(AuthError::InvalidToken)
        );
        assert_eq!(auth.verify(&creds(None, None)), Err(AuthError::InvalidToken));
        assert!(!auth.requires_password());
    }

    #[test]
    fn test_password_required() {
        let auth = AuthService::new("secret".into(), Some("correct-horse".into()));
        assert!(auth.requires_password());
        assert_eq!(
            auth.verify(&creds(Some("secret"), Some("wrong"))),
            Err(AuthError::InvalidPassword)
        );
        assert_eq!(
            auth.verify(&creds(Some("secret"), None)),
            Err(AuthError::InvalidPassword)
        );
        assert!(auth
            .verify(&creds(Some("secret"), Some("correct-horse")))
            .is_ok());
    }

    #[test]
    fn test_token_checked_before_password() {
        let auth = AuthService::new("secret".into(), Some("pw".into()));
        assert_eq!(
            auth.verify(&creds(Some("wrong"), Some("pw"))),
            Err(AuthError::InvalidToken)
        );
    }

    #[test]
    fn test_generated_shapes() {
        let token = generate_token();
        assert_eq!(token.len(), 32);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(generate_token(), token);

        let id = generate_client_id();
        assert_eq!(id.len(), 24);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
        assert!(constant_time_eq(b"", b""));
    }
}
