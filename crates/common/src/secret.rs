//! Secret types for connection strings and credentials.
//!
//! Re-exports [`secrecy`] types. `SecretString` redacts itself in `Debug`,
//! so configuration structs that hold a `DATABASE_URL` or `REDIS_URL`
//! (which may embed passwords) can derive `Debug` safely.
//!
//! ```rust
//! use common::secret::{ExposeSecret, SecretString};
//!
//! #[derive(Debug)]
//! struct Backend {
//!     name: String,
//!     url: SecretString,
//! }
//!
//! let backend = Backend {
//!     name: "chat".to_string(),
//!     url: SecretString::from("postgres://user:pw@db/chat"),
//! };
//!
//! assert!(!format!("{backend:?}").contains("pw@db"));
//! assert_eq!(backend.url.expose_secret(), "postgres://user:pw@db/chat");
//! ```

pub use secrecy::{ExposeSecret, SecretBox, SecretString};

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn test_debug_is_redacted() {
        let secret = SecretString::from("redis://:hunter2@cache:6379");
        let debug_str = format!("{secret:?}");

        assert!(debug_str.contains("REDACTED"));
        assert!(!debug_str.contains("hunter2"));
    }

    #[test]
    fn test_expose_secret_returns_inner_value() {
        let secret = SecretString::from("postgres://localhost/chat");
        assert_eq!(secret.expose_secret(), "postgres://localhost/chat");
    }

    #[test]
    fn test_deserialize_keeps_value_hidden() {
        #[allow(dead_code)]
        #[derive(Debug, Deserialize)]
        struct Backend {
            kind: String,
            url: SecretString,
        }

        let json = r#"{"kind": "postgres", "url": "postgres://u:topsecret@db/chat"}"#;
        let backend: Backend = serde_json::from_str(json).expect("deserialize");

        assert_eq!(
            backend.url.expose_secret(),
            "postgres://u:topsecret@db/chat"
        );
        let debug = format!("{backend:?}");
        assert!(!debug.contains("topsecret"));
        assert!(debug.contains("REDACTED"));
    }
}
