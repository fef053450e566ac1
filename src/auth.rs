//! Session authentication: Basic and Bearer.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

/// Credential attached to every request of a session (or one request,
/// when set on the builder), unless the composed headers already carry an
/// `Authorization` field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Auth {
    /// `Authorization: Basic base64(user:password)`.
    Basic {
        /// User name; must not contain `:`.
        user: String,
        /// Password.
        password: String,
    },
    /// `Authorization: Bearer <token>`.
    Bearer(String),
}

impl Auth {
    /// The serialized `Authorization` header value.
    pub(crate) fn header_value(&self) -> String {
        match self {
            Auth::Basic { user, password } => {
                let encoded = BASE64.encode(format!("{user}:{password}"));
                format!("Basic {encoded}")
            }
            Auth::Bearer(token) => format!("Bearer {token}"),
        }
    }
}

#[cfg(test)]
mod auth_tests {
    use super::*;

    #[test]
    fn header_values() {
        // RFC 7617 example credentials.
        let basic = Auth::Basic {
            user: "Aladdin".into(),
            password: "open sesame".into(),
        };
        assert_eq!(basic.header_value(), "Basic QWxhZGRpbjpvcGVuIHNlc2FtZQ==");

        let bearer = Auth::Bearer("abc.def".into());
        assert_eq!(bearer.header_value(), "Bearer abc.def");
    }
}
