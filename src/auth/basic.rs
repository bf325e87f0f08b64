//! Basic proxy authentication (`Proxy-Authorization: Basic <base64>`).

use base64::{engine::general_purpose, Engine as _};

use super::AuthValidator;

/// Accepts one username/password pair.
#[derive(Debug, Clone)]
pub struct BasicAuthValidator {
    username: String,
    password: String,
}

impl BasicAuthValidator {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// The header value a client would send for these credentials.
    pub fn header_value(&self) -> String {
        encode_basic(&self.username, &self.password)
    }
}

impl AuthValidator for BasicAuthValidator {
    fn validate(&self, credentials: Option<&str>) -> bool {
        match credentials.and_then(decode_basic) {
            Some((user, pass)) => user == self.username && pass == self.password,
            None => false,
        }
    }
}

/// Build a `Basic` credential header value.
pub fn encode_basic(username: &str, password: &str) -> String {
    format!(
        "Basic {}",
        general_purpose::STANDARD.encode(format!("{}:{}", username, password))
    )
}

/// Decode a `Basic` credential header value into `(username, password)`.
pub fn decode_basic(value: &str) -> Option<(String, String)> {
    let (scheme, encoded) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = general_purpose::STANDARD.decode(encoded.trim()).ok()?;
    let credentials = String::from_utf8(decoded).ok()?;
    let (user, pass) = credentials.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}
