use std::fmt;

use http::HeaderValue;
use http::header::InvalidHeaderValue;
use serde::Deserialize;
use zeroize::Zeroize;

/// A password or token that must not show up in logs.
///
/// The value is hidden from `Debug` and wiped from memory on drop.
#[derive(Clone, Deserialize)]
#[serde(from = "String")]
pub struct Credential(String);

impl Credential {
    /// Wrap a secret value.
    pub fn new(value: impl Into<String>) -> Self {
        Credential(value.into())
    }

    /// The secret value.
    pub fn revealed(&self) -> &str {
        &self.0
    }

    /// Whether the value is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// An `Authorization: Bearer` header carrying this value.
    pub fn bearer(&self) -> Result<HeaderValue, InvalidHeaderValue> {
        let mut header = HeaderValue::try_from(format!("Bearer {}", self.revealed()))?;
        header.set_sensitive(true);
        Ok(header)
    }
}

impl From<String> for Credential {
    fn from(value: String) -> Self {
        Credential(value)
    }
}

impl Drop for Credential {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(****)")
    }
}

/// An `Authorization: Basic` header for `username` and `password`.
pub(crate) fn basic_auth(username: &str, password: &Credential) -> HeaderValue {
    use base64::prelude::BASE64_STANDARD;
    use base64::write::EncoderWriter;
    use std::io::Write;

    let mut buf = b"Basic ".to_vec();
    {
        let mut encoder = EncoderWriter::new(&mut buf, &BASE64_STANDARD);
        let _ = write!(encoder, "{}:{}", username, password.revealed());
    }

    // Base64 output and the "Basic " prefix are always valid header bytes.
    let mut header = HeaderValue::from_bytes(&buf).unwrap_or_else(|_| HeaderValue::from_static(""));
    header.set_sensitive(true);
    buf.zeroize();
    header
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_is_redacted() {
        let credential = Credential::new("hunter2");
        assert_eq!(format!("{credential:?}"), "Credential(****)");
        assert_eq!(credential.revealed(), "hunter2");
    }

    #[test]
    fn bearer_header() {
        let header = Credential::new("abc").bearer().unwrap();
        assert_eq!(header.to_str().unwrap(), "Bearer abc");
        assert!(header.is_sensitive());
    }

    #[test]
    fn basic_header() {
        let header = basic_auth("username", &Credential::new("password"));
        assert_eq!(header.to_str().unwrap(), "Basic dXNlcm5hbWU6cGFzc3dvcmQ=");
        assert!(header.is_sensitive());
    }
}
