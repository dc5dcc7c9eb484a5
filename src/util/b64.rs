//! Standard (padded) base64 over borrowed or owned bytes.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as b64;
use once_cell::sync::Lazy;
use regex::Regex;
use std::borrow::Cow;
use std::fmt::Display;

static STANDARD_ALPHABET: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9+/]*={0,2}$").expect("base64 alphabet pattern is valid")
});

/// Base64 text, kept as bytes so headers can be inspected without copying.
///
/// ```rust
/// use x402_gasless::util::Base64Bytes;
///
/// let encoded = Base64Bytes::encode(br#"{"a":1}"#);
/// assert_eq!(encoded.to_string(), "eyJhIjoxfQ==");
/// assert_eq!(encoded.decode().unwrap(), br#"{"a":1}"#);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Base64Bytes<'a>(pub Cow<'a, [u8]>);

impl Base64Bytes<'_> {
    /// Decodes to raw bytes.
    pub fn decode(&self) -> Result<Vec<u8>, base64::DecodeError> {
        b64.decode(&self.0)
    }

    pub fn encode<T: AsRef<[u8]>>(input: T) -> Base64Bytes<'static> {
        let encoded = b64.encode(input.as_ref());
        Base64Bytes(Cow::Owned(encoded.into_bytes()))
    }

    /// Cheap shape check: standard alphabet, at most two trailing `=`,
    /// length a multiple of four. Never fails.
    pub fn is_well_formed(&self) -> bool {
        let Ok(text) = std::str::from_utf8(&self.0) else {
            return false;
        };
        text.len() % 4 == 0 && STANDARD_ALPHABET.is_match(text)
    }
}

impl AsRef<[u8]> for Base64Bytes<'_> {
    fn as_ref(&self) -> &[u8] {
        self.0.as_ref()
    }
}

impl<'a> From<&'a [u8]> for Base64Bytes<'a> {
    fn from(slice: &'a [u8]) -> Self {
        Base64Bytes(Cow::Borrowed(slice))
    }
}

impl<'a> From<&'a str> for Base64Bytes<'a> {
    fn from(text: &'a str) -> Self {
        Base64Bytes(Cow::Borrowed(text.as_bytes()))
    }
}

impl Display for Base64Bytes<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(self.0.as_ref()))
    }
}
