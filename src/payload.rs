//! Image payloads as self-describing `data:` URIs.
//!
//! Every stage of the pipeline hands images around as an [`ImagePayload`]:
//! the relay produces one, the OCR endpoint consumes one, the overlay step
//! reads one and produces another. A payload is immutable once built.

use std::fmt;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while building or unpacking a payload.
#[derive(Error, Debug)]
pub enum PayloadError {
    #[error("not a data URI")]
    NotDataUri,

    #[error("data URI is not base64 encoded")]
    NotBase64,

    #[error("invalid base64 body: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// Immutable re-encoded image, addressable as a `data:<mime>;base64,<body>` string.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ImagePayload {
    uri: Arc<str>,
}

impl ImagePayload {
    /// Wrap raw bytes with the given MIME type.
    #[must_use]
    pub fn from_bytes(mime: &str, bytes: &[u8]) -> Self {
        let uri = format!("data:{mime};base64,{}", STANDARD.encode(bytes));
        Self { uri: uri.into() }
    }

    /// Wrap PNG-encoded bytes.
    #[must_use]
    pub fn png(bytes: &[u8]) -> Self {
        Self::from_bytes("image/png", bytes)
    }

    /// Wrap bytes whose format is sniffed from their magic number.
    ///
    /// Unknown formats are labelled `application/octet-stream`; the relay
    /// still attempts to decode them.
    #[must_use]
    pub fn sniffed(bytes: &[u8]) -> Self {
        let mime = image::guess_format(bytes)
            .map_or("application/octet-stream", |f| f.to_mime_type());
        Self::from_bytes(mime, bytes)
    }

    /// Validate an existing `data:` URI.
    pub fn parse(uri: impl Into<String>) -> Result<Self, PayloadError> {
        let uri = uri.into();
        let header = uri
            .strip_prefix("data:")
            .and_then(|rest| rest.split_once(','))
            .map(|(header, _)| header)
            .ok_or(PayloadError::NotDataUri)?;
        if !header.ends_with(";base64") {
            return Err(PayloadError::NotBase64);
        }
        Ok(Self { uri: uri.into() })
    }

    /// The full `data:` URI.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.uri
    }

    /// MIME type from the URI header.
    #[must_use]
    pub fn mime(&self) -> &str {
        self.uri
            .strip_prefix("data:")
            .and_then(|rest| rest.split(';').next())
            .unwrap_or_default()
    }

    /// Decode the base64 body back into bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, PayloadError> {
        let (_, body) = self.uri.split_once(',').ok_or(PayloadError::NotDataUri)?;
        Ok(STANDARD.decode(body)?)
    }

    /// Length of the URI string, which is what travels over the wire.
    #[must_use]
    pub fn len(&self) -> usize {
        self.uri.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.to_bytes().map_or(true, |b| b.is_empty())
    }
}

impl TryFrom<String> for ImagePayload {
    type Error = PayloadError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<ImagePayload> for String {
    fn from(payload: ImagePayload) -> Self {
        payload.uri.to_string()
    }
}

impl fmt::Debug for ImagePayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImagePayload")
            .field("mime", &self.mime())
            .field("len", &self.len())
            .finish()
    }
}
