//! The closed set of content types a [`Response`](super::Response) can be
//! negotiated into.

use std::fmt;

/// A response content type. Determines both the `Content-Type` header and
/// which body representations are acceptable at write time.
///
/// # Examples
///
/// ```
/// use courier::http::ContentType;
///
/// assert_eq!(ContentType::Json.mime(), "application/json");
/// assert!(ContentType::Csv.is_textual());
/// assert!(!ContentType::Png.is_textual());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentType {
    Json,
    Text,
    Html,
    OctetStream,
    Pdf,
    Csv,
    Png,
    Jpeg,
    Bmp,
}

impl ContentType {
    /// Returns the MIME type written to the `Content-Type` header.
    pub fn mime(self) -> &'static str {
        match self {
            Self::Json => "application/json",
            Self::Text => "text/plain",
            Self::Html => "text/html",
            Self::OctetStream => "application/octet-stream",
            Self::Pdf => "application/pdf",
            Self::Csv => "text/csv",
            Self::Png => "image/png",
            Self::Jpeg => "image/jpeg",
            Self::Bmp => "image/bmp",
        }
    }

    /// Returns `true` for types whose fixed bodies must be valid UTF-8 text.
    pub fn is_textual(self) -> bool {
        matches!(self, Self::Text | Self::Html | Self::Csv)
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mime())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_is_structured_not_textual() {
        assert!(!ContentType::Json.is_textual());
        assert_eq!(ContentType::Json.to_string(), "application/json");
    }

    #[test]
    fn image_mimes() {
        assert_eq!(ContentType::Png.mime(), "image/png");
        assert_eq!(ContentType::Jpeg.mime(), "image/jpeg");
        assert_eq!(ContentType::Bmp.mime(), "image/bmp");
    }
}
