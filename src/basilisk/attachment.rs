//! Attachment types and classification.
//!
//! An attachment references content by *location*: a local path, a remote
//! `http(s)` URL, or an inline `data:` URI.  Local content is staged into the
//! conversation's storage root on first add (see
//! [`storage`](crate::basilisk::storage)); URL and `data:` locations pass
//! through verbatim.

use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::basilisk::error::BasiliskError;

lazy_static::lazy_static! {
    /// Routes a pasted string: group 1 matches remote URLs, group 2 inline
    /// `data:` URIs.  Anything else is treated as a local path.
    pub static ref URL_PATTERN: Regex =
        Regex::new(r"^(https?://[^\s]+)|(data:[a-z]+/\S+)$").expect("valid URL pattern");
}

/// Where an attachment's bytes live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationKind {
    /// Path on the host filesystem or relative path inside a storage root.
    Local,
    /// Remote `http(s)` URL, passed to providers verbatim.
    Url,
    /// Inline `data:` URI, passed to providers verbatim.
    Data,
}

/// Classify a location string without touching the filesystem.
pub fn location_kind(location: &str) -> LocationKind {
    if location.starts_with("data:") {
        LocationKind::Data
    } else if URL_PATTERN.is_match(location) {
        LocationKind::Url
    } else {
        LocationKind::Local
    }
}

/// Render a byte count the way the attachment list displays it.
pub fn display_size(size: u64) -> String {
    if size < 1024 {
        format!("{} B", size)
    } else if size < 1024 * 1024 {
        format!("{:.2} KB", size as f64 / 1024.0)
    } else {
        format!("{:.2} MB", size as f64 / 1024.0 / 1024.0)
    }
}

/// An image attachment, eligible for inlining as a `data:` URL on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageAttachment {
    pub location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<(u32, u32)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A non-image file attachment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileAttachment {
    pub location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    pub name: String,
}

/// Attachment sum type, tagged with `kind` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Attachment {
    Image(ImageAttachment),
    File(FileAttachment),
}

impl Attachment {
    pub fn location(&self) -> &str {
        match self {
            Attachment::Image(image) => &image.location,
            Attachment::File(file) => &file.location,
        }
    }

    pub fn set_location(&mut self, location: String) {
        match self {
            Attachment::Image(image) => image.location = location,
            Attachment::File(file) => file.location = location,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Attachment::Image(image) => &image.name,
            Attachment::File(file) => &file.name,
        }
    }

    pub fn mime(&self) -> Option<&str> {
        match self {
            Attachment::Image(image) => image.mime.as_deref(),
            Attachment::File(file) => file.mime.as_deref(),
        }
    }

    pub fn size(&self) -> Option<u64> {
        match self {
            Attachment::Image(image) => image.size,
            Attachment::File(file) => file.size,
        }
    }

    pub fn is_image(&self) -> bool {
        matches!(self, Attachment::Image(_))
    }

    pub fn location_kind(&self) -> LocationKind {
        location_kind(self.location())
    }
}

fn file_name_of(location: &str) -> String {
    match location_kind(location) {
        LocationKind::Local => Path::new(location)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| location.to_string()),
        LocationKind::Url => location
            .rsplit('/')
            .next()
            .filter(|segment| !segment.is_empty())
            .unwrap_or("remote")
            .to_string(),
        LocationKind::Data => "inline".to_string(),
    }
}

fn image_extension(location: &str) -> bool {
    let lower = location.to_ascii_lowercase();
    [".png", ".jpg", ".jpeg", ".gif", ".webp", ".bmp"]
        .iter()
        .any(|ext| lower.ends_with(ext))
}

/// Sniff a location into an [`Attachment`].
///
/// Local paths are read to determine MIME type, byte size, and (for images)
/// pixel dimensions.  Remote URLs are routed by extension; `data:` URIs by
/// their embedded MIME type.  Neither is fetched.
pub fn classify(location: &str) -> Result<Attachment, BasiliskError> {
    match location_kind(location) {
        LocationKind::Data => {
            let mime = location
                .strip_prefix("data:")
                .and_then(|rest| rest.split(&[';', ','][..]).next())
                .map(str::to_string);
            let is_image = mime.as_deref().is_some_and(|m| m.starts_with("image/"));
            if is_image {
                Ok(Attachment::Image(ImageAttachment {
                    location: location.to_string(),
                    dimensions: None,
                    mime,
                    size: None,
                    name: file_name_of(location),
                    description: None,
                }))
            } else {
                Ok(Attachment::File(FileAttachment {
                    location: location.to_string(),
                    mime,
                    size: None,
                    name: file_name_of(location),
                }))
            }
        }
        LocationKind::Url => {
            if image_extension(location) {
                Ok(Attachment::Image(ImageAttachment {
                    location: location.to_string(),
                    dimensions: None,
                    mime: None,
                    size: None,
                    name: file_name_of(location),
                    description: None,
                }))
            } else {
                Ok(Attachment::File(FileAttachment {
                    location: location.to_string(),
                    mime: None,
                    size: None,
                    name: file_name_of(location),
                }))
            }
        }
        LocationKind::Local => {
            let bytes = std::fs::read(location).map_err(|err| {
                BasiliskError::Storage(format!("cannot read attachment '{}': {}", location, err))
            })?;
            classify_bytes(location, &bytes)
        }
    }
}

/// Classify already-loaded bytes (used for storage-root content, where the
/// location is a relative path rather than a host path).
pub fn classify_bytes(location: &str, bytes: &[u8]) -> Result<Attachment, BasiliskError> {
    let mime = infer::get(bytes).map(|t| t.mime_type().to_string());
    let size = bytes.len() as u64;
    let is_image = mime.as_deref().is_some_and(|m| m.starts_with("image/"));
    if is_image {
        let dimensions = image::load_from_memory(bytes)
            .ok()
            .map(|img| (img.width(), img.height()));
        Ok(Attachment::Image(ImageAttachment {
            location: location.to_string(),
            dimensions,
            mime,
            size: Some(size),
            name: file_name_of(location),
            description: None,
        }))
    } else {
        Ok(Attachment::File(FileAttachment {
            location: location.to_string(),
            mime,
            size: Some(size),
            name: file_name_of(location),
        }))
    }
}
