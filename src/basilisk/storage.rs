//! Per-conversation storage roots.
//!
//! A storage root is a small virtual filesystem holding the bytes of local
//! attachments under relative paths (`attachments/<name>`).  New conversations
//! get an in-memory root; opening an archive rematerialises its entries into a
//! fresh root.  Keeping attachment content here means the serialised
//! conversation never refers to absolute host paths.

use std::collections::HashMap;
use std::io::Cursor;
use std::path::Path;
use std::sync::{Arc, Mutex};

use base64::Engine as _;
use sha2::{Digest, Sha256};

use crate::basilisk::attachment::{Attachment, LocationKind};
use crate::basilisk::error::BasiliskError;

/// Directory inside the root (and inside archives) where attachments live.
pub const ATTACHMENTS_DIR: &str = "attachments";

/// Sizing parameters applied to image attachments before they are inlined
/// into a request.
#[derive(Debug, Clone, Copy)]
pub struct ImageRequestOptions {
    pub resize: bool,
    /// Maximum width; 0 means "use only the height bound".
    pub max_width: u32,
    /// Maximum height; 0 means "use only the width bound".
    pub max_height: u32,
    /// JPEG quality for re-encoded images.
    pub quality: u8,
}

impl Default for ImageRequestOptions {
    fn default() -> Self {
        ImageRequestOptions {
            resize: false,
            max_width: 0,
            max_height: 0,
            quality: 85,
        }
    }
}

/// What an attachment resolves to for the wire protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestSource {
    /// Remote URL, passed to the provider verbatim.
    Url(String),
    /// `data:<mime>;base64,<…>` payload ready for inlining.
    DataUrl(String),
}

impl RequestSource {
    pub fn as_str(&self) -> &str {
        match self {
            RequestSource::Url(url) => url,
            RequestSource::DataUrl(data) => data,
        }
    }
}

/// In-memory virtual filesystem for one conversation.
///
/// Cloning shares the underlying map, so the conversation model and the
/// archive codec observe the same content.
#[derive(Debug, Clone)]
pub struct StorageRoot {
    entries: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    url: String,
}

impl StorageRoot {
    /// Fresh empty root with a unique `memory://` URL.
    pub fn memory() -> Self {
        StorageRoot {
            entries: Arc::new(Mutex::new(HashMap::new())),
            url: format!("memory://{}", uuid::Uuid::new_v4()),
        }
    }

    /// Serde default for deserialised conversations; equivalent to
    /// [`StorageRoot::memory`].
    pub fn detached() -> Self {
        Self::memory()
    }

    /// The root's URL, e.g. `memory://6fcb…`.
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn write(&self, relative_path: &str, bytes: Vec<u8>) {
        self.entries
            .lock()
            .expect("storage root lock")
            .insert(relative_path.to_string(), bytes);
    }

    pub fn read(&self, relative_path: &str) -> Option<Vec<u8>> {
        self.entries
            .lock()
            .expect("storage root lock")
            .get(relative_path)
            .cloned()
    }

    pub fn exists(&self, relative_path: &str) -> bool {
        self.entries
            .lock()
            .expect("storage root lock")
            .contains_key(relative_path)
    }

    /// Relative paths of all stored entries, in no particular order.
    pub fn entries(&self) -> Vec<String> {
        self.entries
            .lock()
            .expect("storage root lock")
            .keys()
            .cloned()
            .collect()
    }

    /// Ensure `attachment`'s content lives under this root.
    ///
    /// Local host paths are copied in under a content-hashed name and the
    /// returned attachment's location becomes the relative path.  Relative
    /// locations already present, remote URLs, and `data:` URIs are returned
    /// unchanged.
    pub fn ingest(&self, mut attachment: Attachment) -> Result<Attachment, BasiliskError> {
        if attachment.location_kind() != LocationKind::Local {
            return Ok(attachment);
        }
        let location = attachment.location().to_string();
        if self.exists(&location) {
            return Ok(attachment);
        }
        let bytes = std::fs::read(&location).map_err(|err| {
            BasiliskError::Storage(format!("cannot stage attachment '{}': {}", location, err))
        })?;
        let staged = staged_name(&location, &bytes);
        self.write(&staged, bytes);
        attachment.set_location(staged);
        Ok(attachment)
    }

    /// Bytes behind a local attachment: storage-root entries by relative
    /// path, anything else from the host filesystem.
    pub fn attachment_bytes(&self, attachment: &Attachment) -> Result<Vec<u8>, BasiliskError> {
        let location = attachment.location();
        if let Some(bytes) = self.read(location) {
            return Ok(bytes);
        }
        std::fs::read(location).map_err(|err| {
            BasiliskError::Storage(format!("attachment '{}' not resolvable: {}", location, err))
        })
    }

    /// Resolve an attachment for the wire protocol.
    ///
    /// Remote URLs and `data:` URIs pass through verbatim.  Local content is
    /// read, optionally resized (images only), and encoded as a base64
    /// `data:` URL.
    pub fn resolve_for_request(
        &self,
        attachment: &Attachment,
        options: &ImageRequestOptions,
    ) -> Result<RequestSource, BasiliskError> {
        match attachment.location_kind() {
            LocationKind::Url => Ok(RequestSource::Url(attachment.location().to_string())),
            LocationKind::Data => Ok(RequestSource::DataUrl(attachment.location().to_string())),
            LocationKind::Local => {
                let bytes = self.attachment_bytes(attachment)?;
                let (bytes, mime) = if attachment.is_image()
                    && options.resize
                    && (options.max_width > 0 || options.max_height > 0)
                {
                    let resized =
                        resize_image(&bytes, options.max_width, options.max_height, options.quality)?;
                    (resized, "image/jpeg".to_string())
                } else {
                    let mime = attachment
                        .mime()
                        .map(str::to_string)
                        .or_else(|| infer::get(&bytes).map(|t| t.mime_type().to_string()))
                        .unwrap_or_else(|| "application/octet-stream".to_string());
                    (bytes, mime)
                };
                let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
                Ok(RequestSource::DataUrl(format!(
                    "data:{};base64,{}",
                    mime, encoded
                )))
            }
        }
    }
}

/// Stable staged name: `<stem>-<8 hex of sha256>.<ext>` under
/// [`ATTACHMENTS_DIR`], so identical content maps to one entry and distinct
/// files with the same basename cannot collide.
fn staged_name(location: &str, bytes: &[u8]) -> String {
    let path = Path::new(location);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "attachment".to_string());
    let digest = Sha256::digest(bytes);
    let short = digest
        .iter()
        .take(4)
        .map(|b| format!("{:02x}", b))
        .collect::<String>();
    match path.extension() {
        Some(ext) => format!(
            "{}/{}-{}.{}",
            ATTACHMENTS_DIR,
            stem,
            short,
            ext.to_string_lossy()
        ),
        None => format!("{}/{}-{}", ATTACHMENTS_DIR, stem, short),
    }
}

/// Resize image bytes to fit within the given bounds, preserving aspect
/// ratio, and re-encode as JPEG.
///
/// When both bounds are non-zero the ratio is `min(max_w/w, max_h/h)`;
/// otherwise the single non-zero bound drives the ratio alone.
pub fn resize_image(
    bytes: &[u8],
    max_width: u32,
    max_height: u32,
    quality: u8,
) -> Result<Vec<u8>, BasiliskError> {
    if max_width == 0 && max_height == 0 {
        return Err(BasiliskError::Content(
            "resize requires at least one non-zero bound".to_string(),
        ));
    }
    let img = image::load_from_memory(bytes)
        .map_err(|err| BasiliskError::Content(format!("cannot decode image: {}", err)))?;
    let (width, height) = (img.width(), img.height());
    let ratio = if max_width > 0 && max_height > 0 {
        (max_width as f64 / width as f64).min(max_height as f64 / height as f64)
    } else if max_width > 0 {
        max_width as f64 / width as f64
    } else {
        max_height as f64 / height as f64
    };
    let new_width = ((width as f64 * ratio) as u32).max(1);
    let new_height = ((height as f64 * ratio) as u32).max(1);
    let resized = img.resize_exact(new_width, new_height, image::imageops::FilterType::Lanczos3);

    let mut buffer = Cursor::new(Vec::new());
    let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut buffer, quality);
    resized
        .to_rgb8()
        .write_with_encoder(encoder)
        .map_err(|err| BasiliskError::Content(format!("cannot encode image: {}", err)))?;
    Ok(buffer.into_inner())
}
