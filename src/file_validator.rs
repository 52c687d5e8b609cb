//! Upload validation: size, declared media type and magic-byte sniffing

use image::ImageFormat;
use std::error::Error;
use std::fmt;
use tracing::debug;

/// Default upload limit (10 MiB)
pub const DEFAULT_MAX_FILE_SIZE: usize = 10 * 1024 * 1024;

/// Image kinds accepted for upload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Jpeg,
    Png,
}

impl ImageKind {
    /// Map a declared content type onto an accepted kind.
    ///
    /// Parameters after `;` are ignored and the comparison is case-insensitive.
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();

        match essence.as_str() {
            "image/jpeg" | "image/jpg" => Some(ImageKind::Jpeg),
            "image/png" => Some(ImageKind::Png),
            _ => None,
        }
    }

    fn from_format(format: ImageFormat) -> Option<Self> {
        match format {
            ImageFormat::Jpeg => Some(ImageKind::Jpeg),
            ImageFormat::Png => Some(ImageKind::Png),
            _ => None,
        }
    }

    pub fn image_format(self) -> ImageFormat {
        match self {
            ImageKind::Jpeg => ImageFormat::Jpeg,
            ImageKind::Png => ImageFormat::Png,
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            ImageKind::Jpeg => "image/jpeg",
            ImageKind::Png => "image/png",
        }
    }
}

impl fmt::Display for ImageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageKind::Jpeg => write!(f, "jpeg"),
            ImageKind::Png => write!(f, "png"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    TooLarge { size: usize, limit: usize },
    UnsupportedMediaType(String),
    InvalidImage(String),
    FormatMismatch { declared: ImageKind, detected: ImageKind },
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::TooLarge { size, limit } => {
                write!(f, "File too large: {size} bytes exceeds {limit} bytes")
            }
            ValidationError::UnsupportedMediaType(declared) => {
                write!(f, "Unsupported media type: {declared}")
            }
            ValidationError::InvalidImage(msg) => write!(f, "Invalid image: {msg}"),
            ValidationError::FormatMismatch { declared, detected } => {
                write!(f, "Format mismatch: declared {declared}, detected {detected}")
            }
        }
    }
}

impl Error for ValidationError {}

/// Checks raw upload bytes before anything touches the disk
#[derive(Debug, Clone)]
pub struct FileValidator {
    max_file_size: usize,
}

impl FileValidator {
    pub fn new(max_file_size: usize) -> Self {
        Self { max_file_size }
    }

    pub fn max_file_size(&self) -> usize {
        self.max_file_size
    }

    /// Reject a payload purely on its length
    pub fn check_size(&self, size: usize) -> Result<(), ValidationError> {
        if size > self.max_file_size {
            return Err(ValidationError::TooLarge {
                size,
                limit: self.max_file_size,
            });
        }
        Ok(())
    }

    /// Validate an upload and return the sniffed image kind.
    ///
    /// Checks run in order and stop at the first failure: size, declared type,
    /// magic bytes, declared/sniffed consistency, then a header parse.
    pub fn validate(
        &self,
        bytes: &[u8],
        declared_content_type: &str,
    ) -> Result<ImageKind, ValidationError> {
        self.check_size(bytes.len())?;

        let declared = ImageKind::from_content_type(declared_content_type).ok_or_else(|| {
            ValidationError::UnsupportedMediaType(declared_content_type.to_string())
        })?;

        let detected = image::guess_format(bytes)
            .ok()
            .and_then(ImageKind::from_format)
            .ok_or_else(|| {
                ValidationError::InvalidImage("content is not a JPEG or PNG image".to_string())
            })?;

        if detected != declared {
            return Err(ValidationError::FormatMismatch { declared, detected });
        }

        // Magic bytes alone are not enough, a truncated header is still unusable
        match imagesize::blob_size(bytes) {
            Ok(size) if size.width > 0 && size.height > 0 => {
                debug!(
                    "Validated {} upload: {}x{}, {} bytes",
                    detected,
                    size.width,
                    size.height,
                    bytes.len()
                );
                Ok(detected)
            }
            Ok(size) => Err(ValidationError::InvalidImage(format!(
                "image has empty dimensions {}x{}",
                size.width, size.height
            ))),
            Err(e) => Err(ValidationError::InvalidImage(format!(
                "unreadable image header: {e:?}"
            ))),
        }
    }
}

impl Default for FileValidator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FILE_SIZE)
    }
}
