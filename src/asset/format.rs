//! Image format detection.
//!
//! Magic bytes win over the declared `Content-Type` when the two disagree;
//! the URL extension is the last resort.

use std::fmt;

use tracing::debug;
use url::Url;

/// Image formats the pipeline handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    /// Portable Network Graphics.
    Png,
    /// JPEG / JFIF.
    Jpeg,
    /// Graphics Interchange Format.
    Gif,
    /// WebP (RIFF container).
    Webp,
    /// Scalable Vector Graphics.
    Svg,
}

const PNG_SIGNATURE: &[u8] = b"\x89PNG\r\n\x1a\n";

/// How far into the file optimizer markers are searched for.
const MARKER_SCAN_LIMIT: usize = 64 * 1024;

/// Byte strings left behind by common image optimizers (tEXt chunks, JPEG
/// comments, XMP creator tool).
const OPTIMIZER_MARKERS: &[&[u8]] = &[
    b"pngquant",
    b"OptiPNG",
    b"optipng",
    b"ImageOptim",
    b"TinyPNG",
    b"tinypng",
    b"mozjpeg",
    b"MozJPEG",
    b"jpegoptim",
    b"Squoosh",
    b"zopflipng",
];

impl ImageFormat {
    /// File extension used when persisting the asset.
    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "jpg",
            Self::Gif => "gif",
            Self::Webp => "webp",
            Self::Svg => "svg",
        }
    }

    /// Canonical MIME type.
    #[must_use]
    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Png => "image/png",
            Self::Jpeg => "image/jpeg",
            Self::Gif => "image/gif",
            Self::Webp => "image/webp",
            Self::Svg => "image/svg+xml",
        }
    }

    /// Whether the format goes through resize and compression.
    #[must_use]
    pub fn is_resizable(self) -> bool {
        matches!(self, Self::Png | Self::Jpeg | Self::Webp)
    }

    /// Identifies the format from leading bytes.
    #[must_use]
    pub fn from_magic(bytes: &[u8]) -> Option<Self> {
        if bytes.starts_with(PNG_SIGNATURE) {
            return Some(Self::Png);
        }
        if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
            return Some(Self::Jpeg);
        }
        if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
            return Some(Self::Gif);
        }
        if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
            return Some(Self::Webp);
        }
        if looks_like_svg(bytes) {
            return Some(Self::Svg);
        }
        None
    }

    /// Maps a MIME type (parameters already stripped) to a format.
    #[must_use]
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        match content_type.trim().to_ascii_lowercase().as_str() {
            "image/png" | "image/x-png" => Some(Self::Png),
            "image/jpeg" | "image/jpg" | "image/pjpeg" => Some(Self::Jpeg),
            "image/gif" => Some(Self::Gif),
            "image/webp" => Some(Self::Webp),
            "image/svg+xml" | "image/svg" => Some(Self::Svg),
            _ => None,
        }
    }

    /// Maps a file extension (without dot) to a format.
    #[must_use]
    pub fn from_extension(extension: &str) -> Option<Self> {
        match extension.to_ascii_lowercase().as_str() {
            "png" => Some(Self::Png),
            "jpg" | "jpeg" | "jpe" => Some(Self::Jpeg),
            "gif" => Some(Self::Gif),
            "webp" => Some(Self::Webp),
            "svg" => Some(Self::Svg),
            _ => None,
        }
    }

    /// Guesses the format from the URL path's extension.
    #[must_use]
    pub fn from_url(url: &str) -> Option<Self> {
        let parsed = Url::parse(url).ok()?;
        let last_segment = parsed.path_segments()?.next_back()?;
        let (_, extension) = last_segment.rsplit_once('.')?;
        Self::from_extension(extension)
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Detects the format of fetched bytes.
///
/// Priority: magic bytes, then declared content type, then URL extension.
#[must_use]
pub fn detect_format(bytes: &[u8], content_type: Option<&str>, url: &str) -> Option<ImageFormat> {
    let magic = ImageFormat::from_magic(bytes);
    let declared = content_type.and_then(ImageFormat::from_content_type);

    match (magic, declared) {
        (Some(magic), Some(declared)) if magic != declared => {
            debug!(%magic, %declared, url, "content type disagrees with magic bytes");
            Some(magic)
        }
        (Some(magic), _) => Some(magic),
        (None, Some(declared)) => Some(declared),
        (None, None) => ImageFormat::from_url(url),
    }
}

/// Returns the bit depth from a PNG's IHDR chunk.
#[must_use]
pub fn png_bit_depth(bytes: &[u8]) -> Option<u8> {
    // signature (8) + chunk length (4) + "IHDR" (4) + width (4) + height (4)
    if bytes.len() < 25 || !bytes.starts_with(PNG_SIGNATURE) || &bytes[12..16] != b"IHDR" {
        return None;
    }
    Some(bytes[24])
}

/// Returns true if the leading bytes carry a known optimizer signature.
#[must_use]
pub fn has_optimizer_marker(bytes: &[u8]) -> bool {
    let window = &bytes[..bytes.len().min(MARKER_SCAN_LIMIT)];
    OPTIMIZER_MARKERS
        .iter()
        .any(|marker| window.windows(marker.len()).any(|w| w == *marker))
}

fn looks_like_svg(bytes: &[u8]) -> bool {
    let head = &bytes[..bytes.len().min(1024)];
    let Ok(text) = std::str::from_utf8(head) else {
        // A multi-byte char may be cut at the window edge.
        return std::str::from_utf8(&head[..head.len().saturating_sub(3)])
            .is_ok_and(is_svg_prefix);
    };
    is_svg_prefix(text)
}

fn is_svg_prefix(text: &str) -> bool {
    let trimmed = text.trim_start_matches('\u{feff}').trim_start();
    (trimmed.starts_with("<svg") || trimmed.starts_with("<?xml") || trimmed.starts_with("<!--"))
        && trimmed.contains("<svg")
}
