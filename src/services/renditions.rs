//! Derived raster renditions (thumbnail, preview) of an uploaded image.
//!
//! The generator only writes files next to the source and describes them;
//! uploading is the resource manager's job.

use image::imageops::FilterType;
use std::{
    io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tokio::task;

/// Mime types renditions can be generated for.
pub const SUPPORTED_IMAGE_TYPES: [&str; 3] = ["image/bmp", "image/jpeg", "image/png"];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenditionKind {
    pub label: &'static str,
    /// Target size of the long edge in pixels.
    pub long_edge: u32,
}

pub const THUMBNAIL: RenditionKind = RenditionKind {
    label: "Thumbnail",
    long_edge: 200,
};

pub const PREVIEW: RenditionKind = RenditionKind {
    label: "Preview",
    long_edge: 640,
};

#[derive(Debug, Error)]
pub enum RenditionError {
    #[error("source `{0}` has no file name")]
    InvalidSource(PathBuf),
    #[error("source image has zero width or height")]
    EmptyImage,
    #[error(transparent)]
    Image(#[from] image::ImageError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("rendition task failed: {0}")]
    Join(#[from] task::JoinError),
}

/// Metadata for one generated rendition file.
#[derive(Clone, Debug)]
pub struct Rendition {
    /// e.g. `1:Thumbnail`
    pub version_identifier: String,
    pub file_name: String,
    pub path: PathBuf,
    pub mime_type: Option<String>,
    pub size_kb: f64,
}

pub fn is_supported_image_type(mime_type: Option<&str>) -> bool {
    mime_type.is_some_and(|m| SUPPORTED_IMAGE_TYPES.contains(&m))
}

/// Aspect-preserving target size for a long edge of `long_edge` pixels.
///
/// Portrait sources (ratio < 1.0) hold the height at the target, everything
/// else holds the width. The short edge never drops below one pixel.
pub fn target_dimensions(width: u32, height: u32, long_edge: u32) -> (u32, u32) {
    let ratio = f64::from(width) / f64::from(height);
    let edge = f64::from(long_edge);
    if ratio < 1.0 {
        (((edge * ratio).round() as u32).max(1), long_edge)
    } else {
        (long_edge, ((edge / ratio).round() as u32).max(1))
    }
}

/// `<stem>_<label>.<ext>` beside the source.
fn rendition_path(source: &Path, label: &str) -> Result<PathBuf, RenditionError> {
    let stem = source
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| RenditionError::InvalidSource(source.to_path_buf()))?;
    let name = match source.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{}_{}.{}", stem, label.to_lowercase(), ext),
        None => format!("{}_{}", stem, label.to_lowercase()),
    };
    Ok(source.with_file_name(name))
}

#[derive(Clone, Debug)]
pub struct RenditionGenerator {
    kinds: Vec<RenditionKind>,
}

impl Default for RenditionGenerator {
    fn default() -> Self {
        Self {
            kinds: vec![THUMBNAIL, PREVIEW],
        }
    }
}

impl RenditionGenerator {
    /// Produce every configured rendition of `source` for base version
    /// `base_version` (identifiers become `<base_version>:<label>`).
    pub async fn generate(
        &self,
        source: &Path,
        base_version: &str,
    ) -> Result<Vec<Rendition>, RenditionError> {
        let source = source.to_path_buf();
        let kinds = self.kinds.clone();
        let base_version = base_version.to_string();

        let renditions =
            task::spawn_blocking(move || render_all(&source, &kinds, &base_version)).await??;

        tracing::debug!("generated {} renditions", renditions.len());
        Ok(renditions)
    }
}

fn render_all(
    source: &Path,
    kinds: &[RenditionKind],
    base_version: &str,
) -> Result<Vec<Rendition>, RenditionError> {
    let img = image::open(source)?;
    let (width, height) = (img.width(), img.height());
    if width == 0 || height == 0 {
        return Err(RenditionError::EmptyImage);
    }

    let mut out: Vec<Rendition> = Vec::with_capacity(kinds.len());
    for kind in kinds {
        let (w, h) = target_dimensions(width, height, kind.long_edge);
        let path = rendition_path(source, kind.label)?;
        let resized = img.resize_exact(w, h, FilterType::Triangle);
        if let Err(err) = resized.save(&path) {
            for written in &out {
                let _ = std::fs::remove_file(&written.path);
            }
            return Err(err.into());
        }

        let size = std::fs::metadata(&path)?.len();
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .ok_or_else(|| RenditionError::InvalidSource(path.clone()))?;
        out.push(Rendition {
            version_identifier: format!("{}:{}", base_version, kind.label),
            file_name,
            mime_type: mime_guess::from_path(&path)
                .first()
                .map(|m| m.essence_str().to_string()),
            path,
            size_kb: size as f64 / 1024.0,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};

    #[test]
    fn landscape_holds_width() {
        assert_eq!(target_dimensions(1200, 800, 200), (200, 133));
        assert_eq!(target_dimensions(1200, 800, 640), (640, 427));
    }

    #[test]
    fn portrait_holds_height() {
        assert_eq!(target_dimensions(800, 1200, 200), (133, 200));
        assert_eq!(target_dimensions(800, 1200, 640), (427, 640));
    }

    #[test]
    fn square_and_extreme_ratios() {
        assert_eq!(target_dimensions(500, 500, 200), (200, 200));
        assert_eq!(target_dimensions(10_000, 1, 200), (200, 1));
        assert_eq!(target_dimensions(1, 10_000, 200), (1, 200));
    }

    #[test]
    fn rendition_names_embed_label() {
        let path = rendition_path(Path::new("/tmp/up/scan.png"), "Thumbnail").unwrap();
        assert_eq!(path, PathBuf::from("/tmp/up/scan_thumbnail.png"));
    }

    #[test]
    fn supported_types() {
        assert!(is_supported_image_type(Some("image/png")));
        assert!(is_supported_image_type(Some("image/jpeg")));
        assert!(!is_supported_image_type(Some("image/gif")));
        assert!(!is_supported_image_type(None));
    }

    #[tokio::test]
    async fn generates_thumbnail_and_preview() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("photo.png");
        ImageBuffer::from_pixel(1200, 800, Rgb([10u8, 120, 200]))
            .save(&source)
            .unwrap();

        let renditions = RenditionGenerator::default()
            .generate(&source, "1")
            .await
            .unwrap();

        assert_eq!(renditions.len(), 2);
        let thumb = &renditions[0];
        assert_eq!(thumb.version_identifier, "1:Thumbnail");
        assert_eq!(thumb.file_name, "photo_thumbnail.png");
        assert_eq!(thumb.mime_type.as_deref(), Some("image/png"));
        assert_eq!(image::image_dimensions(&thumb.path).unwrap(), (200, 133));

        let preview = &renditions[1];
        assert_eq!(preview.version_identifier, "1:Preview");
        assert_eq!(image::image_dimensions(&preview.path).unwrap(), (640, 427));
        assert!(preview.size_kb > 0.0);
    }

    #[tokio::test]
    async fn non_image_source_fails() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("notes.png");
        std::fs::write(&source, b"definitely not a png").unwrap();

        let err = RenditionGenerator::default()
            .generate(&source, "1")
            .await
            .unwrap_err();
        assert!(matches!(err, RenditionError::Image(_)));
    }
}
