use image::RgbImage;
use std::path::{Path, PathBuf};
use thermsync_core::PreviewSink;

pub const PREVIEW_FILE: &str = "preview.png";

/// Rewrites a PNG on every display tick. Readers see either the previous
/// or the new image, never a partial one.
pub struct FilePreview {
    path: PathBuf,
    staging: PathBuf,
}

impl FilePreview {
    pub fn new(session_dir: &Path) -> Self {
        Self {
            path: session_dir.join(PREVIEW_FILE),
            staging: session_dir.join(".preview.tmp.png"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write(&self, composite: &RgbImage) -> Result<(), image::ImageError> {
        composite.save(&self.staging)?;
        std::fs::rename(&self.staging, &self.path)?;
        Ok(())
    }
}

impl PreviewSink for FilePreview {
    fn show(&mut self, composite: &RgbImage) {
        // Preview failures never abort the capture.
        if let Err(e) = self.write(composite) {
            tracing::warn!(path = %self.path.display(), error = %e, "preview write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_preview_rewritten_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = FilePreview::new(dir.path());

        sink.show(&RgbImage::from_pixel(8, 4, Rgb([1, 2, 3])));
        sink.show(&RgbImage::from_pixel(6, 3, Rgb([9, 9, 9])));

        let shown = image::open(sink.path()).unwrap().to_rgb8();
        assert_eq!(shown.dimensions(), (6, 3));
        assert_eq!(shown.get_pixel(0, 0).0, [9, 9, 9]);
        // Only the preview itself remains.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_unwritable_dir_does_not_panic() {
        let mut sink = FilePreview::new(Path::new("/nonexistent/thermsync"));
        sink.show(&RgbImage::new(2, 2));
    }
}
