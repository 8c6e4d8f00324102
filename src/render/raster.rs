use std::{
    path::Path,
    sync::{Arc, OnceLock},
};

use anyhow::Context as _;

use crate::foundation::{
    core::FrameSize,
    error::{FramesmithError, FramesmithResult},
};

/// A rasterized frame in straight-alpha RGBA8.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RgbaFrame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl RgbaFrame {
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = ((y * self.width + x) * 4) as usize;
        self.data.get(i..i + 4)?.try_into().ok()
    }

    /// Encode as PNG. The parent directory must already exist.
    pub fn write_png(&self, path: &Path) -> FramesmithResult<()> {
        image::save_buffer_with_format(
            path,
            &self.data,
            self.width,
            self.height,
            image::ExtendedColorType::Rgba8,
            image::ImageFormat::Png,
        )
        .with_context(|| format!("write png '{}'", path.display()))?;
        Ok(())
    }
}

/// Turns SVG markup into pixels.
pub trait Rasterizer: Send {
    fn rasterize(&mut self, markup: &str, size: FrameSize) -> FramesmithResult<RgbaFrame>;
}

/// `usvg` + `resvg` rasterizer over a font database that can be shared between instances.
pub struct SvgRasterizer {
    options: usvg::Options<'static>,
}

impl SvgRasterizer {
    /// Rasterizer over the system fonts. The font scan happens once per process.
    pub fn new() -> Self {
        static SYSTEM_FONTS: OnceLock<Arc<usvg::fontdb::Database>> = OnceLock::new();
        let fontdb = SYSTEM_FONTS.get_or_init(|| {
            let mut fontdb = usvg::fontdb::Database::new();
            fontdb.load_system_fonts();
            tracing::debug!(faces = fontdb.len(), "loaded system fonts");
            Arc::new(fontdb)
        });
        Self::with_fontdb(Arc::clone(fontdb))
    }

    pub fn with_fontdb(fontdb: Arc<usvg::fontdb::Database>) -> Self {
        Self {
            options: usvg::Options {
                fontdb,
                ..usvg::Options::default()
            },
        }
    }
}

impl Default for SvgRasterizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Rasterizer for SvgRasterizer {
    fn rasterize(&mut self, markup: &str, size: FrameSize) -> FramesmithResult<RgbaFrame> {
        size.validate()?;
        let tree = usvg::Tree::from_str(markup, &self.options)
            .map_err(|e| FramesmithError::render(format!("frame markup is not valid svg: {e}")))?;

        let mut pixmap = resvg::tiny_skia::Pixmap::new(size.width, size.height)
            .ok_or_else(|| FramesmithError::render("failed to allocate frame pixmap"))?;

        let tree_size = tree.size();
        let sx = (size.width as f32) / tree_size.width();
        let sy = (size.height as f32) / tree_size.height();
        resvg::render(
            &tree,
            resvg::tiny_skia::Transform::from_scale(sx, sy),
            &mut pixmap.as_mut(),
        );

        let mut data = pixmap.take();
        unpremultiply_in_place(&mut data);
        Ok(RgbaFrame {
            width: size.width,
            height: size.height,
            data,
        })
    }
}

fn unpremultiply_in_place(rgba: &mut [u8]) {
    for px in rgba.chunks_exact_mut(4) {
        let a = px[3] as u16;
        if a == 0 || a == 255 {
            continue;
        }
        px[0] = ((px[0] as u16 * 255 + a / 2) / a).min(255) as u8;
        px[1] = ((px[1] as u16 * 255 + a / 2) / a).min(255) as u8;
        px[2] = ((px[2] as u16 * 255 + a / 2) / a).min(255) as u8;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rasterizer() -> SvgRasterizer {
        SvgRasterizer::with_fontdb(Arc::new(usvg::fontdb::Database::new()))
    }

    #[test]
    fn fills_are_rasterized_at_frame_size() {
        let markup = r##"<svg xmlns="http://www.w3.org/2000/svg" width="4" height="4" viewBox="0 0 4 4"><rect width="4" height="4" fill="#ff0000"/></svg>"##;
        let frame = rasterizer()
            .rasterize(markup, FrameSize::new(4, 4).unwrap())
            .unwrap();
        assert_eq!(frame.data.len(), 4 * 4 * 4);
        assert_eq!(frame.pixel(1, 1), Some([255, 0, 0, 255]));
    }

    #[test]
    fn markup_is_scaled_to_the_requested_size() {
        let markup = r##"<svg xmlns="http://www.w3.org/2000/svg" width="2" height="2"><rect width="1" height="2" fill="#0000ff"/></svg>"##;
        let frame = rasterizer()
            .rasterize(markup, FrameSize::new(8, 8).unwrap())
            .unwrap();
        assert_eq!(frame.pixel(1, 4), Some([0, 0, 255, 255]));
        assert_eq!(frame.pixel(6, 4).map(|p| p[3]), Some(0));
    }

    #[test]
    fn system_font_rasterizers_share_one_database() {
        let a = SvgRasterizer::new();
        let b = SvgRasterizer::default();
        assert!(Arc::ptr_eq(&a.options.fontdb, &b.options.fontdb));
    }

    #[test]
    fn png_writes_need_an_existing_directory() {
        let frame = RgbaFrame {
            width: 1,
            height: 1,
            data: vec![0, 0, 0, 255],
        };
        let missing = std::path::PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("target")
            .join("unit-scratch")
            .join(format!("raster-missing-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&missing);
        assert!(frame.write_png(&missing.join("0.png")).is_err());
        assert!(!missing.exists());
    }

    #[test]
    fn invalid_markup_is_a_render_error() {
        let err = rasterizer()
            .rasterize("<svg", FrameSize::new(2, 2).unwrap())
            .unwrap_err();
        assert!(matches!(err, FramesmithError::Render(_)));
    }

    #[test]
    fn unpremultiply_restores_straight_alpha() {
        let mut px = vec![64u8, 0, 0, 128, 9, 9, 9, 0];
        unpremultiply_in_place(&mut px);
        assert_eq!(px, vec![128, 0, 0, 128, 9, 9, 9, 0]);
    }
}
