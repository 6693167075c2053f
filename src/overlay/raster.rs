use super::renderer::{OverlayFrame, PixelRect, Rgb, TextCommand};
use super::surface::OverlaySurface;
use crate::config::OverlayConfig;
use crate::error::{Result, SyncError};
use image::{ImageFormat, Rgba, RgbaImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use rusttype::{Font, Scale};
use std::fs;
use std::path::Path;
use tracing::{debug, info};

const TRANSPARENT: Rgba<u8> = Rgba([0, 0, 0, 0]);
const BADGE_BACKGROUND: Rgba<u8> = Rgba([0, 0, 0, 128]);

/// In-memory RGBA raster surface
pub struct ImageSurface {
    image: RgbaImage,
    /// Text is skipped when no font is loaded
    font: Option<Font<'static>>,
}

impl ImageSurface {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            image: RgbaImage::from_pixel(width.max(1), height.max(1), TRANSPARENT),
            font: None,
        }
    }

    /// Surface sized from configuration, loading the label font if one is set
    pub fn from_config(config: &OverlayConfig) -> Result<Self> {
        let surface = Self::new(config.width, config.height);
        match &config.font_path {
            Some(path) => surface.with_font_file(path),
            None => Ok(surface),
        }
    }

    pub fn with_font_file<P: AsRef<Path>>(mut self, path: P) -> Result<Self> {
        let path = path.as_ref();
        let font_data = fs::read(path).map_err(|e| {
            SyncError::component(
                "overlay",
                format!("Failed to read font file '{}': {}", path.display(), e),
            )
        })?;

        let font = Font::try_from_vec(font_data).ok_or_else(|| {
            SyncError::component(
                "overlay",
                format!("Failed to parse font file '{}'", path.display()),
            )
        })?;

        debug!("Loaded overlay font from {}", path.display());
        self.font = Some(font);
        Ok(self)
    }

    pub fn image(&self) -> &RgbaImage {
        &self.image
    }

    pub fn save_png<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        self.image
            .save_with_format(path, ImageFormat::Png)
            .map_err(|e| {
                SyncError::component(
                    "overlay",
                    format!("Failed to write '{}': {}", path.display(), e),
                )
            })?;
        info!("Saved overlay snapshot to {}", path.display());
        Ok(())
    }

    fn fill(&mut self, rect: &PixelRect, color: Rgba<u8>) {
        draw_filled_rect_mut(&mut self.image, to_rect(rect), color);
    }

    fn text(&mut self, command: &TextCommand) {
        let Some(font) = &self.font else {
            return;
        };
        draw_text_mut(
            &mut self.image,
            opaque(command.color),
            command.x,
            command.y,
            Scale::uniform(command.size),
            font,
            &command.text,
        );
    }
}

impl OverlaySurface for ImageSurface {
    fn size(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    fn clear(&mut self) {
        for pixel in self.image.pixels_mut() {
            *pixel = TRANSPARENT;
        }
    }

    fn draw(&mut self, frame: &OverlayFrame) {
        for command in &frame.boxes {
            let color = opaque(command.color);
            let outline = command.outline;
            draw_hollow_rect_mut(&mut self.image, to_rect(&outline), color);
            // Two pixel stroke
            if outline.width > 2 && outline.height > 2 {
                let inner = PixelRect {
                    x: outline.x + 1,
                    y: outline.y + 1,
                    width: outline.width - 2,
                    height: outline.height - 2,
                };
                draw_hollow_rect_mut(&mut self.image, to_rect(&inner), color);
            }

            if let Some(label) = &command.label {
                self.fill(&label.background, color);
                self.text(&label.text);
            }
        }

        if let Some(badge) = &frame.badge {
            self.fill(&badge.background, BADGE_BACKGROUND);
            self.text(&badge.count);
            self.text(&badge.caption);
        }

        if let Some(banner) = &frame.banner {
            self.fill(&banner.background, opaque(banner.color));
            self.text(&banner.text);
        }
    }
}

fn opaque(color: Rgb) -> Rgba<u8> {
    Rgba([color.0, color.1, color.2, 255])
}

fn to_rect(rect: &PixelRect) -> Rect {
    Rect::at(rect.x, rect.y).of_size(rect.width.max(1), rect.height.max(1))
}
