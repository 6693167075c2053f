//! Overlay rendering: detections and live status drawn over the video surface.
//!
//! Composition is pure; surfaces only rasterize. Every render clears the
//! surface first, so nothing from a previous tick survives.

#[cfg(feature = "raster")]
mod raster;
mod renderer;
mod surface;

#[cfg(feature = "raster")]
pub use raster::ImageSurface;
pub use renderer::{
    box_color, BoxCommand, LabelCommand, OverlayFrame, OverlayRenderer, PixelRect,
    PriorityBanner, RenderInstruction, Rgb, StatusBadge, TextCommand, AMBULANCE_COLOR,
    DEFAULT_BOX_COLOR, TRUCK_COLOR,
};
pub use surface::{OverlaySurface, RecordingSurface, SurfaceOp};
