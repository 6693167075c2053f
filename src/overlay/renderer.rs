use super::surface::OverlaySurface;
use crate::config::OverlayConfig;
use crate::telemetry::{AggregateStats, DetectionBox, FlowStatus, TelemetrySample};
use std::sync::Arc;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgb(pub u8, pub u8, pub u8);

impl Rgb {
    pub const WHITE: Rgb = Rgb(0xff, 0xff, 0xff);
}

pub const AMBULANCE_COLOR: Rgb = Rgb(0x22, 0xc5, 0x5e);
pub const TRUCK_COLOR: Rgb = Rgb(0xf5, 0x9e, 0x0b);
pub const DEFAULT_BOX_COLOR: Rgb = Rgb(0x3b, 0x82, 0xf6);
pub const CAPTION_COLOR: Rgb = Rgb(0xaa, 0xaa, 0xaa);
pub const BANNER_COLOR: Rgb = Rgb(0x16, 0xa3, 0x4a);

const PRIORITY_BANNER_TEXT: &str = "AMBULANCE DETECTED - GREEN WAVE ACTIVE";

/// Outline colour for a detection class
pub fn box_color(label: &str) -> Rgb {
    let label = label.to_ascii_lowercase();
    if label.contains("ambulance") {
        AMBULANCE_COLOR
    } else if label.contains("truck") {
        TRUCK_COLOR
    } else {
        DEFAULT_BOX_COLOR
    }
}

/// Everything needed to draw one tick
#[derive(Debug, Clone)]
pub struct RenderInstruction {
    pub sample: Arc<TelemetrySample>,
    /// Frame the playback position asked for
    pub target_frame: u64,
    /// Live aggregate stats at the time of the tick
    pub stats: AggregateStats,
    pub priority_active: bool,
}

/// Axis-aligned rectangle in surface pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextCommand {
    pub text: String,
    pub x: i32,
    pub y: i32,
    pub color: Rgb,
    pub size: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LabelCommand {
    pub background: PixelRect,
    pub text: TextCommand,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BoxCommand {
    pub outline: PixelRect,
    pub color: Rgb,
    pub label: Option<LabelCommand>,
}

/// Vehicle count panel in the top-right corner
#[derive(Debug, Clone, PartialEq)]
pub struct StatusBadge {
    pub background: PixelRect,
    pub count: TextCommand,
    pub caption: TextCommand,
    pub status: FlowStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PriorityBanner {
    pub background: PixelRect,
    pub color: Rgb,
    pub text: TextCommand,
}

/// Complete draw list for one tick
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OverlayFrame {
    pub width: u32,
    pub height: u32,
    pub frame_index: u64,
    pub boxes: Vec<BoxCommand>,
    pub badge: Option<StatusBadge>,
    pub banner: Option<PriorityBanner>,
}

/// Stateless composer turning render instructions into draw lists
#[derive(Debug, Clone)]
pub struct OverlayRenderer {
    font_size: f32,
}

impl OverlayRenderer {
    pub fn new(config: &OverlayConfig) -> Self {
        Self::with_font_size(config.font_size)
    }

    pub fn with_font_size(font_size: f32) -> Self {
        Self {
            font_size: if font_size.is_finite() && font_size > 0.0 {
                font_size
            } else {
                12.0
            },
        }
    }

    /// Clear the surface and draw `instruction` on it
    pub fn render(&self, instruction: &RenderInstruction, surface: &mut dyn OverlaySurface) {
        let (width, height) = surface.size();
        let frame = self.compose(instruction, width, height);
        trace!(
            frame_index = frame.frame_index,
            target_frame = instruction.target_frame,
            boxes = frame.boxes.len(),
            "Drawing overlay"
        );
        surface.clear();
        surface.draw(&frame);
    }

    pub fn compose(&self, instruction: &RenderInstruction, width: u32, height: u32) -> OverlayFrame {
        let boxes = instruction
            .sample
            .boxes
            .iter()
            .map(|detection| self.compose_box(detection, width, height))
            .collect();

        OverlayFrame {
            width,
            height,
            frame_index: instruction.sample.frame_index,
            boxes,
            badge: self.compose_badge(&instruction.stats, width),
            banner: instruction
                .priority_active
                .then(|| self.compose_banner(width)),
        }
    }

    fn compose_box(&self, detection: &DetectionBox, width: u32, height: u32) -> BoxCommand {
        let [x1, y1, x2, y2] = detection.coords;
        let scale = |v: f32, extent: u32| (v.clamp(0.0, 1.0) * extent as f32).round() as i32;

        let (left, right) = (scale(x1.min(x2), width), scale(x1.max(x2), width));
        let (top, bottom) = (scale(y1.min(y2), height), scale(y1.max(y2), height));

        let outline = PixelRect {
            x: left,
            y: top,
            width: (right - left).max(1) as u32,
            height: (bottom - top).max(1) as u32,
        };
        let color = box_color(&detection.label);

        let label = (!detection.label.is_empty()).then(|| {
            let text = format!("{} {}%", detection.label, detection.confidence_percent());
            let label_height = (self.font_size * 1.5).round() as u32;
            let text_width = (text.chars().count() as f32 * self.font_size * 0.6).ceil() as u32;
            // Above the box, or inside it when there is no room
            let y = if top >= label_height as i32 {
                top - label_height as i32
            } else {
                top
            };

            LabelCommand {
                background: PixelRect {
                    x: left,
                    y,
                    width: text_width + 8,
                    height: label_height,
                },
                text: TextCommand {
                    text,
                    x: left + 4,
                    y: y + ((label_height as f32 - self.font_size) / 2.0).round() as i32,
                    color: Rgb::WHITE,
                    size: self.font_size,
                },
            }
        });

        BoxCommand {
            outline,
            color,
            label,
        }
    }

    fn compose_badge(&self, stats: &AggregateStats, width: u32) -> Option<StatusBadge> {
        if stats.count == 0 {
            return None;
        }

        let right = width as i32;
        Some(StatusBadge {
            background: PixelRect {
                x: right - 120,
                y: 50,
                width: 110,
                height: 60,
            },
            count: TextCommand {
                text: stats.count.to_string(),
                x: right - 110,
                y: 64,
                color: Rgb::WHITE,
                size: self.font_size * 2.0,
            },
            caption: TextCommand {
                text: "vehicles".to_string(),
                x: right - 70,
                y: 74,
                color: CAPTION_COLOR,
                size: self.font_size,
            },
            status: stats.status,
        })
    }

    fn compose_banner(&self, width: u32) -> PriorityBanner {
        let height = (self.font_size * 3.0).round() as u32;
        PriorityBanner {
            background: PixelRect {
                x: 0,
                y: 0,
                width: width.max(1),
                height,
            },
            color: BANNER_COLOR,
            text: TextCommand {
                text: PRIORITY_BANNER_TEXT.to_string(),
                x: 12,
                y: ((height as f32 - self.font_size * 1.3) / 2.0).round() as i32,
                color: Rgb::WHITE,
                size: self.font_size * 1.3,
            },
        }
    }
}

impl Default for OverlayRenderer {
    fn default() -> Self {
        Self::with_font_size(12.0)
    }
}
