use super::renderer::OverlayFrame;
use std::collections::VecDeque;

/// Output surface an overlay is drawn onto
pub trait OverlaySurface: Send {
    /// Width and height in pixels
    fn size(&self) -> (u32, u32);

    /// Remove everything drawn so far
    fn clear(&mut self);

    fn draw(&mut self, frame: &OverlayFrame);
}

#[derive(Debug, Clone, PartialEq)]
pub enum SurfaceOp {
    Clear,
    Draw(OverlayFrame),
}

/// Surface that remembers what was drawn instead of rasterizing it
#[derive(Debug)]
pub struct RecordingSurface {
    width: u32,
    height: u32,
    ops: VecDeque<SurfaceOp>,
    history: usize,
    current: Option<OverlayFrame>,
    clears: u64,
    draws: u64,
}

impl RecordingSurface {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            ops: VecDeque::new(),
            history: usize::MAX,
            current: None,
            clears: 0,
            draws: 0,
        }
    }

    /// Keep only the most recent `history` operations
    pub fn with_history(mut self, history: usize) -> Self {
        self.history = history;
        self
    }

    /// Frame currently visible, if any
    pub fn current(&self) -> Option<&OverlayFrame> {
        self.current.as_ref()
    }

    pub fn ops(&self) -> impl Iterator<Item = &SurfaceOp> {
        self.ops.iter()
    }

    pub fn clears(&self) -> u64 {
        self.clears
    }

    pub fn draws(&self) -> u64 {
        self.draws
    }

    fn record(&mut self, op: SurfaceOp) {
        if self.history == 0 {
            return;
        }
        if self.ops.len() >= self.history {
            self.ops.pop_front();
        }
        self.ops.push_back(op);
    }
}

impl OverlaySurface for RecordingSurface {
    fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn clear(&mut self) {
        self.clears += 1;
        self.current = None;
        self.record(SurfaceOp::Clear);
    }

    fn draw(&mut self, frame: &OverlayFrame) {
        self.draws += 1;
        self.current = Some(frame.clone());
        self.record(SurfaceOp::Draw(frame.clone()));
    }
}
