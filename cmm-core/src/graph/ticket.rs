//! Tickets, buffers and the processor call context

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cache::ContextHandle;
use crate::error::{CMMError, Result};
use crate::module::NodeOptions;

use super::NodeId;

/// Region of interest in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub x: usize,
    pub y: usize,
    pub width: usize,
    pub height: usize,
}

impl Region {
    pub fn new(x: usize, y: usize, width: usize, height: usize) -> Self {
        Self { x, y, width, height }
    }

    /// Region covering `width` x `height` from the origin
    pub fn full(width: usize, height: usize) -> Self {
        Self::new(0, 0, width, height)
    }

    pub fn area(&self) -> usize {
        self.width.saturating_mul(self.height)
    }
}

/// Interleaved sample buffer
#[derive(Debug, Clone, PartialEq)]
pub struct Buffer {
    data_type: String,
    channels: u16,
    width: usize,
    height: usize,
    samples: Vec<f32>,
}

impl Buffer {
    /// Allocate a zeroed buffer.
    ///
    /// Fails with `OutOfMemory` when the sample count overflows or the
    /// allocation cannot be satisfied.
    pub fn allocate(data_type: impl Into<String>, channels: u16, width: usize, height: usize) -> Result<Self> {
        let requested = width
            .checked_mul(height)
            .and_then(|n| n.checked_mul(usize::from(channels)))
            .ok_or(CMMError::OutOfMemory { requested: usize::MAX })?;

        let mut samples = Vec::new();
        samples
            .try_reserve_exact(requested)
            .map_err(|_| CMMError::OutOfMemory { requested })?;
        samples.resize(requested, 0.0);

        Ok(Self {
            data_type: data_type.into(),
            channels,
            width,
            height,
            samples,
        })
    }

    pub fn data_type(&self) -> &str {
        &self.data_type
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn samples_mut(&mut self) -> &mut [f32] {
        &mut self.samples
    }

    /// Samples of one pixel, `None` outside the buffer
    pub fn pixel(&self, x: usize, y: usize) -> Option<&[f32]> {
        let range = self.pixel_range(x, y)?;
        self.samples.get(range)
    }

    pub fn pixel_mut(&mut self, x: usize, y: usize) -> Option<&mut [f32]> {
        let range = self.pixel_range(x, y)?;
        self.samples.get_mut(range)
    }

    /// Set every sample to `value`
    pub fn fill(&mut self, value: f32) {
        self.samples.iter_mut().for_each(|s| *s = value);
    }

    fn pixel_range(&self, x: usize, y: usize) -> Option<std::ops::Range<usize>> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let channels = usize::from(self.channels);
        let start = (y * self.width + x) * channels;
        Some(start..start + channels)
    }
}

/// Cooperative cancellation flag shared between a ticket and its owner
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// A request to fill `target` with the pipeline's output for `region`
#[derive(Debug)]
pub struct Ticket {
    id: Uuid,
    region: Region,
    target: Buffer,
    cancel: CancelToken,
}

impl Ticket {
    /// Ticket covering the whole target buffer
    pub fn new(target: Buffer) -> Self {
        Self {
            id: Uuid::new_v4(),
            region: Region::full(target.width(), target.height()),
            target,
            cancel: CancelToken::new(),
        }
    }

    /// Allocate a target of `region`'s size
    pub fn for_region(region: Region, data_type: &str, channels: u16) -> Result<Self> {
        let target = Buffer::allocate(data_type, channels, region.width, region.height)?;
        Ok(Self::new(target).with_region(region))
    }

    pub fn with_region(mut self, region: Region) -> Self {
        self.region = region;
        self
    }

    /// Share an existing cancellation flag
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn region(&self) -> Region {
        self.region
    }

    pub fn target(&self) -> &Buffer {
        &self.target
    }

    pub fn target_mut(&mut self) -> &mut Buffer {
        &mut self.target
    }

    pub fn into_target(self) -> Buffer {
        self.target
    }

    /// A clone of the ticket's cancellation flag
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn cancelled_error(&self) -> CMMError {
        CMMError::Cancelled {
            ticket_id: self.id.to_string(),
        }
    }
}

/// Everything a processor sees while filling its output
pub struct ProcessContext<'a> {
    pub node: NodeId,
    pub provider_id: &'a str,
    pub options: &'a NodeOptions,
    /// Context built for this node, already checked against the
    /// processor's expected resource kind
    pub context: Option<&'a ContextHandle>,
    /// Upstream output per plug; `None` for unbound optional plugs
    pub inputs: &'a [Option<&'a Buffer>],
    pub region: Region,
    pub output: &'a mut Buffer,
    pub ticket_id: Uuid,
    pub(crate) cancel: &'a CancelToken,
}

impl<'a> ProcessContext<'a> {
    /// Processors working in chunks should poll this and return
    /// `Cancelled` early
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Input bound to plug `index`
    pub fn input(&self, index: usize) -> Option<&Buffer> {
        self.inputs.get(index).copied().flatten()
    }

    /// Typed access to the node's context
    pub fn context_as<T: std::any::Any>(&self, expected_kind: &str) -> Result<&T> {
        match self.context {
            Some(handle) => handle.downcast::<T>(expected_kind),
            None => Err(CMMError::TypeMismatch {
                expected: expected_kind.to_string(),
                actual: "no context".to_string(),
            }),
        }
    }

    /// Error to return when cancellation was observed
    pub fn cancelled(&self) -> CMMError {
        CMMError::Cancelled {
            ticket_id: self.ticket_id.to_string(),
        }
    }
}
