//! Sub-picture (overlay) layer state.
//!
//! Each overlay layer remembers what it last put on screen so an unchanged
//! overlay costs nothing per frame: no region update, no send. Change is
//! detected by the entry sequence number carried in the buffer payload,
//! which the pool keeps stable while a picture stays cached.

use crate::error::{PoolError, PoolResult};
use crate::header::{HeaderPool, HeaderRef};
use crate::port::{default_completion, DisplayRegion, HardwarePort, Rect};
use crate::vzc::send_replicated;
use std::sync::Arc;
use tracing::{debug, trace};

/// What [`SubpicStash::update`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubpicUpdate {
    /// Nothing to show and nothing shown.
    Idle,
    /// Sent an empty buffer to clear the layer.
    Blanked,
    /// Same content, placement and alpha as already shown.
    Unchanged,
    /// Sent new content or placement.
    Updated,
}

/// State of one overlay layer.
pub struct SubpicStash {
    port: Arc<dyn HardwarePort>,
    pool: Option<HeaderPool>,
    layer: i32,
    dest_rect: Rect,
    alpha: u8,
    seq: u32,
}

impl SubpicStash {
    /// Stash for `port` composited at `layer`, with its own header pool.
    ///
    /// # Errors
    ///
    /// [`PoolError::InvalidConfig`] if `header_count` is zero.
    pub fn open(port: Arc<dyn HardwarePort>, layer: i32, header_count: usize) -> PoolResult<Self> {
        if header_count == 0 {
            return Err(PoolError::InvalidConfig(
                "sub-picture stash needs at least one header".into(),
            ));
        }
        debug!(port = port.name(), layer, "Sub-picture stash opened");
        Ok(Self {
            port,
            pool: Some(HeaderPool::new(header_count)),
            layer,
            dest_rect: Rect::default(),
            alpha: 0,
            seq: 0,
        })
    }

    /// Show `buf` on the layer, or clear the layer if `buf` is `None`.
    ///
    /// Placement and alpha come from the buffer's payload.
    ///
    /// # Errors
    ///
    /// - [`PoolError::ProtocolViolation`] if the stash was closed.
    /// - [`PoolError::HeadersExhausted`] if no header is free.
    /// - [`PoolError::PortRejected`] if the port refuses the region, enable
    ///   or buffer. The stash then still believes the old content is shown.
    pub fn update(
        &mut self,
        buf: Option<&HeaderRef>,
        pts: Option<i64>,
    ) -> PoolResult<SubpicUpdate> {
        let Some(pool) = self.pool.as_ref() else {
            return Err(PoolError::ProtocolViolation(
                "update on a closed sub-picture stash".into(),
            ));
        };

        let Some(buf) = buf else {
            if !self.port.is_enabled() || self.seq == 0 {
                return Ok(SubpicUpdate::Idle);
            }
            let blank = pool.get().ok_or(PoolError::HeadersExhausted)?;
            blank.payload().pts = pts;
            self.port
                .send(blank)
                .map_err(|err| PoolError::PortRejected(err.status))?;
            trace!(layer = self.layer, "Blanked sub-picture layer");
            self.seq = 0;
            return Ok(SubpicUpdate::Blanked);
        };

        let (seq, dest_rect, alpha) = {
            let payload = buf.payload();
            (payload.seq, payload.dest_rect, payload.alpha)
        };

        let mut needs_update = seq != self.seq;
        if needs_update || alpha != self.alpha || dest_rect != self.dest_rect {
            let region = DisplayRegion {
                dest_rect,
                alpha,
                layer: self.layer,
            };
            self.port
                .set_display_region(&region)
                .map_err(PoolError::PortRejected)?;
            self.alpha = alpha;
            self.dest_rect = dest_rect;
            needs_update = true;
        }

        if !self.port.is_enabled() {
            self.port
                .enable(default_completion(self.port.name()))
                .map_err(PoolError::PortRejected)?;
        }

        if !needs_update {
            return Ok(SubpicUpdate::Unchanged);
        }

        send_replicated(&*self.port, pool, buf, pts)?;
        trace!(layer = self.layer, seq, "Updated sub-picture layer");
        self.seq = seq;
        Ok(SubpicUpdate::Updated)
    }

    /// Take the layer off screen and forget what was shown.
    pub fn flush(&mut self) {
        if self.port.is_enabled() {
            self.port.disable();
        }
        self.seq = 0;
    }

    /// Flush and destroy the stash's header pool.
    pub fn close(&mut self) {
        self.flush();
        if let Some(pool) = self.pool.take() {
            pool.destroy();
            debug!(port = self.port.name(), layer = self.layer, "Sub-picture stash closed");
        }
    }

    /// Compositing layer of the stash.
    #[must_use]
    pub fn layer(&self) -> i32 {
        self.layer
    }

    /// Sequence number currently shown, zero if none.
    #[must_use]
    pub fn shown_seq(&self) -> u32 {
        self.seq
    }
}

impl Drop for SubpicStash {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for SubpicStash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubpicStash")
            .field("port", &self.port.name())
            .field("layer", &self.layer)
            .field("seq", &self.seq)
            .finish_non_exhaustive()
    }
}
