//! Read-only view of decoded pictures.
//!
//! Pictures are shared as `Arc<dyn Picture>`: cloning the `Arc` holds the
//! picture, dropping it releases it. Reuse matching compares pictures by
//! identity (the address of the shared allocation), never by content.

use std::sync::Arc;

/// Visible geometry of a picture.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PictureFormat {
    /// Visible width in pixels.
    pub width: u32,
    /// Visible height in pixels.
    pub height: u32,
    /// Left edge of the visible area.
    pub x_offset: u32,
    /// Top edge of the visible area.
    pub y_offset: u32,
}

/// One pixel plane of a picture.
#[derive(Debug, Clone, Copy)]
pub struct PlaneView<'a> {
    /// Plane bytes, at least `pitch * lines` long.
    pub pixels: &'a [u8],
    /// Bytes per line.
    pub pitch: usize,
    /// Number of lines.
    pub lines: usize,
}

impl PlaneView<'_> {
    /// Bytes this plane occupies once staged.
    #[must_use]
    pub fn footprint(&self) -> usize {
        self.pitch * self.lines
    }
}

/// Decoded picture supplied by the decode pipeline.
pub trait Picture: Send + Sync + 'static {
    /// Visible geometry.
    fn format(&self) -> PictureFormat;

    /// Pixel planes in staging order.
    fn planes(&self) -> Vec<PlaneView<'_>>;

    /// Presentation timestamp in microseconds, if known.
    fn pts(&self) -> Option<i64> {
        None
    }

    /// Bytes needed to stage every plane back to back.
    fn footprint(&self) -> usize {
        self.planes().iter().map(PlaneView::footprint).sum()
    }
}

/// Shared, held reference to a picture.
pub type PictureRef = Arc<dyn Picture>;

/// Identity comparison used for reuse matching.
#[must_use]
pub fn same_picture(a: &PictureRef, b: &PictureRef) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Copy every plane of `picture` into `dst` back to back.
///
/// Returns the number of bytes written. Planes that would overrun `dst` are
/// truncated; callers size `dst` from [`Picture::footprint`] so this only
/// happens if a picture changes its planes between calls.
pub fn stage_planes(picture: &dyn Picture, dst: &mut [u8]) -> usize {
    let mut written = 0;
    for plane in picture.planes() {
        let len = plane
            .footprint()
            .min(plane.pixels.len())
            .min(dst.len() - written);
        dst[written..written + len].copy_from_slice(&plane.pixels[..len]);
        written += len;
        if written == dst.len() {
            break;
        }
    }
    written
}
