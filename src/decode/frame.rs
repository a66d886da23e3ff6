//! Decoded frame model shared between the decode and render threads.

use std::fmt;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;

/// Every native output layout maps to exactly one texture upload path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelLayout {
    /// Planar YUV 4:2:0, chroma half width and half height
    Yuv420p,
    /// Planar YUV 4:2:2, chroma half width and full height
    Yuv422p,
    /// Semi-planar, luma plane + interleaved UV plane at half resolution
    Nv12,
    /// Hardware surface importable into the GPU without a CPU copy
    OpaqueGpu,
    /// Hardware surface that must be read back to system memory first
    HwReadback,
}

impl fmt::Display for PixelLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PixelLayout::Yuv420p => "yuv420p",
            PixelLayout::Yuv422p => "yuv422p",
            PixelLayout::Nv12 => "nv12",
            PixelLayout::OpaqueGpu => "opaque-gpu",
            PixelLayout::HwReadback => "hw-readback",
        };
        f.write_str(s)
    }
}

/// One tightly owned image plane.
#[derive(Debug, Clone)]
pub struct Plane {
    pub data: Bytes,
    /// Bytes per row. Equals the logical row width after the engine's
    /// stride-aware copy, but uploads must not assume that.
    pub stride: usize,
}

impl Plane {
    /// Copy `rows` rows of `row_bytes` each out of a strided source
    /// buffer into a tightly packed plane. Rows are copied one by one
    /// when the source stride differs from the logical row width.
    pub fn copy_strided(src: &[u8], src_stride: usize, row_bytes: usize, rows: usize) -> Self {
        if src_stride == row_bytes {
            return Self {
                data: Bytes::copy_from_slice(&src[..row_bytes * rows]),
                stride: row_bytes,
            };
        }
        let mut packed = Vec::with_capacity(row_bytes * rows);
        for row in 0..rows {
            let start = row * src_stride;
            packed.extend_from_slice(&src[start..start + row_bytes]);
        }
        Self {
            data: Bytes::from(packed),
            stride: row_bytes,
        }
    }
}

/// DRM layout of a DMA-BUF plane, as reported by the decoder.
#[derive(Debug, Clone, Copy)]
pub struct DmaBufPlane {
    pub offset: u64,
    pub stride: u32,
}

/// A hardware decoder output surface referenced by a duplicated
/// DMA-BUF file descriptor. The duplicate keeps the underlying buffer
/// alive independently of the decoder's pool, so a frame that is still
/// queued for display survives a session teardown.
#[derive(Debug)]
pub struct DmaBufFrame {
    pub fd: OwnedFd,
    /// DRM fourcc of the buffer contents
    pub fourcc: u32,
    pub modifier: u64,
    pub planes: Vec<DmaBufPlane>,
    /// Total size of the mapping in bytes
    pub size: usize,
}

#[derive(Debug, Clone)]
pub enum FrameStorage {
    Planar { planes: [Plane; 3] },
    SemiPlanar { y: Plane, uv: Plane },
    Dmabuf(Arc<DmaBufFrame>),
}

static LIVE_FRAMES: AtomicUsize = AtomicUsize::new(0);

/// Number of `DecodedFrame` values (including refcounted duplicates)
/// currently alive. Constructions and releases must balance; the leak
/// tests assert this returns to zero.
pub fn live_frame_count() -> usize {
    LIVE_FRAMES.load(Ordering::Acquire)
}

#[derive(Debug)]
struct LiveToken;

impl LiveToken {
    fn new() -> Self {
        LIVE_FRAMES.fetch_add(1, Ordering::AcqRel);
        LiveToken
    }
}

impl Clone for LiveToken {
    fn clone(&self) -> Self {
        LiveToken::new()
    }
}

impl Drop for LiveToken {
    fn drop(&mut self) {
        LIVE_FRAMES.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A decoded picture handed from the decode thread to the renderer.
/// Cloning is refcounted duplication of the backing storage.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub width: u32,
    pub height: u32,
    /// Wall-clock microseconds assigned at feed time. Latency
    /// measurement only, there is no audio to sync against.
    pub pts_us: i64,
    pub layout: PixelLayout,
    pub storage: FrameStorage,
    _live: LiveToken,
}

impl DecodedFrame {
    pub fn new_planar(
        width: u32,
        height: u32,
        pts_us: i64,
        layout: PixelLayout,
        planes: [Plane; 3],
    ) -> Self {
        debug_assert!(matches!(
            layout,
            PixelLayout::Yuv420p | PixelLayout::Yuv422p
        ));
        Self {
            width,
            height,
            pts_us,
            layout,
            storage: FrameStorage::Planar { planes },
            _live: LiveToken::new(),
        }
    }

    pub fn new_nv12(width: u32, height: u32, pts_us: i64, y: Plane, uv: Plane) -> Self {
        Self {
            width,
            height,
            pts_us,
            layout: PixelLayout::Nv12,
            storage: FrameStorage::SemiPlanar { y, uv },
            _live: LiveToken::new(),
        }
    }

    pub fn new_dmabuf(
        width: u32,
        height: u32,
        pts_us: i64,
        layout: PixelLayout,
        dmabuf: DmaBufFrame,
    ) -> Self {
        debug_assert!(matches!(
            layout,
            PixelLayout::OpaqueGpu | PixelLayout::HwReadback
        ));
        Self {
            width,
            height,
            pts_us,
            layout,
            storage: FrameStorage::Dmabuf(Arc::new(dmabuf)),
            _live: LiveToken::new(),
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

/// Chroma plane dimensions for a planar layout.
pub fn chroma_dimensions(layout: PixelLayout, width: u32, height: u32) -> (u32, u32) {
    match layout {
        // Both 420 and 422 have half width
        PixelLayout::Yuv420p => (width.div_ceil(2), height.div_ceil(2)),
        // 422 has full height
        PixelLayout::Yuv422p => (width.div_ceil(2), height),
        PixelLayout::Nv12 => (width.div_ceil(2), height.div_ceil(2)),
        PixelLayout::OpaqueGpu | PixelLayout::HwReadback => (0, 0),
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    /// Synthetic planar frame for pipeline tests.
    pub fn gray_frame(width: u32, height: u32, pts_us: i64) -> DecodedFrame {
        let (cw, ch) = chroma_dimensions(PixelLayout::Yuv420p, width, height);
        let y = Plane {
            data: Bytes::from(vec![0x80; (width * height) as usize]),
            stride: width as usize,
        };
        let u = Plane {
            data: Bytes::from(vec![0x80; (cw * ch) as usize]),
            stride: cw as usize,
        };
        let v = Plane {
            data: Bytes::from(vec![0x80; (cw * ch) as usize]),
            stride: cw as usize,
        };
        DecodedFrame::new_planar(width, height, pts_us, PixelLayout::Yuv420p, [y, u, v])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strided_copy_drops_decoder_padding() {
        // 4x2 logical image inside a stride-8 buffer
        let src: Vec<u8> = vec![
            1, 2, 3, 4, 0xAA, 0xAA, 0xAA, 0xAA, //
            5, 6, 7, 8, 0xAA, 0xAA, 0xAA, 0xAA,
        ];
        let plane = Plane::copy_strided(&src, 8, 4, 2);
        assert_eq!(plane.stride, 4);
        assert_eq!(plane.data.as_ref(), &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn strided_copy_is_single_memcpy_when_packed() {
        let src: Vec<u8> = vec![1, 2, 3, 4, 5, 6, 7, 8];
        let plane = Plane::copy_strided(&src, 4, 4, 2);
        assert_eq!(plane.data.as_ref(), src.as_slice());
    }

    #[test]
    fn chroma_dims_match_subsampling() {
        assert_eq!(chroma_dimensions(PixelLayout::Yuv420p, 1280, 720), (640, 360));
        assert_eq!(chroma_dimensions(PixelLayout::Yuv422p, 1280, 720), (640, 720));
        // odd dimensions round up
        assert_eq!(chroma_dimensions(PixelLayout::Yuv420p, 101, 51), (51, 26));
    }

    #[test]
    fn live_counter_balances_constructions_and_releases() {
        let before = live_frame_count();
        {
            let frame = testutil::gray_frame(64, 48, 0);
            assert_eq!(live_frame_count(), before + 1);
            let dup = frame.clone();
            assert_eq!(live_frame_count(), before + 2);
            drop(frame);
            assert_eq!(live_frame_count(), before + 1);
            drop(dup);
        }
        assert_eq!(live_frame_count(), before);
    }
}
