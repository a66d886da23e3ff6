//! Aspect-correct viewport computation.

/// Pixel rectangle inside the window, origin bottom-left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewportRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Compute the video viewport inside the window. Preserves the video's
/// aspect ratio (letter-/pillarboxed and centered) unless
/// `scale_to_fit` stretches it over the whole window. Callers swap the
/// video dimensions before calling when the display rotation is 90 or
/// 270 degrees.
pub fn calculate_viewport(
    window_width: u32,
    window_height: u32,
    video_width: u32,
    video_height: u32,
    scale_to_fit: bool,
) -> ViewportRect {
    let full = ViewportRect {
        x: 0,
        y: 0,
        width: window_width,
        height: window_height,
    };
    if scale_to_fit || video_width == 0 || video_height == 0 {
        return full;
    }

    let window_ar = window_width as f64 / window_height as f64;
    let video_ar = video_width as f64 / video_height as f64;

    if video_ar > window_ar {
        // video wider than window: full width, letterboxed
        let height = (window_width as f64 / video_ar).round() as u32;
        ViewportRect {
            x: 0,
            y: (window_height - height) / 2,
            width: window_width,
            height,
        }
    } else {
        // video taller than window: full height, pillarboxed
        let width = (window_height as f64 * video_ar).round() as u32;
        ViewportRect {
            x: (window_width - width) / 2,
            y: 0,
            width,
            height: window_height,
        }
    }
}

/// Effective video dimensions for viewport computation under display
/// rotation: 90/270 swap width and height.
pub fn rotated_dimensions(width: u32, height: u32, rotation_degrees: u32) -> (u32, u32) {
    match rotation_degrees % 360 {
        90 | 270 => (height, width),
        _ => (width, height),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_aspect_fills_the_window() {
        let vp = calculate_viewport(1920, 1080, 1280, 720, false);
        assert_eq!(
            vp,
            ViewportRect {
                x: 0,
                y: 0,
                width: 1920,
                height: 1080
            }
        );
        // 16:9 preserved, centered with zero offset on both axes
        assert_eq!(vp.width * 9, vp.height * 16);
    }

    #[test]
    fn narrow_video_is_pillarboxed_and_centered() {
        let vp = calculate_viewport(1920, 1080, 720, 720, false);
        assert_eq!(vp.height, 1080);
        assert_eq!(vp.width, 1080);
        assert_eq!(vp.x, (1920 - 1080) / 2);
        assert_eq!(vp.y, 0);
    }

    #[test]
    fn wide_video_is_letterboxed_and_centered() {
        let vp = calculate_viewport(1280, 1024, 1280, 720, false);
        assert_eq!(vp.width, 1280);
        assert_eq!(vp.height, 720);
        assert_eq!(vp.x, 0);
        assert_eq!(vp.y, (1024 - 720) / 2);
    }

    #[test]
    fn scale_to_fit_ignores_aspect() {
        let vp = calculate_viewport(1920, 1080, 640, 640, true);
        assert_eq!(vp.width, 1920);
        assert_eq!(vp.height, 1080);
    }

    #[test]
    fn rotation_swaps_effective_dimensions() {
        assert_eq!(rotated_dimensions(1280, 720, 0), (1280, 720));
        assert_eq!(rotated_dimensions(1280, 720, 90), (720, 1280));
        assert_eq!(rotated_dimensions(1280, 720, 180), (1280, 720));
        assert_eq!(rotated_dimensions(1280, 720, 270), (720, 1280));

        // rotated portrait video inside a landscape window pillarboxes
        let (w, h) = rotated_dimensions(1280, 720, 90);
        let vp = calculate_viewport(1920, 1080, w, h, false);
        assert_eq!(vp.height, 1080);
        assert!(vp.width < 1920 && vp.x > 0);
    }

    #[test]
    fn degenerate_video_dimensions_fall_back_to_full_window() {
        let vp = calculate_viewport(800, 600, 0, 0, false);
        assert_eq!(vp.width, 800);
        assert_eq!(vp.height, 600);
    }
}
