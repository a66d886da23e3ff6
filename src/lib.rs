pub mod decode;
pub mod display;
pub mod pipeline;
pub mod source;
pub mod utils;

use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

pub use decode::frame::{DecodedFrame, PixelLayout};
pub use decode::supervisor::DecodeSupervisor;
pub use display::compositor::VideoCompositor;
pub use pipeline::mailbox::FrameMailbox;

/// Handle to the live stream configuration, shared between the owning
/// application (which writes new snapshots) and the decode supervisor
/// (which reads one fresh snapshot per iteration).
pub type SettingsHandle = Arc<ArcSwap<StreamConfig>>;

pub fn settings_handle(config: StreamConfig) -> SettingsHandle {
    Arc::new(ArcSwap::from_pointee(config))
}

/// Default input endpoint, must stay in sync with the vehicle side.
pub const DEFAULT_INPUT_IP: &str = "127.0.0.1";
pub const DEFAULT_INPUT_PORT: u16 = 5600;

/// Supported video codecs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VideoCodec {
    H264,
    H265,
}

impl VideoCodec {
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "h264",
            VideoCodec::H265 => "h265",
        }
    }
}

/// Generic flags, not separated per stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenericSettings {
    /// Feed incomplete frames to the decoder instead of only intact ones
    pub feed_incomplete_frames: bool,
    /// Display rotation in degrees (0/90/180/270)
    pub screen_rotation: u32,
    /// Stretch video to the window instead of preserving aspect ratio
    pub scale_to_fit: bool,
    /// Draw alternating solid-color frames while no video has arrived (dev aid)
    pub dev_draw_placeholder_frames: bool,
}

impl Default for GenericSettings {
    fn default() -> Self {
        Self {
            feed_incomplete_frames: false,
            screen_rotation: 0,
            scale_to_fit: false,
            dev_draw_placeholder_frames: false,
        }
    }
}

/// Stream configuration snapshot. Two configs are equal if all members
/// are exactly the same; any difference triggers a decoder restart on
/// the next settings poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// The ip address where we receive udp video data from
    pub input_ip: String,
    /// The port where to receive udp video data from
    pub input_port: u16,
    /// The video codec the received data should be interpreted as
    pub codec: VideoCodec,
    /// Force sw decoding even if a HW decoder is available on this platform
    pub force_software_decode: bool,
    pub generic: GenericSettings,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            input_ip: DEFAULT_INPUT_IP.to_string(),
            input_port: DEFAULT_INPUT_PORT,
            codec: VideoCodec::H264,
            force_software_decode: false,
            generic: GenericSettings::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_configs_compare_equal() {
        let a = StreamConfig::default();
        let b = a.clone();
        assert_eq!(a, b);
    }

    #[test]
    fn any_single_field_change_breaks_equality() {
        let base = StreamConfig::default();

        let mut c = base.clone();
        c.codec = VideoCodec::H265;
        assert_ne!(base, c);

        let mut c = base.clone();
        c.input_port = 5601;
        assert_ne!(base, c);

        let mut c = base.clone();
        c.input_ip = "10.0.0.1".into();
        assert_ne!(base, c);

        let mut c = base.clone();
        c.force_software_decode = true;
        assert_ne!(base, c);

        let mut c = base.clone();
        c.generic.screen_rotation = 90;
        assert_ne!(base, c);

        let mut c = base.clone();
        c.generic.feed_incomplete_frames = true;
        assert_ne!(base, c);
    }

    #[test]
    fn settings_handle_reads_are_snapshots() {
        let handle = settings_handle(StreamConfig::default());
        let before = handle.load_full();
        let mut updated = StreamConfig::default();
        updated.input_port = 5700;
        handle.store(Arc::new(updated));
        // The earlier snapshot is unaffected by the store.
        assert_eq!(before.input_port, DEFAULT_INPUT_PORT);
        assert_eq!(handle.load().input_port, 5700);
    }
}
