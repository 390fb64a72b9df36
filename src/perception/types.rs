use serde::{Deserialize, Serialize};

use crate::perception::marks::Tag;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenshotMeta {
    pub original_width: u32,
    pub original_height: u32,
    /// Size after fitting into the pixel budget; what the model sees.
    pub resized_width: u32,
    pub resized_height: u32,
}

/// One look at the VM.
#[derive(Debug, Clone)]
pub struct Observation {
    pub screenshot: Vec<u8>,
    /// Present in set-of-marks mode.
    pub tags: Option<Vec<Tag>>,
}
