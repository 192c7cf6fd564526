use serde::{Deserialize, Serialize};

use super::Identity;

/// Face region in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

/// How the backend scored a face. Remote services report a confidence,
/// the local matcher reports an embedding distance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "value")]
pub enum MatchScore {
    Confidence(f32),
    Distance(f32),
}

/// One detected face in one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchResult {
    pub bounding_box: BoundingBox,
    /// `None` means the face was detected but labelled unknown.
    pub identity: Option<Identity>,
    pub score: MatchScore,
}

impl MatchResult {
    pub fn recognized(&self) -> bool {
        self.identity.is_some()
    }

    pub fn label(&self) -> &str {
        self.identity
            .as_ref()
            .map(|identity| identity.display_name.as_str())
            .unwrap_or("Unknown")
    }
}
