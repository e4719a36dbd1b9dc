//! Landmark frames as delivered by the external landmark provider.
//!
//! Coordinates are normalised to `[0, 1]` in unmirrored sensor space: `x`
//! grows toward the right edge of the raw camera image, which is the
//! subject's own left side.

use serde::{Deserialize, Serialize};

/// A single facial keypoint. `z` is the optional relative depth some
/// providers emit; it is carried but never consumed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawPoint")]
pub struct Point {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y, z: 0.0 }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

/// Accepted wire shapes: `[x, y]`, `[x, y, z]` or `{ "x": .., "y": .., "z": .. }`.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawPoint {
    Xy([f32; 2]),
    Xyz([f32; 3]),
    Named {
        x: f32,
        y: f32,
        #[serde(default)]
        z: f32,
    },
}

impl From<RawPoint> for Point {
    fn from(raw: RawPoint) -> Self {
        match raw {
            RawPoint::Xy([x, y]) => Self { x, y, z: 0.0 },
            RawPoint::Xyz([x, y, z]) => Self { x, y, z },
            RawPoint::Named { x, y, z } => Self { x, y, z },
        }
    }
}

/// One detected face: keypoints indexed by the provider's anatomical scheme.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LandmarkFrame {
    points: Vec<Point>,
}

impl LandmarkFrame {
    pub fn new(points: Vec<Point>) -> Self {
        Self { points }
    }

    pub fn point(&self, index: usize) -> Option<Point> {
        self.points.get(index).copied()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Indices of the keypoints the pose estimator reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LandmarkScheme {
    pub nose_tip: usize,
    pub left_cheek: usize,
    pub right_cheek: usize,
    pub left_eye_outer: usize,
    pub right_eye_outer: usize,
    pub forehead: usize,
}

impl LandmarkScheme {
    /// MediaPipe Face Mesh (468/478 point) topology.
    pub const MEDIAPIPE_FACE_MESH: Self = Self {
        nose_tip: 1,
        left_cheek: 234,
        right_cheek: 454,
        left_eye_outer: 33,
        right_eye_outer: 263,
        forehead: 10,
    };

    /// Highest index this scheme reads; a frame needs `max_index() + 1` points.
    pub fn max_index(&self) -> usize {
        [
            self.nose_tip,
            self.left_cheek,
            self.right_cheek,
            self.left_eye_outer,
            self.right_eye_outer,
            self.forehead,
        ]
        .into_iter()
        .max()
        .unwrap_or(0)
    }
}

impl Default for LandmarkScheme {
    fn default() -> Self {
        Self::MEDIAPIPE_FACE_MESH
    }
}

/// What the landmark provider reported for one video frame.
#[derive(Debug, Clone, PartialEq)]
pub enum FaceObservation {
    None,
    Single(LandmarkFrame),
    Multiple(Vec<LandmarkFrame>),
}

impl FaceObservation {
    pub fn from_faces(mut faces: Vec<LandmarkFrame>) -> Self {
        match faces.len() {
            0 => Self::None,
            1 => Self::Single(faces.remove(0)),
            _ => Self::Multiple(faces),
        }
    }

    pub fn face_count(&self) -> usize {
        match self {
            Self::None => 0,
            Self::Single(_) => 1,
            Self::Multiple(faces) => faces.len(),
        }
    }
}

/// JSON frame payload shared by the daemon and the replay tool.
///
/// ```json
/// { "timestamp_ms": 1200, "faces": [[[0.5, 0.4], [0.51, 0.42, -0.01]]] }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FramePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp_ms: Option<u64>,
    #[serde(default)]
    pub faces: Vec<LandmarkFrame>,
}

impl FramePayload {
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    pub fn into_observation(self) -> FaceObservation {
        FaceObservation::from_faces(self.faces)
    }
}
