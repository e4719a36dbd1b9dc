//! Scalar head-pose signals derived from a single landmark frame.

use thiserror::Error;

use crate::landmarks::{LandmarkFrame, LandmarkScheme};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PoseError {
    #[error("malformed frame: landmark {index} missing ({available} points)")]
    MissingLandmark { index: usize, available: usize },
    #[error("malformed frame: landmark {index} has non-finite coordinates")]
    NonFinite { index: usize },
}

/// Pose signals for one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoseSignal {
    /// Nose-tip x minus the cheek midpoint x. Near zero when facing the
    /// camera; positive when the subject turns to their left.
    pub horizontal_offset: f32,
    /// Right-eye x minus left-eye x. Shrinks as the head rotates away from
    /// the camera and is unaffected by pure translation.
    pub yaw_proxy: f32,
}

/// Derive the pose signal for `frame` using the indices in `scheme`.
///
/// Fails with a [`PoseError`] (a malformed frame) when a required index is
/// absent or carries a non-finite coordinate.
pub fn estimate(frame: &LandmarkFrame, scheme: &LandmarkScheme) -> Result<PoseSignal, PoseError> {
    let x = |index: usize| -> Result<f32, PoseError> {
        let point = frame.point(index).ok_or(PoseError::MissingLandmark {
            index,
            available: frame.len(),
        })?;
        if !point.is_finite() {
            return Err(PoseError::NonFinite { index });
        }
        Ok(point.x)
    };

    let nose = x(scheme.nose_tip)?;
    let left_cheek = x(scheme.left_cheek)?;
    let right_cheek = x(scheme.right_cheek)?;
    let left_eye = x(scheme.left_eye_outer)?;
    let right_eye = x(scheme.right_eye_outer)?;
    // Forehead is not part of either signal but must be present for the
    // frame to count as a complete face.
    x(scheme.forehead)?;

    let face_center = (left_cheek + right_cheek) / 2.0;

    Ok(PoseSignal {
        horizontal_offset: nose - face_center,
        yaw_proxy: right_eye - left_eye,
    })
}
