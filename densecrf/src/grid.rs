//! CRFs over the pixels of a `width x height` image.
//!
//! Node `y * width + x` is the pixel at column `x`, row `y`. The two constructors below
//! scale pixel coordinates (and colours) by the inverse of their standard deviations so
//! that the unit Gaussian kernel of [`crate::FeaturePotential`] has the requested
//! bandwidth.

use std::ops::{Deref, DerefMut};

use crate::{Compatibility, CrfError, CrfResult, DenseCrf};

fn check_sigmas(sigmas: &[f32]) -> CrfResult<()> {
    match sigmas.iter().find(|s| !(s.is_finite() && **s > 0.0)) {
        Some(s) => Err(CrfError::ParameterError(format!(
            "standard deviations must be finite and positive, got {}",
            s
        ))),
        None => Ok(()),
    }
}

/// Features `(x / sx, y / sy)` of every pixel, row-major.
pub fn spatial_features(width: usize, height: usize, sx: f32, sy: f32) -> CrfResult<Vec<f32>> {
    check_sigmas(&[sx, sy])?;
    let mut features = Vec::with_capacity(width * height * 2);
    for y in 0..height {
        for x in 0..width {
            features.push(x as f32 / sx);
            features.push(y as f32 / sy);
        }
    }
    Ok(features)
}

/// Features `(x / sx, y / sy, r / sr, g / sg, b / sb)` of every pixel of an interleaved
/// RGB `image`.
#[allow(clippy::too_many_arguments)]
pub fn bilateral_features(
    width: usize,
    height: usize,
    sx: f32,
    sy: f32,
    sr: f32,
    sg: f32,
    sb: f32,
    image: &[u8],
) -> CrfResult<Vec<f32>> {
    check_sigmas(&[sx, sy, sr, sg, sb])?;
    if image.len() != width * height * 3 {
        return Err(CrfError::ParameterError(format!(
            "a {}x{} RGB image has {} bytes, got {}",
            width,
            height,
            width * height * 3,
            image.len()
        )));
    }
    let features = image
        .chunks_exact(3)
        .enumerate()
        .flat_map(|(i, rgb)| {
            let (x, y) = (i % width, i / width);
            [
                x as f32 / sx,
                y as f32 / sy,
                rgb[0] as f32 / sr,
                rgb[1] as f32 / sg,
                rgb[2] as f32 / sb,
            ]
        })
        .collect();
    Ok(features)
}

/// A [`DenseCrf`] whose nodes are the pixels of an image. Derefs to the engine for
/// everything that is not image specific.
#[derive(Debug)]
pub struct DenseCrf2D {
    crf: DenseCrf,
    width: usize,
    height: usize,
}

impl DenseCrf2D {
    pub fn new(width: usize, height: usize, n_labels: usize) -> CrfResult<Self> {
        let n_nodes = width.checked_mul(height).ok_or_else(|| {
            CrfError::ParameterError(format!("a {}x{} grid is too large", width, height))
        })?;
        Ok(DenseCrf2D {
            crf: DenseCrf::new(n_nodes, n_labels)?,
            width,
            height,
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Smoothness term: nearby pixels prefer the same label.
    pub fn add_pairwise_gaussian(
        &mut self,
        sx: f32,
        sy: f32,
        weight: f32,
        compatibility: Option<Box<dyn Compatibility>>,
    ) -> CrfResult<()> {
        let features = spatial_features(self.width, self.height, sx, sy)?;
        self.crf
            .add_pairwise_energy(&features, 2, weight, compatibility)
    }

    /// Appearance term: nearby pixels of similar colour prefer the same label.
    #[allow(clippy::too_many_arguments)]
    pub fn add_pairwise_bilateral(
        &mut self,
        sx: f32,
        sy: f32,
        sr: f32,
        sg: f32,
        sb: f32,
        image: &[u8],
        weight: f32,
        compatibility: Option<Box<dyn Compatibility>>,
    ) -> CrfResult<()> {
        let features = bilateral_features(self.width, self.height, sx, sy, sr, sg, sb, image)?;
        self.crf
            .add_pairwise_energy(&features, 5, weight, compatibility)
    }

    pub fn into_inner(self) -> DenseCrf {
        self.crf
    }
}

impl Deref for DenseCrf2D {
    type Target = DenseCrf;

    fn deref(&self) -> &DenseCrf {
        &self.crf
    }
}

impl DerefMut for DenseCrf2D {
    fn deref_mut(&mut self) -> &mut DenseCrf {
        &mut self.crf
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::{testing::init_tracing, InferenceState, Label};

    /// A `width x height` image, red on the left half and blue on the right half.
    fn two_tone_image(width: usize, height: usize) -> Vec<u8> {
        (0..width * height)
            .flat_map(|i| {
                if i % width < width / 2 {
                    [255, 0, 0]
                } else {
                    [0, 0, 255]
                }
            })
            .collect()
    }

    /// Unaries agreeing with the two halves, except for a vertical band of flipped
    /// pixels on each side.
    fn noisy_unary(width: usize, height: usize) -> Vec<f32> {
        (0..width * height)
            .flat_map(|i| {
                let x = i % width;
                let left = x < width / 2;
                let flipped = x == 2 || x == width - 3;
                if left != flipped {
                    [0.0, 0.3]
                } else {
                    [0.3, 0.0]
                }
            })
            .collect()
    }

    #[test]
    fn test_spatial_features_layout() -> anyhow::Result<()> {
        let features = spatial_features(3, 2, 1.0, 2.0)?;
        assert_eq!(features.len(), 12);
        // Pixel (x = 2, y = 1) is node 5.
        assert_eq!(&features[10..12], &[2.0, 0.5]);
        Ok(())
    }

    #[test]
    fn test_bilateral_features_layout() -> anyhow::Result<()> {
        let image = [10, 20, 30, 40, 50, 60];
        let features = bilateral_features(2, 1, 1.0, 1.0, 10.0, 10.0, 10.0, &image)?;
        assert_eq!(features, vec![0.0, 0.0, 1.0, 2.0, 3.0, 1.0, 0.0, 4.0, 5.0, 6.0]);
        Ok(())
    }

    #[rstest]
    #[case(0.0)]
    #[case(-3.0)]
    #[case(f32::NAN)]
    fn test_rejects_bad_sigma(#[case] sigma: f32) {
        assert!(spatial_features(2, 2, sigma, 1.0).is_err());
        assert!(bilateral_features(2, 2, 1.0, 1.0, 1.0, sigma, 1.0, &[0; 12]).is_err());
    }

    #[test]
    fn test_rejects_wrong_image_size() -> anyhow::Result<()> {
        let mut crf = DenseCrf2D::new(4, 4, 2)?;
        crf.set_unary(&[0.0; 32])?;
        let result = crf.add_pairwise_bilateral(1.0, 1.0, 1.0, 1.0, 1.0, &[0; 47], 1.0, None);
        assert!(matches!(result, Err(CrfError::ParameterError(_))));
        assert_eq!(crf.n_pairwise(), 0);
        Ok(())
    }

    #[test]
    fn test_derefs_to_engine() -> anyhow::Result<()> {
        let mut crf = DenseCrf2D::new(5, 3, 4)?;
        assert_eq!((crf.width(), crf.height()), (5, 3));
        assert_eq!(crf.n_nodes(), 15);
        assert_eq!(crf.n_labels(), 4);
        assert_eq!(crf.state(), InferenceState::Unconfigured);
        crf.set_unary(&[0.0; 60])?;
        crf.add_pairwise_gaussian(3.0, 3.0, 3.0, None)?;
        let engine = crf.into_inner();
        assert_eq!(engine.n_pairwise(), 1);
        Ok(())
    }

    #[test]
    fn test_smoothing_removes_flipped_bands() -> anyhow::Result<()> {
        init_tracing();
        let (width, height) = (16, 8);
        let unary = noisy_unary(width, height);
        let image = two_tone_image(width, height);
        let expected: Vec<Label> = (0..width * height)
            .map(|i| if i % width < width / 2 { 0 } else { 1 })
            .collect();

        let mut crf = DenseCrf2D::new(width, height, 2)?;
        crf.set_unary(&unary)?;
        assert_ne!(crf.decode(0, 1.0)?, expected);

        crf.add_pairwise_gaussian(3.0, 3.0, 3.0, None)?;
        crf.add_pairwise_bilateral(5.0, 5.0, 20.0, 20.0, 20.0, &image, 5.0, None)?;
        assert_eq!(crf.decode(10, 1.0)?, expected);
        Ok(())
    }
}
