//! Tensor-space augmentation for weak/strong view pairs
//!
//! Augmentations operate on a flattened CHW `f32` image so they apply to
//! decoded images and to pre-extracted `[D, 1, 1]` feature vectors alike.
//!
//! # Presets
//!
//! - **Weak**: horizontal flip plus a little jitter. Its prediction produces the
//!   pseudo-label.
//! - **Strong**: flip, brightness/contrast jitter, noise and cutout. The model is
//!   trained to match the weak-view pseudo-label on this view.

use rand::Rng;
use rand_chacha::ChaCha8Rng;

/// Configuration for one augmentation policy
#[derive(Clone, Debug)]
pub struct AugmentationConfig {
    /// Probability of a horizontal flip (0.0 - 1.0)
    pub horizontal_flip_prob: f32,
    /// Brightness shift range (±brightness_delta)
    pub brightness_delta: f32,
    /// Probability of a brightness shift
    pub brightness_prob: f32,
    /// Contrast scale range (1.0 ± contrast_delta)
    pub contrast_delta: f32,
    /// Probability of a contrast change
    pub contrast_prob: f32,
    /// Uniform noise amplitude (0.0 = disabled)
    pub noise_amplitude: f32,
    /// Probability of adding noise
    pub noise_prob: f32,
    /// Fraction of each spatial side covered by the cutout square (0.0 = disabled)
    pub cutout_fraction: f32,
    /// Probability of applying cutout
    pub cutout_prob: f32,
}

impl AugmentationConfig {
    /// The weak view
    pub fn weak() -> Self {
        Self {
            horizontal_flip_prob: 0.5,
            brightness_delta: 0.05,
            brightness_prob: 0.5,
            contrast_delta: 0.0,
            contrast_prob: 0.0,
            noise_amplitude: 0.0,
            noise_prob: 0.0,
            cutout_fraction: 0.0,
            cutout_prob: 0.0,
        }
    }

    /// The strong view
    pub fn strong() -> Self {
        Self {
            horizontal_flip_prob: 0.5,
            brightness_delta: 0.3,
            brightness_prob: 0.8,
            contrast_delta: 0.3,
            contrast_prob: 0.8,
            noise_amplitude: 0.1,
            noise_prob: 0.5,
            cutout_fraction: 0.5,
            cutout_prob: 0.5,
        }
    }

    /// Identity, used for evaluation
    pub fn none() -> Self {
        Self {
            horizontal_flip_prob: 0.0,
            brightness_delta: 0.0,
            brightness_prob: 0.0,
            contrast_delta: 0.0,
            contrast_prob: 0.0,
            noise_amplitude: 0.0,
            noise_prob: 0.0,
            cutout_fraction: 0.0,
            cutout_prob: 0.0,
        }
    }
}

/// Applies an [`AugmentationConfig`] to CHW images
#[derive(Clone, Debug)]
pub struct Augmenter {
    config: AugmentationConfig,
    shape: [usize; 3],
}

impl Augmenter {
    pub fn new(config: AugmentationConfig, shape: [usize; 3]) -> Self {
        Self { config, shape }
    }

    /// Return an augmented copy of `image`
    pub fn augment(&self, image: &[f32], rng: &mut ChaCha8Rng) -> Vec<f32> {
        let [channels, height, width] = self.shape;
        let mut out = image.to_vec();
        let cfg = &self.config;

        if width > 1 && rng.gen::<f32>() < cfg.horizontal_flip_prob {
            for c in 0..channels {
                for y in 0..height {
                    let row = c * height * width + y * width;
                    out[row..row + width].reverse();
                }
            }
        }

        if cfg.brightness_delta > 0.0 && rng.gen::<f32>() < cfg.brightness_prob {
            let delta = rng.gen_range(-cfg.brightness_delta..=cfg.brightness_delta);
            out.iter_mut().for_each(|v| *v += delta);
        }

        if cfg.contrast_delta > 0.0 && rng.gen::<f32>() < cfg.contrast_prob {
            let factor = 1.0 + rng.gen_range(-cfg.contrast_delta..=cfg.contrast_delta);
            let mean = out.iter().sum::<f32>() / out.len().max(1) as f32;
            out.iter_mut().for_each(|v| *v = mean + (*v - mean) * factor);
        }

        if cfg.noise_amplitude > 0.0 && rng.gen::<f32>() < cfg.noise_prob {
            for v in out.iter_mut() {
                *v += rng.gen_range(-cfg.noise_amplitude..=cfg.noise_amplitude);
            }
        }

        if cfg.cutout_fraction > 0.0 && rng.gen::<f32>() < cfg.cutout_prob {
            self.cutout(&mut out, rng);
        }

        out
    }

    /// Zero a square patch across all channels. For `[D, 1, 1]` inputs this drops
    /// a contiguous run of channels instead.
    fn cutout(&self, image: &mut [f32], rng: &mut ChaCha8Rng) {
        let [channels, height, width] = self.shape;

        if height == 1 && width == 1 {
            let len = ((channels as f32 * self.config.cutout_fraction) as usize).max(1);
            let start = rng.gen_range(0..=channels.saturating_sub(len));
            image[start..start + len].iter_mut().for_each(|v| *v = 0.0);
            return;
        }

        let side_h = ((height as f32 * self.config.cutout_fraction) as usize).max(1);
        let side_w = ((width as f32 * self.config.cutout_fraction) as usize).max(1);
        let y0 = rng.gen_range(0..=height - side_h);
        let x0 = rng.gen_range(0..=width - side_w);

        for c in 0..channels {
            for y in y0..y0 + side_h {
                let row = c * height * width + y * width;
                image[row + x0..row + x0 + side_w]
                    .iter_mut()
                    .for_each(|v| *v = 0.0);
            }
        }
    }
}
