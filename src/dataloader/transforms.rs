use image::{imageops::FilterType, DynamicImage, GenericImageView, ImageBuffer, Rgb, RgbImage};
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use tch::{Kind, Tensor};

/// ImageNet channel statistics used by the default normalization.
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// A randomized image-space transform.
pub trait Transform {
    fn apply(&self, image: DynamicImage, rng: &mut dyn RngCore) -> DynamicImage;
}

pub struct Compose {
    transforms: Vec<Box<dyn Transform>>,
}

impl Compose {
    pub fn new(transforms: Vec<Box<dyn Transform>>) -> Self {
        Self { transforms }
    }

    pub fn apply(&self, mut image: DynamicImage, rng: &mut dyn RngCore) -> DynamicImage {
        for transform in &self.transforms {
            image = transform.apply(image, rng);
        }
        image
    }
}

/// Random brightness/contrast/saturation/hue perturbation.
///
/// Each delta defines a sampling range around the identity: a delta of
/// 0.5 means a factor drawn uniformly from [0.5, 1.5]. Hue is a shift
/// in degrees drawn from [-hue * 360, hue * 360]. A delta of 0.0
/// disables that component.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ColorJitter {
    pub brightness: f32,
    pub contrast: f32,
    pub saturation: f32,
    pub hue: f32,
}

impl Default for ColorJitter {
    fn default() -> Self {
        Self {
            brightness: 0.7,
            contrast: 0.5,
            saturation: 0.5,
            hue: 0.05,
        }
    }
}

impl Transform for ColorJitter {
    fn apply(&self, image: DynamicImage, rng: &mut dyn RngCore) -> DynamicImage {
        let mut rgb = image.to_rgb8();

        if self.brightness > 0.0 {
            let lo = (1.0 - self.brightness).max(0.0);
            let factor = rng.gen_range(lo..=1.0 + self.brightness);
            rgb = adjust_brightness(&rgb, factor);
        }

        if self.contrast > 0.0 {
            let lo = (1.0 - self.contrast).max(0.0);
            let factor = rng.gen_range(lo..=1.0 + self.contrast);
            rgb = adjust_contrast(&rgb, factor);
        }

        if self.saturation > 0.0 {
            let lo = (1.0 - self.saturation).max(0.0);
            let factor = rng.gen_range(lo..=1.0 + self.saturation);
            rgb = adjust_saturation(&rgb, factor);
        }

        if self.hue > 0.0 {
            let degrees = rng.gen_range(-self.hue * 360.0..=self.hue * 360.0);
            rgb = adjust_hue(&rgb, degrees);
        }

        DynamicImage::ImageRgb8(rgb)
    }
}

/// Occasional Gaussian blur with a random radius.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GaussianBlur {
    pub probability: f32,
    pub max_sigma: f32,
}

impl Default for GaussianBlur {
    fn default() -> Self {
        Self {
            probability: 0.1,
            max_sigma: 10.0,
        }
    }
}

impl Transform for GaussianBlur {
    fn apply(&self, image: DynamicImage, rng: &mut dyn RngCore) -> DynamicImage {
        if rng.gen::<f32>() <= self.probability {
            image.blur(rng.gen_range(0.0..self.max_sigma))
        } else {
            image
        }
    }
}

/// Per-channel normalization applied after tensor conversion.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Normalize {
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

impl Normalize {
    pub fn imagenet() -> Self {
        Self {
            mean: IMAGENET_MEAN,
            std: IMAGENET_STD,
        }
    }

    pub fn apply(&self, image: &Tensor) -> Tensor {
        let mean = Tensor::from_slice(&self.mean).view([3, 1, 1]).to_device(image.device());
        let std = Tensor::from_slice(&self.std).view([3, 1, 1]).to_device(image.device());

        (image - mean) / std
    }
}

/// Post-processing applied to the image after the geometric
/// augmentation: randomized color transforms, tensor conversion,
/// then normalization.
pub struct PostTransform {
    pub color: Compose,
    pub normalize: Option<Normalize>,
}

impl Default for PostTransform {
    fn default() -> Self {
        Self {
            color: Compose::new(vec![Box::new(ColorJitter::default())]),
            normalize: Some(Normalize::imagenet()),
        }
    }
}

impl PostTransform {
    pub fn apply(&self, image: &DynamicImage, rng: &mut dyn RngCore) -> Tensor {
        let image = self.color.apply(image.clone(), rng);
        let tensor = to_tensor(&image);
        match &self.normalize {
            Some(normalize) => normalize.apply(&tensor),
            None => tensor,
        }
    }
}

/// Converts an image to a (3, H, W) float tensor in [0, 1].
pub fn to_tensor(image: &DynamicImage) -> Tensor {
    let rgb = image.to_rgb8();
    let (width, height) = rgb.dimensions();
    let mut data = Vec::with_capacity(3 * height as usize * width as usize);

    // CHW layout
    for c in 0..3 {
        for y in 0..height {
            for x in 0..width {
                data.push(rgb.get_pixel(x, y)[c] as f32 / 255.0);
            }
        }
    }

    Tensor::from_slice(&data).view([3, height as i64, width as i64])
}

/// Converts a mask image to a (1, H, W) float tensor in [0, 1].
pub fn mask_to_tensor(mask: &DynamicImage) -> Tensor {
    let gray = mask.to_luma8();
    let (width, height) = gray.dimensions();
    let mut data = Vec::with_capacity(height as usize * width as usize);

    for y in 0..height {
        for x in 0..width {
            data.push(gray.get_pixel(x, y)[0] as f32 / 255.0);
        }
    }

    Tensor::from_slice(&data).view([1, height as i64, width as i64])
}

/// Thresholds a mask tensor at 0.5 into a strict {0, 1} tensor.
pub fn binarize(mask: &Tensor) -> Tensor {
    mask.gt(0.5).to_kind(Kind::Float)
}

/// Resizes so the smaller edge becomes `size`, preserving aspect
/// ratio, with a bicubic filter.
pub fn resize_min_edge(image: &DynamicImage, size: u32) -> DynamicImage {
    let (width, height) = image.dimensions();
    let (new_width, new_height) = if width <= height {
        (size, (height as f32 * size as f32 / width as f32).round() as u32)
    } else {
        ((width as f32 * size as f32 / height as f32).round() as u32, size)
    };

    image.resize_exact(new_width, new_height, FilterType::CatmullRom)
}

/// Uniform scale about the image center, keeping the output size equal
/// to the input size. Pixels mapped from outside the frame are black.
pub fn affine_scale(image: &DynamicImage, scale: f32) -> DynamicImage {
    let rgb = image.to_rgb8();
    let (width, height) = rgb.dimensions();
    let cx = width as f32 / 2.0;
    let cy = height as f32 / 2.0;

    let mut output = ImageBuffer::new(width, height);

    for y in 0..height {
        for x in 0..width {
            // Inverse mapping: output pixel -> source coordinate
            let src_x = cx + (x as f32 - cx) / scale;
            let src_y = cy + (y as f32 - cy) / scale;
            output.put_pixel(x, y, bilinear_sample(&rgb, src_x, src_y));
        }
    }

    DynamicImage::ImageRgb8(output)
}

fn bilinear_sample(image: &RgbImage, x: f32, y: f32) -> Rgb<u8> {
    let (width, height) = image.dimensions();

    if x < 0.0 || y < 0.0 || x > width as f32 - 1.0 || y > height as f32 - 1.0 {
        return Rgb([0, 0, 0]);
    }

    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(width - 1);
    let y1 = (y0 + 1).min(height - 1);

    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let p00 = image.get_pixel(x0, y0);
    let p10 = image.get_pixel(x1, y0);
    let p01 = image.get_pixel(x0, y1);
    let p11 = image.get_pixel(x1, y1);

    let mut result = [0u8; 3];
    for c in 0..3 {
        let value = p00[c] as f32 * (1.0 - fx) * (1.0 - fy)
            + p10[c] as f32 * fx * (1.0 - fy)
            + p01[c] as f32 * (1.0 - fx) * fy
            + p11[c] as f32 * fx * fy;
        result[c] = value.round().clamp(0.0, 255.0) as u8;
    }

    Rgb(result)
}

fn adjust_brightness(image: &RgbImage, factor: f32) -> RgbImage {
    let (width, height) = image.dimensions();
    let mut output = ImageBuffer::new(width, height);

    for (x, y, pixel) in image.enumerate_pixels() {
        let r = (pixel[0] as f32 * factor).clamp(0.0, 255.0) as u8;
        let g = (pixel[1] as f32 * factor).clamp(0.0, 255.0) as u8;
        let b = (pixel[2] as f32 * factor).clamp(0.0, 255.0) as u8;
        output.put_pixel(x, y, Rgb([r, g, b]));
    }

    output
}

fn adjust_contrast(image: &RgbImage, factor: f32) -> RgbImage {
    let (width, height) = image.dimensions();

    let mut sum = 0.0f64;
    for pixel in image.pixels() {
        sum += luminance(pixel) as f64;
    }
    let mean = (sum / (width as f64 * height as f64)) as f32;

    let mut output = ImageBuffer::new(width, height);

    for (x, y, pixel) in image.enumerate_pixels() {
        let r = (mean + factor * (pixel[0] as f32 - mean)).clamp(0.0, 255.0) as u8;
        let g = (mean + factor * (pixel[1] as f32 - mean)).clamp(0.0, 255.0) as u8;
        let b = (mean + factor * (pixel[2] as f32 - mean)).clamp(0.0, 255.0) as u8;
        output.put_pixel(x, y, Rgb([r, g, b]));
    }

    output
}

fn adjust_saturation(image: &RgbImage, factor: f32) -> RgbImage {
    let (width, height) = image.dimensions();
    let mut output = ImageBuffer::new(width, height);

    for (x, y, pixel) in image.enumerate_pixels() {
        let gray = luminance(pixel);
        let r = (gray + factor * (pixel[0] as f32 - gray)).clamp(0.0, 255.0) as u8;
        let g = (gray + factor * (pixel[1] as f32 - gray)).clamp(0.0, 255.0) as u8;
        let b = (gray + factor * (pixel[2] as f32 - gray)).clamp(0.0, 255.0) as u8;
        output.put_pixel(x, y, Rgb([r, g, b]));
    }

    output
}

fn adjust_hue(image: &RgbImage, degrees: f32) -> RgbImage {
    let (width, height) = image.dimensions();
    let mut output = ImageBuffer::new(width, height);

    for (x, y, pixel) in image.enumerate_pixels() {
        let (h, s, v) = rgb_to_hsv(
            pixel[0] as f32 / 255.0,
            pixel[1] as f32 / 255.0,
            pixel[2] as f32 / 255.0,
        );
        let h = (h + degrees).rem_euclid(360.0);
        let (r, g, b) = hsv_to_rgb(h, s, v);
        output.put_pixel(
            x,
            y,
            Rgb([
                (r * 255.0).round().clamp(0.0, 255.0) as u8,
                (g * 255.0).round().clamp(0.0, 255.0) as u8,
                (b * 255.0).round().clamp(0.0, 255.0) as u8,
            ]),
        );
    }

    output
}

fn luminance(pixel: &Rgb<u8>) -> f32 {
    0.299 * pixel[0] as f32 + 0.587 * pixel[1] as f32 + 0.114 * pixel[2] as f32
}

fn rgb_to_hsv(r: f32, g: f32, b: f32) -> (f32, f32, f32) {
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;

    let h = if delta == 0.0 {
        0.0
    } else if max == r {
        60.0 * ((g - b) / delta).rem_euclid(6.0)
    } else if max == g {
        60.0 * ((b - r) / delta + 2.0)
    } else {
        60.0 * ((r - g) / delta + 4.0)
    };

    let s = if max == 0.0 { 0.0 } else { delta / max };
    (h, s, max)
}

fn hsv_to_rgb(h: f32, s: f32, v: f32) -> (f32, f32, f32) {
    let c = v * s;
    let hp = h / 60.0;
    let x = c * (1.0 - (hp % 2.0 - 1.0).abs());

    let (r, g, b) = match hp as u32 {
        0 => (c, x, 0.0),
        1 => (x, c, 0.0),
        2 => (0.0, c, x),
        3 => (0.0, x, c),
        4 => (x, 0.0, c),
        _ => (c, 0.0, x),
    };

    let m = v - c;
    (r + m, g + m, b + m)
}
