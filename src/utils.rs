use image::RgbImage;
use ndarray::ArrayViewMut3;

use crate::config::ChannelOrder;

/// Index of the largest value; the lowest index wins a tie.
pub fn argmax(row: &[f32]) -> usize {
    let mut max = f32::NEG_INFINITY;
    let mut index = 0;
    row.iter().enumerate().for_each(|(i, v)| {
        if *v > max {
            max = *v;
            index = i;
        }
    });
    index
}

/// Numerically stable softmax of one logits row.
pub fn softmax(row: &[f32]) -> Vec<f32> {
    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exp: Vec<f32> = row.iter().map(|v| (v - max).exp()).collect();
    let sum: f32 = exp.iter().sum();
    exp.into_iter().map(|v| v / sum).collect()
}

/// Write `img` into a `[channels, height, width]` view in `order`, mapping every sample through `f`.
pub fn write_chw(img: &RgbImage, mut out: ArrayViewMut3<f32>, order: ChannelOrder, f: impl Fn(u8) -> f32) {
    let planes = order.indices();
    img.enumerate_pixels().for_each(|(x, y, pixel)| {
        for (c, src) in planes.iter().enumerate() {
            out[[c, y as usize, x as usize]] = f(pixel.0[*src]);
        }
    });
}

/// Min/max of all samples of an image, for range normalisation.
pub fn sample_range(img: &RgbImage) -> (u8, u8) {
    img.as_raw().iter().fold((u8::MAX, u8::MIN), |(lo, hi), v| (lo.min(*v), hi.max(*v)))
}

#[cfg(test)]
mod test {
    use super::*;

    use image::Rgb;
    use ndarray::Array3;

    #[test]
    fn argmax_prefers_lowest_index_on_tie() {
        assert_eq!(argmax(&[0.1, 0.7, 0.7, 0.2]), 1);
        assert_eq!(argmax(&[3.0, 3.0]), 0);
    }

    #[test]
    fn softmax_sums_to_one_and_keeps_order() {
        let probs = softmax(&[1000.0, 1001.0, 999.0]);
        let total: f32 = probs.iter().sum();
        assert!((total - 1.0).abs() < 1e-5);
        assert_eq!(argmax(&probs), 1);
    }

    #[test]
    fn chw_layout() {
        let mut img = RgbImage::new(2, 1);
        img.put_pixel(1, 0, Rgb([10, 20, 30]));
        let mut out = Array3::<f32>::zeros((3, 1, 2));
        write_chw(&img, out.view_mut(), ChannelOrder::Rgb, |v| v as f32);
        assert_eq!(out[[0, 0, 1]], 10.0);
        assert_eq!(out[[2, 0, 1]], 30.0);
        assert_eq!(out[[1, 0, 0]], 0.0);
        assert_eq!(sample_range(&img), (0, 30));

        write_chw(&img, out.view_mut(), ChannelOrder::Bgr, |v| v as f32);
        assert_eq!(out[[0, 0, 1]], 30.0);
        assert_eq!(out[[1, 0, 1]], 20.0);
        assert_eq!(out[[2, 0, 1]], 10.0);
    }
}
