use image::{DynamicImage, Rgb, RgbImage};
use imageproc::filter::gaussian_blur_f32;
use micrograph_focus_stack::{focus_stack, FocusStackConfig};

const WIDTH: u32 = 64;
const HEIGHT: u32 = 32;

/// Vertical stripes, 4 px wide
fn specimen() -> RgbImage {
    RgbImage::from_fn(WIDTH, HEIGHT, |x, _| {
        if (x / 4) % 2 == 0 {
            Rgb([40, 40, 40])
        } else {
            Rgb([210, 210, 210])
        }
    })
}

/// The specimen with only the columns in `sharp` in focus
fn focused_on(sharp: std::ops::Range<u32>) -> DynamicImage {
    let original = specimen();
    let blurred = gaussian_blur_f32(&original, 2.0);
    DynamicImage::ImageRgb8(RgbImage::from_fn(WIDTH, HEIGHT, |x, y| {
        if sharp.contains(&x) {
            *original.get_pixel(x, y)
        } else {
            *blurred.get_pixel(x, y)
        }
    }))
}

fn mean_abs_error(img: &DynamicImage, reference: &RgbImage) -> f64 {
    let img = img.to_rgb8();
    let total: u64 = img
        .pixels()
        .zip(reference.pixels())
        .map(|(a, b)| u64::from(a.0[0].abs_diff(b.0[0])))
        .sum();
    total as f64 / f64::from(WIDTH * HEIGHT)
}

#[test]
fn test_stack_recovers_detail_from_both_halves() {
    let left = focused_on(0..WIDTH / 2);
    let right = focused_on(WIDTH / 2..WIDTH);
    let reference = specimen();

    let stacked = focus_stack(&[&left, &right], &FocusStackConfig::default()).unwrap();

    let stacked_error = mean_abs_error(&stacked, &reference);
    let left_error = mean_abs_error(&left, &reference);
    let right_error = mean_abs_error(&right, &reference);
    println!(
        "MAE: stacked {:.2}, left-focused {:.2}, right-focused {:.2}",
        stacked_error, left_error, right_error
    );

    assert!(stacked_error < left_error);
    assert!(stacked_error < right_error);
}
