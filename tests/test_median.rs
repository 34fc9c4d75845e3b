// tests/test_median.rs — integration tests for the CPU reference filter.
//
// These run with `cargo test --test test_median` and only use the crate's
// public API. GPU agreement tests live in the library's unit suites (they
// need subprocess isolation); everything here is device-free.

use median_pool::{median_filter_cpu, Error};

fn lcg_pixels(n: usize, mut seed: u32) -> Vec<u8> {
    (0..n)
        .map(|_| {
            seed = seed.wrapping_mul(1664525).wrapping_add(1013904223);
            (seed >> 24) as u8
        })
        .collect()
}

/// Full-sort reference, written independently of the crate internals.
fn naive_median(src: &[u8], w: usize, h: usize, k: u32) -> Vec<u8> {
    let half = (k / 2) as isize;
    let mut out = vec![0u8; w * h];
    for y in 0..h as isize {
        for x in 0..w as isize {
            let mut window = Vec::new();
            for dy in -half..=half {
                for dx in -half..=half {
                    let cx = (x + dx).clamp(0, w as isize - 1) as usize;
                    let cy = (y + dy).clamp(0, h as isize - 1) as usize;
                    window.push(src[cy * w + cx]);
                }
            }
            window.sort_unstable();
            out[y as usize * w + x as usize] = window[window.len() / 2];
        }
    }
    out
}

#[test]
fn matches_naive_reference_across_kernel_sizes() {
    let (w, h) = (20usize, 15usize);
    let src = lcg_pixels(w * h, 31337);
    for k in [3u32, 5, 7, 9, 11, 13] {
        let mut dst = vec![0u8; w * h];
        median_filter_cpu(&src, w as u32, h as u32, k, &mut dst).unwrap();
        assert_eq!(dst, naive_median(&src, w, h, k), "mismatch at k={k}");
    }
}

#[test]
fn flat_image_of_any_size_is_unchanged() {
    for (w, h) in [(4u32, 4u32), (5, 9), (33, 7), (64, 64)] {
        let src = vec![211u8; (w * h) as usize];
        let mut dst = vec![0u8; src.len()];
        median_filter_cpu(&src, w, h, 3, &mut dst).unwrap();
        assert_eq!(dst, src, "flat {w}×{h} changed");
    }
}

#[test]
fn constant_image_is_a_fixed_point_under_repeated_filtering() {
    let (w, h) = (16u32, 16u32);
    let src = vec![42u8; 256];
    let mut once = vec![0u8; 256];
    median_filter_cpu(&src, w, h, 5, &mut once).unwrap();
    let mut twice = vec![0u8; 256];
    median_filter_cpu(&once, w, h, 5, &mut twice).unwrap();
    assert_eq!(once, src);
    assert_eq!(twice, src);
}

#[test]
fn sparse_impulse_noise_is_removed() {
    let (w, h) = (24usize, 24usize);
    let mut src = vec![128u8; w * h];
    // Sparse impulses, pairwise farther apart than the window.
    for &(x, y, v) in &[(4usize, 4usize, 255u8), (12, 7, 0), (20, 18, 255), (6, 20, 0)] {
        src[y * w + x] = v;
    }
    let mut dst = vec![0u8; w * h];
    median_filter_cpu(&src, w as u32, h as u32, 3, &mut dst).unwrap();
    assert!(
        dst.iter().all(|&v| v == 128),
        "isolated impulses must not survive a 3×3 median"
    );
}

#[test]
fn narrow_column_borders_stay_in_bounds() {
    // Narrowest legal width for k=3: every window is clamped horizontally.
    let (w, h) = (4usize, 64usize);
    let src = lcg_pixels(w * h, 8);
    let mut dst = vec![0u8; w * h];
    median_filter_cpu(&src, w as u32, h as u32, 3, &mut dst).unwrap();
    assert_eq!(dst, naive_median(&src, w, h, 3));
}

#[test]
fn even_kernel_size_is_invalid() {
    let src = vec![0u8; 100];
    let mut dst = vec![0u8; 100];
    let err = median_filter_cpu(&src, 10, 10, 4, &mut dst).unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
}

#[test]
fn kernel_size_not_below_min_dimension_is_invalid() {
    let src = vec![0u8; 7 * 20];
    let mut dst = vec![0u8; 7 * 20];
    // min(7, 20) = 7, so k = 7 is already out.
    let err = median_filter_cpu(&src, 7, 20, 7, &mut dst).unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
    // k = 5 is fine.
    median_filter_cpu(&src, 7, 20, 5, &mut dst).unwrap();
}

#[test]
fn zero_dimensions_are_invalid() {
    let src = vec![0u8; 0];
    let mut dst = vec![0u8; 0];
    for (w, h) in [(0u32, 100u32), (100, 0), (0, 0)] {
        let err = median_filter_cpu(&src, w, h, 3, &mut dst).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)), "{w}×{h} accepted");
    }
}

#[test]
fn output_is_deterministic() {
    let (w, h) = (32u32, 32u32);
    let src = lcg_pixels(1024, 77);
    let mut a = vec![0u8; 1024];
    let mut b = vec![0u8; 1024];
    median_filter_cpu(&src, w, h, 5, &mut a).unwrap();
    median_filter_cpu(&src, w, h, 5, &mut b).unwrap();
    assert_eq!(a, b);
}
