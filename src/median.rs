// median.rs — CPU reference median filter.
//
// This is the authoritative implementation: the GPU kernel in gpu/kernel.rs
// is validated against it pixel-for-pixel. Both use the same strategy split:
//
//   k ≤ 7   — gather the window into a small array and partial-select the
//             middle element. At ≤49 taps this beats a histogram.
//   k > 7   — 256-bin histogram per window, cumulative scan to the middle.
//             Pixel values are bounded 8-bit, so selection is O(k² + 256)
//             instead of O(k² log k²) for a sort.
//
// Both return the exact value a full sort would. k is odd, so k² is odd and
// the median is always a single input sample — no averaging, no rounding.
//
// BORDER HANDLING: clamp (replicate edge pixels), same as the convolution
// kernels this crate's layout descends from. Output dimensions equal input
// dimensions and no padded copy is allocated.

use crate::error::{Error, Result};

/// Largest kernel size that uses the selection-sort strategy; larger
/// windows switch to the histogram scan. The GPU shader uses the same
/// boundary so the two paths stay structurally identical.
pub const SMALL_KERNEL_MAX: u32 = 7;

const SMALL_KERNEL_TAPS: usize = (SMALL_KERNEL_MAX * SMALL_KERNEL_MAX) as usize;

/// Validate one filter request. Shared by the CPU and GPU paths so both
/// reject exactly the same inputs, before any work is done.
///
/// Rules:
/// - `width` and `height` must be nonzero.
/// - `kernel_size` must be odd, ≥3, and strictly less than the smaller
///   image dimension (a window as large as the image has no interior).
/// - `src_len` and `dst_len` must both equal `width * height`.
pub(crate) fn validate(
    src_len: usize,
    width: u32,
    height: u32,
    kernel_size: u32,
    dst_len: usize,
) -> Result<()> {
    if width == 0 || height == 0 {
        return Err(Error::InvalidArgument(format!(
            "image dimensions must be positive (got {width}×{height})"
        )));
    }
    if kernel_size < 3 || kernel_size % 2 == 0 {
        return Err(Error::InvalidArgument(format!(
            "kernel size must be an odd integer ≥3 (got {kernel_size})"
        )));
    }
    if kernel_size >= width.min(height) {
        return Err(Error::InvalidArgument(format!(
            "kernel size {kernel_size} must be smaller than min({width}, {height})"
        )));
    }
    let expected = width as usize * height as usize;
    if src_len != expected {
        return Err(Error::InvalidArgument(format!(
            "source length {src_len} does not match {width}×{height} = {expected}"
        )));
    }
    if dst_len != expected {
        return Err(Error::InvalidArgument(format!(
            "destination length {dst_len} does not match {width}×{height} = {expected}"
        )));
    }
    Ok(())
}

/// Windowed median filter over row-major 8-bit grayscale pixels.
///
/// Replaces every pixel with the median of the `kernel_size × kernel_size`
/// neighborhood centered on it. Windows extending past the image edge are
/// clamped to the nearest valid row/column.
///
/// `dst` is only written after validation succeeds; on error it is
/// untouched.
pub fn median_filter(
    src: &[u8],
    width: u32,
    height: u32,
    kernel_size: u32,
    dst: &mut [u8],
) -> Result<()> {
    validate(src.len(), width, height, kernel_size, dst.len())?;

    let w = width as usize;
    let h = height as usize;
    let half = (kernel_size / 2) as isize;

    for y in 0..h {
        for x in 0..w {
            let m = if kernel_size <= SMALL_KERNEL_MAX {
                window_median_select(src, w, h, x, y, half)
            } else {
                window_median_hist(src, w, h, x, y, half, kernel_size)
            };
            dst[y * w + x] = m;
        }
    }
    Ok(())
}

#[inline]
fn clamped_pixel(src: &[u8], w: usize, h: usize, x: isize, y: isize) -> u8 {
    let cx = x.clamp(0, (w - 1) as isize) as usize;
    let cy = y.clamp(0, (h - 1) as isize) as usize;
    src[cy * w + cx]
}

/// Median by partial selection sort. Only the positions up to the middle
/// need to reach their sorted value, so the scan stops there.
fn window_median_select(src: &[u8], w: usize, h: usize, x: usize, y: usize, half: isize) -> u8 {
    let mut window = [0u8; SMALL_KERNEL_TAPS];
    let mut n = 0usize;
    for dy in -half..=half {
        for dx in -half..=half {
            window[n] = clamped_pixel(src, w, h, x as isize + dx, y as isize + dy);
            n += 1;
        }
    }

    let mid = n / 2;
    for i in 0..=mid {
        let mut min_j = i;
        for j in (i + 1)..n {
            if window[j] < window[min_j] {
                min_j = j;
            }
        }
        window.swap(i, min_j);
    }
    window[mid]
}

/// Median by histogram scan: count the window into 256 bins, then walk the
/// bins until the cumulative count covers the middle sample.
fn window_median_hist(
    src: &[u8],
    w: usize,
    h: usize,
    x: usize,
    y: usize,
    half: isize,
    kernel_size: u32,
) -> u8 {
    let mut hist = [0u32; 256];
    for dy in -half..=half {
        for dx in -half..=half {
            let v = clamped_pixel(src, w, h, x as isize + dx, y as isize + dy);
            hist[v as usize] += 1;
        }
    }

    // k² is odd; the median is the first bin whose cumulative count
    // reaches k²/2 + 1.
    let target = kernel_size * kernel_size / 2 + 1;
    let mut cum = 0u32;
    for (bin, &count) in hist.iter().enumerate() {
        cum += count;
        if cum >= target {
            return bin as u8;
        }
    }
    unreachable!("cumulative count must reach the window size")
}
