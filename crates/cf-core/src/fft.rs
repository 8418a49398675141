//! Radix-2 Cooley-Tukey FFT over `Complex64`, in place.
//!
//! Callers pad to a power of two. Forward is unscaled; inverse scales by 1/n,
//! so `ifft(fft(x)) == x`.

use std::f64::consts::PI;

use num_complex::Complex64;

/// Smallest power of two ≥ `n` (1 for 0).
pub fn padded_len(n: usize) -> usize {
    n.max(1).next_power_of_two()
}

/// In-place forward transform. `data.len()` must be a power of two.
pub fn fft(data: &mut [Complex64]) {
    let n = data.len();
    debug_assert!(n.is_power_of_two(), "FFT size must be a power of 2");
    if n <= 1 {
        return;
    }
    bit_reverse_permute(data);

    let mut stage_len = 2;
    while stage_len <= n {
        let half = stage_len / 2;
        let step = Complex64::from_polar(1.0, -2.0 * PI / stage_len as f64);
        for k in (0..n).step_by(stage_len) {
            let mut w = Complex64::new(1.0, 0.0);
            for j in 0..half {
                let even = data[k + j];
                let odd = data[k + j + half] * w;
                data[k + j] = even + odd;
                data[k + j + half] = even - odd;
                w *= step;
            }
        }
        stage_len *= 2;
    }
}

/// In-place inverse transform via conjugation.
pub fn ifft(data: &mut [Complex64]) {
    let n = data.len();
    if n <= 1 {
        return;
    }
    for z in data.iter_mut() {
        *z = z.conj();
    }
    fft(data);
    let scale = 1.0 / n as f64;
    for z in data.iter_mut() {
        *z = z.conj() * scale;
    }
}

/// Normalized frequency of bin `k` in an `n`-point transform, in `[0, ½]`.
pub fn bin_frequency(k: usize, n: usize) -> f64 {
    if n == 0 {
        return 0.0;
    }
    k.min(n - k) as f64 / n as f64
}

fn bit_reverse_permute(data: &mut [Complex64]) {
    let n = data.len();
    let bits = n.trailing_zeros();
    for i in 0..n {
        let j = (i as u32).reverse_bits().checked_shr(32 - bits).unwrap_or(0) as usize;
        if i < j {
            data.swap(i, j);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_impulse_is_flat() {
        let mut data = vec![Complex64::new(0.0, 0.0); 8];
        data[0] = Complex64::new(1.0, 0.0);
        fft(&mut data);
        for z in &data {
            assert_relative_eq!(z.re, 1.0, epsilon = 1e-12);
            assert_relative_eq!(z.im, 0.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_single_tone_lands_in_one_bin() {
        let n = 16;
        let mut data: Vec<Complex64> = (0..n)
            .map(|t| Complex64::from_polar(1.0, 2.0 * PI * 3.0 * t as f64 / n as f64))
            .collect();
        fft(&mut data);
        for (k, z) in data.iter().enumerate() {
            let expected = if k == 3 { n as f64 } else { 0.0 };
            assert_relative_eq!(z.norm(), expected, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_inverse_and_parseval() {
        let original: Vec<Complex64> = (0..32)
            .map(|i| Complex64::new((i as f64 * 0.7).sin(), (i as f64 * 1.3).cos()))
            .collect();
        let mut data = original.clone();
        fft(&mut data);
        let time_energy: f64 = original.iter().map(|z| z.norm_sqr()).sum();
        let freq_energy: f64 = data.iter().map(|z| z.norm_sqr()).sum::<f64>() / 32.0;
        assert_relative_eq!(time_energy, freq_energy, epsilon = 1e-9);

        ifft(&mut data);
        for (a, b) in data.iter().zip(&original) {
            assert_relative_eq!(a.re, b.re, epsilon = 1e-12);
            assert_relative_eq!(a.im, b.im, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_bin_frequency_is_symmetric() {
        assert_eq!(bin_frequency(0, 8), 0.0);
        assert_eq!(bin_frequency(1, 8), bin_frequency(7, 8));
        assert_eq!(bin_frequency(4, 8), 0.5);
        assert_eq!(padded_len(0), 1);
        assert_eq!(padded_len(5), 8);
    }
}
