//! Small numeric helpers shared by every stage.

/// Index of the value in the sorted `data` closest to `point`.
///
/// Queries below the first or above the last element clamp to the
/// endpoints. Ties go to the larger index. Returns 0 for an empty slice.
///
/// Example:
/// ```
/// use unidec::utils::nearfast;
///
/// let data = [1.0, 2.0, 4.0];
/// assert_eq!(nearfast(&data, 2.9), 1);
/// assert_eq!(nearfast(&data, 3.0), 2);
/// assert_eq!(nearfast(&data, -10.0), 0);
/// assert_eq!(nearfast(&data, 10.0), 2);
/// ```
pub fn nearfast(data: &[f32], point: f32) -> usize {
    if data.is_empty() {
        return 0;
    }
    let upper = data.partition_point(|&x| x < point);
    if upper == 0 {
        return 0;
    }
    if upper >= data.len() {
        return data.len() - 1;
    }
    let lower = upper - 1;
    if (point - data[lower]).abs() >= (data[upper] - point).abs() {
        upper
    } else {
        lower
    }
}

pub fn max(data: &[f32]) -> f32 {
    data.iter().copied().fold(0.0, f32::max)
}

pub fn min(data: &[f32]) -> f32 {
    data.iter().copied().fold(f32::INFINITY, f32::min)
}

pub fn sum(data: &[f32]) -> f32 {
    data.iter().map(|&x| x as f64).sum::<f64>() as f32
}

pub fn average(data: &[f32]) -> f32 {
    if data.is_empty() {
        return 0.0;
    }
    sum(data) / data.len() as f32
}

/// Normalizes `data` in place so it sums to one.
///
/// An all-zero array is left untouched.
pub fn simp_norm_sum(data: &mut [f32]) {
    let total = sum(data);
    if total != 0.0 {
        data.iter_mut().for_each(|x| *x /= total);
    }
}

/// Zeroes every value below `cutoff`.
pub fn apply_cutoff(data: &mut [f32], cutoff: f32) {
    data.iter_mut().filter(|x| **x < cutoff).for_each(|x| *x = 0.0);
}

/// Clamps negative values to zero.
pub fn clip_negatives(data: &mut [f32]) {
    data.iter_mut().for_each(|x| *x = x.max(0.0));
}

pub fn linear_interpolate(y1: f32, y2: f32, mu: f32) -> f32 {
    y1 * (1.0 - mu) + y2 * mu
}

/// Fractional position of `x` between `x1` (0) and `x2` (1).
pub fn linear_interpolate_position(x1: f32, x2: f32, x: f32) -> f32 {
    if x2 - x1 == 0.0 {
        return 0.0;
    }
    (x - x1) / (x2 - x1)
}

/// Cubic interpolation between `y1` and `y2`, `mu` in `[0, 1]`.
pub fn cubic_interpolate(y0: f32, y1: f32, y2: f32, y3: f32, mu: f32) -> f32 {
    let mu2 = mu * mu;
    let a0 = y3 - y2 - y0 + y1;
    let a1 = y0 - y1 - a0;
    let a2 = y2 - y0;
    let a3 = y1;
    a0 * mu * mu2 + a1 * mu2 + a2 * mu + a3
}

/// Approximate most abundant charge of a natively sprayed ion of `mass`.
pub fn native_charge(mass: f32) -> f32 {
    0.0467 * mass.powf(0.533)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nearfast_clamps() {
        let data: Vec<f32> = (0..101).map(|i| 500.0 + i as f32 * 0.2).collect();
        for query in [-1e9, 0.0, 499.9, 500.0, 510.05, 520.0, 520.1, 1e9] {
            let idx = nearfast(&data, query);
            assert!(idx < data.len());
        }
        assert_eq!(nearfast(&data, -1e9), 0);
        assert_eq!(nearfast(&data, 1e9), data.len() - 1);
        assert_eq!(nearfast(&data, 510.02), 50);
        assert_eq!(nearfast(&[3.0], 100.0), 0);
        assert_eq!(nearfast(&[], 100.0), 0);
    }

    #[test]
    fn test_nearfast_exact_hits() {
        let data = [1.0, 2.0, 3.0, 4.0, 5.0];
        for (i, x) in data.iter().enumerate() {
            assert_eq!(nearfast(&data, *x), i);
        }
    }

    #[test]
    fn test_simp_norm_sum() {
        let mut data = vec![1.0, 3.0, 4.0];
        simp_norm_sum(&mut data);
        assert!((sum(&data) - 1.0).abs() < 1e-6);
        assert!((data[2] - 0.5).abs() < 1e-6);

        let mut zeros = vec![0.0; 4];
        simp_norm_sum(&mut zeros);
        assert_eq!(zeros, vec![0.0; 4]);
    }

    #[test]
    fn test_reductions() {
        let data = [2.0, -1.0, 4.0, 3.0];
        assert_eq!(max(&data), 4.0);
        assert_eq!(min(&data), -1.0);
        assert_eq!(sum(&data), 8.0);
        assert_eq!(average(&data), 2.0);
        assert_eq!(average(&[]), 0.0);
    }

    #[test]
    fn test_cutoff_and_clip() {
        let mut data = vec![-1.0, 0.5, 2.0];
        apply_cutoff(&mut data, 1.0);
        assert_eq!(data, vec![0.0, 0.0, 2.0]);
        let mut data = vec![-1.0, 0.5];
        clip_negatives(&mut data);
        assert_eq!(data, vec![0.0, 0.5]);
    }

    #[test]
    fn test_interpolators() {
        assert_eq!(linear_interpolate(1.0, 3.0, 0.5), 2.0);
        assert_eq!(linear_interpolate_position(1.0, 3.0, 2.5), 0.75);
        assert_eq!(cubic_interpolate(5.0, 1.0, 2.0, 7.0, 0.0), 1.0);
        assert!((cubic_interpolate(5.0, 1.0, 2.0, 7.0, 1.0) - 2.0).abs() < 1e-6);
        let mid = cubic_interpolate(1.0, 1.0, 1.0, 1.0, 0.5);
        assert!((mid - 1.0).abs() < 1e-6);
    }
}
