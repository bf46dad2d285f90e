/// Scalar local-level state-space smoother.
///
/// Model: x[t] = x[t-1] + w, w ~ N(0, Q);  y[t] = x[t] + v, v ~ N(0, R).
/// A forward Kalman filter (missing observations skip the update step) is
/// followed by a Rauch-Tung-Striebel backward pass. The filter starts from the
/// mean of the observed values with variance `initial_variance`.

use crate::config::ImputationConfig;

#[derive(Debug, Clone, Copy)]
pub struct LocalLevelSmoother {
    pub observation_variance: f64,
    pub process_variance: f64,
    pub initial_variance: f64,
}

impl LocalLevelSmoother {
    pub fn from_config(config: &ImputationConfig) -> Self {
        LocalLevelSmoother {
            observation_variance: config.observation_variance,
            process_variance: config.process_variance,
            initial_variance: config.initial_variance,
        }
    }

    /// Smoothed level for every index of `observations`; `None` when the
    /// window holds no observation at all.
    pub fn smooth(&self, observations: &[Option<f64>]) -> Option<Vec<f64>> {
        let observed: Vec<f64> = observations.iter().flatten().copied().collect();
        if observed.is_empty() {
            return None;
        }
        let initial_mean = observed.iter().sum::<f64>() / observed.len() as f64;

        let n = observations.len();
        let mut predicted_mean = vec![0.0; n];
        let mut predicted_var = vec![0.0; n];
        let mut filtered_mean = vec![0.0; n];
        let mut filtered_var = vec![0.0; n];

        for t in 0..n {
            let (mean, var) = if t == 0 {
                (initial_mean, self.initial_variance)
            } else {
                (filtered_mean[t - 1], filtered_var[t - 1] + self.process_variance)
            };
            predicted_mean[t] = mean;
            predicted_var[t] = var;

            match observations[t] {
                Some(y) => {
                    let gain = var / (var + self.observation_variance);
                    filtered_mean[t] = mean + gain * (y - mean);
                    filtered_var[t] = (1.0 - gain) * var;
                }
                None => {
                    filtered_mean[t] = mean;
                    filtered_var[t] = var;
                }
            }
        }

        // The backward mean recursion does not need the smoothed variances.
        let mut smoothed = filtered_mean.clone();
        for t in (0..n.saturating_sub(1)).rev() {
            let gain = filtered_var[t] / predicted_var[t + 1];
            smoothed[t] = filtered_mean[t] + gain * (smoothed[t + 1] - predicted_mean[t + 1]);
        }

        Some(smoothed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn smoother() -> LocalLevelSmoother {
        LocalLevelSmoother::from_config(&ImputationConfig::default())
    }

    #[test]
    fn test_constant_series_is_preserved() {
        let window = vec![Some(5.0), Some(5.0), None, None, Some(5.0), Some(5.0)];
        let smoothed = smoother().smooth(&window).unwrap();
        for v in smoothed {
            assert_abs_diff_eq!(v, 5.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_gap_estimates_stay_between_observed_extremes() {
        let mut window = vec![Some(10.0); 10];
        window.extend(vec![None; 20]);
        window.extend(vec![Some(20.0); 10]);
        let smoothed = smoother().smooth(&window).unwrap();

        assert_eq!(smoothed.len(), window.len());
        for v in &smoothed[10..30] {
            assert!(*v >= 10.0 && *v <= 20.0);
        }
        // The level drifts from the left block towards the right block.
        for pair in smoothed[10..30].windows(2) {
            assert!(pair[1] >= pair[0] - 1e-12);
        }
    }

    #[test]
    fn test_all_missing_window_is_none() {
        assert!(smoother().smooth(&[None, None, None]).is_none());
    }

    #[test]
    fn test_single_observation_propagates() {
        let smoothed = smoother().smooth(&[None, Some(7.0), None]).unwrap();
        for v in smoothed {
            assert_abs_diff_eq!(v, 7.0, epsilon = 1e-12);
        }
    }
}
