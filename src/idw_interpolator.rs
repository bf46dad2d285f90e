/// Inverse-distance weighting
///
/// weight_i = 1 / max(d_i, eps)^p, prediction = sum(w_i * v_i) / sum(w_i),
/// taken over the k nearest candidates. Shared by the calibration grid search
/// and the long-gap fill so both see the same kernel.

use geo::{point, HaversineDistance};

use crate::config::{DistanceMetric, SpatialConfig};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub distance: f64,
    pub value: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct IdwKernel {
    pub metric: DistanceMetric,
    pub neighbors: usize,
    pub epsilon: f64,
}

impl IdwKernel {
    pub fn from_config(config: &SpatialConfig) -> Self {
        IdwKernel {
            metric: config.metric,
            neighbors: config.neighbors,
            epsilon: config.distance_epsilon,
        }
    }

    /// Distance between two (lon, lat) positions under the configured metric.
    pub fn distance(&self, a: (f64, f64), b: (f64, f64)) -> f64 {
        match self.metric {
            DistanceMetric::Euclidean => ((a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)).sqrt(),
            DistanceMetric::Haversine => {
                let pa = point!(x: a.0, y: a.1);
                let pb = point!(x: b.0, y: b.1);
                pa.haversine_distance(&pb)
            }
        }
    }

    /// The k nearest candidates to `target`. Equal distances keep candidate order.
    pub fn nearest<I>(&self, target: (f64, f64), candidates: I) -> Vec<Neighbor>
    where
        I: IntoIterator<Item = ((f64, f64), f64)>,
    {
        let mut all: Vec<Neighbor> = candidates
            .into_iter()
            .map(|(pos, value)| Neighbor {
                distance: self.distance(target, pos),
                value,
            })
            .collect();
        all.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        all.truncate(self.neighbors);
        all
    }

    /// Weighted mean for exponent `p`; `None` when the weights degenerate
    /// (no neighbours, or a non-finite sum).
    pub fn predict(&self, neighbors: &[Neighbor], p: f64) -> Option<f64> {
        if neighbors.is_empty() {
            return None;
        }
        let mut weighted = 0.0;
        let mut total = 0.0;
        for n in neighbors {
            let w = 1.0 / n.distance.max(self.epsilon).powf(p);
            weighted += w * n.value;
            total += w;
        }
        let prediction = weighted / total;
        (total > 0.0 && prediction.is_finite()).then_some(prediction)
    }
}
