use std::fmt;

/// Scalar running-statistics accumulator for epoch logging.
///
/// Cumulative meters report the running sum of every observation, the rest
/// report the running mean. Values are taken as-is; NaN or infinite samples
/// propagate into the statistic.
#[derive(Debug, Clone)]
pub struct Meter {
    name: &'static str,
    cumulative: bool,
    sum: f64,
    count: usize,
}

impl Meter {
    pub fn new(name: &'static str, cumulative: bool) -> Self {
        Self {
            name,
            cumulative,
            sum: 0.0,
            count: 0,
        }
    }

    pub fn update(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    pub fn value(&self) -> f64 {
        if self.cumulative {
            self.sum
        } else if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }
}

impl fmt::Display for Meter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:.4}", self.name, self.value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_meter_tracks_arithmetic_mean() {
        let mut meter = Meter::new("Loss", false);
        for value in [1.0, 2.0, 3.0, 4.0] {
            meter.update(value);
        }
        assert!((meter.value() - 2.5).abs() < 1e-12);
        meter.update(10.0);
        assert!((meter.value() - 4.0).abs() < 1e-12);
    }

    #[test]
    fn cumulative_meter_tracks_sum() {
        let mut meter = Meter::new("Time", true);
        for value in [0.5, 0.25, 0.25] {
            meter.update(value);
        }
        assert!((meter.value() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn empty_mean_meter_reads_zero() {
        let meter = Meter::new("Error", false);
        assert_eq!(meter.value(), 0.0);
        assert_eq!(meter.count(), 0);
    }

    #[test]
    fn nan_propagates_silently() {
        let mut meter = Meter::new("Loss", false);
        meter.update(1.0);
        meter.update(f64::NAN);
        assert!(meter.value().is_nan());
    }
}
