use crate::common::constants::{FOUR_THIRDS_PI, NOT_VIRIALIZED, TINY};

/// Log-spaced cumulative mass profile around a halo center.
///
/// `radial_bins` holds `bins + 1` edges. A particle at distance `d` lands in
/// the bin whose lower edge is the largest edge `<= d`; `mass_bins` is then
/// summed forward, and `overdensity[i]` is `mass_bins[i]` over the mass a
/// sphere of radius `radial_bins[i]` holds at the reference density.
#[derive(Debug, Clone, PartialEq)]
pub struct RadialProfile {
    pub radial_bins: Vec<f64>,
    pub mass_bins: Vec<f64>,
    pub overdensity: Vec<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VirialInfo {
    /// Index into the profile, or `None` when no bin exceeds the threshold.
    pub bin: Option<usize>,
    pub radius: f64,
    pub mass: f64,
}

impl VirialInfo {
    pub const fn not_virialized() -> Self {
        Self {
            bin: None,
            radius: NOT_VIRIALIZED,
            mass: NOT_VIRIALIZED,
        }
    }

    pub const fn is_virialized(&self) -> bool {
        self.bin.is_some()
    }
}

fn logspace(start: f64, stop: f64, num: usize) -> Vec<f64> {
    let (low, high) = (start.log10(), stop.log10());
    let steps = num.saturating_sub(1).max(1) as f64;
    (0..num)
        .map(|i| 10_f64.powf(low + (high - low) * i as f64 / steps))
        .collect()
}

impl RadialProfile {
    /// Distances and masses must share units with `reference_density`.
    ///
    /// Returns `None` for an empty particle set. A single particle yields an
    /// empty (all-zero) mass profile.
    pub fn build(
        distances: &[f64],
        masses: &[f64],
        bins: usize,
        reference_density: f64,
    ) -> Option<Self> {
        if distances.is_empty() || bins == 0 {
            return None;
        }
        let min = distances.iter().copied().fold(f64::INFINITY, f64::min);
        let max = distances.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let radial_bins = logspace(min * 0.99 + TINY, max * 1.01 + 2.0 * TINY, bins + 1);

        let mut mass_bins = vec![0.0; bins + 1];
        if distances.len() > 1 {
            for (distance, mass) in distances.iter().zip(masses) {
                let upper = radial_bins.partition_point(|edge| *edge <= *distance);
                mass_bins[upper.saturating_sub(1).min(bins)] += mass;
            }
        }
        for i in 0..bins {
            mass_bins[i + 1] += mass_bins[i];
        }

        let overdensity = mass_bins
            .iter()
            .zip(&radial_bins)
            .map(|(mass, radius)| mass / (FOUR_THIRDS_PI * reference_density * radius.powi(3)))
            .collect();

        Some(Self {
            radial_bins,
            mass_bins,
            overdensity,
        })
    }

    pub fn bins(&self) -> usize {
        self.radial_bins.len().saturating_sub(1)
    }

    /// Largest bin whose overdensity exceeds `threshold`.
    pub fn virial_bin(&self, threshold: f64) -> Option<usize> {
        self.overdensity
            .iter()
            .rposition(|overdensity| *overdensity > threshold)
    }

    pub fn virial(&self, threshold: f64) -> VirialInfo {
        match self.virial_bin(threshold) {
            Some(bin) => VirialInfo {
                bin: Some(bin),
                radius: self.radial_bins[bin],
                mass: self.mass_bins[bin],
            },
            None => VirialInfo::not_virialized(),
        }
    }

    /// Radius where the overdensity crosses `threshold` from above, log-interpolated.
    pub fn crossing(&self, threshold: f64) -> Option<(usize, f64)> {
        let bin = self.virial_bin(threshold)?;
        if bin + 1 >= self.overdensity.len() {
            return Some((bin, self.radial_bins[bin]));
        }
        let (d0, d1) = (self.overdensity[bin], self.overdensity[bin + 1]);
        let (r0, r1) = (self.radial_bins[bin], self.radial_bins[bin + 1]);
        if d1 <= 0.0 || d0 <= 0.0 || (d0 - d1).abs() <= f64::EPSILON * d0 {
            return Some((bin, r0));
        }
        let fraction = (threshold.ln() - d0.ln()) / (d1.ln() - d0.ln());
        Some((bin, (r0.ln() + fraction * (r1.ln() - r0.ln())).exp()))
    }
}

#[cfg(test)]
mod tests {
    use super::{RadialProfile, VirialInfo};
    use crate::common::constants::{FOUR_THIRDS_PI, NOT_VIRIALIZED};

    #[test]
    fn edges_bracket_every_particle() {
        let distances = [0.5, 1.0, 2.0, 4.0];
        let profile =
            RadialProfile::build(&distances, &[1.0; 4], 10, 1.0).expect("profile should build");
        assert_eq!(profile.radial_bins.len(), 11);
        assert!(profile.radial_bins[0] <= 0.5 * 0.99 + 1.0e-12);
        assert!(profile.radial_bins[10] >= 4.0 * 1.01 - 1.0e-12);
        assert!((profile.mass_bins[10] - 4.0).abs() < 1.0e-12);
        assert!(profile.mass_bins.windows(2).all(|pair| pair[0] <= pair[1]));
    }

    #[test]
    fn dense_core_is_virialized_at_its_largest_overdense_bin() {
        let mut distances = vec![0.1; 50];
        distances.push(10.0);
        let masses = vec![1.0; distances.len()];
        let reference = 1.0e-3;
        let profile =
            RadialProfile::build(&distances, &masses, 20, reference).expect("profile should build");
        let info = profile.virial(200.0);
        let bin = info.bin.expect("core should be virialized");
        assert!(profile.overdensity[bin] > 200.0);
        assert!(profile.overdensity[bin + 1..].iter().all(|d| *d <= 200.0));
        assert_eq!(info.radius, profile.radial_bins[bin]);
        let expected = info.mass / (FOUR_THIRDS_PI * reference * info.radius.powi(3));
        assert!((expected - profile.overdensity[bin]).abs() <= 1.0e-9 * expected);
    }

    #[test]
    fn diffuse_halo_returns_sentinel() {
        let distances: Vec<f64> = (1..=20).map(|i| i as f64).collect();
        let profile = RadialProfile::build(&distances, &[1.0; 20], 30, 1.0)
            .expect("profile should build");
        let info = profile.virial(200.0);
        assert_eq!(info, VirialInfo::not_virialized());
        assert_eq!(info.radius, NOT_VIRIALIZED);
        assert_eq!(info.mass, NOT_VIRIALIZED);
    }

    #[test]
    fn single_particle_is_never_virialized() {
        let profile = RadialProfile::build(&[0.0], &[1.0e40], 10, 1.0).expect("profile");
        assert!(!profile.virial(200.0).is_virialized());
        assert!(RadialProfile::build(&[], &[], 10, 1.0).is_none());
    }

    #[test]
    fn crossing_interpolates_between_bins() {
        let mut distances = vec![0.1; 50];
        distances.push(10.0);
        let profile = RadialProfile::build(&distances, &[1.0; 51], 20, 1.0e-3)
            .expect("profile should build");
        let (bin, radius) = profile.crossing(200.0).expect("crossing should exist");
        assert!(radius >= profile.radial_bins[bin]);
        assert!(radius <= profile.radial_bins[bin + 1]);
    }
}
