//! Physical constants and numerical guards shared by the finders and the
//! unit registry. Values are cgs.

pub const MASS_SUN_CGS: f64 = 1.988_409_870_698_051e33;
pub const KPC_CGS: f64 = 3.085_677_581_491_367e21;
pub const MPC_CGS: f64 = 1.0e3 * KPC_CGS;
pub const KM_CGS: f64 = 1.0e5;
pub const SECONDS_PER_YEAR: f64 = 3.155_76e7;

/// Critical density today in g/cm^3, divided by h^2.
pub const RHO_CRIT_G_CM3_H2: f64 = 1.878_469_845_688_422e-29;

/// Offset that keeps logarithmic radial bins finite for zero distances.
pub const TINY: f64 = 1.0e-40;

pub const DEFAULT_VIRIAL_OVERDENSITY: f64 = 200.0;
pub const DEFAULT_VIRIAL_BINS: usize = 300;

/// Sentinel reported for virial quantities of halos that never reach the
/// requested overdensity.
pub const NOT_VIRIALIZED: f64 = -1.0;

pub const FOUR_THIRDS_PI: f64 = 4.0 / 3.0 * std::f64::consts::PI;
