use super::operators::{OperatorArgs, OperatorRegistry, QuantityFn};
use super::target::{Halo, TargetContext};
use crate::common::constants::{DEFAULT_VIRIAL_OVERDENSITY, NOT_VIRIALIZED};
use crate::domain::{HaloError, HaloResult};
use crate::numerics::RadialProfile;
use crate::units::{Dimension, Quantity, Unit};
use std::sync::Arc;

pub fn register(registry: &mut OperatorRegistry<QuantityFn>) {
    registry.register("virial_value", Arc::new(virial_value) as QuantityFn);
    registry.register("member_count", Arc::new(member_count) as QuantityFn);
}

/// `virial_value(field, critical_overdensity = 200)`
///
/// Reads `radius` (cm) or `matter_mass`/`particle_mass` (g) where the
/// `virial_profile` attribute crosses the overdensity. Halos that never reach
/// it report the not-virialized sentinel.
fn virial_value(halo: &Halo, _context: &TargetContext<'_>, args: &OperatorArgs) -> HaloResult<Quantity> {
    let field = args.required_str(0, "field")?;
    let overdensity = args.f64_or(1, "critical_overdensity", DEFAULT_VIRIAL_OVERDENSITY)?;
    let dimension = match field {
        "radius" => Dimension::LENGTH,
        "matter_mass" | "particle_mass" => Dimension::MASS,
        other => {
            return Err(HaloError::configuration(
                "CONFIG.OPERATOR_ARGS",
                format!("virial_value supports radius, matter_mass and particle_mass, not '{other}'"),
            ));
        }
    };

    let profile = Arc::clone(halo.profile()?);
    let crossing = profile
        .profile
        .as_ref()
        .and_then(|profile| profile.crossing(overdensity).map(|crossing| (profile, crossing)));
    let value = match crossing {
        None => NOT_VIRIALIZED,
        Some((_, (_, radius))) if dimension == Dimension::LENGTH => radius,
        Some((profile, (bin, radius))) => mass_at(profile, bin, radius),
    };
    Ok(Quantity::new(value, Unit::base(dimension)))
}

/// Cumulative mass at `radius`, log-interpolated inside `bin`.
fn mass_at(profile: &RadialProfile, bin: usize, radius: f64) -> f64 {
    let (m0, r0) = (profile.mass_bins[bin], profile.radial_bins[bin]);
    let Some((m1, r1)) = profile
        .mass_bins
        .get(bin + 1)
        .zip(profile.radial_bins.get(bin + 1))
        .map(|(mass, edge)| (*mass, *edge))
    else {
        return m0;
    };
    if m0 <= 0.0 || m1 <= 0.0 || r1 <= r0 {
        return m0;
    }
    let fraction = (radius.ln() - r0.ln()) / (r1.ln() - r0.ln());
    (m0.ln() + fraction * (m1.ln() - m0.ln())).exp()
}

/// Number of particles in the `sphere` attribute.
fn member_count(halo: &Halo, _context: &TargetContext<'_>, _args: &OperatorArgs) -> HaloResult<Quantity> {
    Ok(Quantity::plain(halo.sphere()?.indices.len() as f64))
}
