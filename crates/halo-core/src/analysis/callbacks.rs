//! Builtin callbacks: particle spheres, mass profiles and their bookkeeping.

use super::operators::{CallbackFn, OperatorArgs, OperatorRegistry};
use super::target::{Halo, HaloAttribute, MassProfile, SphereSelection, TargetContext};
use crate::common::constants::DEFAULT_VIRIAL_BINS;
use crate::domain::{HaloError, HaloResult};
use crate::numerics::RadialProfile;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

pub fn register(registry: &mut OperatorRegistry<CallbackFn>) {
    registry.register("sphere", Arc::new(sphere) as CallbackFn);
    registry.register("virial_profile", Arc::new(virial_profile) as CallbackFn);
    registry.register("save_members", Arc::new(save_members) as CallbackFn);
    registry.register("delete_attribute", Arc::new(delete_attribute) as CallbackFn);
}

/// `sphere(factor = 1.0, radius_field = "virial_radius", ptype = "all")`
///
/// Selects simulation particles within `factor` times the halo radius of the
/// halo position, with periodic wrapping.
fn sphere(halo: &mut Halo, context: &TargetContext<'_>, args: &OperatorArgs) -> HaloResult<()> {
    let factor = args.f64_or(0, "factor", 1.0)?;
    let radius_field = args.str_or(1, "radius_field", "virial_radius")?;
    let ptype = args.str_or(2, "ptype", "all")?;

    let data = context.data_source()?;
    let code_length = data.unit_registry().unit("code_length")?;
    let center = halo.position_in(&code_length)?;
    let radius = factor * halo.quantity(radius_field)?.in_units(&code_length)?.value;

    let particles = context.particles(ptype)?;
    let mut indices = if radius > 0.0 {
        particles.tree.within(center, radius)
    } else {
        Vec::new()
    };
    indices.sort_unstable();
    debug!(halo = halo.index, radius, members = indices.len(), "sphere selected");

    halo.set_attribute(
        "sphere",
        HaloAttribute::Sphere(Arc::new(SphereSelection {
            center,
            radius,
            ptype: ptype.to_string(),
            indices,
        })),
    );
    Ok(())
}

/// `virial_profile(bins = 300, ptype = "all")`
///
/// Cumulative mass in log-spaced radial bins around the sphere center.
fn virial_profile(halo: &mut Halo, context: &TargetContext<'_>, args: &OperatorArgs) -> HaloResult<()> {
    let bins = args.usize_or(0, "bins", DEFAULT_VIRIAL_BINS)?;
    let ptype = args.str_or(1, "ptype", "all")?;
    if bins == 0 {
        return Err(HaloError::configuration(
            "CONFIG.OPERATOR_ARGS",
            "virial_profile needs at least one bin",
        ));
    }

    let sphere = Arc::clone(halo.sphere()?);
    let particles = context.particles(ptype)?;
    let rows = sphere.rows_for(ptype, &particles);
    let distances: Vec<f64> = rows
        .iter()
        .map(|index| {
            particles
                .geometry
                .periodic_distance(sphere.center, particles.positions[*index])
                * particles.length_cgs
        })
        .collect();
    let masses: Vec<f64> = rows.iter().map(|index| particles.masses[*index]).collect();
    let reference_density = context
        .data_source()?
        .cosmology()
        .unwrap_or_default()
        .reference_density_cgs();

    let profile = RadialProfile::build(&distances, &masses, bins, reference_density);
    halo.set_attribute("virial_profile", HaloAttribute::Profile(Arc::new(MassProfile { profile })));
    Ok(())
}

/// `save_members(output_dir = "members", ptype = "all")`
///
/// Writes the particle indices of the sphere selection to
/// `<output_dir>/halo_<id>.json`.
fn save_members(halo: &mut Halo, context: &TargetContext<'_>, args: &OperatorArgs) -> HaloResult<()> {
    let output_dir = PathBuf::from(args.str_or(0, "output_dir", "members")?);
    let ptype = args.str_or(1, "ptype", "all")?;
    let output_dir = if output_dir.is_absolute() {
        output_dir
    } else {
        context.output_dir.join(output_dir)
    };

    let sphere = Arc::clone(halo.sphere()?);
    let particles = context.particles(ptype)?;
    let members: Vec<i64> = sphere
        .rows_for(ptype, &particles)
        .iter()
        .map(|index| particles.particle_index[*index])
        .collect();

    let path = output_dir.join(format!("halo_{}.json", halo.identifier()));
    let document = json!({
        "particle_identifier": halo.identifier(),
        "particle_index": members,
    });
    std::fs::create_dir_all(&output_dir)
        .and_then(|()| std::fs::write(&path, document.to_string()))
        .map_err(|source| {
            HaloError::io_system(
                "IO.MEMBERS_WRITE",
                format!("failed to write '{}': {source}", path.display()),
            )
        })
}

/// `delete_attribute(name)`; missing attributes are ignored.
fn delete_attribute(halo: &mut Halo, _context: &TargetContext<'_>, args: &OperatorArgs) -> HaloResult<()> {
    let name = args.required_str(0, "name")?;
    halo.remove_attribute(name);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{delete_attribute, save_members, sphere, virial_profile};
    use crate::analysis::operators::OperatorArgs;
    use crate::analysis::target::{Halo, TargetCache, TargetContext};
    use crate::data::{InMemoryDataset, ParticleSnapshot};
    use crate::domain::{Cosmology, DomainGeometry, FieldKey, HaloErrorCategory};
    use crate::units::{CodeUnits, Quantity, UnitRegistry};
    use std::path::Path;
    use tempfile::TempDir;

    fn simulation() -> InMemoryDataset {
        let mut positions = vec![[0.02, 0.5, 0.5], [0.98, 0.5, 0.5], [0.0, 0.51, 0.5]];
        positions.push([0.5, 0.5, 0.5]);
        let mut snapshot = ParticleSnapshot::new("DD0020", DomainGeometry::unit_box(), positions);
        snapshot.code_units = CodeUnits {
            length_cgs: 3.0e24,
            mass_cgs: 2.0e43,
            time_cgs: 3.0e16,
        };
        snapshot.cosmology = Some(Cosmology::default());
        snapshot.into_dataset().expect("snapshot should build")
    }

    fn halo_at(position: [f64; 3], radius_code: f64) -> Halo {
        let registry = UnitRegistry::new(
            CodeUnits {
                length_cgs: 3.0e24,
                mass_cgs: 2.0e43,
                time_cgs: 3.0e16,
            },
            1.0,
            None,
        );
        let unitary = registry.unit("unitary").expect("unitary");
        let code_length = registry.unit("code_length").expect("code_length");
        let mut halo = Halo::new(0);
        for (axis, name) in ["particle_position_x", "particle_position_y", "particle_position_z"]
            .iter()
            .enumerate()
        {
            halo.set_quantity(*name, Quantity::new(position[axis], unitary.clone()));
        }
        halo.set_quantity("virial_radius", Quantity::new(radius_code, code_length));
        halo.set_quantity("particle_identifier", Quantity::plain(7.0));
        halo
    }

    #[test]
    fn sphere_wraps_across_the_periodic_boundary() {
        let data = simulation();
        let cache = TargetCache::new();
        let context = TargetContext::new(&data, Some(&data), "halos", Path::new("."), 0, &cache);
        let mut halo = halo_at([0.0, 0.5, 0.5], 0.025);

        sphere(&mut halo, &context, &OperatorArgs::new()).expect("sphere should select");
        assert_eq!(halo.sphere().expect("sphere").indices, vec![0, 1, 2]);

        let mut wide = halo_at([0.0, 0.5, 0.5], 0.025);
        sphere(&mut wide, &context, &OperatorArgs::new().kwarg("factor", 30.0)).expect("sphere");
        assert_eq!(wide.sphere().expect("sphere").indices.len(), 4);
    }

    #[test]
    fn sphere_requires_a_simulation_dataset() {
        let data = simulation();
        let cache = TargetCache::new();
        let context = TargetContext::new(&data, None, "halos", Path::new("."), 0, &cache);
        let error = sphere(&mut halo_at([0.5; 3], 0.1), &context, &OperatorArgs::new())
            .expect_err("missing data should fail");
        assert_eq!(error.category(), HaloErrorCategory::Configuration);
    }

    #[test]
    fn profile_and_members_follow_the_sphere() {
        let data = simulation();
        let output = TempDir::new().expect("tempdir should be created");
        let cache = TargetCache::new();
        let context = TargetContext::new(&data, Some(&data), "halos", output.path(), 0, &cache);
        let mut halo = halo_at([0.0, 0.5, 0.5], 0.025);

        assert!(virial_profile(&mut halo, &context, &OperatorArgs::new()).is_err());
        sphere(&mut halo, &context, &OperatorArgs::new()).expect("sphere");
        virial_profile(&mut halo, &context, &OperatorArgs::new().kwarg("bins", 16)).expect("profile");
        let profile = halo.profile().expect("profile attribute");
        let built = profile.profile.as_ref().expect("three particles give a profile");
        assert_eq!(built.bins(), 16);
        assert!((built.mass_bins[16] - 6.0e43).abs() <= 1.0e-6 * 6.0e43);

        save_members(&mut halo, &context, &OperatorArgs::new()).expect("members should be written");
        let text = std::fs::read_to_string(output.path().join("members").join("halo_7.json"))
            .expect("members file should exist");
        let document: serde_json::Value = serde_json::from_str(&text).expect("members json");
        assert_eq!(document["particle_index"], serde_json::json!([0, 1, 2]));

        delete_attribute(&mut halo, &context, &OperatorArgs::new().arg("virial_profile")).expect("delete");
        delete_attribute(&mut halo, &context, &OperatorArgs::new().arg("virial_profile")).expect("idempotent");
        assert_eq!(halo.attribute_names(), vec!["sphere"]);
    }

    fn with_dark_matter(mut data: InMemoryDataset) -> InMemoryDataset {
        let positions = [[0.01, 0.5, 0.5], [0.99, 0.5, 0.5], [0.5, 0.5, 0.5]];
        for (axis, name) in ["particle_position_x", "particle_position_y", "particle_position_z"]
            .iter()
            .enumerate()
        {
            data.insert_values(
                FieldKey::new("dm", *name),
                positions.iter().map(|p| p[axis]).collect(),
                Some("code_length"),
            )
            .expect("dm positions should insert");
        }
        data.insert_values(FieldKey::new("dm", "particle_mass"), vec![3.0; 3], Some("code_mass"))
            .expect("dm masses should insert");
        data.insert_values(FieldKey::new("dm", "particle_index"), vec![40.0, 41.0, 42.0], None)
            .expect("dm indices should insert");
        data
    }

    #[test]
    fn particle_types_are_indexed_separately() {
        let data = with_dark_matter(simulation());
        let output = TempDir::new().expect("tempdir should be created");
        let cache = TargetCache::new();
        let context = TargetContext::new(&data, Some(&data), "halos", output.path(), 0, &cache);

        assert_eq!(context.particles("all").expect("all particles").positions.len(), 4);
        assert_eq!(context.particles("dm").expect("dm particles").positions.len(), 3);
        assert_eq!(context.particles("all").expect("cached all").positions.len(), 4);

        let mut halo = halo_at([0.0, 0.5, 0.5], 0.025);
        sphere(&mut halo, &context, &OperatorArgs::new()).expect("sphere");
        assert_eq!(halo.sphere().expect("sphere").indices, vec![0, 1, 2]);

        virial_profile(&mut halo, &context, &OperatorArgs::new().kwarg("bins", 8).kwarg("ptype", "dm"))
            .expect("dm profile");
        let profile = halo.profile().expect("profile attribute");
        let built = profile.profile.as_ref().expect("two dm particles give a profile");
        assert!((built.mass_bins[8] - 1.2e44).abs() <= 1.0e-6 * 1.2e44);

        save_members(&mut halo, &context, &OperatorArgs::new().kwarg("ptype", "dm"))
            .expect("dm members should be written");
        let text = std::fs::read_to_string(output.path().join("members").join("halo_7.json"))
            .expect("members file should exist");
        let document: serde_json::Value = serde_json::from_str(&text).expect("members json");
        assert_eq!(document["particle_index"], serde_json::json!([40, 41]));
    }
}
