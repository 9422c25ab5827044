use super::found_halo::{HaloKind, ParticleStore};
use super::halo_list::HaloList;
use crate::common::config::{FofConfig, HopConfig};
use crate::common::constants::MASS_SUN_CGS;
use crate::data::{DataSource, PARTICLE_POSITION_FIELDS, PARTICLE_VELOCITY_FIELDS};
use crate::domain::{DomainGeometry, FieldKey, FinderResult, HaloError};
use crate::numerics::{HopParams, friends_of_friends, hop};
use crate::parallel::{
    Communicator, Subvolume, agree, all_reduce_sum, all_reduce_sum_usize, partition_domain,
};
use crate::units::{Dimension, Unit, UnitArray};
use std::sync::Arc;
use tracing::{info, warn};

/// Particles of one worker's padded subvolume.
#[derive(Debug)]
pub struct LocalParticles {
    pub store: ParticleStore,
    /// Particles inside the unpadded bounds.
    pub owned: usize,
    pub owned_mass: f64,
}

fn subvolume_for(source: &dyn DataSource, comm: &dyn Communicator, padding: f64) -> FinderResult<Subvolume> {
    partition_domain(&source.geometry(), comm.size(), padding)
        .into_iter()
        .nth(comm.rank())
        .ok_or_else(|| {
            HaloError::internal(
                "RUN.DECOMPOSITION",
                format!("no subvolume for rank {} of {}", comm.rank(), comm.size()),
            )
        })
}

fn column_in(source: &dyn DataSource, key: &FieldKey, target: &Unit) -> FinderResult<Vec<f64>> {
    let data = source.full_field(key)?;
    let data = match data.units {
        Some(_) => data.in_units(target)?,
        None => UnitArray::new(data.values, Some(target.clone())),
    };
    Ok(data.values)
}

/// Copies the particle fields this worker reads into contiguous arrays.
pub fn extract_particles(
    source: &dyn DataSource,
    ptype: &str,
    bounds: &Subvolume,
) -> FinderResult<LocalParticles> {
    let registry = source.unit_registry();
    let code_length = registry.unit("code_length")?;
    let velocity_unit = Unit::base(Dimension::VELOCITY);
    let mass_unit = Unit::base(Dimension::MASS);

    let mut axes = Vec::with_capacity(3);
    for name in PARTICLE_POSITION_FIELDS {
        axes.push(column_in(source, &FieldKey::new(ptype, name), &code_length)?);
    }
    let count = axes[0].len();
    let masses = column_in(source, &FieldKey::new(ptype, "particle_mass"), &mass_unit)?;

    let mut velocity_axes = Vec::with_capacity(3);
    for name in PARTICLE_VELOCITY_FIELDS {
        let key = FieldKey::new(ptype, name);
        if source.has_field(&key) {
            velocity_axes.push(column_in(source, &key, &velocity_unit)?);
        } else {
            warn!(field = %key, "velocity field missing, assuming zero");
            velocity_axes.push(vec![0.0; count]);
        }
    }
    let index_key = FieldKey::new(ptype, "particle_index");
    let particle_index: Vec<i64> = if source.has_field(&index_key) {
        source.full_field(&index_key)?.values.iter().map(|v| *v as i64).collect()
    } else {
        (0..count as i64).collect()
    };

    let geometry = source.geometry();
    let mut store = ParticleStore {
        geometry,
        cosmology: source.cosmology().unwrap_or_default(),
        length_cgs: code_length.cgs_factor(),
        positions: Vec::new(),
        velocities: Vec::new(),
        masses: Vec::new(),
        particle_index: Vec::new(),
        densities: Vec::new(),
    };
    let mut owned = 0;
    let mut owned_mass = 0.0;
    for row in 0..count {
        let point = [axes[0][row], axes[1][row], axes[2][row]];
        if bounds.owns(point) {
            owned += 1;
            owned_mass += masses[row];
        }
        let Some(local) = bounds.localize(point) else {
            continue;
        };
        store.positions.push(local);
        store.velocities.push([velocity_axes[0][row], velocity_axes[1][row], velocity_axes[2][row]]);
        store.masses.push(masses[row]);
        store.particle_index.push(particle_index[row]);
    }
    store.densities = vec![-1.0; store.positions.len()];
    Ok(LocalParticles {
        store,
        owned,
        owned_mass,
    })
}

/// Kernel coordinates: code length divided by the domain width.
fn unit_box_inputs(store: &ParticleStore, bounds: &Subvolume) -> (Vec<[f64; 3]>, DomainGeometry) {
    let width = store.geometry.width();
    let positions = store
        .positions
        .iter()
        .map(|p| std::array::from_fn(|axis| p[axis] / width[axis]))
        .collect();
    let mut geometry = bounds.clustering_geometry();
    for axis in 0..3 {
        geometry.left_edge[axis] /= width[axis];
        geometry.right_edge[axis] /= width[axis];
    }
    (positions, geometry)
}

/// `link > 0` scales the mean interparticle spacing of the unit box; `link < 0`
/// is taken as an absolute unit-box length.
pub fn fof_linking_length(link: f64, total_particles: usize) -> f64 {
    if link > 0.0 {
        let spacing = (1.0 / total_particles.max(1) as f64).cbrt();
        link * spacing
    } else {
        link.abs()
    }
}

/// Friends-of-friends over this worker's subvolume. Collective.
pub fn fof_halo_list(
    source: &dyn DataSource,
    comm: &dyn Communicator,
    config: &FofConfig,
) -> FinderResult<HaloList> {
    info!(dataset = source.name(), "initializing FOF");
    let local = subvolume_for(source, comm, config.padding)
        .and_then(|bounds| Ok((extract_particles(source, &config.ptype, &bounds)?, bounds)));
    let (local, bounds) = agree(comm, local)?;

    let linking_length = if config.link > 0.0 {
        let total = all_reduce_sum_usize(comm, local.owned)?;
        fof_linking_length(config.link, total)
    } else {
        fof_linking_length(config.link, 0)
    };
    info!("using a linking length of {linking_length:.3e}");

    let (positions, geometry) = unit_box_inputs(&local.store, &bounds);
    let list = match friends_of_friends(&positions, &geometry, linking_length) {
        Ok(labels) => HaloList::from_labels(Arc::new(local.store), &labels, HaloKind::FriendsOfFriends),
        Err(error) => Err(error.into()),
    };
    let mut list = agree(comm, list)?.with_save_particles(config.save_particles);
    list.retain_owned(&bounds, 1.0);
    list.join(comm)?;
    Ok(list)
}

/// HOP over this worker's subvolume, threshold scaled to the full volume. Collective.
pub fn hop_halo_list(
    source: &dyn DataSource,
    comm: &dyn Communicator,
    config: &HopConfig,
) -> FinderResult<HaloList> {
    info!(dataset = source.name(), "initializing HOP");
    let local = subvolume_for(source, comm, config.padding)
        .and_then(|bounds| Ok((extract_particles(source, &config.ptype, &bounds)?, bounds)));
    let (mut local, bounds) = agree(comm, local)?;

    let total_mass = match config.total_mass {
        Some(total) => total,
        None => all_reduce_sum(comm, local.owned_mass / MASS_SUN_CGS)?,
    };
    let sub_mass = local.store.masses.iter().sum::<f64>() / MASS_SUN_CGS;
    let adjustment = if sub_mass > 0.0 { total_mass / sub_mass } else { 1.0 };

    let (positions, geometry) = unit_box_inputs(&local.store, &bounds);
    let input_mass: f64 = local.store.masses.iter().sum();
    let masses: Vec<f64> = local
        .store
        .masses
        .iter()
        .map(|m| if input_mass > 0.0 { m / input_mass } else { 0.0 })
        .collect();
    let params = HopParams::new(config.threshold * adjustment);
    let list = match hop(&positions, &masses, &geometry, params) {
        Ok(result) => {
            local.store.densities = result.densities;
            HaloList::from_labels(Arc::new(local.store), &result.labels, HaloKind::Hop)
        }
        Err(error) => Err(error.into()),
    };
    let mut list = agree(comm, list)?.with_save_particles(config.save_particles);
    list.retain_owned(&bounds, adjustment);
    list.join(comm)?;
    Ok(list)
}
