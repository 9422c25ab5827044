//! Built-in halo finders and the halo lists they produce.

mod found_halo;
mod generic;
mod halo_list;

pub use found_halo::{FoundHalo, HaloKind, HaloSummary, ParticleStore};
pub use generic::{
    LocalParticles, extract_particles, fof_halo_list, fof_linking_length, hop_halo_list,
};
pub use halo_list::HaloList;
