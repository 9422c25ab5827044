//! Halo finding and per-halo analysis for particle simulations.
//!
//! Finders ([`finding`]) group particles into halos and write catalogs; the
//! [`analysis`] pipeline then walks a catalog row by row, applying filters,
//! callbacks and quantities, and writes a new catalog. Work is spread over the
//! ranks of a [`parallel::Communicator`].

pub mod analysis;
pub mod common;
pub mod data;
pub mod domain;
pub mod finding;
pub mod numerics;
pub mod parallel;
pub mod rockstar;
pub mod units;
