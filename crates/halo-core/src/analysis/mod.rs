//! Halo catalogs and the operator pipeline they run.
//!
//! A catalog binds a halo dataset (or a finder that produces one) to an
//! [`AnalysisPipeline`]. The pipeline is an ordered chain of callbacks,
//! filters and quantities looked up by name in [`Registries`]; recipes expand
//! into several actions when added.

pub mod callbacks;
mod catalog;
pub mod filters;
pub mod finding_methods;
mod operators;
mod pipeline;
pub mod quantities;
pub mod recipes;
mod target;

pub use catalog::{
    DEFAULT_CATALOG_DIR, DEFAULT_HALO_FIELD_TYPE, HaloCatalog, HaloCatalogBuilder, default_halo_fields,
};
pub use operators::{
    BoundOperator, CallbackFn, FilterFn, FindingContext, FindingMethodFn, OperatorArgs,
    OperatorRegistry, QuantityFn, RecipeFn, Registries,
};
pub use pipeline::{
    Action, AnalysisPipeline, CatalogRun, DEFAULT_ANALYSIS_DIR, QuantitySource, output_basename,
};
pub use target::{
    Halo, HaloAttribute, MassProfile, ParticleIndex, SphereSelection, TargetCache, TargetContext,
};
