use super::operators::{OperatorArgs, OperatorRegistry, RecipeFn};
use super::pipeline::AnalysisPipeline;
use crate::common::constants::{DEFAULT_VIRIAL_BINS, DEFAULT_VIRIAL_OVERDENSITY};
use crate::domain::HaloResult;
use std::sync::Arc;

pub fn register(registry: &mut OperatorRegistry<RecipeFn>) {
    registry.register(
        "calculate_virial_quantities",
        Arc::new(calculate_virial_quantities) as RecipeFn,
    );
}

/// Column name of a virial quantity, e.g. `radius_200`.
pub fn virial_quantity_key(field: &str, overdensity: f64) -> String {
    format!("{field}_{}", overdensity.round() as i64)
}

/// `calculate_virial_quantities(fields, factor = 2.0, radius_field = "virial_radius",
/// critical_overdensity = 200, bins = 300)`
fn calculate_virial_quantities(pipeline: &mut AnalysisPipeline, args: &OperatorArgs) -> HaloResult<()> {
    let fields = args.string_list(0, "fields")?;
    let factor = args.f64_or(1, "factor", 2.0)?;
    let radius_field = args.str_or(2, "radius_field", "virial_radius")?;
    let overdensity = args.f64_or(3, "critical_overdensity", DEFAULT_VIRIAL_OVERDENSITY)?;
    let bins = args.usize_or(4, "bins", DEFAULT_VIRIAL_BINS)?;

    pipeline.add_callback(
        "sphere",
        OperatorArgs::new()
            .kwarg("factor", factor)
            .kwarg("radius_field", radius_field),
    )?;
    pipeline.add_callback("virial_profile", OperatorArgs::new().kwarg("bins", bins))?;
    for field in &fields {
        pipeline.add_operator_quantity(
            &virial_quantity_key(field, overdensity),
            "virial_value",
            OperatorArgs::new()
                .arg(field.as_str())
                .kwarg("critical_overdensity", overdensity),
        )?;
    }
    pipeline.add_callback("delete_attribute", OperatorArgs::new().arg("virial_profile"))?;
    pipeline.add_callback("delete_attribute", OperatorArgs::new().arg("sphere"))
}
