use super::operators::{FilterFn, OperatorArgs, OperatorRegistry};
use super::target::{Halo, TargetContext};
use crate::data::{DataSource, PARTICLE_POSITION_FIELDS};
use crate::domain::{DomainGeometry, FieldKey, HaloError, HaloResult};
use crate::numerics::KdTree;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

pub fn register(registry: &mut OperatorRegistry<FilterFn>) {
    registry.register("quantity_value", Arc::new(quantity_value) as FilterFn);
    registry.register("not_subhalo", Arc::new(not_subhalo) as FilterFn);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Less,
    LessEqual,
    Equal,
    NotEqual,
    GreaterEqual,
    Greater,
}

impl Comparison {
    pub fn parse(symbol: &str) -> HaloResult<Self> {
        match symbol.trim() {
            "<" => Ok(Self::Less),
            "<=" => Ok(Self::LessEqual),
            "==" => Ok(Self::Equal),
            "!=" => Ok(Self::NotEqual),
            ">=" => Ok(Self::GreaterEqual),
            ">" => Ok(Self::Greater),
            other => Err(HaloError::configuration(
                "CONFIG.OPERATOR_ARGS",
                format!("unsupported comparison '{other}'; use one of < <= == != >= >"),
            )),
        }
    }

    pub fn holds(self, left: f64, right: f64) -> bool {
        match self {
            Self::Less => left < right,
            Self::LessEqual => left <= right,
            Self::Equal => left == right,
            Self::NotEqual => left != right,
            Self::GreaterEqual => left >= right,
            Self::Greater => left > right,
        }
    }
}

/// `quantity_value(field, operator, value, units)`
fn quantity_value(halo: &Halo, context: &TargetContext<'_>, args: &OperatorArgs) -> HaloResult<bool> {
    let field = args.required_str(0, "field")?;
    let comparison = Comparison::parse(args.required_str(1, "operator")?)?;
    let value = args.required_f64(2, "value")?;
    let units = args.str_or(3, "units", "")?;

    let units = context.halos.unit_registry().unit(units)?;
    let current = halo.quantity(field)?.in_units(&units)?.value;
    Ok(comparison.holds(current, value))
}

/// `not_subhalo(field_type = "halos")`
///
/// True for halos that are not contained in a larger neighbour.
fn not_subhalo(halo: &Halo, context: &TargetContext<'_>, args: &OperatorArgs) -> HaloResult<bool> {
    let field_type = args.str_or(0, "field_type", "halos")?;
    let parents = context.parent_map(|| parent_map(context.halos, field_type))?;
    let id = halo.identifier();
    parents.get(&id).map(|parent| *parent == -1).ok_or_else(|| {
        HaloError::lookup(
            "LOOKUP.HALO_ID",
            format!("halo {id} is not part of the parent map"),
        )
    })
}

/// Maps every halo id to its parent id, `-1` for halos without one.
///
/// When two or more halos lie within one halo's radius, all of them are
/// assigned the id of the largest among them. Halos assigned their own id
/// end up with `-1`.
pub fn parent_map(halos: &dyn DataSource, field_type: &str) -> HaloResult<HashMap<i64, i64>> {
    let registry = halos.unit_registry();
    let mpc = registry.unit("Mpc")?;
    let field = |name: &str| -> HaloResult<Vec<f64>> {
        Ok(halos
            .full_field(&FieldKey::new(field_type, name))?
            .in_units(&mpc)?
            .values)
    };
    let mut axes = Vec::with_capacity(3);
    for name in PARTICLE_POSITION_FIELDS {
        axes.push(field(name)?);
    }
    let radii = field("virial_radius")?;
    let ids: Vec<i64> = halos
        .full_field(&FieldKey::new(field_type, "particle_identifier"))?
        .values
        .iter()
        .map(|value| value.round() as i64)
        .collect();
    let positions: Vec<[f64; 3]> = (0..ids.len())
        .map(|row| [axes[0][row], axes[1][row], axes[2][row]])
        .collect();

    let code_to_mpc = registry.unit("code_length")?.conversion_factor(&mpc)?;
    let domain = halos.geometry();
    let scaled = |edge: [f64; 3]| edge.map(|value| value * code_to_mpc);
    let geometry = DomainGeometry {
        left_edge: scaled(domain.left_edge),
        right_edge: scaled(domain.right_edge),
        periodicity: domain.periodicity,
    };
    let tree = KdTree::new(&positions, geometry);

    let mut parents = vec![-1_i64; ids.len()];
    for (index, position) in positions.iter().enumerate() {
        let mut neighbours = tree.within(*position, radii[index]);
        if neighbours.len() < 2 {
            continue;
        }
        neighbours.sort_unstable();
        let largest = neighbours
            .iter()
            .copied()
            .reduce(|best, candidate| if radii[candidate] > radii[best] { candidate } else { best })
            .unwrap_or(index);
        for neighbour in neighbours {
            parents[neighbour] = ids[largest];
        }
    }
    for (parent, id) in parents.iter_mut().zip(&ids) {
        if *parent == *id {
            *parent = -1;
        }
    }
    info!(
        halos = ids.len(),
        subhalos = parents.iter().filter(|parent| **parent != -1).count(),
        "built halo parent map"
    );
    Ok(ids.into_iter().zip(parents).collect())
}
