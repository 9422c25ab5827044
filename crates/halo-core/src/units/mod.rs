//! Runtime unit tags for catalog columns and halo quantities.
//!
//! Units are resolved once through a [`UnitRegistry`] built from a dataset's
//! code units and cosmology; the resolved [`Unit`] carries its cgs factor so
//! conversions to the base (cgs) system never need the registry again.

use crate::common::constants::{KM_CGS, KPC_CGS, MASS_SUN_CGS, MPC_CGS, SECONDS_PER_YEAR};
use crate::domain::{Cosmology, HaloError};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum UnitError {
    #[error("unknown unit symbol '{symbol}'")]
    UnknownSymbol { symbol: String },
    #[error("malformed exponent '{exponent}' in unit '{expression}'")]
    MalformedExponent { expression: String, exponent: String },
    #[error("cannot convert '{from}' to '{to}': dimensions differ")]
    DimensionMismatch { from: String, to: String },
}

impl From<UnitError> for HaloError {
    fn from(source: UnitError) -> Self {
        HaloError::computation("RUN.UNITS", source.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Dimension {
    pub mass: i8,
    pub length: i8,
    pub time: i8,
}

impl Dimension {
    pub const NONE: Self = Self::new(0, 0, 0);
    pub const MASS: Self = Self::new(1, 0, 0);
    pub const LENGTH: Self = Self::new(0, 1, 0);
    pub const TIME: Self = Self::new(0, 0, 1);
    pub const VELOCITY: Self = Self::new(0, 1, -1);

    pub const fn new(mass: i8, length: i8, time: i8) -> Self {
        Self { mass, length, time }
    }

    pub const fn is_dimensionless(self) -> bool {
        self.mass == 0 && self.length == 0 && self.time == 0
    }

    fn scaled(self, power: i8) -> Self {
        Self::new(self.mass * power, self.length * power, self.time * power)
    }

    fn combined(self, other: Self) -> Self {
        Self::new(
            self.mass + other.mass,
            self.length + other.length,
            self.time + other.time,
        )
    }

    /// Canonical cgs symbol for this dimension, e.g. `g/cm**3`.
    pub fn base_symbol(self) -> String {
        let atoms = [("g", self.mass), ("cm", self.length), ("s", self.time)];
        let render = |symbol: &str, power: i8| {
            if power == 1 {
                symbol.to_string()
            } else {
                format!("{symbol}**{power}")
            }
        };
        let numerator: Vec<String> = atoms
            .iter()
            .filter(|(_, power)| *power > 0)
            .map(|(symbol, power)| render(symbol, *power))
            .collect();
        let denominator: Vec<String> = atoms
            .iter()
            .filter(|(_, power)| *power < 0)
            .map(|(symbol, power)| render(symbol, -*power))
            .collect();

        let mut symbol = if numerator.is_empty() {
            if denominator.is_empty() {
                String::new()
            } else {
                "1".to_string()
            }
        } else {
            numerator.join("*")
        };
        for atom in denominator {
            symbol.push('/');
            symbol.push_str(&atom);
        }
        symbol
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Unit {
    symbol: String,
    cgs_factor: f64,
    dimension: Dimension,
}

impl Unit {
    pub fn new(symbol: impl Into<String>, cgs_factor: f64, dimension: Dimension) -> Self {
        Self {
            symbol: symbol.into(),
            cgs_factor,
            dimension,
        }
    }

    pub fn base(dimension: Dimension) -> Self {
        Self::new(dimension.base_symbol(), 1.0, dimension)
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub const fn cgs_factor(&self) -> f64 {
        self.cgs_factor
    }

    pub const fn dimension(&self) -> Dimension {
        self.dimension
    }

    /// Multiplicative factor taking values in `self` to values in `target`.
    pub fn conversion_factor(&self, target: &Unit) -> Result<f64, UnitError> {
        if self.dimension != target.dimension {
            return Err(UnitError::DimensionMismatch {
                from: self.symbol.clone(),
                to: target.symbol.clone(),
            });
        }
        Ok(self.cgs_factor / target.cgs_factor)
    }
}

impl Display for Unit {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.symbol)
    }
}

/// Code units and cosmology needed to resolve dataset-relative symbols.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CodeUnits {
    pub length_cgs: f64,
    pub mass_cgs: f64,
    pub time_cgs: f64,
}

impl CodeUnits {
    pub const fn cgs() -> Self {
        Self {
            length_cgs: 1.0,
            mass_cgs: 1.0,
            time_cgs: 1.0,
        }
    }
}

impl Default for CodeUnits {
    fn default() -> Self {
        Self::cgs()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnitRegistry {
    code_units: CodeUnits,
    unitary_code_length: f64,
    hubble_constant: f64,
    current_redshift: f64,
}

impl UnitRegistry {
    pub fn new(code_units: CodeUnits, domain_width: f64, cosmology: Option<&Cosmology>) -> Self {
        Self {
            code_units,
            unitary_code_length: domain_width,
            hubble_constant: cosmology.map_or(1.0, |c| c.hubble_constant),
            current_redshift: cosmology.map_or(0.0, |c| c.current_redshift),
        }
    }

    pub const fn code_units(&self) -> CodeUnits {
        self.code_units
    }

    /// Resolves a symbol such as `Msun`, `km/s`, `Mpccm/h` or `g/cm**3`.
    pub fn unit(&self, expression: &str) -> Result<Unit, UnitError> {
        let trimmed = expression.trim();
        if trimmed.is_empty() || trimmed == "dimensionless" {
            return Ok(Unit::new(trimmed, 1.0, Dimension::NONE));
        }

        let mut factor = 1.0;
        let mut dimension = Dimension::NONE;
        for (sign, term) in split_terms(trimmed) {
            let (atom, power) = parse_term(trimmed, term)?;
            if atom == "1" {
                continue;
            }
            let (atom_factor, atom_dimension) = self.atom(atom)?;
            let signed_power = sign * power;
            factor *= atom_factor.powi(i32::from(signed_power));
            dimension = dimension.combined(atom_dimension.scaled(signed_power));
        }

        Ok(Unit::new(trimmed, factor, dimension))
    }

    fn atom(&self, symbol: &str) -> Result<(f64, Dimension), UnitError> {
        let comoving = 1.0 / (1.0 + self.current_redshift);
        let code = self.code_units;
        let resolved = match symbol {
            "h" => (self.hubble_constant, Dimension::NONE),
            "g" => (1.0, Dimension::MASS),
            "kg" => (1.0e3, Dimension::MASS),
            "Msun" => (MASS_SUN_CGS, Dimension::MASS),
            "cm" => (1.0, Dimension::LENGTH),
            "m" => (1.0e2, Dimension::LENGTH),
            "km" => (KM_CGS, Dimension::LENGTH),
            "pc" => (KPC_CGS * 1.0e-3, Dimension::LENGTH),
            "kpc" => (KPC_CGS, Dimension::LENGTH),
            "Mpc" => (MPC_CGS, Dimension::LENGTH),
            "kpccm" => (KPC_CGS * comoving, Dimension::LENGTH),
            "Mpccm" => (MPC_CGS * comoving, Dimension::LENGTH),
            "s" => (1.0, Dimension::TIME),
            "yr" => (SECONDS_PER_YEAR, Dimension::TIME),
            "Myr" => (SECONDS_PER_YEAR * 1.0e6, Dimension::TIME),
            "code_length" => (code.length_cgs, Dimension::LENGTH),
            "code_mass" => (code.mass_cgs, Dimension::MASS),
            "code_time" => (code.time_cgs, Dimension::TIME),
            "code_velocity" => (code.length_cgs / code.time_cgs, Dimension::VELOCITY),
            "unitary" => (code.length_cgs * self.unitary_code_length, Dimension::LENGTH),
            _ => {
                return Err(UnitError::UnknownSymbol {
                    symbol: symbol.to_string(),
                });
            }
        };
        Ok(resolved)
    }
}

impl Default for UnitRegistry {
    fn default() -> Self {
        Self::new(CodeUnits::cgs(), 1.0, None)
    }
}

/// Splits `a*b/c**2` into signed terms, keeping `**` exponents attached.
fn split_terms(expression: &str) -> Vec<(i8, &str)> {
    let bytes = expression.as_bytes();
    let mut terms = Vec::new();
    let mut sign = 1_i8;
    let mut start = 0;
    let mut index = 0;
    while index < bytes.len() {
        match bytes[index] {
            b'*' if bytes.get(index + 1) == Some(&b'*') => index += 2,
            b'*' | b'/' => {
                terms.push((sign, &expression[start..index]));
                sign = if bytes[index] == b'/' { -1 } else { 1 };
                index += 1;
                start = index;
            }
            _ => index += 1,
        }
    }
    terms.push((sign, &expression[start..]));
    terms
}

fn parse_term<'a>(expression: &str, term: &'a str) -> Result<(&'a str, i8), UnitError> {
    match term.split_once("**") {
        Some((atom, exponent)) => {
            let power = exponent
                .trim()
                .parse::<i8>()
                .map_err(|_| UnitError::MalformedExponent {
                    expression: expression.to_string(),
                    exponent: exponent.to_string(),
                })?;
            Ok((atom.trim(), power))
        }
        None => Ok((term.trim(), 1)),
    }
}

/// A single unit-tagged scalar.
#[derive(Debug, Clone, PartialEq)]
pub struct Quantity {
    pub value: f64,
    pub units: Option<Unit>,
}

impl Quantity {
    pub fn new(value: f64, units: Unit) -> Self {
        Self {
            value,
            units: Some(units),
        }
    }

    pub const fn plain(value: f64) -> Self {
        Self { value, units: None }
    }

    pub fn has_units(&self) -> bool {
        self.units.is_some()
    }

    pub fn in_units(&self, target: &Unit) -> Result<Quantity, UnitError> {
        let factor = match &self.units {
            Some(units) => units.conversion_factor(target)?,
            None if target.dimension().is_dimensionless() => 1.0 / target.cgs_factor(),
            None => {
                return Err(UnitError::DimensionMismatch {
                    from: String::new(),
                    to: target.symbol().to_string(),
                });
            }
        };
        Ok(Quantity::new(self.value * factor, target.clone()))
    }

    pub fn convert_to_base(&mut self) {
        if let Some(units) = &self.units {
            self.value *= units.cgs_factor();
            self.units = Some(Unit::base(units.dimension()));
        }
    }
}

/// Homogeneous unit-tagged column.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct UnitArray {
    pub values: Vec<f64>,
    pub units: Option<Unit>,
}

impl UnitArray {
    pub fn new(values: Vec<f64>, units: Option<Unit>) -> Self {
        Self { values, units }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<Quantity> {
        self.values.get(index).map(|value| Quantity {
            value: *value,
            units: self.units.clone(),
        })
    }

    pub fn in_units(&self, target: &Unit) -> Result<UnitArray, UnitError> {
        let factor = match &self.units {
            Some(units) => units.conversion_factor(target)?,
            None => 1.0,
        };
        Ok(UnitArray::new(
            self.values.iter().map(|value| value * factor).collect(),
            Some(target.clone()),
        ))
    }

    pub fn select(&self, indices: &[usize]) -> UnitArray {
        UnitArray::new(
            indices.iter().map(|index| self.values[*index]).collect(),
            self.units.clone(),
        )
    }

    /// Collects scalars into a column; units come from the first entry.
    pub fn from_quantities<'a>(
        quantities: impl IntoIterator<Item = &'a Quantity>,
    ) -> Result<UnitArray, UnitError> {
        let mut values = Vec::new();
        let mut units: Option<Unit> = None;
        for (index, quantity) in quantities.into_iter().enumerate() {
            if index == 0 {
                units = quantity.units.clone();
                values.push(quantity.value);
                continue;
            }
            match (&units, &quantity.units) {
                (Some(column), Some(_)) => values.push(quantity.in_units(column)?.value),
                _ => values.push(quantity.value),
            }
        }
        Ok(UnitArray::new(values, units))
    }
}
