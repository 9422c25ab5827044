//! Named operators and the registries they are looked up in.
//!
//! A pipeline resolves operator names against a [`Registries`] value when an
//! action is added. Registries are plain values until they are wrapped in an
//! `Arc` and handed to a pipeline; from then on they are read-only.

use super::pipeline::AnalysisPipeline;
use super::target::{Halo, TargetContext};
use crate::data::DatasetSeries;
use crate::domain::{HaloError, HaloResult};
use crate::parallel::Communicator;
use crate::rockstar::RockstarHandler;
use crate::units::Quantity;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

pub type CallbackFn =
    Arc<dyn Fn(&mut Halo, &TargetContext<'_>, &OperatorArgs) -> HaloResult<()> + Send + Sync>;
pub type FilterFn =
    Arc<dyn Fn(&Halo, &TargetContext<'_>, &OperatorArgs) -> HaloResult<bool> + Send + Sync>;
pub type QuantityFn =
    Arc<dyn Fn(&Halo, &TargetContext<'_>, &OperatorArgs) -> HaloResult<Quantity> + Send + Sync>;
pub type RecipeFn = Arc<dyn Fn(&mut AnalysisPipeline, &OperatorArgs) -> HaloResult<()> + Send + Sync>;
pub type FindingMethodFn =
    Arc<dyn Fn(&FindingContext<'_>, &OperatorArgs) -> HaloResult<()> + Send + Sync>;

/// What a finding method needs to locate halos and persist a catalog.
pub struct FindingContext<'a> {
    pub series: &'a DatasetSeries,
    pub comm: &'a dyn Communicator,
    /// Catalog root; each dataset writes under `<output_dir>/<basename>`.
    pub output_dir: &'a Path,
    pub rockstar: Option<&'a dyn RockstarHandler>,
}

/// Bound positional and keyword arguments.
///
/// Accessors look a parameter up by keyword first, then by position.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperatorArgs {
    pub positional: Vec<Value>,
    pub keyword: Map<String, Value>,
}

impl OperatorArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_parts(positional: Vec<Value>, keyword: Map<String, Value>) -> Self {
        Self {
            positional,
            keyword,
        }
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.positional.push(value.into());
        self
    }

    pub fn kwarg(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.keyword.insert(name.to_string(), value.into());
        self
    }

    pub fn value(&self, position: usize, name: &str) -> Option<&Value> {
        self.keyword
            .get(name)
            .or_else(|| self.positional.get(position))
    }

    pub fn take_keyword(&mut self, name: &str) -> Option<Value> {
        self.keyword.remove(name)
    }

    pub fn set_keyword(&mut self, name: &str, value: impl Into<Value>) {
        self.keyword.insert(name.to_string(), value.into());
    }

    pub fn f64_or(&self, position: usize, name: &str, default: f64) -> HaloResult<f64> {
        match self.value(position, name) {
            None | Some(Value::Null) => Ok(default),
            Some(value) => value.as_f64().ok_or_else(|| invalid_argument(name, "a number", value)),
        }
    }

    pub fn required_f64(&self, position: usize, name: &str) -> HaloResult<f64> {
        let value = self.value(position, name).ok_or_else(|| missing_argument(name))?;
        value.as_f64().ok_or_else(|| invalid_argument(name, "a number", value))
    }

    pub fn usize_or(&self, position: usize, name: &str, default: usize) -> HaloResult<usize> {
        match self.value(position, name) {
            None | Some(Value::Null) => Ok(default),
            Some(value) => value
                .as_u64()
                .and_then(|number| usize::try_from(number).ok())
                .ok_or_else(|| invalid_argument(name, "a non-negative integer", value)),
        }
    }

    pub fn str_or<'a>(&'a self, position: usize, name: &str, default: &'a str) -> HaloResult<&'a str> {
        match self.value(position, name) {
            None | Some(Value::Null) => Ok(default),
            Some(value) => value.as_str().ok_or_else(|| invalid_argument(name, "a string", value)),
        }
    }

    pub fn required_str(&self, position: usize, name: &str) -> HaloResult<&str> {
        let value = self.value(position, name).ok_or_else(|| missing_argument(name))?;
        value.as_str().ok_or_else(|| invalid_argument(name, "a string", value))
    }

    /// A single string or a list of strings.
    pub fn string_list(&self, position: usize, name: &str) -> HaloResult<Vec<String>> {
        let value = self.value(position, name).ok_or_else(|| missing_argument(name))?;
        match value {
            Value::String(single) => Ok(vec![single.clone()]),
            Value::Array(items) => items
                .iter()
                .map(|item| {
                    item.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| invalid_argument(name, "a list of strings", value))
                })
                .collect(),
            other => Err(invalid_argument(name, "a string or a list of strings", other)),
        }
    }

    pub fn bool_or(&self, position: usize, name: &str, default: bool) -> HaloResult<bool> {
        match self.value(position, name) {
            None | Some(Value::Null) => Ok(default),
            Some(value) => value.as_bool().ok_or_else(|| invalid_argument(name, "a boolean", value)),
        }
    }
}

fn missing_argument(name: &str) -> HaloError {
    HaloError::configuration("CONFIG.OPERATOR_ARGS", format!("missing argument '{name}'"))
}

fn invalid_argument(name: &str, expected: &str, actual: &Value) -> HaloError {
    HaloError::configuration(
        "CONFIG.OPERATOR_ARGS",
        format!("argument '{name}' must be {expected}, got {actual}"),
    )
}

/// An operator with its arguments bound at lookup time.
#[derive(Clone)]
pub struct BoundOperator<F> {
    pub name: String,
    pub function: F,
    pub args: OperatorArgs,
}

impl<F> Debug for BoundOperator<F> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundOperator")
            .field("name", &self.name)
            .field("args", &self.args)
            .finish_non_exhaustive()
    }
}

/// Name to function map for one operator category.
#[derive(Clone)]
pub struct OperatorRegistry<F> {
    category: &'static str,
    entries: BTreeMap<String, F>,
}

impl<F: Clone> OperatorRegistry<F> {
    pub fn new(category: &'static str) -> Self {
        Self {
            category,
            entries: BTreeMap::new(),
        }
    }

    /// Registers `function` under `name`, returning the one it replaced.
    pub fn register(&mut self, name: impl Into<String>, function: F) -> Option<F> {
        let name = name.into();
        debug!(category = self.category, name = %name, "registering operator");
        self.entries.insert(name, function)
    }

    pub fn find(&self, name: &str, args: OperatorArgs) -> HaloResult<BoundOperator<F>> {
        let function = self.entries.get(name).cloned().ok_or_else(|| {
            HaloError::lookup(
                "LOOKUP.OPERATOR",
                format!(
                    "unknown {} '{name}'; registered: [{}]",
                    self.category,
                    self.names().join(", ")
                ),
            )
        })?;
        Ok(BoundOperator {
            name: name.to_string(),
            function,
            args,
        })
    }

    pub fn remove(&mut self, name: &str) -> Option<F> {
        self.entries.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }
}

impl<F> Debug for OperatorRegistry<F> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperatorRegistry")
            .field("category", &self.category)
            .field("entries", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct Registries {
    pub callbacks: OperatorRegistry<CallbackFn>,
    pub filters: OperatorRegistry<FilterFn>,
    pub quantities: OperatorRegistry<QuantityFn>,
    pub recipes: OperatorRegistry<RecipeFn>,
    pub finding_methods: OperatorRegistry<FindingMethodFn>,
}

impl Registries {
    pub fn empty() -> Self {
        Self {
            callbacks: OperatorRegistry::new("callback"),
            filters: OperatorRegistry::new("filter"),
            quantities: OperatorRegistry::new("quantity"),
            recipes: OperatorRegistry::new("recipe"),
            finding_methods: OperatorRegistry::new("finding method"),
        }
    }

    /// Every operator shipped with the crate.
    pub fn with_builtins() -> Self {
        let mut registries = Self::empty();
        super::callbacks::register(&mut registries.callbacks);
        super::filters::register(&mut registries.filters);
        super::quantities::register(&mut registries.quantities);
        super::recipes::register(&mut registries.recipes);
        super::finding_methods::register(&mut registries.finding_methods);
        registries
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }
}

impl Default for Registries {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::{FilterFn, OperatorArgs, OperatorRegistry, Registries};
    use crate::domain::HaloErrorCategory;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn keyword_arguments_take_precedence_over_positions() {
        let args = OperatorArgs::new().arg(1.5).arg("kpc").kwarg("factor", 3.0);
        assert_eq!(args.f64_or(0, "factor", 1.0).expect("factor"), 3.0);
        assert_eq!(args.str_or(1, "units", "cm").expect("units"), "kpc");
        assert_eq!(args.usize_or(7, "bins", 300).expect("bins"), 300);
        assert!(args.required_str(0, "field").is_err());
    }

    #[test]
    fn string_list_accepts_scalar_or_array() {
        let single = OperatorArgs::new().arg("radius");
        assert_eq!(single.string_list(0, "fields").expect("list"), vec!["radius"]);
        let many = OperatorArgs::new().kwarg("fields", json!(["radius", "matter_mass"]));
        assert_eq!(many.string_list(0, "fields").expect("list").len(), 2);
    }

    #[test]
    fn registration_overwrites_and_lookup_fails_for_unknown_names() {
        let mut registry: OperatorRegistry<FilterFn> = OperatorRegistry::new("filter");
        let always: FilterFn = Arc::new(|_, _, _| Ok(true));
        let never: FilterFn = Arc::new(|_, _, _| Ok(false));
        assert!(registry.register("keep", always).is_none());
        assert!(registry.register("keep", never).is_some());
        assert_eq!(registry.names(), vec!["keep"]);

        let error = registry
            .find("missing", OperatorArgs::new())
            .expect_err("unknown name should fail");
        assert_eq!(error.category(), HaloErrorCategory::Lookup);
        assert!(error.message().contains("keep"));

        assert!(registry.remove("keep").is_some());
        assert!(!registry.contains("keep"));
    }

    #[test]
    fn builtins_cover_every_category() {
        let registries = Registries::with_builtins();
        assert!(registries.filters.contains("quantity_value"));
        assert!(registries.filters.contains("not_subhalo"));
        assert!(registries.callbacks.contains("sphere"));
        assert!(registries.callbacks.contains("delete_attribute"));
        assert!(registries.quantities.contains("virial_value"));
        assert!(registries.recipes.contains("calculate_virial_quantities"));
        for method in ["fof", "hop", "rockstar"] {
            assert!(registries.finding_methods.contains(method));
        }
    }
}
