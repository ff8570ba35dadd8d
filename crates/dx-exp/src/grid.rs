use std::collections::BTreeSet;
use std::fmt::{self, Display};

use dx_core::errors::{DxError, ErrorInfo};
use dx_core::ParamValue;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Grid parameter descriptor: one option and its candidate values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridParameter {
    pub name: String,
    pub values: Vec<ParamValue>,
}

/// Ordered option → candidate list mapping describing a sweep.
///
/// Declaration order is significant: the first option varies slowest during
/// expansion and the last varies fastest.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterSpec {
    parameters: Vec<GridParameter>,
}

impl ParameterSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_parameters(parameters: Vec<GridParameter>) -> Self {
        Self { parameters }
    }

    /// Appends an option. Validation happens when the grid is built.
    pub fn option<I, V>(mut self, name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<ParamValue>,
    {
        self.parameters.push(GridParameter {
            name: name.into(),
            values: values.into_iter().map(Into::into).collect(),
        });
        self
    }

    pub fn parameters(&self) -> &[GridParameter] {
        &self.parameters
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    /// Checks option names and value lists and returns the number of bindings it expands to.
    pub fn validate(&self) -> Result<usize, DxError> {
        let mut seen = BTreeSet::new();
        let mut total: usize = 1;
        for param in &self.parameters {
            if param.name.trim().is_empty() {
                return Err(DxError::Config(ErrorInfo::new(
                    "grid.blank_name",
                    "parameter option has an empty name",
                )));
            }
            if !seen.insert(param.name.as_str()) {
                return Err(DxError::Config(
                    ErrorInfo::new("grid.duplicate_option", "parameter option declared twice")
                        .with_context("option", param.name.clone()),
                ));
            }
            if param.values.is_empty() {
                return Err(DxError::Config(
                    ErrorInfo::new("grid.empty_values", "parameter option has no candidate values")
                        .with_context("option", param.name.clone())
                        .with_hint("list at least one value or drop the option"),
                ));
            }
            total = total.checked_mul(param.values.len()).ok_or_else(|| {
                DxError::Config(
                    ErrorInfo::new("grid.too_large", "parameter grid size overflows usize")
                        .with_context("option", param.name.clone()),
                )
            })?;
        }
        Ok(total)
    }
}

/// One concrete assignment of a value to every option of a [`ParameterSpec`].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParameterBinding {
    values: Vec<(String, ParamValue)>,
}

impl ParameterBinding {
    /// The binding used by experiments without a parameter grid.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.values.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.values
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }

    /// Looks up an option, failing with a configuration error when absent.
    pub fn require(&self, name: &str) -> Result<&ParamValue, DxError> {
        self.get(name).ok_or_else(|| {
            DxError::Config(
                ErrorInfo::new("binding.missing_option", "binding has no such option")
                    .with_context("option", name)
                    .with_context("binding", self.to_string()),
            )
        })
    }

    pub fn int(&self, name: &str) -> Result<i64, DxError> {
        let value = self.require(name)?;
        value.as_i64().ok_or_else(|| self.type_error(name, "int", value))
    }

    pub fn float(&self, name: &str) -> Result<f64, DxError> {
        let value = self.require(name)?;
        value.as_f64().ok_or_else(|| self.type_error(name, "float", value))
    }

    pub fn str(&self, name: &str) -> Result<&str, DxError> {
        let value = self.require(name)?;
        value.as_str().ok_or_else(|| self.type_error(name, "string", value))
    }

    pub fn bool(&self, name: &str) -> Result<bool, DxError> {
        let value = self.require(name)?;
        value.as_bool().ok_or_else(|| self.type_error(name, "bool", value))
    }

    fn type_error(&self, name: &str, expected: &str, found: &ParamValue) -> DxError {
        DxError::Config(
            ErrorInfo::new("binding.type_mismatch", "option has an unexpected type")
                .with_context("option", name)
                .with_context("expected", expected)
                .with_context("found", found.kind()),
        )
    }
}

impl Display for ParameterBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (idx, (name, value)) in self.values.iter().enumerate() {
            if idx > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{name}={value}")?;
        }
        write!(f, "}}")
    }
}

impl FromIterator<(String, ParamValue)> for ParameterBinding {
    fn from_iter<I: IntoIterator<Item = (String, ParamValue)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

impl Serialize for ParameterBinding {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (name, value) in &self.values {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for ParameterBinding {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct BindingVisitor;

        impl<'de> Visitor<'de> for BindingVisitor {
            type Value = ParameterBinding;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of option names to scalar values")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut values = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((name, value)) = access.next_entry::<String, ParamValue>()? {
                    values.push((name, value));
                }
                Ok(ParameterBinding { values })
            }
        }

        deserializer.deserialize_map(BindingVisitor)
    }
}

/// Validated parameter space that expands into bindings in row-major order.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterGrid {
    spec: ParameterSpec,
    len: usize,
}

impl ParameterGrid {
    pub fn new(spec: ParameterSpec) -> Result<Self, DxError> {
        let len = spec.validate()?;
        Ok(Self { spec, len })
    }

    pub fn spec(&self) -> &ParameterSpec {
        &self.spec
    }

    /// Number of bindings; one for an empty spec.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the binding at the given row-major position.
    pub fn binding_at(&self, index: usize) -> Option<ParameterBinding> {
        if index >= self.len {
            return None;
        }
        let params = self.spec.parameters();
        let mut picks = vec![0usize; params.len()];
        let mut rem = index;
        for (slot, param) in picks.iter_mut().zip(params).rev() {
            *slot = rem % param.values.len();
            rem /= param.values.len();
        }
        Some(
            params
                .iter()
                .zip(picks)
                .map(|(param, pick)| (param.name.clone(), param.values[pick].clone()))
                .collect(),
        )
    }

    /// Lazily iterates the bindings. Each call starts a fresh pass.
    pub fn iter(&self) -> GridIter<'_> {
        GridIter {
            grid: self,
            next: 0,
        }
    }
}

impl<'a> IntoIterator for &'a ParameterGrid {
    type Item = ParameterBinding;
    type IntoIter = GridIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator over the bindings of a [`ParameterGrid`].
#[derive(Debug, Clone)]
pub struct GridIter<'a> {
    grid: &'a ParameterGrid,
    next: usize,
}

impl Iterator for GridIter<'_> {
    type Item = ParameterBinding;

    fn next(&mut self) -> Option<Self::Item> {
        let binding = self.grid.binding_at(self.next)?;
        self.next += 1;
        Some(binding)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.grid.len() - self.next.min(self.grid.len());
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for GridIter<'_> {}
