pub mod fermi_edge;
pub mod gaussian;
pub mod lineshapes;

use std::fmt::Display;

use super::parameters::{ParameterError, ParameterKind, Parameters};

#[derive(Debug, Clone, PartialEq)]
pub enum ModelError {
    Parameter(ParameterError),
    GuessNotSupported(&'static str),
    EmptyData,
    LengthMismatch { x: usize, y: usize },
}

impl From<ParameterError> for ModelError {
    fn from(value: ParameterError) -> Self {
        ModelError::Parameter(value)
    }
}

impl Display for ModelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelError::Parameter(x) => write!(f, "Model parameter error: {}", x),
            ModelError::GuessNotSupported(name) => {
                write!(f, "The guess method is not implemented for model '{}'", name)
            }
            ModelError::EmptyData => write!(f, "Model received no data points"),
            ModelError::LengthMismatch { x, y } => write!(
                f,
                "x and y must have the same length (x: {}, y: {})",
                x, y
            ),
        }
    }
}

impl std::error::Error for ModelError {}

/// One named sub-model evaluation of a composite model.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Component {
    pub name: String,
    pub y: Vec<f64>,
}

/// A pure mapping from (x, parameters) to a curve of the same length as x.
pub trait Model {
    fn name(&self) -> &'static str;

    /// Parameter set with default values and bounds.
    fn make_params(&self) -> Result<Parameters, ModelError>;

    fn eval(&self, params: &Parameters, x: &[f64]) -> Result<Vec<f64>, ModelError>;

    fn eval_components(
        &self,
        params: &Parameters,
        x: &[f64],
    ) -> Result<Vec<Component>, ModelError> {
        Ok(vec![Component {
            name: self.name().to_string(),
            y: self.eval(params, x)?,
        }])
    }

    /// Estimates starting values from data.
    fn guess(&self, _x: &[f64], _y: &[f64]) -> Result<Parameters, ModelError> {
        Err(ModelError::GuessNotSupported(self.name()))
    }
}

/// Composite of two models: both are evaluated over x and the resulting arrays
/// are convolved (see [`lineshapes::convolve`]).
#[derive(Debug, Clone, Default)]
pub struct ConvolvedModel<L, R> {
    pub left: L,
    pub right: R,
}

impl<L: Model, R: Model> ConvolvedModel<L, R> {
    pub fn new(left: L, right: R) -> Self {
        Self { left, right }
    }
}

impl<L: Model, R: Model> Model for ConvolvedModel<L, R> {
    fn name(&self) -> &'static str {
        "convolution"
    }

    fn make_params(&self) -> Result<Parameters, ModelError> {
        let mut params = self.left.make_params()?;
        for p in self.right.make_params()?.iter() {
            if params.get(&p.name).is_some() {
                continue;
            }
            match &p.kind {
                ParameterKind::Fixed(v) => params.add_fixed(&p.name, *v)?,
                ParameterKind::Free(v, bounds) => {
                    params.add_bounded(&p.name, *v, *bounds)?
                }
                ParameterKind::DerivedExpr(expr, deps) => {
                    let deps: Vec<&str> = deps.iter().map(String::as_str).collect();
                    params.add_expr(&p.name, *expr, &deps)?
                }
            }
        }
        Ok(params)
    }

    fn eval(&self, params: &Parameters, x: &[f64]) -> Result<Vec<f64>, ModelError> {
        let left = self.left.eval(params, x)?;
        let right = self.right.eval(params, x)?;
        Ok(lineshapes::convolve(&left, &right))
    }

    fn eval_components(
        &self,
        params: &Parameters,
        x: &[f64],
    ) -> Result<Vec<Component>, ModelError> {
        let mut components = self.left.eval_components(params, x)?;
        components.extend(self.right.eval_components(params, x)?);
        Ok(components)
    }
}
