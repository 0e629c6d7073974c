use std::fmt::Display;

/// Floor applied to widths whenever a height/width ratio is formed.
pub const WIDTH_FLOOR: f64 = 1e-12;

#[derive(Debug, Clone, PartialEq)]
pub enum ParameterError {
    UnknownParameterReference { parameter: String, reference: String },
    ConstraintCycle(String),
    InvalidParameterBounds { name: String, min: f64, max: f64 },
    DuplicateParameter(String),
    ArgumentCount {
        name: String,
        expected: usize,
        found: usize,
    },
}

impl Display for ParameterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParameterError::UnknownParameterReference {
                parameter,
                reference,
            } => write!(
                f,
                "Parameter '{}' references unknown parameter '{}'",
                parameter, reference
            ),
            ParameterError::ConstraintCycle(name) => {
                write!(f, "Constraint on parameter '{}' forms a dependency cycle", name)
            }
            ParameterError::InvalidParameterBounds { name, min, max } => write!(
                f,
                "Parameter '{}' has invalid bounds [{}, {}]",
                name, min, max
            ),
            ParameterError::DuplicateParameter(name) => {
                write!(f, "Parameter '{}' is already defined", name)
            }
            ParameterError::ArgumentCount {
                name,
                expected,
                found,
            } => write!(
                f,
                "Constraint on parameter '{}' expects {} arguments, got {}",
                name, expected, found
            ),
        }
    }
}

impl std::error::Error for ParameterError {}

#[derive(Debug, Clone, Copy, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Bounds {
    pub min: f64,
    pub max: f64,
}

impl Default for Bounds {
    fn default() -> Self {
        Self {
            min: f64::NEG_INFINITY,
            max: f64::INFINITY,
        }
    }
}

impl Bounds {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn lower(min: f64) -> Self {
        Self {
            min,
            max: f64::INFINITY,
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.min.is_nan() && !self.max.is_nan() && self.min <= self.max
    }

    pub fn clamp(&self, value: f64) -> f64 {
        value.max(self.min).min(self.max)
    }

    // MINUIT-style transforms: the minimiser works on an unbounded internal
    // coordinate and every external value it maps back to lies inside the bounds.
    pub fn to_internal(&self, value: f64) -> f64 {
        let value = self.clamp(value);
        match (self.min.is_finite(), self.max.is_finite()) {
            (true, true) => (2.0 * (value - self.min) / (self.max - self.min) - 1.0).asin(),
            (true, false) => ((value - self.min + 1.0).powi(2) - 1.0).sqrt(),
            (false, true) => ((self.max - value + 1.0).powi(2) - 1.0).sqrt(),
            (false, false) => value,
        }
    }

    pub fn to_external(&self, internal: f64) -> f64 {
        match (self.min.is_finite(), self.max.is_finite()) {
            (true, true) => self.min + (internal.sin() + 1.0) * (self.max - self.min) / 2.0,
            (true, false) => self.min - 1.0 + (internal * internal + 1.0).sqrt(),
            (false, true) => self.max + 1.0 - (internal * internal + 1.0).sqrt(),
            (false, false) => internal,
        }
    }

    /// d(external)/d(internal), used to carry the covariance back to external values.
    pub fn scale_gradient(&self, internal: f64) -> f64 {
        match (self.min.is_finite(), self.max.is_finite()) {
            (true, true) => internal.cos() * (self.max - self.min) / 2.0,
            (true, false) => internal / (internal * internal + 1.0).sqrt(),
            (false, true) => -internal / (internal * internal + 1.0).sqrt(),
            (false, false) => 1.0,
        }
    }
}

/// The closed set of algebraic relations a derived parameter may follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub enum Expr {
    /// `a`
    Alias,
    /// `2.3548 * sigma`
    Fwhm,
    /// `0.3989 * amplitude / max(sigma, 1e-12)`
    Height,
    /// `sqrt(a^2 - b^2)`, NaN when `b > a`
    Quadrature,
}

impl Expr {
    pub fn arity(&self) -> usize {
        match self {
            Expr::Alias | Expr::Fwhm => 1,
            Expr::Height | Expr::Quadrature => 2,
        }
    }

    pub fn evaluate(&self, args: &[f64]) -> f64 {
        match self {
            Expr::Alias => args[0],
            Expr::Fwhm => 2.3548 * args[0],
            Expr::Height => 0.3989 * args[0] / args[1].max(WIDTH_FLOOR),
            Expr::Quadrature => (args[0].powi(2) - args[1].powi(2)).sqrt(),
        }
    }

    pub fn render(&self, deps: &[String]) -> String {
        match self {
            Expr::Alias => deps[0].clone(),
            Expr::Fwhm => format!("2.3548*{}", deps[0]),
            Expr::Height => format!("0.3989*{}/max(1e-12,{})", deps[0], deps[1]),
            Expr::Quadrature => format!("sqrt({}**2-{}**2)", deps[0], deps[1]),
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub enum ParameterKind {
    Fixed(f64),
    Free(f64, Bounds),
    DerivedExpr(Expr, Vec<String>),
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Parameter {
    pub name: String,
    pub kind: ParameterKind,
    pub value: f64,
    pub init_value: f64,
    pub stderr: Option<f64>,
}

impl Parameter {
    pub fn is_free(&self) -> bool {
        matches!(self.kind, ParameterKind::Free(..))
    }

    pub fn is_derived(&self) -> bool {
        matches!(self.kind, ParameterKind::DerivedExpr(..))
    }

    pub fn bounds(&self) -> Bounds {
        match &self.kind {
            ParameterKind::Free(_, bounds) => *bounds,
            _ => Bounds::default(),
        }
    }

    pub fn expression(&self) -> Option<String> {
        match &self.kind {
            ParameterKind::DerivedExpr(expr, deps) => Some(expr.render(deps)),
            _ => None,
        }
    }
}

/// An ordered parameter set. Iteration follows insertion order.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Parameters {
    params: Vec<Parameter>,
    // indices of derived parameters, in the order their expressions were declared
    derived_order: Vec<usize>,
}

impl Parameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Parameter> {
        self.params.iter()
    }

    pub fn get(&self, name: &str) -> Option<&Parameter> {
        self.params.iter().find(|p| p.name == name)
    }

    fn index_of(&self, name: &str) -> Option<usize> {
        self.params.iter().position(|p| p.name == name)
    }

    pub fn value(&self, name: &str) -> Result<f64, ParameterError> {
        self.get(name)
            .map(|p| p.value)
            .ok_or_else(|| ParameterError::UnknownParameterReference {
                parameter: name.to_string(),
                reference: name.to_string(),
            })
    }

    fn push(&mut self, name: &str, kind: ParameterKind, value: f64) -> Result<(), ParameterError> {
        if self.index_of(name).is_some() {
            return Err(ParameterError::DuplicateParameter(name.to_string()));
        }
        self.params.push(Parameter {
            name: name.to_string(),
            kind,
            value,
            init_value: value,
            stderr: None,
        });
        Ok(())
    }

    pub fn add_free(&mut self, name: &str, value: f64) -> Result<(), ParameterError> {
        self.push(name, ParameterKind::Free(value, Bounds::default()), value)
    }

    pub fn add_bounded(
        &mut self,
        name: &str,
        value: f64,
        bounds: Bounds,
    ) -> Result<(), ParameterError> {
        if !bounds.is_valid() {
            return Err(ParameterError::InvalidParameterBounds {
                name: name.to_string(),
                min: bounds.min,
                max: bounds.max,
            });
        }
        let value = bounds.clamp(value);
        self.push(name, ParameterKind::Free(value, bounds), value)
    }

    pub fn add_fixed(&mut self, name: &str, value: f64) -> Result<(), ParameterError> {
        self.push(name, ParameterKind::Fixed(value), value)
    }

    /// Adds a derived parameter. Its arguments must already be defined.
    pub fn add_expr(&mut self, name: &str, expr: Expr, deps: &[&str]) -> Result<(), ParameterError> {
        let deps = self.check_references(name, expr, deps)?;
        self.push(name, ParameterKind::DerivedExpr(expr, deps), f64::NAN)?;
        self.derived_order.push(self.params.len() - 1);
        self.resolve()
    }

    /// Sets the value of an existing parameter, keeping its kind. Derived
    /// parameters are recomputed by the next `resolve`.
    pub fn set_value(&mut self, name: &str, value: f64) -> Result<(), ParameterError> {
        let index = self.require(name, name)?;
        let param = &mut self.params[index];
        match &mut param.kind {
            ParameterKind::Fixed(v) => *v = value,
            ParameterKind::Free(v, bounds) => *v = bounds.clamp(value),
            ParameterKind::DerivedExpr(..) => return Ok(()),
        }
        param.value = match param.kind {
            ParameterKind::Free(v, _) | ParameterKind::Fixed(v) => v,
            ParameterKind::DerivedExpr(..) => param.value,
        };
        param.init_value = param.value;
        self.resolve()
    }

    pub fn set_vary(&mut self, name: &str, vary: bool) -> Result<(), ParameterError> {
        let index = self.require(name, name)?;
        let param = &mut self.params[index];
        param.kind = match (&param.kind, vary) {
            (ParameterKind::Fixed(v), true) => ParameterKind::Free(*v, Bounds::default()),
            (ParameterKind::Free(v, _), false) => ParameterKind::Fixed(*v),
            (kind, _) => kind.clone(),
        };
        Ok(())
    }

    pub fn set_bounds(&mut self, name: &str, bounds: Bounds) -> Result<(), ParameterError> {
        if !bounds.is_valid() {
            return Err(ParameterError::InvalidParameterBounds {
                name: name.to_string(),
                min: bounds.min,
                max: bounds.max,
            });
        }
        let index = self.require(name, name)?;
        let param = &mut self.params[index];
        if let ParameterKind::Free(v, _) = param.kind {
            let v = bounds.clamp(v);
            param.kind = ParameterKind::Free(v, bounds);
            param.value = v;
            param.init_value = v;
        }
        Ok(())
    }

    /// Turns an existing parameter into a derived one. References may point
    /// anywhere in the set, so the dependency graph is checked for cycles.
    pub fn set_expr(&mut self, name: &str, expr: Expr, deps: &[&str]) -> Result<(), ParameterError> {
        let index = self.require(name, name)?;
        let deps = self.check_references(name, expr, deps)?;

        let previous = self.params[index].kind.clone();
        self.params[index].kind = ParameterKind::DerivedExpr(expr, deps);
        self.derived_order.retain(|&i| i != index);
        self.derived_order.push(index);

        if let Err(e) = self.resolution_order() {
            self.params[index].kind = previous;
            self.derived_order.retain(|&i| i != index);
            return Err(e);
        }
        self.resolve()
    }

    fn require(&self, parameter: &str, reference: &str) -> Result<usize, ParameterError> {
        self.index_of(reference)
            .ok_or_else(|| ParameterError::UnknownParameterReference {
                parameter: parameter.to_string(),
                reference: reference.to_string(),
            })
    }

    fn check_references(
        &self,
        name: &str,
        expr: Expr,
        deps: &[&str],
    ) -> Result<Vec<String>, ParameterError> {
        if deps.len() != expr.arity() {
            return Err(ParameterError::ArgumentCount {
                name: name.to_string(),
                expected: expr.arity(),
                found: deps.len(),
            });
        }
        if deps.contains(&name) {
            return Err(ParameterError::ConstraintCycle(name.to_string()));
        }
        for dep in deps {
            self.require(name, dep)?;
        }
        Ok(deps.iter().map(|d| d.to_string()).collect())
    }

    /// Derived parameter indices in evaluation order: declaration order, with
    /// any derived dependency pulled in ahead of its dependents.
    fn resolution_order(&self) -> Result<Vec<usize>, ParameterError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            New,
            Visiting,
            Done,
        }

        fn visit(
            params: &Parameters,
            index: usize,
            marks: &mut [Mark],
            order: &mut Vec<usize>,
        ) -> Result<(), ParameterError> {
            match marks[index] {
                Mark::Done => return Ok(()),
                Mark::Visiting => {
                    return Err(ParameterError::ConstraintCycle(
                        params.params[index].name.clone(),
                    ));
                }
                Mark::New => {}
            }
            marks[index] = Mark::Visiting;
            if let ParameterKind::DerivedExpr(_, deps) = &params.params[index].kind {
                for dep in deps {
                    let dep_index = params.require(&params.params[index].name, dep)?;
                    if params.params[dep_index].is_derived() {
                        visit(params, dep_index, marks, order)?;
                    }
                }
            }
            marks[index] = Mark::Done;
            order.push(index);
            Ok(())
        }

        let mut marks = vec![Mark::New; self.params.len()];
        let mut order = Vec::with_capacity(self.derived_order.len());
        for &index in &self.derived_order {
            visit(self, index, &mut marks, &mut order)?;
        }
        Ok(order)
    }

    /// Recomputes every derived value from the current free and fixed values.
    pub fn resolve(&mut self) -> Result<(), ParameterError> {
        for index in self.resolution_order()? {
            let (expr, deps) = match &self.params[index].kind {
                ParameterKind::DerivedExpr(expr, deps) => (*expr, deps.clone()),
                _ => continue,
            };
            let args = deps
                .iter()
                .map(|d| self.value(d))
                .collect::<Result<Vec<f64>, _>>()?;
            self.params[index].value = expr.evaluate(&args);
        }
        Ok(())
    }

    pub fn free_names(&self) -> Vec<String> {
        self.params
            .iter()
            .filter(|p| p.is_free())
            .map(|p| p.name.clone())
            .collect()
    }

    pub fn nvarys(&self) -> usize {
        self.params.iter().filter(|p| p.is_free()).count()
    }

    pub fn check_bounds(&self) -> Result<(), ParameterError> {
        for p in &self.params {
            if let ParameterKind::Free(v, bounds) = &p.kind
                && (!bounds.is_valid() || v.is_nan())
            {
                return Err(ParameterError::InvalidParameterBounds {
                    name: p.name.clone(),
                    min: bounds.min,
                    max: bounds.max,
                });
            }
        }
        Ok(())
    }

    /// Internal (unbounded) coordinates of the free parameters.
    pub fn internal_values(&self) -> Vec<f64> {
        self.params
            .iter()
            .filter_map(|p| match &p.kind {
                ParameterKind::Free(v, bounds) => Some(bounds.to_internal(*v)),
                _ => None,
            })
            .collect()
    }

    /// Writes internal coordinates back to the free parameters and resolves
    /// derived values.
    pub fn apply_internal(&mut self, internal: &[f64]) -> Result<(), ParameterError> {
        let mut values = internal.iter();
        for p in self.params.iter_mut() {
            if let ParameterKind::Free(v, bounds) = &mut p.kind
                && let Some(&q) = values.next()
            {
                *v = bounds.to_external(q);
                p.value = *v;
            }
        }
        self.resolve()
    }

    pub fn internal_gradients(&self, internal: &[f64]) -> Vec<f64> {
        self.params
            .iter()
            .filter(|p| p.is_free())
            .zip(internal)
            .map(|(p, &q)| p.bounds().scale_gradient(q))
            .collect()
    }

    pub fn set_stderr(&mut self, name: &str, stderr: Option<f64>) {
        if let Some(index) = self.index_of(name) {
            self.params[index].stderr = stderr;
        }
    }

    /// Overwrites the external values of the free parameters (no transform).
    pub fn apply_external(&mut self, values: &[f64]) -> Result<(), ParameterError> {
        let mut values = values.iter();
        for p in self.params.iter_mut() {
            if let ParameterKind::Free(v, _) = &mut p.kind
                && let Some(&x) = values.next()
            {
                *v = x;
                p.value = x;
            }
        }
        self.resolve()
    }

    pub fn free_values(&self) -> Vec<f64> {
        self.params
            .iter()
            .filter(|p| p.is_free())
            .map(|p| p.value)
            .collect()
    }

    pub fn derived_names(&self) -> Vec<String> {
        self.derived_order
            .iter()
            .map(|&i| self.params[i].name.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn gaussian_like() -> Parameters {
        let mut params = Parameters::new();
        params.add_free("center", 2.0).unwrap();
        params.add_free("amplitude", 10.0).unwrap();
        params.add_bounded("sigma", 0.5, Bounds::lower(0.0)).unwrap();
        params.add_expr("fwhm", Expr::Fwhm, &["sigma"]).unwrap();
        params
            .add_expr("height", Expr::Height, &["amplitude", "sigma"])
            .unwrap();
        params
    }

    #[test]
    fn derived_values_follow_free_values() {
        let mut params = gaussian_like();
        assert_relative_eq!(params.value("fwhm").unwrap(), 1.1774, epsilon = 1e-12);
        assert_relative_eq!(params.value("height").unwrap(), 7.978, epsilon = 1e-12);

        params.set_value("sigma", 1.0).unwrap();
        assert_relative_eq!(params.value("fwhm").unwrap(), 2.3548, epsilon = 1e-12);
        assert_relative_eq!(params.value("height").unwrap(), 3.989, epsilon = 1e-12);
    }

    #[test]
    fn height_uses_width_floor() {
        let mut params = gaussian_like();
        params.set_value("sigma", 0.0).unwrap();
        let height = params.value("height").unwrap();
        assert!(height.is_finite());
        assert_relative_eq!(height, 0.3989 * 10.0 / 1e-12, max_relative = 1e-12);
    }

    #[test]
    fn unknown_reference_is_rejected() {
        let mut params = gaussian_like();
        let err = params.add_expr("Conv_dE", Expr::Alias, &["FWHM"]).unwrap_err();
        assert_eq!(
            err,
            ParameterError::UnknownParameterReference {
                parameter: "Conv_dE".to_string(),
                reference: "FWHM".to_string(),
            }
        );
    }

    #[test]
    fn cycles_are_rejected_and_rolled_back() {
        let mut params = Parameters::new();
        params.add_free("a", 1.0).unwrap();
        params.add_expr("b", Expr::Alias, &["a"]).unwrap();
        let err = params.set_expr("a", Expr::Alias, &["b"]).unwrap_err();
        assert!(matches!(err, ParameterError::ConstraintCycle(_)));
        assert!(params.get("a").unwrap().is_free());

        let err = params.set_expr("a", Expr::Alias, &["a"]).unwrap_err();
        assert_eq!(err, ParameterError::ConstraintCycle("a".to_string()));
    }

    #[test]
    fn set_expr_allows_references_declared_later() {
        let mut params = Parameters::new();
        params.add_free("Ef", 0.0).unwrap();
        params.add_free("center", 0.25).unwrap();
        params.set_expr("Ef", Expr::Alias, &["center"]).unwrap();
        assert_eq!(params.value("Ef").unwrap(), 0.25);
        assert_eq!(params.nvarys(), 1);
        assert_eq!(params.free_names(), vec!["center".to_string()]);
    }

    #[test]
    fn quadrature_is_nan_when_undefined() {
        let mut params = Parameters::new();
        params.add_fixed("Beamline_dE", 3.0).unwrap();
        params.add_fixed("Conv_dE", 5.0).unwrap();
        params
            .add_expr("Instrument_dE", Expr::Quadrature, &["Conv_dE", "Beamline_dE"])
            .unwrap();
        assert_relative_eq!(params.value("Instrument_dE").unwrap(), 4.0);

        params.set_value("Beamline_dE", 6.0).unwrap();
        assert!(params.value("Instrument_dE").unwrap().is_nan());
    }

    #[test]
    fn argument_count_is_checked() {
        let mut params = gaussian_like();
        let err = params.add_expr("x", Expr::Height, &["amplitude"]).unwrap_err();
        assert!(matches!(err, ParameterError::ArgumentCount { expected: 2, found: 1, .. }));
    }

    #[test]
    fn invalid_bounds_are_rejected() {
        let mut params = Parameters::new();
        let err = params
            .add_bounded("sigma", 1.0, Bounds::new(2.0, 1.0))
            .unwrap_err();
        assert!(matches!(err, ParameterError::InvalidParameterBounds { .. }));
    }

    #[test]
    fn bound_transforms_round_trip_inside_bounds() {
        for bounds in [
            Bounds::new(-1.0, 3.0),
            Bounds::lower(0.0),
            Bounds::new(f64::NEG_INFINITY, 5.0),
            Bounds::default(),
        ] {
            for value in [0.1, 0.75, 2.5] {
                let internal = bounds.to_internal(value);
                assert_relative_eq!(bounds.to_external(internal), value, epsilon = 1e-12);
            }
            for internal in [-40.0, -1.0, 0.3, 17.0] {
                let external = bounds.to_external(internal);
                assert!(external >= bounds.min && external <= bounds.max);
            }
        }
    }

    #[test]
    fn fixed_parameters_are_not_varied() {
        let mut params = gaussian_like();
        params.set_vary("center", false).unwrap();
        assert_eq!(params.nvarys(), 2);
        params.apply_internal(&[1.0, 2.0]).unwrap();
        assert_eq!(params.value("center").unwrap(), 2.0);
        assert_eq!(params.value("amplitude").unwrap(), 1.0);
    }
}
