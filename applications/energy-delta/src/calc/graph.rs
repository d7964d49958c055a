//! Evaluation of virtual metering points over their reference graph.
//!
//! A [`FormulaGraph`] holds every calculation reachable from the point being
//! evaluated plus the set of metering points known to exist. Loading happens
//! up front (see `services::energy`), evaluation itself is synchronous.

use std::collections::{BTreeSet, HashMap, HashSet};

use tracing::warn;

use super::dependencies::referenced_point_ids;
use super::formula::{CalculationError, Expr, Reference};

/// Longest chain of nested `vmp` references followed before giving up.
pub const MAX_VIRTUAL_DEPTH: usize = 64;

#[derive(Debug, Clone)]
struct Calculation {
    text: String,
    parsed: Result<Expr, CalculationError>,
}

#[derive(Debug, Clone, Default)]
pub struct FormulaGraph {
    calculations: HashMap<i64, Calculation>,
    points: HashSet<i64>,
}

impl FormulaGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_virtual_point(&mut self, id: i64, calculation: impl Into<String>) {
        let text = calculation.into();
        let parsed = Expr::parse(&text);
        self.calculations.insert(id, Calculation { text, parsed });
    }

    pub fn insert_point(&mut self, id: i64) {
        self.points.insert(id);
    }

    pub fn contains_point(&self, id: i64) -> bool {
        self.points.contains(&id)
    }

    /// Metering points referenced by any loaded calculation.
    pub fn referenced_points(&self) -> BTreeSet<i64> {
        self.calculations
            .values()
            .flat_map(|calc| referenced_point_ids(&calc.text))
            .collect()
    }

    /// Data path: evaluate virtual point `id` to `bucket_count` values.
    ///
    /// `series` holds the energy vector of every existing metering point the
    /// graph references. Never fails: a broken formula yields zeros for its
    /// own branch and a warning, a reference closing a cycle yields zeros.
    /// Each virtual point is evaluated once per call unless a cycle was cut
    /// below it, since such a result depends on where the cycle was entered.
    pub fn evaluate(&self, id: i64, bucket_count: usize, series: &HashMap<i64, Vec<f64>>) -> Vec<f64> {
        let mut evaluation = Evaluation {
            graph: self,
            series,
            bucket_count,
            chain: Vec::new(),
            done: HashMap::new(),
        };
        evaluation.virtual_point(id).0
    }

    /// Validation path: check `formula` statically.
    ///
    /// The formula must parse, every `mp(id)` must exist, every `vmp(id)` must
    /// exist with a valid formula of its own, and no reference may lead back
    /// to `subject` or to itself.
    pub fn validate(&self, formula: &str, subject: Option<i64>) -> Result<(), CalculationError> {
        let expr = Expr::parse(formula)?;
        let mut chain: Vec<i64> = subject.into_iter().collect();
        let mut valid = HashSet::new();
        self.validate_expr(&expr, &mut chain, &mut valid)
    }

    fn validate_expr(
        &self,
        expr: &Expr,
        chain: &mut Vec<i64>,
        valid: &mut HashSet<i64>,
    ) -> Result<(), CalculationError> {
        for reference in expr.references() {
            match reference {
                Reference::Point(mp) if !self.points.contains(&mp) => {
                    return Err(CalculationError::UnknownPoint(mp));
                }
                Reference::Point(_) => {}
                Reference::VirtualPoint(vmp) => {
                    if chain.contains(&vmp) {
                        return Err(CalculationError::CircularReference(vmp));
                    }
                    if valid.contains(&vmp) {
                        continue;
                    }
                    let Some(nested) = self.calculations.get(&vmp) else {
                        return Err(CalculationError::UnknownVirtualPoint(vmp));
                    };
                    if chain.len() >= MAX_VIRTUAL_DEPTH {
                        return Err(CalculationError::NestingTooDeep(MAX_VIRTUAL_DEPTH));
                    }
                    let nested = nested.parsed.as_ref().map_err(Clone::clone)?;
                    chain.push(vmp);
                    let checked = self.validate_expr(nested, chain, valid);
                    chain.pop();
                    checked?;
                    valid.insert(vmp);
                }
            }
        }
        Ok(())
    }
}

/// State of one `FormulaGraph::evaluate` call.
struct Evaluation<'a> {
    graph: &'a FormulaGraph,
    series: &'a HashMap<i64, Vec<f64>>,
    bucket_count: usize,
    chain: Vec<i64>,
    done: HashMap<i64, Vec<f64>>,
}

impl Evaluation<'_> {
    /// Values of `id` and whether a cycle or depth cut happened below it.
    fn virtual_point(&mut self, id: i64) -> (Vec<f64>, bool) {
        if let Some(values) = self.done.get(&id) {
            return (values.clone(), false);
        }
        let graph = self.graph;
        let Some(calculation) = graph.calculations.get(&id) else {
            warn!(virtual_point = id, "virtual metering point not found, using zeros");
            return (vec![0.0; self.bucket_count], false);
        };

        let mut cut = false;
        let result = calculation.parsed.as_ref().map_err(Clone::clone).and_then(|expr| {
            self.chain.push(id);
            let values = expr.evaluate(self.bucket_count, &mut |reference| {
                self.resolve(id, reference, &mut cut)
            });
            self.chain.pop();
            values
        });

        let values = match result {
            Ok(values) => values,
            Err(e) => {
                warn!(virtual_point = id, calculation = %calculation.text, error = %e, "calculation failed, using zeros");
                vec![0.0; self.bucket_count]
            }
        };
        if !cut {
            self.done.insert(id, values.clone());
        }
        (values, cut)
    }

    fn resolve(&mut self, id: i64, reference: Reference, cut: &mut bool) -> Result<Vec<f64>, CalculationError> {
        match reference {
            Reference::Point(mp) => self
                .series
                .get(&mp)
                .cloned()
                .ok_or(CalculationError::UnknownPoint(mp)),
            Reference::VirtualPoint(vmp) if self.chain.contains(&vmp) => {
                warn!(
                    virtual_point = id,
                    chain = ?self.chain,
                    "circular reference to vmp({vmp}), using zeros for this branch"
                );
                *cut = true;
                Ok(vec![0.0; self.bucket_count])
            }
            Reference::VirtualPoint(vmp) if !self.graph.calculations.contains_key(&vmp) => {
                Err(CalculationError::UnknownVirtualPoint(vmp))
            }
            Reference::VirtualPoint(_) if self.chain.len() >= MAX_VIRTUAL_DEPTH => {
                *cut = true;
                Err(CalculationError::NestingTooDeep(MAX_VIRTUAL_DEPTH))
            }
            Reference::VirtualPoint(vmp) => {
                let (values, nested_cut) = self.virtual_point(vmp);
                *cut |= nested_cut;
                Ok(values)
            }
        }
    }
}
