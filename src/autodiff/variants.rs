// Copyright 2025 STARGA Inc.
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at:
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// Part of the SYMFORM project (Symbolic Form Differentiation).

//! The three differentiation-variable specializations.
//!
//! One generic skeleton carries three semantics: derivative with respect to
//! a spatial coordinate component, with respect to a labeled variable, and
//! the Gateaux derivative with respect to coefficient fields in supplied
//! directions. The descriptor fixes, for the lifetime of one run, the extra
//! shape and extra free indices every produced derivative carries.

use std::collections::BTreeMap;

use crate::diagnostics::Sink;
use crate::expr::{
    DerivativeTable, ExprArena, ExprId, Index, IndexTerm, Kind, Label, MultiIndex,
};
use crate::shapes;

use super::engine::{Diff, ForwardAd, Visited};
use super::{AdError, AdOptions};

/// Differentiation-variable descriptor, fixed per run.
#[derive(Debug, Clone)]
pub(super) enum DiffVar {
    /// One spatial coordinate component, fixed or symbolically indexed.
    Spatial { component: IndexTerm },
    /// A labeled variable, identified by label identity.
    Variable {
        target: Label,
        shape: Vec<usize>,
        free: Vec<Index>,
        dims: BTreeMap<Index, usize>,
    },
    /// Coefficient fields paired with direction fields, plus the
    /// caller-supplied partial derivatives of compound coefficients.
    Coefficient { pairs: Vec<(ExprId, ExprId)>, table: DerivativeTable },
}

impl DiffVar {
    /// Extra shape, extra free indices, and their dimensions.
    pub(super) fn signature(&self, dim: usize) -> (Vec<usize>, Vec<Index>, BTreeMap<Index, usize>) {
        match self {
            DiffVar::Spatial { component: IndexTerm::Free(i) } => {
                (Vec::new(), vec![*i], [(*i, dim)].into_iter().collect())
            }
            DiffVar::Spatial { component: IndexTerm::Fixed(_) } => {
                (Vec::new(), Vec::new(), BTreeMap::new())
            }
            DiffVar::Variable { shape, free, dims, .. } => {
                (shape.clone(), free.clone(), dims.clone())
            }
            DiffVar::Coefficient { .. } => (Vec::new(), Vec::new(), BTreeMap::new()),
        }
    }
}

impl<'a> ForwardAd<'a> {
    /// Derivative with respect to one spatial coordinate component.
    pub(super) fn spatial(
        arena: &'a mut ExprArena,
        sink: &'a mut dyn Sink,
        dim: usize,
        component: IndexTerm,
        options: AdOptions,
    ) -> Self {
        Self::new(arena, sink, dim, DiffVar::Spatial { component }, options)
    }

    /// Derivative with respect to the labeled variable wrapped by `var`.
    pub(super) fn for_variable(
        arena: &'a mut ExprArena,
        sink: &'a mut dyn Sink,
        dim: usize,
        var: ExprId,
        options: AdOptions,
    ) -> Result<Self, AdError> {
        let target = match *arena.kind(var) {
            Kind::Variable { label, .. } => label,
            _ => return Err(AdError::Internal("variable derivative without a variable node")),
        };
        let descriptor = DiffVar::Variable {
            target,
            shape: arena.shape(var).to_vec(),
            free: arena.free_indices(var).to_vec(),
            dims: arena.index_dimensions(var).clone(),
        };
        Ok(Self::new(arena, sink, dim, descriptor, options))
    }

    /// Gateaux derivative with respect to `(coefficient, direction)` pairs.
    pub(super) fn for_coefficients(
        arena: &'a mut ExprArena,
        sink: &'a mut dyn Sink,
        dim: usize,
        pairs: Vec<(ExprId, ExprId)>,
        table: DerivativeTable,
        options: AdOptions,
    ) -> Self {
        Self::new(arena, sink, dim, DiffVar::Coefficient { pairs, table }, options)
    }

    // --- Specialized rules ---------------------------------------------

    /// The spatial coordinate differentiates to the identity column for the
    /// chosen component: `1` for a scalar coordinate, the basis vector for
    /// a fixed component, the symbolically indexed identity row otherwise.
    pub(super) fn spatial_coordinate(&mut self, id: ExprId) -> Result<Visited, AdError> {
        let component = match self.var {
            DiffVar::Spatial { component } => component,
            _ => return self.terminal(id),
        };
        if self.arena.is_scalar(id) {
            let one = self.arena.int(1);
            return Ok((id, Diff::Expr(one)));
        }
        let dim = self.dim;
        let op = match component {
            IndexTerm::Fixed(c) => {
                let mut components = Vec::with_capacity(dim);
                for r in 0..dim {
                    components.push(self.arena.int(i64::from(r == c)));
                }
                self.arena.list_tensor(components)?
            }
            IndexTerm::Free(i) => {
                let k = self.arena.fresh_index();
                let eye = self.arena.identity(dim);
                let entry =
                    self.arena.indexed(eye, vec![IndexTerm::Free(k), IndexTerm::Free(i)])?;
                shapes::as_tensor(self.arena, entry, &[k])?
            }
        };
        Ok((id, Diff::Expr(op)))
    }

    /// Unknown fields vary in space but are not resolved here: their
    /// spatial derivative is deferred as a re-applied marker. Reusing the
    /// differentiation index inside the expression is a caller
    /// responsibility, checked by the index-sum rule.
    pub(super) fn form_argument(&mut self, id: ExprId) -> Result<Visited, AdError> {
        match self.var {
            DiffVar::Spatial { component } => {
                let op = self.arena.spatial_derivative(id, component, self.dim)?;
                Ok((id, Diff::Expr(op)))
            }
            _ => self.terminal(id),
        }
    }

    pub(super) fn coefficient(&mut self, id: ExprId) -> Result<Visited, AdError> {
        match self.var {
            // Coefficient fields are spatially varying, like arguments.
            DiffVar::Spatial { component } => {
                let op = self.arena.spatial_derivative(id, component, self.dim)?;
                Ok((id, Diff::Expr(op)))
            }
            DiffVar::Coefficient { .. } => self.gateaux_coefficient(id),
            DiffVar::Variable { .. } => self.terminal(id),
        }
    }

    /// d w_k / d w_k is the matching direction; other coefficients consult
    /// the caller-supplied table, contracting each entry against its
    /// direction, and default to a signed zero with a warning.
    fn gateaux_coefficient(&mut self, id: ExprId) -> Result<Visited, AdError> {
        let (pairs, entry, table_empty) = match &self.var {
            DiffVar::Coefficient { pairs, table } => {
                (pairs.clone(), table.get(id).map(<[ExprId]>::to_vec), table.is_empty())
            }
            _ => return Err(AdError::Internal("coefficient rule outside a coefficient run")),
        };
        for &(w, v) in &pairs {
            if self.arena.expr_eq(id, w) {
                return Ok((id, Diff::Expr(v)));
            }
        }

        let mut accumulated = self.zero_diff(id);
        match entry {
            None => {
                if !table_empty && self.warned_coefficients.insert(id) {
                    let number = match *self.arena.kind(id) {
                        Kind::Coefficient { number } => number,
                        _ => usize::MAX,
                    };
                    self.sink.warn(&format!(
                        "no derivative supplied for coefficient w{number}; assuming it is zero"
                    ));
                }
            }
            Some(derivatives) => {
                if derivatives.len() != pairs.len() {
                    return Err(AdError::DerivativeTableArity {
                        expected: pairs.len(),
                        found: derivatives.len(),
                    });
                }
                for (&oprime, &(_, v)) in derivatives.iter().zip(pairs.iter()) {
                    let (scalarized, oi) = shapes::as_scalar(self.arena, oprime)?;
                    let direction_rank = self.arena.rank(v);
                    if oi.len() < direction_rank {
                        return Err(AdError::DerivativeTableContraction {
                            derivative: self.arena.shape(oprime).to_vec(),
                            direction: self.arena.shape(v).to_vec(),
                        });
                    }
                    let (leading, trailing) = oi.split_at(oi.len() - direction_rank);
                    let terms: MultiIndex =
                        trailing.iter().copied().map(IndexTerm::Free).collect();
                    let indexed_direction = self.arena.indexed(v, terms)?;
                    // mul contracts the trailing indices shared with the
                    // direction; the leading ones are re-bound as axes.
                    let contracted = self.arena.mul(scalarized, indexed_direction)?;
                    let term = shapes::as_tensor(self.arena, contracted, leading)?;
                    accumulated = self.arena.add(accumulated, term)?;
                }
            }
        }
        Ok((id, Diff::Expr(accumulated)))
    }

    /// Identity ("ones") derivative of the target variable: one identity
    /// contraction per shape dimension, re-tensorized over all of them,
    /// with a literal one carrying any free indices as correction factor.
    pub(super) fn ones_diff(&mut self, o: ExprId) -> Result<ExprId, AdError> {
        let shape = self.arena.shape(o).to_vec();
        if shape != self.var_shape {
            return Err(AdError::VariableShapeMismatch {
                variable: self.var_shape.clone(),
                expression: shape,
            });
        }
        let mut free = self.arena.free_indices(o).to_vec();
        let mut dims = self.arena.index_dimensions(o).clone();
        for &i in &self.var_free {
            if !dims.contains_key(&i) {
                free.push(i);
                dims.insert(i, self.var_dims[&i]);
            }
        }
        if shape.is_empty() {
            return Ok(self.arena.int_with_indices(1, &free, &dims));
        }

        let mut product: Option<ExprId> = None;
        let mut rows = Vec::with_capacity(shape.len());
        let mut cols = Vec::with_capacity(shape.len());
        for &d in &shape {
            let i = self.arena.fresh_index();
            let j = self.arena.fresh_index();
            let eye = self.arena.identity(d);
            let delta = self.arena.indexed(eye, vec![IndexTerm::Free(i), IndexTerm::Free(j)])?;
            product = Some(match product {
                None => delta,
                Some(p) => self.arena.product_of(vec![p, delta])?,
            });
            rows.push(i);
            cols.push(j);
        }
        let product =
            product.ok_or(AdError::Internal("identity derivative of an empty shape"))?;
        let mut all = rows;
        all.extend(cols);
        let mut fp = shapes::as_tensor(self.arena, product, &all)?;
        if !free.is_empty() {
            let one = self.arena.int_with_indices(1, &free, &dims);
            fp = self.arena.mul(fp, one)?;
        }
        Ok(fp)
    }
}
