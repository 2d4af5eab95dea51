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

//! Generic forward-AD skeleton.
//!
//! [`ForwardAd`] walks the expression DAG once, returning for every node a
//! `(primal, derivative)` pair. Results are memoized on node identity, and
//! variables are additionally memoized on their label, so a sub-expression
//! shared by several parents is differentiated exactly once per run.

use std::collections::{BTreeMap, BTreeSet};

use crate::diagnostics::Sink;
use crate::expr::{
    BesselFamily, CondOp, ExprArena, ExprId, Index, IndexTerm, Kind, Label, MathKind, MultiIndex,
    Side,
};
use crate::shapes;

use super::rules;
use super::variants::DiffVar;
use super::{AdError, AdOptions};

/// Derivative slot of a visited node. Multi-indices and conditions have no
/// meaningful derivative; their slot is a sentinel that must never be
/// consumed as an expression.
#[derive(Debug, Clone, Copy)]
pub(super) enum Diff {
    Expr(ExprId),
    Sentinel,
}

impl Diff {
    pub(super) fn expr(self) -> Result<ExprId, AdError> {
        match self {
            Diff::Expr(e) => Ok(e),
            Diff::Sentinel => Err(AdError::Internal("sentinel derivative consumed as an expression")),
        }
    }
}

pub(super) type Visited = (ExprId, Diff);

/// One forward-AD run over one arena.
///
/// Both caches are constructed here and only here; every specialization
/// constructor funnels through [`ForwardAd::new`], so no code path can
/// observe an absent cache.
pub(super) struct ForwardAd<'a> {
    pub(super) arena: &'a mut ExprArena,
    pub(super) sink: &'a mut dyn Sink,
    pub(super) dim: usize,
    pub(super) var: DiffVar,
    pub(super) var_shape: Vec<usize>,
    pub(super) var_free: Vec<Index>,
    pub(super) var_dims: BTreeMap<Index, usize>,
    pub(super) options: AdOptions,
    cache: BTreeMap<ExprId, Visited>,
    variable_cache: BTreeMap<Label, Visited>,
    pub(super) warned_coefficients: BTreeSet<ExprId>,
}

impl<'a> ForwardAd<'a> {
    pub(super) fn new(
        arena: &'a mut ExprArena,
        sink: &'a mut dyn Sink,
        dim: usize,
        var: DiffVar,
        options: AdOptions,
    ) -> Self {
        let (var_shape, var_free, var_dims) = var.signature(dim);
        Self {
            arena,
            sink,
            dim,
            var,
            var_shape,
            var_free,
            var_dims,
            options,
            cache: BTreeMap::new(),
            variable_cache: BTreeMap::new(),
            warned_coefficients: BTreeSet::new(),
        }
    }

    /// Differentiate the marker's inner expression and return only the
    /// derivative component.
    pub(super) fn differentiate(&mut self, root: ExprId) -> Result<ExprId, AdError> {
        let (_, diff) = self.visit(root)?;
        diff.expr()
    }

    /// Memoized visit: one rule evaluation per distinct node per run.
    pub(super) fn visit(&mut self, id: ExprId) -> Result<Visited, AdError> {
        if let Some(&hit) = self.cache.get(&id) {
            return Ok(hit);
        }
        log::debug!("differentiating {} node", self.arena.kind_tag(id));
        let result = self.apply_rule(id)?;
        self.cache.insert(id, result);
        Ok(result)
    }

    fn apply_rule(&mut self, id: ExprId) -> Result<Visited, AdError> {
        match self.arena.kind(id).clone() {
            // Plain terminals are independent of the differentiation
            // variable; the specializations override the ones that are not.
            Kind::IntValue(_)
            | Kind::RealValue(_)
            | Kind::Zero
            | Kind::Identity(_)
            | Kind::FacetNormal => self.terminal(id),
            Kind::SpatialCoordinate => self.spatial_coordinate(id),
            Kind::Argument { .. } => self.form_argument(id),
            Kind::Coefficient { .. } => self.coefficient(id),

            Kind::Variable { expr, label } => self.variable(id, expr, label),

            Kind::Indexed { base, indices } => self.indexed(id, base, indices),
            Kind::ListTensor { components } => self.list_tensor(id, components),
            Kind::ComponentTensor { scalar, indices } => {
                self.component_tensor(id, scalar, indices)
            }
            Kind::IndexSum { summand, index } => self.index_sum(id, summand, index),

            Kind::Sum { operands } => self.sum(id, operands),
            Kind::Product { operands } => self.product(id, operands),
            Kind::Division { numerator, denominator } => {
                self.division(id, numerator, denominator)
            }
            Kind::Power { base, exponent } => self.power(id, base, exponent),
            Kind::Abs { operand } => self.abs(id, operand),

            Kind::MathFn { kind, operand } => self.math_function(id, kind, operand),
            Kind::Bessel { family, order, operand } => self.bessel(id, family, order, operand),

            Kind::Restricted { operand, side } => self.restricted(id, operand, side),

            Kind::Condition { op, lhs, rhs } => self.condition(id, op, lhs, rhs),
            Kind::NotCondition { operand } => self.not_condition(id, operand),
            Kind::Conditional { condition, on_true, on_false } => {
                self.conditional(id, condition, on_true, on_false)
            }

            Kind::SpatialDerivative { operand, component } => {
                self.applied_spatial_derivative(id, operand, component)
            }
            Kind::VariableDerivative { operand, var } => {
                if self.options.compound_rules {
                    rules::pending_variable_derivative(self, id, operand, var)
                } else {
                    Err(AdError::Internal(
                        "unresolved variable derivative reached the forward-AD engine",
                    ))
                }
            }
            Kind::CoefficientDerivative { .. } => Err(AdError::Internal(
                "unresolved coefficient derivative reached the forward-AD engine",
            )),

            kind @ (Kind::Transposed(_)
            | Kind::Trace(_)
            | Kind::Deviatoric(_)
            | Kind::Divergence(_)
            | Kind::Curl(_)
            | Kind::Gradient { .. }
            | Kind::Outer(..)
            | Kind::Inner(..)
            | Kind::Dot(..)
            | Kind::Cross(..)
            | Kind::Determinant(_)
            | Kind::Cofactor(_)
            | Kind::Inverse(_)) => rules::compound_rule(self, id, &kind),
        }
    }

    // --- Default rules -------------------------------------------------

    /// Terminals are lifted to `(o, 0)` with a zero of the extended
    /// signature.
    pub(super) fn terminal(&mut self, id: ExprId) -> Result<Visited, AdError> {
        let fp = self.zero_diff(id);
        Ok((id, Diff::Expr(fp)))
    }

    /// Zero with the node's signature extended by the differentiation
    /// variable's extra shape and free indices.
    pub(super) fn zero_diff(&mut self, o: ExprId) -> ExprId {
        let mut shape = self.arena.shape(o).to_vec();
        shape.extend_from_slice(&self.var_shape);
        let mut free = self.arena.free_indices(o).to_vec();
        let mut dims = self.arena.index_dimensions(o).clone();
        for &i in &self.var_free {
            if !dims.contains_key(&i) {
                free.push(i);
                dims.insert(i, self.var_dims[&i]);
            }
        }
        self.arena.zero(shape, &free, &dims)
    }

    /// Variables are labels: the derivative forwards to the wrapped
    /// expression, cached per label so two variable nodes with the same
    /// label share one derivative.
    fn variable(&mut self, id: ExprId, expr: ExprId, label: Label) -> Result<Visited, AdError> {
        if let Some(&hit) = self.variable_cache.get(&label) {
            return Ok(hit);
        }
        if let DiffVar::Variable { target, .. } = &self.var {
            if *target == label {
                let fp = self.ones_diff(id)?;
                let result = (id, Diff::Expr(fp));
                self.variable_cache.insert(label, result);
                return Ok(result);
            }
        }
        let (e2, ep) = self.visit(expr)?;
        let v = if e2 == expr { id } else { self.arena.variable(e2, label) };
        let result = (v, ep);
        self.variable_cache.insert(label, result);
        Ok(result)
    }

    fn indexed(&mut self, id: ExprId, base: ExprId, indices: MultiIndex) -> Result<Visited, AdError> {
        let (a2, ap) = self.visit(base)?;
        let ap = ap.expr()?;
        let o = if a2 == base { id } else { self.arena.indexed(a2, indices.clone())? };
        let op = if self.arena.is_zero(ap) {
            self.zero_diff(o)
        } else {
            // The derivative carries the variable's extra axes beyond the
            // indexed ones; index those with fresh indices and re-bind them
            // so the result's free set gains exactly the variable's indices.
            let extra = self.arena.rank(ap) - indices.len();
            if extra > 0 {
                let fresh = self.arena.fresh_indices(extra);
                let mut full = indices;
                full.extend(fresh.iter().copied().map(IndexTerm::Free));
                let scalar = self.arena.indexed(ap, full)?;
                shapes::as_tensor(self.arena, scalar, &fresh)?
            } else {
                self.arena.indexed(ap, indices)?
            }
        };
        Ok((o, Diff::Expr(op)))
    }

    fn list_tensor(&mut self, id: ExprId, components: Vec<ExprId>) -> Result<Visited, AdError> {
        let mut rebuilt = Vec::with_capacity(components.len());
        let mut derivatives = Vec::with_capacity(components.len());
        let mut changed = false;
        for &c in &components {
            let (c2, cp) = self.visit(c)?;
            changed |= c2 != c;
            rebuilt.push(c2);
            derivatives.push(cp.expr()?);
        }
        let o = if changed { self.arena.list_tensor(rebuilt)? } else { id };
        let op = self.arena.list_tensor(derivatives)?;
        Ok((o, Diff::Expr(op)))
    }

    fn component_tensor(
        &mut self,
        id: ExprId,
        scalar: ExprId,
        indices: Vec<Index>,
    ) -> Result<Visited, AdError> {
        let (a2, ap) = self.visit(scalar)?;
        let ap = ap.expr()?;
        let o = if a2 == scalar { id } else { self.arena.component_tensor(a2, &indices)? };
        let op = if self.arena.is_zero(ap) {
            self.zero_diff(o)
        } else {
            let (scalarized, trailing) = shapes::as_scalar(self.arena, ap)?;
            let mut bound = indices;
            bound.extend(trailing);
            self.arena.component_tensor(scalarized, &bound)?
        };
        Ok((o, Diff::Expr(op)))
    }

    fn index_sum(&mut self, id: ExprId, summand: ExprId, index: Index) -> Result<Visited, AdError> {
        // Moving the derivative inside a sum bound to the differentiation
        // index would accumulate it once per summand. No automatic
        // relabeling; the caller must rename indices upstream.
        if self.var_free.contains(&index) {
            return Err(AdError::IndexScopeCollision { index });
        }
        let (a2, ap) = self.visit(summand)?;
        let ap = ap.expr()?;
        let o = if a2 == summand { id } else { self.arena.index_sum(a2, index)? };
        let op = self.arena.index_sum(ap, index)?;
        Ok((o, Diff::Expr(op)))
    }

    fn sum(&mut self, id: ExprId, operands: Vec<ExprId>) -> Result<Visited, AdError> {
        let mut rebuilt = Vec::with_capacity(operands.len());
        let mut derivatives = Vec::with_capacity(operands.len());
        let mut changed = false;
        for &operand in &operands {
            let (o2, op) = self.visit(operand)?;
            changed |= o2 != operand;
            rebuilt.push(o2);
            derivatives.push(op.expr()?);
        }
        let o = if changed { self.arena.sum_of(rebuilt)? } else { id };
        let op = self.arena.sum_of(derivatives)?;
        Ok((o, Diff::Expr(op)))
    }

    /// Product rule generalized to index-carrying operands: scalarize each
    /// operand's derivative over the variable's extra axes, substitute it
    /// into the product, re-tensorize, and accumulate over the operands.
    fn product(&mut self, id: ExprId, operands: Vec<ExprId>) -> Result<Visited, AdError> {
        let mut accumulated = self.zero_diff(id);
        let mut rebuilt = Vec::with_capacity(operands.len());
        let mut derivatives = Vec::with_capacity(operands.len());
        let mut changed = false;
        for &operand in &operands {
            let (o2, op) = self.visit(operand)?;
            changed |= o2 != operand;
            rebuilt.push(o2);
            derivatives.push(op.expr()?);
        }
        let o = if changed { self.arena.product_of(rebuilt.clone())? } else { id };
        for k in 0..rebuilt.len() {
            let (scalarized, trailing) = shapes::as_scalar(self.arena, derivatives[k])?;
            let mut factors = rebuilt.clone();
            factors[k] = scalarized;
            let mut term = self.arena.product_of(factors)?;
            term = shapes::as_tensor(self.arena, term, &trailing)?;
            accumulated = self.arena.add(accumulated, term)?;
        }
        Ok((o, Diff::Expr(accumulated)))
    }

    fn division(
        &mut self,
        id: ExprId,
        numerator: ExprId,
        denominator: ExprId,
    ) -> Result<Visited, AdError> {
        let (f2, fp) = self.visit(numerator)?;
        let fp = fp.expr()?;
        let (g2, gp) = self.visit(denominator)?;
        let gp = gp.expr()?;
        if !self.arena.is_scalar(f2) {
            return Err(AdError::NonScalar { role: "numerator", shape: self.arena.shape(f2).to_vec() });
        }
        if !self.arena.is_true_scalar(g2) {
            return Err(AdError::NonScalar {
                role: "denominator",
                shape: self.arena.shape(g2).to_vec(),
            });
        }
        let o = if f2 == numerator && g2 == denominator {
            id
        } else {
            self.arena.div(f2, g2)?
        };
        // (f/g)' = (f' - (f/g) g') / g, with the (f/g) g' product formed in
        // scalarized form and re-tensorized over its indices.
        let (so, oi) = shapes::as_scalar(self.arena, o)?;
        let (sgp, gi) = shapes::as_scalar(self.arena, gp)?;
        let mut o_gp = self.arena.product_of(vec![so, sgp])?;
        let mut bound = oi;
        bound.extend(gi);
        o_gp = shapes::as_tensor(self.arena, o_gp, &bound)?;
        let num = self.arena.sub(fp, o_gp)?;
        let op = self.arena.div(num, g2)?;
        Ok((o, Diff::Expr(op)))
    }

    /// (f**g)' = f**(g-1) (f' g + f ln(f) g'); the primal is rewritten as
    /// f * f**(g-1) to reuse the shared sub-expression.
    fn power(&mut self, _id: ExprId, base: ExprId, exponent: ExprId) -> Result<Visited, AdError> {
        let (f2, fp) = self.visit(base)?;
        let fp = fp.expr()?;
        let (g2, gp) = self.visit(exponent)?;
        let gp = gp.expr()?;
        if !self.arena.is_true_scalar(f2) {
            return Err(AdError::NonScalar { role: "power base", shape: self.arena.shape(f2).to_vec() });
        }
        if !self.arena.is_true_scalar(g2) {
            return Err(AdError::NonScalar {
                role: "power exponent",
                shape: self.arena.shape(g2).to_vec(),
            });
        }
        let one = self.arena.int(1);
        let g_minus_one = self.arena.sub(g2, one)?;
        let f_pow_gm1 = self.arena.pow(f2, g_minus_one)?;
        let fp_g = self.arena.mul(fp, g2)?;
        let ln_f = self.arena.math_fn(MathKind::Ln, f2)?;
        let f_ln_f = self.arena.mul(f2, ln_f)?;
        let f_ln_f_gp = self.arena.mul(f_ln_f, gp)?;
        let bracket = self.arena.add(fp_g, f_ln_f_gp)?;
        let op = self.arena.mul(f_pow_gm1, bracket)?;
        let o = self.arena.mul(f2, f_pow_gm1)?;
        Ok((o, Diff::Expr(op)))
    }

    fn abs(&mut self, id: ExprId, operand: ExprId) -> Result<Visited, AdError> {
        let (f2, fp) = self.visit(operand)?;
        let fp = fp.expr()?;
        let o = if f2 == operand { id } else { self.arena.abs_of(f2)? };
        let sign = self.arena.sign_of(f2)?;
        let op = self.arena.mul(sign, fp)?;
        Ok((o, Diff::Expr(op)))
    }

    fn math_function(
        &mut self,
        id: ExprId,
        kind: MathKind,
        operand: ExprId,
    ) -> Result<Visited, AdError> {
        let (f2, fp) = self.visit(operand)?;
        let fp = fp.expr()?;
        let o = if f2 == operand { id } else { self.arena.math_fn(kind, f2)? };
        let op = rules::math_rule(self, kind, o, f2, fp)?;
        Ok((o, Diff::Expr(op)))
    }

    fn bessel(
        &mut self,
        id: ExprId,
        family: BesselFamily,
        order: ExprId,
        operand: ExprId,
    ) -> Result<Visited, AdError> {
        let (nu2, nu_diff) = self.visit(order)?;
        if !self.arena.is_zero(nu_diff.expr()?) {
            return Err(AdError::BesselOrderDependence);
        }
        let (f2, fp) = self.visit(operand)?;
        let fp = fp.expr()?;
        let o = if nu2 == order && f2 == operand {
            id
        } else {
            self.arena.bessel(family, nu2, f2)?
        };
        let op = rules::bessel_rule(self, family, nu2, f2, fp)?;
        Ok((o, Diff::Expr(op)))
    }

    /// Restriction and differentiation commute; an already-constant
    /// derivative needs no restriction at all.
    fn restricted(&mut self, id: ExprId, operand: ExprId, side: Side) -> Result<Visited, AdError> {
        let (f2, fp) = self.visit(operand)?;
        let fp = fp.expr()?;
        let o = if f2 == operand { id } else { self.arena.restricted(f2, side) };
        let op = if self.arena.is_constant_value(fp) { fp } else { self.arena.restricted(fp, side) };
        Ok((o, Diff::Expr(op)))
    }

    fn condition(
        &mut self,
        id: ExprId,
        op: CondOp,
        lhs: ExprId,
        rhs: ExprId,
    ) -> Result<Visited, AdError> {
        let (l2, lp) = self.visit(lhs)?;
        let (r2, rp) = self.visit(rhs)?;
        let o = if l2 == lhs && r2 == rhs { id } else { self.arena.condition(op, l2, r2)? };
        let varies = [lp, rp].into_iter().any(|d| match d {
            Diff::Expr(e) => !self.arena.is_zero(e),
            Diff::Sentinel => false,
        });
        if varies {
            self.sink.warn(
                "differentiating a conditional whose condition depends on the \
                 differentiation variable; the condition is used as-is",
            );
        }
        Ok((o, Diff::Sentinel))
    }

    fn not_condition(&mut self, id: ExprId, operand: ExprId) -> Result<Visited, AdError> {
        // The dependence warning, if any, fires while visiting the inner
        // condition.
        let (c2, _) = self.visit(operand)?;
        let o = if c2 == operand { id } else { self.arena.not_condition(c2)? };
        Ok((o, Diff::Sentinel))
    }

    fn conditional(
        &mut self,
        id: ExprId,
        condition: ExprId,
        on_true: ExprId,
        on_false: ExprId,
    ) -> Result<Visited, AdError> {
        let (c2, _) = self.visit(condition)?;
        let (t2, tp) = self.visit(on_true)?;
        let tp = tp.expr()?;
        let (f2, fp) = self.visit(on_false)?;
        let fp = fp.expr()?;
        let o = if c2 == condition && t2 == on_true && f2 == on_false {
            id
        } else {
            self.arena.conditional(c2, t2, f2)?
        };
        let op = if self.arena.is_zero(tp) && self.arena.is_zero(fp) {
            self.zero_diff(o)
        } else {
            self.arena.conditional(c2, tp, fp)?
        };
        Ok((o, Diff::Expr(op)))
    }

    /// A spatial derivative that survived propagation sits on a terminal;
    /// differentiation commutes, and a spatially constant inner derivative
    /// collapses the whole thing to a signed zero.
    fn applied_spatial_derivative(
        &mut self,
        id: ExprId,
        operand: ExprId,
        component: IndexTerm,
    ) -> Result<Visited, AdError> {
        let (f2, fp) = self.visit(operand)?;
        let fp = fp.expr()?;
        let o = if f2 == operand {
            id
        } else {
            self.arena.spatial_derivative(f2, component, self.dim)?
        };
        let op = if self.arena.is_spatially_constant(fp) {
            let shape = self.arena.shape(fp).to_vec();
            let mut free = self.arena.free_indices(fp).to_vec();
            let mut dims = self.arena.index_dimensions(fp).clone();
            if let IndexTerm::Free(j) = component {
                if !dims.contains_key(&j) {
                    free.push(j);
                    dims.insert(j, self.dim);
                }
            }
            self.arena.zero(shape, &free, &dims)
        } else {
            self.arena.spatial_derivative(fp, component, self.dim)?
        };
        Ok((o, Diff::Expr(op)))
    }
}
