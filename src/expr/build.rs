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

//! Expression constructors.
//!
//! Every constructor computes the node's cached signature (shape, free
//! indices, index dimensions) and checks the preconditions of its kind.
//! Constructors fold constant leaves eagerly: zeros absorb and propagate,
//! literal ones vanish from products, integer and real literals combine,
//! and a fixed index into a list tensor selects the component. The folds
//! are limited to constant leaves; this is not a simplification pass.

use std::collections::BTreeMap;

use crate::shapes;

use super::{
    kind_name, BesselFamily, CondOp, DerivativeTable, ExprArena, ExprError, ExprId, Index,
    IndexTerm, Kind, Label, MathKind, MultiIndex, Side,
};

impl ExprArena {
    // --- Terminals -----------------------------------------------------

    pub fn int(&mut self, value: i64) -> ExprId {
        self.push(Kind::IntValue(value), Vec::new(), Vec::new(), BTreeMap::new())
    }

    pub fn real(&mut self, value: f64) -> ExprId {
        self.push(Kind::RealValue(value), Vec::new(), Vec::new(), BTreeMap::new())
    }

    /// Scalar integer literal carrying an explicit free-index signature.
    ///
    /// Used by the identity-derivative construction, where a literal one
    /// has to keep the free indices of the expression it stands in for.
    pub fn int_with_indices(
        &mut self,
        value: i64,
        free: &[Index],
        dims: &BTreeMap<Index, usize>,
    ) -> ExprId {
        let free = sorted_unique(free);
        let dims = shapes::dims_for(dims, &free);
        self.push(Kind::IntValue(value), Vec::new(), free, dims)
    }

    pub fn zero_scalar(&mut self) -> ExprId {
        self.push(Kind::Zero, Vec::new(), Vec::new(), BTreeMap::new())
    }

    /// Structurally zero tensor of an exact signature. Two zeros with
    /// different signatures are not interchangeable.
    pub fn zero(
        &mut self,
        shape: Vec<usize>,
        free: &[Index],
        dims: &BTreeMap<Index, usize>,
    ) -> ExprId {
        let free = sorted_unique(free);
        let dims = shapes::dims_for(dims, &free);
        self.push(Kind::Zero, shape, free, dims)
    }

    pub fn identity(&mut self, extent: usize) -> ExprId {
        self.push(Kind::Identity(extent), vec![extent, extent], Vec::new(), BTreeMap::new())
    }

    /// The spatial coordinate field: a scalar in one dimension, otherwise a
    /// vector of the given dimension.
    pub fn spatial_coordinate(&mut self, dim: usize) -> ExprId {
        let shape = if dim == 1 { Vec::new() } else { vec![dim] };
        self.push(Kind::SpatialCoordinate, shape, Vec::new(), BTreeMap::new())
    }

    pub fn facet_normal(&mut self, dim: usize) -> ExprId {
        let shape = if dim == 1 { Vec::new() } else { vec![dim] };
        self.push(Kind::FacetNormal, shape, Vec::new(), BTreeMap::new())
    }

    pub fn argument(&mut self, number: usize, shape: Vec<usize>) -> ExprId {
        self.push(Kind::Argument { number }, shape, Vec::new(), BTreeMap::new())
    }

    pub fn coefficient(&mut self, number: usize, shape: Vec<usize>) -> ExprId {
        self.push(Kind::Coefficient { number }, shape, Vec::new(), BTreeMap::new())
    }

    // --- Variables -----------------------------------------------------

    /// Wrap an expression under an existing label. Two variables with the
    /// same label denote the same quantity.
    pub fn variable(&mut self, expr: ExprId, label: Label) -> ExprId {
        let shape = self.shape(expr).to_vec();
        let free = self.free_indices(expr).to_vec();
        let dims = self.index_dimensions(expr).clone();
        self.push(Kind::Variable { expr, label }, shape, free, dims)
    }

    /// Wrap an expression under a freshly minted label.
    pub fn new_variable(&mut self, expr: ExprId) -> (ExprId, Label) {
        let label = self.fresh_label();
        (self.variable(expr, label), label)
    }

    // --- Indexing and component handling -------------------------------

    pub fn indexed(&mut self, base: ExprId, indices: MultiIndex) -> Result<ExprId, ExprError> {
        let shape = self.shape(base).to_vec();
        if indices.len() != shape.len() {
            return Err(ExprError::RankMismatch { expected: shape.len(), found: indices.len() });
        }

        // A fixed leading index into a list tensor selects the component.
        if let Kind::ListTensor { components } = self.kind(base) {
            if let Some(IndexTerm::Fixed(c)) = indices.first().copied() {
                if c >= components.len() {
                    return Err(ExprError::ComponentOutOfRange {
                        component: c,
                        extent: components.len(),
                    });
                }
                let component = components[c];
                let rest: MultiIndex = indices[1..].to_vec();
                return if rest.is_empty() { Ok(component) } else { self.indexed(component, rest) };
            }
        }

        let mut dims = self.index_dimensions(base).clone();
        let mut free = self.free_indices(base).to_vec();
        for (term, extent) in indices.iter().zip(shape.iter()) {
            match term {
                IndexTerm::Fixed(c) => {
                    if c >= extent {
                        return Err(ExprError::ComponentOutOfRange {
                            component: *c,
                            extent: *extent,
                        });
                    }
                }
                IndexTerm::Free(i) => {
                    match dims.get(i) {
                        Some(&known) if known != *extent => {
                            return Err(ExprError::IndexDimensionConflict {
                                expected: known,
                                found: *extent,
                            })
                        }
                        _ => {
                            dims.insert(*i, *extent);
                        }
                    }
                    free.push(*i);
                }
            }
        }
        let free = sorted_unique(&free);
        let dims = shapes::dims_for(&dims, &free);

        if self.is_zero(base) {
            return Ok(self.push(Kind::Zero, Vec::new(), free, dims));
        }
        Ok(self.push(Kind::Indexed { base, indices }, Vec::new(), free, dims))
    }

    /// Bind free indices of a scalar expression into tensor axes.
    pub fn component_tensor(
        &mut self,
        scalar: ExprId,
        indices: &[Index],
    ) -> Result<ExprId, ExprError> {
        if !self.is_scalar(scalar) {
            return Err(ExprError::ExpectedScalar { shape: self.shape(scalar).to_vec() });
        }
        let mut seen = Vec::new();
        for i in indices {
            if seen.contains(i) {
                return Err(ExprError::DuplicateIndex);
            }
            seen.push(*i);
        }
        let sdims = self.index_dimensions(scalar).clone();
        let mut shape = Vec::with_capacity(indices.len());
        for i in indices {
            match sdims.get(i) {
                Some(&d) => shape.push(d),
                None => return Err(ExprError::UnboundIndex),
            }
        }
        let free: Vec<Index> = self
            .free_indices(scalar)
            .iter()
            .copied()
            .filter(|i| !indices.contains(i))
            .collect();
        let dims = shapes::dims_for(&sdims, &free);

        // Rebinding the exact indices of a plain indexing is the identity.
        if let Kind::Indexed { base, indices: inner } = self.kind(scalar) {
            let base = *base;
            let plain = inner.len() == indices.len()
                && inner
                    .iter()
                    .zip(indices.iter())
                    .all(|(t, i)| matches!(t, IndexTerm::Free(j) if j == i));
            if plain && !self.free_indices(base).iter().any(|i| indices.contains(i)) {
                return Ok(base);
            }
        }

        if self.is_zero(scalar) {
            return Ok(self.push(Kind::Zero, shape, free, dims));
        }
        Ok(self.push(
            Kind::ComponentTensor { scalar, indices: indices.to_vec() },
            shape,
            free,
            dims,
        ))
    }

    pub fn list_tensor(&mut self, components: Vec<ExprId>) -> Result<ExprId, ExprError> {
        let first = *components.first().ok_or(ExprError::EmptyOperands)?;
        let inner_shape = self.shape(first).to_vec();
        for &c in &components[1..] {
            if self.shape(c) != inner_shape.as_slice() {
                return Err(ExprError::ShapeMismatch {
                    lhs: inner_shape,
                    rhs: self.shape(c).to_vec(),
                });
            }
        }
        let (free, dims) = self.merged_operand_signature(&components)?;
        let mut shape = vec![components.len()];
        shape.extend_from_slice(&inner_shape);
        Ok(self.push(Kind::ListTensor { components }, shape, free, dims))
    }

    /// Sum over one bound index.
    pub fn index_sum(&mut self, summand: ExprId, index: Index) -> Result<ExprId, ExprError> {
        if !self.free_indices(summand).contains(&index) {
            return Err(ExprError::UnboundIndex);
        }
        let shape = self.shape(summand).to_vec();
        let free: Vec<Index> =
            self.free_indices(summand).iter().copied().filter(|i| *i != index).collect();
        let dims = shapes::dims_for(self.index_dimensions(summand), &free);
        if self.is_zero(summand) {
            return Ok(self.push(Kind::Zero, shape, free, dims));
        }
        Ok(self.push(Kind::IndexSum { summand, index }, shape, free, dims))
    }

    // --- Scalar algebra ------------------------------------------------

    /// N-ary sum. All operands must agree on shape and free indices.
    /// Zero operands vanish and literal constants combine.
    pub fn sum_of(&mut self, operands: Vec<ExprId>) -> Result<ExprId, ExprError> {
        let first = *operands.first().ok_or(ExprError::EmptyOperands)?;
        let shape = self.shape(first).to_vec();
        let free = self.free_indices(first).to_vec();
        for &op in &operands[1..] {
            if self.shape(op) != shape.as_slice() {
                return Err(ExprError::ShapeMismatch { lhs: shape, rhs: self.shape(op).to_vec() });
            }
            if self.free_indices(op) != free.as_slice() {
                return Err(ExprError::FreeIndexMismatch);
            }
        }

        let mut int_acc: i64 = 0;
        let mut real_acc: f64 = 0.0;
        let mut saw_int = false;
        let mut saw_real = false;
        let mut rest: Vec<ExprId> = Vec::with_capacity(operands.len());
        for &op in &operands {
            match *self.kind(op) {
                Kind::Zero => {}
                Kind::IntValue(v) if self.is_true_scalar(op) => {
                    int_acc += v;
                    saw_int = true;
                }
                Kind::RealValue(v) if self.is_true_scalar(op) => {
                    real_acc += v;
                    saw_real = true;
                }
                _ => rest.push(op),
            }
        }

        // A constant summing to zero folds away unless it is all there is.
        let constant = if saw_real {
            let total = real_acc + int_acc as f64;
            if total == 0.0 && !rest.is_empty() { None } else { Some(self.real(total)) }
        } else if saw_int && (int_acc != 0 || rest.is_empty()) {
            Some(self.int(int_acc))
        } else {
            None
        };

        match (rest.len(), constant) {
            (0, Some(c)) => Ok(c),
            (0, None) => Ok(first), // every operand was a signed zero
            (1, None) => Ok(rest[0]),
            _ => {
                let mut ops = rest;
                if let Some(c) = constant {
                    ops.push(c);
                }
                if ops.len() == 1 {
                    return Ok(ops[0]);
                }
                let (free, dims) = self.merged_operand_signature(&ops)?;
                Ok(self.push(Kind::Sum { operands: ops }, shape, free, dims))
            }
        }
    }

    pub fn add(&mut self, a: ExprId, b: ExprId) -> Result<ExprId, ExprError> {
        self.sum_of(vec![a, b])
    }

    pub fn neg(&mut self, a: ExprId) -> Result<ExprId, ExprError> {
        let minus_one = self.int(-1);
        self.mul(minus_one, a)
    }

    pub fn sub(&mut self, a: ExprId, b: ExprId) -> Result<ExprId, ExprError> {
        let nb = self.neg(b)?;
        self.add(a, nb)
    }

    /// N-ary product of scalar operands, without implicit contraction.
    /// Repeated free indices stay free; use [`ExprArena::mul`] for the
    /// summation-convention operator.
    pub fn product_of(&mut self, operands: Vec<ExprId>) -> Result<ExprId, ExprError> {
        if operands.is_empty() {
            return Err(ExprError::EmptyOperands);
        }
        for &op in &operands {
            if !self.is_scalar(op) {
                return Err(ExprError::ExpectedScalar { shape: self.shape(op).to_vec() });
            }
        }
        let (free, dims) = self.merged_operand_signature(&operands)?;

        if operands.iter().any(|&op| self.is_zero(op)) {
            return Ok(self.push(Kind::Zero, Vec::new(), free, dims));
        }

        let mut int_acc: i64 = 1;
        let mut real_acc: f64 = 1.0;
        let mut saw_real = false;
        let mut rest: Vec<ExprId> = Vec::with_capacity(operands.len());
        for &op in &operands {
            match *self.kind(op) {
                Kind::IntValue(v) if self.is_true_scalar(op) => int_acc *= v,
                Kind::RealValue(v) if self.is_true_scalar(op) => {
                    real_acc *= v;
                    saw_real = true;
                }
                _ => rest.push(op),
            }
        }

        if int_acc == 0 || (saw_real && real_acc == 0.0) {
            return Ok(self.push(Kind::Zero, Vec::new(), free, dims));
        }
        let constant = if saw_real {
            let v = real_acc * int_acc as f64;
            if v == 1.0 { None } else { Some(self.real(v)) }
        } else if int_acc != 1 {
            Some(self.int(int_acc))
        } else {
            None
        };

        match (rest.len(), constant) {
            (0, Some(c)) => Ok(c),
            (0, None) => Ok(self.int(1)),
            (1, None) => Ok(rest[0]),
            _ => {
                let mut ops = Vec::with_capacity(rest.len() + 1);
                if let Some(c) = constant {
                    ops.push(c);
                }
                ops.extend(rest);
                if ops.len() == 1 {
                    return Ok(ops[0]);
                }
                Ok(self.push(Kind::Product { operands: ops }, Vec::new(), free, dims))
            }
        }
    }

    /// Multiplication operator. A free index shared by both factors is
    /// contracted (summation convention); a tensor factor may be combined
    /// with a scalar factor by scalarizing and re-tensorizing.
    pub fn mul(&mut self, a: ExprId, b: ExprId) -> Result<ExprId, ExprError> {
        match (self.rank(a), self.rank(b)) {
            (0, 0) => {
                let shared: Vec<Index> = self
                    .free_indices(a)
                    .iter()
                    .copied()
                    .filter(|i| self.free_indices(b).contains(i))
                    .collect();
                let mut p = self.product_of(vec![a, b])?;
                for i in shared {
                    p = self.index_sum(p, i)?;
                }
                Ok(p)
            }
            (_, 0) => {
                let (s, ii) = shapes::as_scalar(self, a)?;
                let p = self.mul(s, b)?;
                shapes::as_tensor(self, p, &ii)
            }
            (0, _) => {
                let (s, ii) = shapes::as_scalar(self, b)?;
                let p = self.mul(a, s)?;
                shapes::as_tensor(self, p, &ii)
            }
            _ => Err(ExprError::ExpectedScalar { shape: self.shape(b).to_vec() }),
        }
    }

    /// Division by a true scalar. A tensor numerator is divided
    /// componentwise by scalarizing and re-tensorizing.
    pub fn div(&mut self, numerator: ExprId, denominator: ExprId) -> Result<ExprId, ExprError> {
        if !self.is_true_scalar(denominator) {
            return Err(ExprError::ExpectedTrueScalar);
        }
        if self.is_zero(denominator)
            || self.int_value(denominator) == Some(0)
            || matches!(*self.kind(denominator), Kind::RealValue(v) if v == 0.0)
        {
            return Err(ExprError::DivisionByZero);
        }
        if self.rank(numerator) > 0 {
            let (s, ii) = shapes::as_scalar(self, numerator)?;
            let d = self.div(s, denominator)?;
            return shapes::as_tensor(self, d, &ii);
        }
        if self.is_zero(numerator) {
            let free = self.free_indices(numerator).to_vec();
            let dims = self.index_dimensions(numerator).clone();
            return Ok(self.zero(Vec::new(), &free, &dims));
        }
        if self.int_value(denominator) == Some(1)
            || matches!(*self.kind(denominator), Kind::RealValue(v) if v == 1.0)
        {
            return Ok(numerator);
        }
        if let (Some(n), Some(d)) = (self.literal_value(numerator), self.literal_value(denominator))
        {
            return Ok(self.real(n / d));
        }
        let free = self.free_indices(numerator).to_vec();
        let dims = self.index_dimensions(numerator).clone();
        Ok(self.push(Kind::Division { numerator, denominator }, Vec::new(), free, dims))
    }

    /// Power of true scalars.
    pub fn pow(&mut self, base: ExprId, exponent: ExprId) -> Result<ExprId, ExprError> {
        if !self.is_true_scalar(base) || !self.is_true_scalar(exponent) {
            return Err(ExprError::ExpectedTrueScalar);
        }
        match self.int_value(exponent) {
            Some(0) => return Ok(self.int(1)),
            Some(1) => return Ok(base),
            Some(e) if e > 1 => {
                if let Some(b) = self.int_value(base) {
                    if let Ok(e32) = u32::try_from(e) {
                        if let Some(v) = b.checked_pow(e32) {
                            return Ok(self.int(v));
                        }
                    }
                } else if let Kind::RealValue(b) = *self.kind(base) {
                    if let Ok(e32) = i32::try_from(e) {
                        return Ok(self.real(b.powi(e32)));
                    }
                }
            }
            _ => {}
        }
        Ok(self.push(Kind::Power { base, exponent }, Vec::new(), Vec::new(), BTreeMap::new()))
    }

    pub fn abs_of(&mut self, operand: ExprId) -> Result<ExprId, ExprError> {
        if !self.is_scalar(operand) {
            return Err(ExprError::ExpectedScalar { shape: self.shape(operand).to_vec() });
        }
        if self.is_zero(operand) {
            return Ok(operand);
        }
        if let Some(v) = self.int_value(operand) {
            return Ok(self.int(v.abs()));
        }
        if let Kind::RealValue(v) = *self.kind(operand) {
            return Ok(self.real(v.abs()));
        }
        let free = self.free_indices(operand).to_vec();
        let dims = self.index_dimensions(operand).clone();
        Ok(self.push(Kind::Abs { operand }, Vec::new(), free, dims))
    }

    /// Piecewise sign of a true scalar, encoded as a conditional.
    pub fn sign_of(&mut self, operand: ExprId) -> Result<ExprId, ExprError> {
        if !self.is_true_scalar(operand) {
            return Err(ExprError::ExpectedTrueScalar);
        }
        if let Some(v) = self.literal_value(operand) {
            return Ok(self.int(if v < 0.0 { -1 } else { 1 }));
        }
        let zero = self.int(0);
        let negative = self.condition(CondOp::Lt, operand, zero)?;
        let minus_one = self.int(-1);
        let one = self.int(1);
        self.conditional(negative, minus_one, one)
    }

    // --- Transcendental functions --------------------------------------

    pub fn math_fn(&mut self, kind: MathKind, operand: ExprId) -> Result<ExprId, ExprError> {
        if !self.is_true_scalar(operand) {
            return Err(ExprError::ExpectedTrueScalar);
        }
        Ok(self.push(Kind::MathFn { kind, operand }, Vec::new(), Vec::new(), BTreeMap::new()))
    }

    pub fn bessel(
        &mut self,
        family: BesselFamily,
        order: ExprId,
        operand: ExprId,
    ) -> Result<ExprId, ExprError> {
        if !self.is_true_scalar(order) || !self.is_true_scalar(operand) {
            return Err(ExprError::ExpectedTrueScalar);
        }
        Ok(self.push(
            Kind::Bessel { family, order, operand },
            Vec::new(),
            Vec::new(),
            BTreeMap::new(),
        ))
    }

    // --- Restriction ---------------------------------------------------

    pub fn restricted(&mut self, operand: ExprId, side: Side) -> ExprId {
        let shape = self.shape(operand).to_vec();
        let free = self.free_indices(operand).to_vec();
        let dims = self.index_dimensions(operand).clone();
        self.push(Kind::Restricted { operand, side }, shape, free, dims)
    }

    // --- Conditions ----------------------------------------------------

    pub fn condition(&mut self, op: CondOp, lhs: ExprId, rhs: ExprId) -> Result<ExprId, ExprError> {
        if !self.is_true_scalar(lhs) || !self.is_true_scalar(rhs) {
            return Err(ExprError::ExpectedTrueScalar);
        }
        Ok(self.push(Kind::Condition { op, lhs, rhs }, Vec::new(), Vec::new(), BTreeMap::new()))
    }

    pub fn not_condition(&mut self, operand: ExprId) -> Result<ExprId, ExprError> {
        if !matches!(self.kind(operand), Kind::Condition { .. } | Kind::NotCondition { .. }) {
            return Err(ExprError::ExpectedCondition);
        }
        Ok(self.push(Kind::NotCondition { operand }, Vec::new(), Vec::new(), BTreeMap::new()))
    }

    pub fn conditional(
        &mut self,
        condition: ExprId,
        on_true: ExprId,
        on_false: ExprId,
    ) -> Result<ExprId, ExprError> {
        if !matches!(self.kind(condition), Kind::Condition { .. } | Kind::NotCondition { .. }) {
            return Err(ExprError::ExpectedCondition);
        }
        if self.shape(on_true) != self.shape(on_false) {
            return Err(ExprError::ShapeMismatch {
                lhs: self.shape(on_true).to_vec(),
                rhs: self.shape(on_false).to_vec(),
            });
        }
        if self.free_indices(on_true) != self.free_indices(on_false) {
            return Err(ExprError::FreeIndexMismatch);
        }
        let shape = self.shape(on_true).to_vec();
        let free = self.free_indices(on_true).to_vec();
        let dims = self.index_dimensions(on_true).clone();
        Ok(self.push(Kind::Conditional { condition, on_true, on_false }, shape, free, dims))
    }

    // --- Compound tensor operators -------------------------------------

    pub fn transposed(&mut self, operand: ExprId) -> Result<ExprId, ExprError> {
        let sh = self.shape(operand).to_vec();
        if sh.len() != 2 {
            return Err(ExprError::RankMismatch { expected: 2, found: sh.len() });
        }
        let shape = vec![sh[1], sh[0]];
        let free = self.free_indices(operand).to_vec();
        let dims = self.index_dimensions(operand).clone();
        Ok(self.push(Kind::Transposed(operand), shape, free, dims))
    }

    pub fn trace(&mut self, operand: ExprId) -> Result<ExprId, ExprError> {
        self.require_square(operand)?;
        let free = self.free_indices(operand).to_vec();
        let dims = self.index_dimensions(operand).clone();
        Ok(self.push(Kind::Trace(operand), Vec::new(), free, dims))
    }

    pub fn deviatoric(&mut self, operand: ExprId) -> Result<ExprId, ExprError> {
        self.require_square(operand)?;
        let shape = self.shape(operand).to_vec();
        let free = self.free_indices(operand).to_vec();
        let dims = self.index_dimensions(operand).clone();
        Ok(self.push(Kind::Deviatoric(operand), shape, free, dims))
    }

    pub fn divergence(&mut self, operand: ExprId) -> Result<ExprId, ExprError> {
        let sh = self.shape(operand).to_vec();
        if sh.is_empty() {
            return Err(ExprError::RankMismatch { expected: 1, found: 0 });
        }
        let shape = sh[..sh.len() - 1].to_vec();
        let free = self.free_indices(operand).to_vec();
        let dims = self.index_dimensions(operand).clone();
        Ok(self.push(Kind::Divergence(operand), shape, free, dims))
    }

    pub fn curl(&mut self, operand: ExprId) -> Result<ExprId, ExprError> {
        if self.shape(operand) != [3] {
            return Err(ExprError::ShapeMismatch {
                lhs: vec![3],
                rhs: self.shape(operand).to_vec(),
            });
        }
        let free = self.free_indices(operand).to_vec();
        let dims = self.index_dimensions(operand).clone();
        Ok(self.push(Kind::Curl(operand), vec![3], free, dims))
    }

    pub fn gradient(&mut self, operand: ExprId, dim: usize) -> Result<ExprId, ExprError> {
        let mut shape = self.shape(operand).to_vec();
        shape.push(dim);
        let free = self.free_indices(operand).to_vec();
        let dims = self.index_dimensions(operand).clone();
        Ok(self.push(Kind::Gradient { operand, dim }, shape, free, dims))
    }

    pub fn outer(&mut self, a: ExprId, b: ExprId) -> Result<ExprId, ExprError> {
        let mut shape = self.shape(a).to_vec();
        shape.extend_from_slice(self.shape(b));
        let (free, dims) = self.merged_operand_signature(&[a, b])?;
        Ok(self.push(Kind::Outer(a, b), shape, free, dims))
    }

    pub fn inner(&mut self, a: ExprId, b: ExprId) -> Result<ExprId, ExprError> {
        if self.shape(a) != self.shape(b) {
            return Err(ExprError::ShapeMismatch {
                lhs: self.shape(a).to_vec(),
                rhs: self.shape(b).to_vec(),
            });
        }
        let (free, dims) = self.merged_operand_signature(&[a, b])?;
        Ok(self.push(Kind::Inner(a, b), Vec::new(), free, dims))
    }

    pub fn dot(&mut self, a: ExprId, b: ExprId) -> Result<ExprId, ExprError> {
        let (sa, sb) = (self.shape(a).to_vec(), self.shape(b).to_vec());
        if sa.is_empty() || sb.is_empty() {
            return Err(ExprError::RankMismatch { expected: 1, found: 0 });
        }
        if sa[sa.len() - 1] != sb[0] {
            return Err(ExprError::ShapeMismatch { lhs: sa, rhs: sb });
        }
        let mut shape = sa[..sa.len() - 1].to_vec();
        shape.extend_from_slice(&sb[1..]);
        let (free, dims) = self.merged_operand_signature(&[a, b])?;
        Ok(self.push(Kind::Dot(a, b), shape, free, dims))
    }

    pub fn cross(&mut self, a: ExprId, b: ExprId) -> Result<ExprId, ExprError> {
        if self.shape(a) != [3] || self.shape(b) != [3] {
            return Err(ExprError::ShapeMismatch {
                lhs: self.shape(a).to_vec(),
                rhs: self.shape(b).to_vec(),
            });
        }
        let (free, dims) = self.merged_operand_signature(&[a, b])?;
        Ok(self.push(Kind::Cross(a, b), vec![3], free, dims))
    }

    pub fn determinant(&mut self, operand: ExprId) -> Result<ExprId, ExprError> {
        self.require_square(operand)?;
        let free = self.free_indices(operand).to_vec();
        let dims = self.index_dimensions(operand).clone();
        Ok(self.push(Kind::Determinant(operand), Vec::new(), free, dims))
    }

    pub fn cofactor(&mut self, operand: ExprId) -> Result<ExprId, ExprError> {
        self.require_square(operand)?;
        let shape = self.shape(operand).to_vec();
        let free = self.free_indices(operand).to_vec();
        let dims = self.index_dimensions(operand).clone();
        Ok(self.push(Kind::Cofactor(operand), shape, free, dims))
    }

    pub fn inverse(&mut self, operand: ExprId) -> Result<ExprId, ExprError> {
        self.require_square(operand)?;
        let shape = self.shape(operand).to_vec();
        let free = self.free_indices(operand).to_vec();
        let dims = self.index_dimensions(operand).clone();
        Ok(self.push(Kind::Inverse(operand), shape, free, dims))
    }

    // --- Derivative markers --------------------------------------------

    /// Unresolved derivative with respect to one spatial coordinate
    /// component, addressed by a fixed component or a symbolic index bound
    /// to the spatial dimension.
    pub fn spatial_derivative(
        &mut self,
        operand: ExprId,
        component: IndexTerm,
        dim: usize,
    ) -> Result<ExprId, ExprError> {
        let shape = self.shape(operand).to_vec();
        let mut free = self.free_indices(operand).to_vec();
        let mut dims = self.index_dimensions(operand).clone();
        match component {
            IndexTerm::Fixed(c) => {
                if c >= dim {
                    return Err(ExprError::ComponentOutOfRange { component: c, extent: dim });
                }
            }
            IndexTerm::Free(i) => {
                match dims.get(&i) {
                    Some(&known) if known != dim => {
                        return Err(ExprError::IndexDimensionConflict {
                            expected: known,
                            found: dim,
                        })
                    }
                    _ => {
                        dims.insert(i, dim);
                    }
                }
                free.push(i);
            }
        }
        let free = sorted_unique(&free);
        let dims = shapes::dims_for(&dims, &free);
        Ok(self.push(Kind::SpatialDerivative { operand, component }, shape, free, dims))
    }

    /// Unresolved derivative with respect to a labeled variable.
    pub fn variable_derivative(
        &mut self,
        operand: ExprId,
        var: ExprId,
    ) -> Result<ExprId, ExprError> {
        if !matches!(self.kind(var), Kind::Variable { .. }) {
            return Err(ExprError::ExpectedVariable);
        }
        let mut shape = self.shape(operand).to_vec();
        shape.extend_from_slice(self.shape(var));
        let (free, dims) = self.merged_operand_signature(&[operand, var])?;
        Ok(self.push(Kind::VariableDerivative { operand, var }, shape, free, dims))
    }

    /// Unresolved Gateaux derivative with respect to a tuple of coefficient
    /// fields, each paired with a direction field of the same shape.
    pub fn coefficient_derivative(
        &mut self,
        operand: ExprId,
        coefficients: Vec<ExprId>,
        directions: Vec<ExprId>,
        table: DerivativeTable,
    ) -> Result<ExprId, ExprError> {
        if coefficients.len() != directions.len() {
            return Err(ExprError::ArityMismatch {
                expected: coefficients.len(),
                found: directions.len(),
            });
        }
        for &w in &coefficients {
            if !matches!(self.kind(w), Kind::Coefficient { .. }) {
                return Err(ExprError::ExpectedCoefficient);
            }
        }
        let shape = self.shape(operand).to_vec();
        let free = self.free_indices(operand).to_vec();
        let dims = self.index_dimensions(operand).clone();
        Ok(self.push(
            Kind::CoefficientDerivative { operand, coefficients, directions, table },
            shape,
            free,
            dims,
        ))
    }

    // --- Internal helpers ----------------------------------------------

    fn require_square(&self, operand: ExprId) -> Result<(), ExprError> {
        let sh = self.shape(operand);
        if sh.len() == 2 && sh[0] == sh[1] {
            Ok(())
        } else {
            Err(ExprError::ExpectedSquare { shape: sh.to_vec() })
        }
    }

    fn literal_value(&self, id: ExprId) -> Option<f64> {
        if !self.is_true_scalar(id) {
            return None;
        }
        match *self.kind(id) {
            Kind::IntValue(v) => Some(v as f64),
            Kind::RealValue(v) => Some(v),
            _ => None,
        }
    }

    /// Merge the free-index signatures of several operands, checking that a
    /// shared index is bound to one dimension everywhere.
    fn merged_operand_signature(
        &self,
        operands: &[ExprId],
    ) -> Result<(Vec<Index>, BTreeMap<Index, usize>), ExprError> {
        let mut free: Vec<Index> = Vec::new();
        let mut dims: BTreeMap<Index, usize> = BTreeMap::new();
        for &op in operands {
            for (&i, &d) in self.index_dimensions(op) {
                match dims.get(&i) {
                    Some(&known) if known != d => {
                        return Err(ExprError::IndexDimensionConflict {
                            expected: known,
                            found: d,
                        })
                    }
                    _ => {
                        dims.insert(i, d);
                    }
                }
            }
            free = shapes::merge_unique(&free, self.free_indices(op));
        }
        let dims = shapes::dims_for(&dims, &free);
        Ok((free, dims))
    }

    /// Diagnostic helper: short tag of a node's kind.
    pub fn kind_tag(&self, id: ExprId) -> &'static str {
        kind_name(self.kind(id))
    }
}

fn sorted_unique(indices: &[Index]) -> Vec<Index> {
    let mut v = indices.to_vec();
    v.sort_unstable();
    v.dedup();
    v
}
