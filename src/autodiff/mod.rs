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

//! Forward-mode symbolic differentiation over a shared expression DAG.
//!
//! The entry point is [`forward_ad`], which consumes an unresolved
//! derivative-marker node (spatial, variable, or coefficient derivative)
//! and returns the derivative expression. One invocation is one run: the
//! run owns a node-identity memo cache and a label-keyed variable cache,
//! both discarded at the end, so the same shared sub-expression is
//! differentiated at most once and concurrent runs never share state.
//!
//! The engine differentiates primitive operators only. Compound tensor
//! operators (cross product, determinant, cofactor, inverse and friends)
//! must be eliminated by an upstream expansion pass; encountering one is
//! the [`AdError::MissingRule`] fatal unless the optional commuting-rule
//! catalogue is enabled through [`AdOptions`].

mod engine;
mod rules;
mod variants;

use crate::diagnostics::Sink;
use crate::expr::{ExprArena, ExprError, ExprId, Index, Kind};

use engine::ForwardAd;

/// Optional behaviors of one differentiation run.
#[derive(Debug, Clone, Copy, Default)]
pub struct AdOptions {
    /// Consult the pending catalogue of compound operators that commute
    /// with differentiation instead of failing with a missing rule. The
    /// catalogue is only valid for differentiation variables that add no
    /// extra shape; it is off by default and the deliberately
    /// unimplemented operators (cross, determinant, cofactor, inverse)
    /// stay fatal either way.
    pub compound_rules: bool,
}

/// Fatal conditions aborting a differentiation run. Non-fatal conditions
/// go through the diagnostic sink instead.
#[derive(Debug, thiserror::Error)]
pub enum AdError {
    /// The node kind has no differentiation rule. The upstream expansion
    /// pass must rewrite these in terms of supported primitives.
    #[error("no differentiation rule for {kind} nodes; expand compound operators before differentiation")]
    MissingRule { kind: &'static str },
    /// A bound summation index coincides with a free index of the
    /// differentiation variable. Moving the derivative inside the sum
    /// would accumulate it once per summand; the caller must rename
    /// indices instead of reusing them across independent expressions.
    #[error("index scope collision on {index:?}: the summation index is also free in the differentiation variable; rename indices to avoid reuse across independent sub-expressions")]
    IndexScopeCollision { index: Index },
    /// A rule demanding scalar operands met a tensor.
    #[error("expected a scalar {role}, found shape {shape:?}")]
    NonScalar { role: &'static str, shape: Vec<usize> },
    /// The identity derivative of a variable needs the differentiation
    /// variable and the visited expression to agree on shape.
    #[error("differentiation variable of shape {variable:?} cannot produce an identity derivative for shape {expression:?}")]
    VariableShapeMismatch { variable: Vec<usize>, expression: Vec<usize> },
    #[error("differentiation of a Bessel function with respect to its order is not supported")]
    BesselOrderDependence,
    #[error("derivative of ln(f) where f is structurally zero: division by zero")]
    LogOfZero,
    /// A coefficient-derivative table entry must supply one derivative per
    /// differentiation direction.
    #[error("coefficient derivative table supplies {found} entries for {expected} directions")]
    DerivativeTableArity { expected: usize, found: usize },
    #[error("coefficient derivative of shape {derivative:?} cannot be contracted against a direction of shape {direction:?}")]
    DerivativeTableContraction { derivative: Vec<usize>, direction: Vec<usize> },
    /// Engine bug, not a user error.
    #[error("internal error: {0}")]
    Internal(&'static str),
    #[error(transparent)]
    Expr(#[from] ExprError),
}

/// Differentiate an unresolved derivative marker with default options.
///
/// `expr` must be a spatial, variable, or coefficient derivative node;
/// `dim` is the spatial dimension of the underlying domain. Returns the
/// derivative expression, whose shape is the operand's shape extended by
/// the differentiation variable's shape and whose free indices are the
/// operand's extended by the differentiation variable's.
pub fn forward_ad(
    arena: &mut ExprArena,
    expr: ExprId,
    dim: usize,
    sink: &mut dyn Sink,
) -> Result<ExprId, AdError> {
    forward_ad_with_options(arena, expr, dim, AdOptions::default(), sink)
}

/// Like [`forward_ad`], with explicit [`AdOptions`].
pub fn forward_ad_with_options(
    arena: &mut ExprArena,
    expr: ExprId,
    dim: usize,
    options: AdOptions,
    sink: &mut dyn Sink,
) -> Result<ExprId, AdError> {
    log::debug!("forward_ad: {} marker, spatial dimension {dim}", arena.kind_tag(expr));
    match arena.kind(expr).clone() {
        Kind::SpatialDerivative { operand, component } => {
            let mut run = ForwardAd::spatial(arena, sink, dim, component, options);
            run.differentiate(operand)
        }
        Kind::VariableDerivative { operand, var } => {
            let mut run = ForwardAd::for_variable(arena, sink, dim, var, options)?;
            run.differentiate(operand)
        }
        Kind::CoefficientDerivative { operand, coefficients, directions, table } => {
            let pairs = coefficients.into_iter().zip(directions).collect();
            let mut run = ForwardAd::for_coefficients(arena, sink, dim, pairs, table, options);
            run.differentiate(operand)
        }
        _ => Err(AdError::Internal("forward_ad invoked on a non-derivative node")),
    }
}
