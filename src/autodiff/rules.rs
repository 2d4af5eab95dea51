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

//! Rule tables.
//!
//! The first half is the chain-rule table for transcendental functions and
//! the Bessel recurrences; these are part of the active dispatch. The
//! second half is the pending compound-operator catalogue: rules that
//! commute with differentiation, consulted only when
//! [`AdOptions::compound_rules`](super::AdOptions) is set, and the
//! deliberately unimplemented rules (cross product, determinant, cofactor,
//! inverse) that always demand upstream expansion. Nothing here guesses a
//! rule: an operator without one is a hard error.

use crate::expr::{kind_name, BesselFamily, ExprArena, ExprError, ExprId, Kind, MathKind};

use super::engine::{Diff, ForwardAd, Visited};
use super::AdError;

/// Chain rule for a scalar math function: `o` is the (re)built primal node,
/// `f` its argument, `fp` the argument's derivative.
pub(super) fn math_rule(
    ad: &mut ForwardAd<'_>,
    kind: MathKind,
    o: ExprId,
    f: ExprId,
    fp: ExprId,
) -> Result<ExprId, AdError> {
    let a = &mut *ad.arena;
    let op = match kind {
        // fp / (2 o)
        MathKind::Sqrt => {
            let two = a.int(2);
            let denominator = a.mul(two, o)?;
            a.div(fp, denominator)?
        }
        // fp o
        MathKind::Exp => a.mul(fp, o)?,
        // fp / f
        MathKind::Ln => {
            if a.is_zero(f) {
                return Err(AdError::LogOfZero);
            }
            a.div(fp, f)?
        }
        // -fp sin(f)
        MathKind::Cos => {
            let sin_f = a.math_fn(MathKind::Sin, f)?;
            let minus_fp = a.neg(fp)?;
            a.mul(minus_fp, sin_f)?
        }
        // fp cos(f)
        MathKind::Sin => {
            let cos_f = a.math_fn(MathKind::Cos, f)?;
            a.mul(fp, cos_f)?
        }
        // 2 fp / (cos(2f) + 1)
        MathKind::Tan => {
            let two = a.int(2);
            let two_f = a.mul(two, f)?;
            let cos_2f = a.math_fn(MathKind::Cos, two_f)?;
            let one = a.int(1);
            let denominator = a.add(cos_2f, one)?;
            let two = a.int(2);
            let numerator = a.mul(fp, two)?;
            a.div(numerator, denominator)?
        }
        // -fp / sqrt(1 - f^2)
        MathKind::Acos => {
            let root = sqrt_one_minus_square(a, f)?;
            let quotient = a.div(fp, root)?;
            a.neg(quotient)?
        }
        // fp / sqrt(1 - f^2)
        MathKind::Asin => {
            let root = sqrt_one_minus_square(a, f)?;
            a.div(fp, root)?
        }
        // fp / (1 + f^2)
        MathKind::Atan => {
            let two = a.int(2);
            let f_sq = a.pow(f, two)?;
            let one = a.int(1);
            let denominator = a.add(one, f_sq)?;
            a.div(fp, denominator)?
        }
        // fp (2 / sqrt(pi)) exp(-f^2)
        MathKind::Erf => {
            let two = a.int(2);
            let f_sq = a.pow(f, two)?;
            let minus_f_sq = a.neg(f_sq)?;
            let gauss = a.math_fn(MathKind::Exp, minus_f_sq)?;
            let pi = a.real(std::f64::consts::PI);
            let sqrt_pi = a.math_fn(MathKind::Sqrt, pi)?;
            let two = a.int(2);
            let coefficient = a.div(two, sqrt_pi)?;
            let scaled = a.mul(coefficient, gauss)?;
            a.mul(fp, scaled)?
        }
    };
    Ok(op)
}

fn sqrt_one_minus_square(a: &mut ExprArena, f: ExprId) -> Result<ExprId, ExprError> {
    let two = a.int(2);
    let f_sq = a.pow(f, two)?;
    let one = a.int(1);
    let radicand = a.sub(one, f_sq)?;
    a.math_fn(MathKind::Sqrt, radicand)
}

/// Standard Bessel recurrence, branching on a zero order, scaled by the
/// chain-rule factor `fp`. The order itself is never differentiated; the
/// engine rejects order dependence before calling this.
pub(super) fn bessel_rule(
    ad: &mut ForwardAd<'_>,
    family: BesselFamily,
    order: ExprId,
    f: ExprId,
    fp: ExprId,
) -> Result<ExprId, AdError> {
    let a = &mut *ad.arena;
    let base = if a.int_value(order) == Some(0) {
        let one = a.int(1);
        let first = a.bessel(family, one, f)?;
        match family {
            BesselFamily::J | BesselFamily::Y | BesselFamily::K => a.neg(first)?,
            BesselFamily::I => first,
        }
    } else {
        let one = a.int(1);
        let order_minus = a.sub(order, one)?;
        let one = a.int(1);
        let order_plus = a.add(order, one)?;
        let below = a.bessel(family, order_minus, f)?;
        let above = a.bessel(family, order_plus, f)?;
        let half = a.real(0.5);
        match family {
            BesselFamily::J | BesselFamily::Y => {
                let difference = a.sub(below, above)?;
                a.mul(half, difference)?
            }
            BesselFamily::I => {
                let sum = a.add(below, above)?;
                a.mul(half, sum)?
            }
            BesselFamily::K => {
                let sum = a.add(below, above)?;
                let halved = a.mul(half, sum)?;
                a.neg(halved)?
            }
        }
    };
    a.mul(base, fp).map_err(Into::into)
}

/// Pending catalogue: compound operators that commute with differentiation.
///
/// Only consulted when the caller opts in; the rules are valid only for
/// differentiation variables that add no extra shape, which the shape
/// checks in the constructors enforce indirectly. Cross product,
/// determinant, cofactor, and inverse are deliberately not implemented and
/// must be eliminated by the upstream expansion pass.
pub(super) fn compound_rule(
    ad: &mut ForwardAd<'_>,
    id: ExprId,
    kind: &Kind,
) -> Result<Visited, AdError> {
    if !ad.options.compound_rules {
        return Err(AdError::MissingRule { kind: kind_name(kind) });
    }
    match *kind {
        Kind::Transposed(x) => commute(ad, id, x, ExprArena::transposed),
        Kind::Trace(x) => commute(ad, id, x, ExprArena::trace),
        Kind::Deviatoric(x) => commute(ad, id, x, ExprArena::deviatoric),
        Kind::Divergence(x) => commute(ad, id, x, ExprArena::divergence),
        Kind::Curl(x) => commute(ad, id, x, ExprArena::curl),
        Kind::Gradient { operand, dim } => gradient(ad, id, operand, dim),
        Kind::Outer(x, y) => bilinear(ad, id, x, y, ExprArena::outer),
        Kind::Inner(x, y) => bilinear(ad, id, x, y, ExprArena::inner),
        Kind::Dot(x, y) => bilinear(ad, id, x, y, ExprArena::dot),
        Kind::Cross(..) | Kind::Determinant(_) | Kind::Cofactor(_) | Kind::Inverse(_) => {
            Err(AdError::MissingRule { kind: kind_name(kind) })
        }
        _ => Err(AdError::Internal("compound rule invoked on a non-compound node")),
    }
}

/// Single-operand operator commuting with the derivative.
fn commute(
    ad: &mut ForwardAd<'_>,
    id: ExprId,
    x: ExprId,
    rebuild: impl Fn(&mut ExprArena, ExprId) -> Result<ExprId, ExprError>,
) -> Result<Visited, AdError> {
    let (x2, xp) = ad.visit(x)?;
    let xp = xp.expr()?;
    let o = if x2 == x { id } else { rebuild(ad.arena, x2)? };
    let op = rebuild(ad.arena, xp)?;
    Ok((o, Diff::Expr(op)))
}

/// Gradient commutes too, but a spatially constant derivative short-cuts
/// to the signed zero instead of a gradient of a constant.
fn gradient(ad: &mut ForwardAd<'_>, id: ExprId, x: ExprId, dim: usize) -> Result<Visited, AdError> {
    let (x2, xp) = ad.visit(x)?;
    let xp = xp.expr()?;
    let o = if x2 == x { id } else { ad.arena.gradient(x2, dim)? };
    let op = if ad.arena.is_spatially_constant(xp) {
        ad.zero_diff(o)
    } else {
        ad.arena.gradient(xp, dim)?
    };
    Ok((o, Diff::Expr(op)))
}

/// Product rule for a bilinear compound operator.
fn bilinear(
    ad: &mut ForwardAd<'_>,
    id: ExprId,
    x: ExprId,
    y: ExprId,
    rebuild: impl Fn(&mut ExprArena, ExprId, ExprId) -> Result<ExprId, ExprError>,
) -> Result<Visited, AdError> {
    let (x2, xp) = ad.visit(x)?;
    let xp = xp.expr()?;
    let (y2, yp) = ad.visit(y)?;
    let yp = yp.expr()?;
    let o = if x2 == x && y2 == y { id } else { rebuild(ad.arena, x2, y2)? };
    let left = rebuild(ad.arena, xp, y2)?;
    let right = rebuild(ad.arena, x2, yp)?;
    let op = ad.arena.add(left, right)?;
    Ok((o, Diff::Expr(op)))
}

/// Pending rule for a nested variable derivative: the marker is rebuilt
/// around the inner derivative. Fatal if the nested differentiation
/// variable itself depends on the outer one.
pub(super) fn pending_variable_derivative(
    ad: &mut ForwardAd<'_>,
    id: ExprId,
    operand: ExprId,
    var: ExprId,
) -> Result<Visited, AdError> {
    let (f2, fp) = ad.visit(operand)?;
    let fp = fp.expr()?;
    let (v2, vp) = ad.visit(var)?;
    let vp = vp.expr()?;
    if !ad.arena.is_zero(vp) {
        return Err(AdError::Internal(
            "nested variable derivative whose variable depends on the outer differentiation variable",
        ));
    }
    let o = if f2 == operand && v2 == var { id } else { ad.arena.variable_derivative(f2, v2)? };
    let op = ad.arena.variable_derivative(fp, v2)?;
    Ok((o, Diff::Expr(op)))
}
