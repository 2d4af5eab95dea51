use symform::expr::{ExprArena, ExprError, IndexTerm, Kind};
use symform::shapes;

#[test]
fn signatures_follow_the_binding_structure() {
    let mut arena = ExprArena::new();
    let w = arena.coefficient(0, vec![2, 3]);
    let i = arena.fresh_index();
    let j = arena.fresh_index();

    let wij = arena.indexed(w, vec![IndexTerm::Free(i), IndexTerm::Free(j)]).unwrap();
    assert!(arena.is_scalar(wij));
    assert_eq!(arena.free_indices(wij), &[i, j]);
    assert_eq!(arena.index_dimensions(wij)[&i], 2);
    assert_eq!(arena.index_dimensions(wij)[&j], 3);

    let summed = arena.index_sum(wij, i).unwrap();
    assert_eq!(arena.free_indices(summed), &[j]);
    assert!(!arena.index_dimensions(summed).contains_key(&i));

    let rebound = arena.component_tensor(summed, &[j]).unwrap();
    assert_eq!(arena.shape(rebound), &[3]);
    assert!(arena.free_indices(rebound).is_empty());
}

#[test]
fn zeros_carry_their_exact_signature() {
    let mut arena = ExprArena::new();
    let i = arena.fresh_index();
    let dims = [(i, 4)].into_iter().collect();
    let z = arena.zero(vec![2], &[i], &dims);
    assert!(arena.is_zero(z));
    assert_eq!(arena.shape(z), &[2]);
    assert_eq!(arena.free_indices(z), &[i]);
    assert_eq!(arena.index_dimensions(z)[&i], 4);

    // Indexing a zero stays a zero, with the indexing's signature.
    let j = arena.fresh_index();
    let zj = arena.indexed(z, vec![IndexTerm::Free(j)]).unwrap();
    assert!(arena.is_zero(zj));
    assert_eq!(arena.free_indices(zj), &[i, j]);
}

#[test]
fn scalarize_and_retensorize_are_inverse() {
    let mut arena = ExprArena::new();
    let u = arena.coefficient(0, vec![3]);
    let (scalar, indices) = shapes::as_scalar(&mut arena, u).unwrap();
    assert_eq!(indices.len(), 1);
    let back = shapes::as_tensor(&mut arena, scalar, &indices).unwrap();
    assert_eq!(back, u);
}

#[test]
fn list_tensor_rejects_ragged_components() {
    let mut arena = ExprArena::new();
    let a = arena.coefficient(0, vec![2]);
    let b = arena.coefficient(1, vec![3]);
    assert!(matches!(arena.list_tensor(vec![a, b]), Err(ExprError::ShapeMismatch { .. })));
}

#[test]
fn sum_rejects_mismatched_free_indices() {
    let mut arena = ExprArena::new();
    let u = arena.coefficient(0, vec![2]);
    let i = arena.fresh_index();
    let j = arena.fresh_index();
    let ui = arena.indexed(u, vec![IndexTerm::Free(i)]).unwrap();
    let uj = arena.indexed(u, vec![IndexTerm::Free(j)]).unwrap();
    assert!(matches!(arena.sum_of(vec![ui, uj]), Err(ExprError::FreeIndexMismatch)));
}

#[test]
fn reused_index_keeps_one_dimension() {
    let mut arena = ExprArena::new();
    let u = arena.coefficient(0, vec![2]);
    let w = arena.coefficient(1, vec![3]);
    let i = arena.fresh_index();
    let ui = arena.indexed(u, vec![IndexTerm::Free(i)]).unwrap();
    // The same index cannot be bound to extent 3 elsewhere in one product.
    let wi = arena.indexed(w, vec![IndexTerm::Free(i)]).unwrap();
    assert!(matches!(
        arena.product_of(vec![ui, wi]),
        Err(ExprError::IndexDimensionConflict { expected: 2, found: 3 })
    ));
}

#[test]
fn power_requires_true_scalars() {
    let mut arena = ExprArena::new();
    let u = arena.coefficient(0, vec![2]);
    let two = arena.int(2);
    assert!(matches!(arena.pow(u, two), Err(ExprError::ExpectedTrueScalar)));
}

#[test]
fn division_by_literal_zero_is_rejected() {
    let mut arena = ExprArena::new();
    let x = arena.coefficient(0, vec![]);
    let zero = arena.int(0);
    assert!(matches!(arena.div(x, zero), Err(ExprError::DivisionByZero)));
}

#[test]
fn conditional_requires_a_condition_node() {
    let mut arena = ExprArena::new();
    let x = arena.coefficient(0, vec![]);
    let y = arena.coefficient(1, vec![]);
    assert!(matches!(arena.conditional(x, y, y), Err(ExprError::ExpectedCondition)));
}

#[test]
fn derivative_markers_carry_the_extended_signature() {
    let mut arena = ExprArena::new();
    let u = arena.coefficient(0, vec![2]);
    let (v, _) = arena.new_variable(u);
    let inner = arena.coefficient(1, vec![]);
    let marker = arena.variable_derivative(inner, v).unwrap();
    // shape(marker) = shape(inner) + shape(v).
    assert_eq!(arena.shape(marker), &[2]);
}

#[test]
fn structural_equality_ignores_handle_identity() {
    let mut arena = ExprArena::new();
    let u = arena.coefficient(0, vec![]);
    let one_a = arena.int(1);
    let one_b = arena.int(1);
    let s1 = arena.sum_of(vec![u, one_a]).unwrap();
    let s2 = arena.sum_of(vec![u, one_b]).unwrap();
    assert_ne!(s1, s2);
    assert!(arena.expr_eq(s1, s2));

    let two = arena.int(2);
    let s3 = arena.sum_of(vec![u, two]).unwrap();
    assert!(!arena.expr_eq(s1, s3));
}

#[test]
fn spatially_constant_sees_through_algebra() {
    let mut arena = ExprArena::new();
    let one = arena.int(1);
    let c = arena.math_fn(symform::expr::MathKind::Exp, one).unwrap();
    assert!(arena.is_spatially_constant(c));

    let w = arena.coefficient(0, vec![]);
    let p = arena.product_of(vec![c, w]).unwrap();
    assert!(!arena.is_spatially_constant(p));
}

#[test]
fn kind_tags_are_stable_for_diagnostics() {
    let mut arena = ExprArena::new();
    let a = arena.coefficient(0, vec![3]);
    let b = arena.coefficient(1, vec![3]);
    let crossed = arena.cross(a, b).unwrap();
    assert_eq!(arena.kind_tag(crossed), "cross product");
    assert!(matches!(arena.kind(crossed), Kind::Cross(..)));
}
