use symform::diagnostics::CollectingSink;
use symform::expr::{
    BesselFamily, CondOp, DerivativeTable, ExprArena, ExprId, IndexTerm, Kind, MathKind, Side,
};
use symform::{forward_ad, forward_ad_with_options, AdError, AdOptions};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn spatial_marker(
    arena: &mut ExprArena,
    operand: ExprId,
    component: IndexTerm,
    dim: usize,
) -> ExprId {
    arena.spatial_derivative(operand, component, dim).expect("marker")
}

/// First spatial coordinate component in a 2d domain.
fn x_component(arena: &mut ExprArena, c: usize) -> ExprId {
    let x = arena.spatial_coordinate(2);
    arena.indexed(x, vec![IndexTerm::Fixed(c)]).expect("coordinate component")
}

#[test]
fn spatial_derivative_of_sin_is_cos() {
    init_logging();
    let mut arena = ExprArena::new();
    let x0 = x_component(&mut arena, 0);
    let sin_x0 = arena.math_fn(MathKind::Sin, x0).unwrap();
    let marker = spatial_marker(&mut arena, sin_x0, IndexTerm::Fixed(0), 2);

    let mut sink = CollectingSink::new();
    let derivative = forward_ad(&mut arena, marker, 2, &mut sink).expect("derivative");

    // The chain factor is the literal one and folds away: cos(x0) remains.
    match *arena.kind(derivative) {
        Kind::MathFn { kind: MathKind::Cos, operand } => assert_eq!(operand, x0),
        ref other => panic!("expected cos(x0), got {other:?}"),
    }
    assert!(sink.warnings.is_empty());
}

#[test]
fn spatial_derivative_of_coordinate_product_picks_the_other_factor() {
    init_logging();
    let mut arena = ExprArena::new();
    let x0 = x_component(&mut arena, 0);
    let x1 = x_component(&mut arena, 1);
    let product = arena.product_of(vec![x0, x1]).unwrap();

    let marker0 = spatial_marker(&mut arena, product, IndexTerm::Fixed(0), 2);
    let mut sink = CollectingSink::new();
    let d0 = forward_ad(&mut arena, marker0, 2, &mut sink).unwrap();
    assert_eq!(d0, x1);

    let marker1 = spatial_marker(&mut arena, product, IndexTerm::Fixed(1), 2);
    let d1 = forward_ad(&mut arena, marker1, 2, &mut sink).unwrap();
    assert_eq!(d1, x0);
}

#[test]
fn variable_power_rule_reuses_the_reduced_power() {
    init_logging();
    let mut arena = ExprArena::new();
    let inner = arena.coefficient(0, vec![]);
    let (v, _label) = arena.new_variable(inner);
    let two = arena.int(2);
    let v_squared = arena.pow(v, two).unwrap();
    let marker = arena.variable_derivative(v_squared, v).unwrap();

    let mut sink = CollectingSink::new();
    let derivative = forward_ad(&mut arena, marker, 2, &mut sink).expect("derivative");

    // d(v^2)/dv = 2 v, through f**(g-1) with g-1 folding to one.
    match arena.kind(derivative).clone() {
        Kind::Product { operands } => {
            assert_eq!(operands.len(), 2);
            assert_eq!(arena.int_value(operands[0]), Some(2));
            assert_eq!(operands[1], v);
        }
        other => panic!("expected 2*v, got {other:?}"),
    }
}

#[test]
fn index_scope_collision_is_fatal() {
    init_logging();
    let mut arena = ExprArena::new();
    let v = arena.argument(0, vec![2]);
    let i = arena.fresh_index();
    let vi = arena.indexed(v, vec![IndexTerm::Free(i)]).unwrap();
    // v[i]*v[i] contracts over i, leaving the sum bound to i.
    let contracted = arena.mul(vi, vi).unwrap();
    assert!(matches!(arena.kind(contracted), Kind::IndexSum { .. }));
    let marker = spatial_marker(&mut arena, contracted, IndexTerm::Free(i), 2);

    let mut sink = CollectingSink::new();
    let err = forward_ad(&mut arena, marker, 2, &mut sink).unwrap_err();
    match err {
        AdError::IndexScopeCollision { index } => assert_eq!(index, i),
        other => panic!("expected index scope collision, got {other}"),
    }
}

#[test]
fn product_rule_for_coefficients() {
    init_logging();
    let mut arena = ExprArena::new();
    let w0 = arena.coefficient(0, vec![]);
    let w1 = arena.coefficient(1, vec![]);
    let v0 = arena.argument(0, vec![]);
    let v1 = arena.argument(1, vec![]);
    let product = arena.product_of(vec![w0, w1]).unwrap();
    let marker = arena
        .coefficient_derivative(product, vec![w0, w1], vec![v0, v1], DerivativeTable::new())
        .unwrap();

    let mut sink = CollectingSink::new();
    let derivative = forward_ad(&mut arena, marker, 2, &mut sink).expect("derivative");

    // d(w0 w1) = v0 w1 + w0 v1.
    let terms = match arena.kind(derivative).clone() {
        Kind::Sum { operands } => operands,
        other => panic!("expected a two-term sum, got {other:?}"),
    };
    assert_eq!(terms.len(), 2);
    match arena.kind(terms[0]).clone() {
        Kind::Product { operands } => assert_eq!(operands, vec![v0, w1]),
        other => panic!("expected v0*w1, got {other:?}"),
    }
    match arena.kind(terms[1]).clone() {
        Kind::Product { operands } => assert_eq!(operands, vec![w0, v1]),
        other => panic!("expected w0*v1, got {other:?}"),
    }
    assert!(sink.warnings.is_empty());
}

#[test]
fn derivative_signature_extends_shape_and_indices() {
    init_logging();
    let mut arena = ExprArena::new();
    let u = arena.coefficient(0, vec![2]);
    let i = arena.fresh_index();
    let marker = spatial_marker(&mut arena, u, IndexTerm::Free(i), 2);

    let mut sink = CollectingSink::new();
    let derivative = forward_ad(&mut arena, marker, 2, &mut sink).unwrap();

    // Coefficients defer: the derivative is the re-applied marker, with the
    // operand's shape and the variable's index joined in.
    assert!(matches!(arena.kind(derivative), Kind::SpatialDerivative { .. }));
    assert_eq!(arena.shape(derivative), &[2]);
    assert_eq!(arena.free_indices(derivative), &[i]);
    assert_eq!(arena.index_dimensions(derivative)[&i], 2);
}

#[test]
fn terminal_derivative_is_zero_with_extended_signature() {
    init_logging();
    let mut arena = ExprArena::new();
    let n = arena.facet_normal(2);
    let i = arena.fresh_index();
    let marker = spatial_marker(&mut arena, n, IndexTerm::Free(i), 2);

    let mut sink = CollectingSink::new();
    let derivative = forward_ad(&mut arena, marker, 2, &mut sink).unwrap();
    assert!(arena.is_zero(derivative));
    assert_eq!(arena.shape(derivative), &[2]);
    assert_eq!(arena.free_indices(derivative), &[i]);
}

#[test]
fn shared_nodes_are_differentiated_once() {
    init_logging();
    let mut arena = ExprArena::new();
    let c = arena.coefficient(0, vec![]);
    let sin_c = arena.math_fn(MathKind::Sin, c).unwrap();
    // The same node referenced from two parents.
    let doubled = arena.sum_of(vec![sin_c, sin_c]).unwrap();
    let marker = spatial_marker(&mut arena, doubled, IndexTerm::Fixed(0), 2);

    let mut sink = CollectingSink::new();
    let derivative = forward_ad(&mut arena, marker, 2, &mut sink).unwrap();

    match arena.kind(derivative).clone() {
        Kind::Sum { operands } => {
            assert_eq!(operands.len(), 2);
            // Identity, not just structural equality: the memo cache returned
            // the same object for the second visit.
            assert_eq!(operands[0], operands[1]);
        }
        other => panic!("expected a sum of two shared derivatives, got {other:?}"),
    }
}

#[test]
fn variables_with_one_label_share_one_derivative() {
    init_logging();
    let mut arena = ExprArena::new();
    let inner = arena.coefficient(0, vec![]);
    let label = arena.fresh_label();
    let v1 = arena.variable(inner, label);
    let v2 = arena.variable(inner, label);
    assert_ne!(v1, v2);
    let product = arena.product_of(vec![v1, v2]).unwrap();
    let marker = arena.variable_derivative(product, v1).unwrap();

    let mut sink = CollectingSink::new();
    let derivative = forward_ad(&mut arena, marker, 2, &mut sink).unwrap();

    // Both factors resolve through the label cache: d(v*v)/dv = v + v with
    // one shared node.
    match arena.kind(derivative).clone() {
        Kind::Sum { operands } => {
            assert_eq!(operands.len(), 2);
            assert_eq!(operands[0], operands[1]);
            assert_eq!(operands[0], v1);
        }
        other => panic!("expected v + v, got {other:?}"),
    }
}

#[test]
fn variable_differentiated_by_itself_gives_the_identity_structure() {
    init_logging();
    let mut arena = ExprArena::new();
    let u = arena.coefficient(0, vec![2]);
    let (v, _) = arena.new_variable(u);
    let marker = arena.variable_derivative(v, v).unwrap();

    let mut sink = CollectingSink::new();
    let derivative = forward_ad(&mut arena, marker, 2, &mut sink).unwrap();

    assert_eq!(arena.shape(derivative), &[2, 2]);
    // One delta per shape dimension; re-binding delta_ij over (i, j)
    // collapses to the identity itself.
    assert!(matches!(arena.kind(derivative), Kind::Identity(2)));
}

#[test]
fn matrix_variable_identity_derivative_is_a_delta_product() {
    init_logging();
    let mut arena = ExprArena::new();
    let m = arena.coefficient(0, vec![2, 2]);
    let (v, _) = arena.new_variable(m);
    let marker = arena.variable_derivative(v, v).unwrap();

    let mut sink = CollectingSink::new();
    let derivative = forward_ad(&mut arena, marker, 2, &mut sink).unwrap();

    assert_eq!(arena.shape(derivative), &[2, 2, 2, 2]);
    match arena.kind(derivative).clone() {
        Kind::ComponentTensor { scalar, indices } => {
            assert_eq!(indices.len(), 4);
            match arena.kind(scalar).clone() {
                Kind::Product { operands } => {
                    assert_eq!(operands.len(), 2);
                    for delta in operands {
                        match arena.kind(delta).clone() {
                            Kind::Indexed { base, .. } => {
                                assert!(matches!(arena.kind(base), Kind::Identity(2)));
                            }
                            other => panic!("expected an indexed identity, got {other:?}"),
                        }
                    }
                }
                other => panic!("expected a delta product, got {other:?}"),
            }
        }
        other => panic!("expected a component tensor of deltas, got {other:?}"),
    }
}

#[test]
fn scalar_variable_with_free_indices_keeps_them_on_the_one() {
    init_logging();
    let mut arena = ExprArena::new();
    let u = arena.coefficient(0, vec![2]);
    let i = arena.fresh_index();
    let ui = arena.indexed(u, vec![IndexTerm::Free(i)]).unwrap();
    let (v, _) = arena.new_variable(ui);
    let marker = arena.variable_derivative(v, v).unwrap();

    let mut sink = CollectingSink::new();
    let derivative = forward_ad(&mut arena, marker, 2, &mut sink).unwrap();

    assert!(matches!(*arena.kind(derivative), Kind::IntValue(1)));
    assert_eq!(arena.free_indices(derivative), &[i]);
}

#[test]
fn ln_of_structural_zero_is_a_domain_error() {
    init_logging();
    let mut arena = ExprArena::new();
    let zero = arena.zero_scalar();
    let ln = arena.math_fn(MathKind::Ln, zero).unwrap();
    let marker = spatial_marker(&mut arena, ln, IndexTerm::Fixed(0), 2);

    let mut sink = CollectingSink::new();
    let err = forward_ad(&mut arena, marker, 2, &mut sink).unwrap_err();
    assert!(matches!(err, AdError::LogOfZero));
}

#[test]
fn missing_coefficient_mapping_defaults_to_zero_with_one_warning() {
    init_logging();
    let mut arena = ExprArena::new();
    let w0 = arena.coefficient(0, vec![]);
    let w1 = arena.coefficient(1, vec![]);
    let unknown = arena.coefficient(2, vec![2]);
    let v0 = arena.argument(0, vec![]);
    let extra = arena.argument(1, vec![]);
    // Non-empty table without an entry for `unknown`.
    let mut table = DerivativeTable::new();
    table.insert(w1, vec![extra]);
    let marker = arena
        .coefficient_derivative(unknown, vec![w0], vec![v0], table)
        .unwrap();

    let mut sink = CollectingSink::new();
    let derivative = forward_ad(&mut arena, marker, 2, &mut sink).unwrap();

    assert!(arena.is_zero(derivative));
    assert_eq!(arena.shape(derivative), &[2]);
    assert_eq!(sink.warnings.len(), 1);
    assert!(sink.warnings[0].message.contains("assuming"));
}

#[test]
fn supplied_coefficient_derivative_is_contracted_against_the_direction() {
    init_logging();
    let mut arena = ExprArena::new();
    let w0 = arena.coefficient(0, vec![2]);
    let compound = arena.coefficient(1, vec![]);
    let v0 = arena.argument(0, vec![2]);
    // d(compound)/d(w0) has shape `shape(compound) + shape(v0)`.
    let partial = arena.coefficient(2, vec![2]);
    let mut table = DerivativeTable::new();
    table.insert(compound, vec![partial]);
    let marker = arena
        .coefficient_derivative(compound, vec![w0], vec![v0], table)
        .unwrap();

    let mut sink = CollectingSink::new();
    let derivative = forward_ad(&mut arena, marker, 2, &mut sink).unwrap();

    // partial[i] v0[i], summed over the direction's axis.
    assert!(arena.is_scalar(derivative));
    assert!(arena.free_indices(derivative).is_empty());
    assert!(matches!(arena.kind(derivative), Kind::IndexSum { .. }));
    assert!(sink.warnings.is_empty());
}

#[test]
fn coefficient_matching_a_pair_differentiates_to_its_direction() {
    init_logging();
    let mut arena = ExprArena::new();
    let w0 = arena.coefficient(0, vec![2]);
    let v0 = arena.argument(0, vec![2]);
    let marker = arena
        .coefficient_derivative(w0, vec![w0], vec![v0], DerivativeTable::new())
        .unwrap();

    let mut sink = CollectingSink::new();
    let derivative = forward_ad(&mut arena, marker, 2, &mut sink).unwrap();
    assert_eq!(derivative, v0);
}

#[test]
fn division_rule_keeps_the_denominator() {
    init_logging();
    let mut arena = ExprArena::new();
    let inner = arena.coefficient(0, vec![]);
    let (v, _) = arena.new_variable(inner);
    let g = arena.coefficient(1, vec![]);
    let quotient = arena.div(v, g).unwrap();
    let marker = arena.variable_derivative(quotient, v).unwrap();

    let mut sink = CollectingSink::new();
    let derivative = forward_ad(&mut arena, marker, 2, &mut sink).unwrap();

    // g is constant under d/dv, so (v/g)' collapses to 1/g.
    match *arena.kind(derivative) {
        Kind::Division { numerator, denominator } => {
            assert_eq!(arena.int_value(numerator), Some(1));
            assert_eq!(denominator, g);
        }
        ref other => panic!("expected 1/g, got {other:?}"),
    }
}

#[test]
fn bessel_zero_order_uses_the_first_order_function() {
    init_logging();
    let mut arena = ExprArena::new();
    let x0 = x_component(&mut arena, 0);
    let zero_order = arena.int(0);
    let j0 = arena.bessel(BesselFamily::J, zero_order, x0).unwrap();
    let marker = spatial_marker(&mut arena, j0, IndexTerm::Fixed(0), 2);

    let mut sink = CollectingSink::new();
    let derivative = forward_ad(&mut arena, marker, 2, &mut sink).unwrap();

    // -J1(x0), the chain factor being one.
    match arena.kind(derivative).clone() {
        Kind::Product { operands } => {
            assert_eq!(operands.len(), 2);
            assert_eq!(arena.int_value(operands[0]), Some(-1));
            match *arena.kind(operands[1]) {
                Kind::Bessel { family: BesselFamily::J, order, operand } => {
                    assert_eq!(arena.int_value(order), Some(1));
                    assert_eq!(operand, x0);
                }
                ref other => panic!("expected J1(x0), got {other:?}"),
            }
        }
        other => panic!("expected -J1(x0), got {other:?}"),
    }
}

#[test]
fn bessel_nonzero_order_uses_the_recurrence() {
    init_logging();
    let mut arena = ExprArena::new();
    let x0 = x_component(&mut arena, 0);
    let order = arena.int(3);
    let i3 = arena.bessel(BesselFamily::I, order, x0).unwrap();
    let marker = spatial_marker(&mut arena, i3, IndexTerm::Fixed(0), 2);

    let mut sink = CollectingSink::new();
    let derivative = forward_ad(&mut arena, marker, 2, &mut sink).unwrap();

    // 0.5 * (I2(x0) + I4(x0)).
    match arena.kind(derivative).clone() {
        Kind::Product { operands } => {
            let orders: Vec<_> = operands
                .iter()
                .filter_map(|&op| match arena.kind(op).clone() {
                    Kind::Sum { operands } => Some(
                        operands
                            .iter()
                            .map(|&t| match *arena.kind(t) {
                                Kind::Bessel { order, .. } => arena.int_value(order),
                                _ => None,
                            })
                            .collect::<Vec<_>>(),
                    ),
                    _ => None,
                })
                .flatten()
                .collect();
            assert_eq!(orders, vec![Some(2), Some(4)]);
        }
        other => panic!("expected the half-sum recurrence, got {other:?}"),
    }
}

#[test]
fn bessel_order_dependence_is_fatal() {
    init_logging();
    let mut arena = ExprArena::new();
    let inner = arena.coefficient(0, vec![]);
    let (v, _) = arena.new_variable(inner);
    let x = arena.coefficient(1, vec![]);
    let j_v = arena.bessel(BesselFamily::J, v, x).unwrap();
    let marker = arena.variable_derivative(j_v, v).unwrap();

    let mut sink = CollectingSink::new();
    let err = forward_ad(&mut arena, marker, 2, &mut sink).unwrap_err();
    assert!(matches!(err, AdError::BesselOrderDependence));
}

#[test]
fn restriction_commutes_and_skips_constants() {
    init_logging();
    let mut arena = ExprArena::new();

    // Constant derivative: restriction of the one is the one itself.
    let inner = arena.coefficient(0, vec![]);
    let (v, _) = arena.new_variable(inner);
    let restricted_v = arena.restricted(v, Side::Plus);
    let marker = arena.variable_derivative(restricted_v, v).unwrap();
    let mut sink = CollectingSink::new();
    let derivative = forward_ad(&mut arena, marker, 2, &mut sink).unwrap();
    assert_eq!(arena.int_value(derivative), Some(1));

    // Non-constant derivative: the same side is re-applied.
    let w0 = arena.coefficient(1, vec![]);
    let v0 = arena.argument(0, vec![]);
    let restricted_w = arena.restricted(w0, Side::Minus);
    let marker = arena
        .coefficient_derivative(restricted_w, vec![w0], vec![v0], DerivativeTable::new())
        .unwrap();
    let derivative = forward_ad(&mut arena, marker, 2, &mut sink).unwrap();
    match *arena.kind(derivative) {
        Kind::Restricted { operand, side } => {
            assert_eq!(operand, v0);
            assert_eq!(side, Side::Minus);
        }
        ref other => panic!("expected a restricted direction, got {other:?}"),
    }
}

#[test]
fn conditional_with_varying_condition_warns_and_keeps_the_condition() {
    init_logging();
    let mut arena = ExprArena::new();
    let x0 = x_component(&mut arena, 0);
    let x1 = x_component(&mut arena, 1);
    let less = arena.condition(CondOp::Lt, x0, x1).unwrap();
    let zero = arena.real(0.0);
    let chosen = arena.conditional(less, x0, zero).unwrap();
    let marker = spatial_marker(&mut arena, chosen, IndexTerm::Fixed(0), 2);

    let mut sink = CollectingSink::new();
    let derivative = forward_ad(&mut arena, marker, 2, &mut sink).unwrap();

    match *arena.kind(derivative) {
        Kind::Conditional { condition, on_true, .. } => {
            assert_eq!(condition, less);
            assert_eq!(arena.int_value(on_true), Some(1));
        }
        ref other => panic!("expected a conditional derivative, got {other:?}"),
    }
    assert_eq!(sink.warnings.len(), 1);
    assert!(sink.warnings[0].message.contains("condition"));
}

#[test]
fn conditional_with_constant_branches_is_zero_without_warning() {
    init_logging();
    let mut arena = ExprArena::new();
    let x0 = x_component(&mut arena, 0);
    let x1 = x_component(&mut arena, 1);
    let less = arena.condition(CondOp::Lt, x0, x1).unwrap();
    let w0 = arena.coefficient(0, vec![]);
    let w1 = arena.coefficient(1, vec![]);
    let chosen = arena.conditional(less, w0, w1).unwrap();

    // Under a variable derivative nothing in sight varies.
    let inner = arena.coefficient(2, vec![]);
    let (v, _) = arena.new_variable(inner);
    let marker = arena.variable_derivative(chosen, v).unwrap();

    let mut sink = CollectingSink::new();
    let derivative = forward_ad(&mut arena, marker, 2, &mut sink).unwrap();
    assert!(arena.is_zero(derivative));
    assert!(sink.warnings.is_empty());
}

#[test]
fn nested_spatial_derivative_commutes_inward() {
    init_logging();
    let mut arena = ExprArena::new();
    let w = arena.coefficient(0, vec![]);
    let inner = arena.spatial_derivative(w, IndexTerm::Fixed(0), 2).unwrap();
    let marker = spatial_marker(&mut arena, inner, IndexTerm::Fixed(1), 2);

    let mut sink = CollectingSink::new();
    let derivative = forward_ad(&mut arena, marker, 2, &mut sink).unwrap();

    // d/dx1 applied first, the surviving d/dx0 re-applied outside.
    match *arena.kind(derivative) {
        Kind::SpatialDerivative { operand, component: IndexTerm::Fixed(0) } => {
            match *arena.kind(operand) {
                Kind::SpatialDerivative { operand: field, component: IndexTerm::Fixed(1) } => {
                    assert_eq!(field, w);
                }
                ref other => panic!("expected the inner deferred derivative, got {other:?}"),
            }
        }
        ref other => panic!("expected a commuted spatial derivative, got {other:?}"),
    }
}

#[test]
fn nested_spatial_derivative_of_a_constant_inner_derivative_is_zero() {
    init_logging();
    let mut arena = ExprArena::new();
    let x0 = x_component(&mut arena, 0);
    let inner = arena.spatial_derivative(x0, IndexTerm::Fixed(0), 2).unwrap();
    let marker = spatial_marker(&mut arena, inner, IndexTerm::Fixed(1), 2);

    let mut sink = CollectingSink::new();
    let derivative = forward_ad(&mut arena, marker, 2, &mut sink).unwrap();
    // d x0/dx1 = 0 is spatially constant, so no marker is re-applied.
    assert!(arena.is_zero(derivative));
}

#[test]
fn compound_operators_demand_expansion() {
    init_logging();
    let mut arena = ExprArena::new();
    let a = arena.coefficient(0, vec![3]);
    let b = arena.coefficient(1, vec![3]);
    let crossed = arena.cross(a, b).unwrap();
    let marker = spatial_marker(&mut arena, crossed, IndexTerm::Fixed(0), 3);

    let mut sink = CollectingSink::new();
    let err = forward_ad(&mut arena, marker, 3, &mut sink).unwrap_err();
    match err {
        AdError::MissingRule { kind } => assert_eq!(kind, "cross product"),
        other => panic!("expected a missing rule, got {other}"),
    }
}

#[test]
fn unimplemented_compounds_stay_fatal_even_with_the_catalogue() {
    init_logging();
    let mut arena = ExprArena::new();
    let m = arena.coefficient(0, vec![2, 2]);
    let det = arena.determinant(m).unwrap();
    let marker = spatial_marker(&mut arena, det, IndexTerm::Fixed(0), 2);

    let options = AdOptions { compound_rules: true };
    let mut sink = CollectingSink::new();
    let err = forward_ad_with_options(&mut arena, marker, 2, options, &mut sink).unwrap_err();
    assert!(matches!(err, AdError::MissingRule { kind: "determinant" }));
}

#[test]
fn commuting_catalogue_handles_the_transpose() {
    init_logging();
    let mut arena = ExprArena::new();
    let w = arena.coefficient(0, vec![2, 2]);
    let d = arena.argument(0, vec![2, 2]);
    let transposed = arena.transposed(w).unwrap();
    let marker = arena
        .coefficient_derivative(transposed, vec![w], vec![d], DerivativeTable::new())
        .unwrap();

    let options = AdOptions { compound_rules: true };
    let mut sink = CollectingSink::new();
    let derivative = forward_ad_with_options(&mut arena, marker, 2, options, &mut sink).unwrap();
    match *arena.kind(derivative) {
        Kind::Transposed(operand) => assert_eq!(operand, d),
        ref other => panic!("expected the transposed direction, got {other:?}"),
    }
}

#[test]
fn driver_rejects_non_derivative_roots() {
    init_logging();
    let mut arena = ExprArena::new();
    let x = arena.spatial_coordinate(2);
    let mut sink = CollectingSink::new();
    let err = forward_ad(&mut arena, x, 2, &mut sink).unwrap_err();
    assert!(matches!(err, AdError::Internal(_)));
}

#[test]
fn derivative_runs_are_deterministic() {
    init_logging();
    let mut arena = ExprArena::new();
    let x0 = x_component(&mut arena, 0);
    let x1 = x_component(&mut arena, 1);
    let product = arena.product_of(vec![x0, x1]).unwrap();
    let sin = arena.math_fn(MathKind::Sin, product).unwrap();
    let marker = spatial_marker(&mut arena, sin, IndexTerm::Fixed(0), 2);

    let mut sink = CollectingSink::new();
    let first = forward_ad(&mut arena, marker, 2, &mut sink).unwrap();
    let second = forward_ad(&mut arena, marker, 2, &mut sink).unwrap();
    assert!(arena.expr_eq(first, second));
}

/// A derivative table must carry one entry per direction.
#[test]
fn mismatched_table_arity_is_fatal() {
    init_logging();
    let mut arena = ExprArena::new();
    let w0 = arena.coefficient(0, vec![]);
    let w1 = arena.coefficient(1, vec![]);
    let compound = arena.coefficient(2, vec![]);
    let v0 = arena.argument(0, vec![]);
    let v1 = arena.argument(1, vec![]);
    let partial = arena.coefficient(3, vec![]);
    let mut table = DerivativeTable::new();
    table.insert(compound, vec![partial]);
    let marker = arena
        .coefficient_derivative(compound, vec![w0, w1], vec![v0, v1], table)
        .unwrap();

    let mut sink = CollectingSink::new();
    let err = forward_ad(&mut arena, marker, 2, &mut sink).unwrap_err();
    assert!(matches!(err, AdError::DerivativeTableArity { expected: 2, found: 1 }));
}
