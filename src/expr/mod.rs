//! Immutable, structurally shared expression DAG for tensor-valued forms.
//!
//! Nodes live in an [`ExprArena`] and are addressed by the `Copy` handle
//! [`ExprId`]. A node is never mutated after construction; rebuilding an
//! expression with unchanged operands yields the original handle, so handle
//! equality is identity equality and is the authoritative key for the
//! differentiation caches.

pub mod build;

use std::collections::BTreeMap;
use std::fmt;

/// Stable handle of an expression node inside one [`ExprArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExprId(u32);

/// Opaque identity of a symbolic tensor index.
///
/// Two indices are equal only if they are the same identity; the numeric id
/// is minted by the arena and carries no meaning beyond ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Index(u32);

/// Opaque identity of a labeled variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Label(u32);

/// One slot of a multi-index: either a fixed component or a free symbolic
/// index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexTerm {
    Fixed(usize),
    Free(Index),
}

/// Ordered sequence of index terms addressing one tensor component or slice.
pub type MultiIndex = Vec<IndexTerm>;

/// Side of an interior interface selected by a restriction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Plus,
    Minus,
}

/// Scalar math functions with a closed-form chain rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MathKind {
    Sqrt,
    Exp,
    Ln,
    Cos,
    Sin,
    Tan,
    Acos,
    Asin,
    Atan,
    Erf,
}

/// Bessel function families of integer order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BesselFamily {
    J,
    Y,
    I,
    K,
}

/// Comparison operators usable as conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CondOp {
    Eq,
    Ne,
    Le,
    Ge,
    Lt,
    Gt,
}

/// Caller-supplied partial derivatives of compound coefficients, keyed by
/// the coefficient node they differentiate. Each entry carries one
/// derivative expression per differentiation direction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DerivativeTable {
    entries: BTreeMap<ExprId, Vec<ExprId>>,
}

impl DerivativeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, coefficient: ExprId, derivatives: Vec<ExprId>) {
        self.entries.insert(coefficient, derivatives);
    }

    pub fn get(&self, coefficient: ExprId) -> Option<&[ExprId]> {
        self.entries.get(&coefficient).map(Vec::as_slice)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The closed set of expression node kinds.
///
/// Child expressions are stored as [`ExprId`] handles; multi-indices are
/// inline payloads rather than child nodes, so "reconstruct with unchanged
/// operands" degenerates to handle comparison.
#[derive(Debug, Clone, PartialEq)]
pub enum Kind {
    // Terminals.
    IntValue(i64),
    RealValue(f64),
    Zero,
    Identity(usize),
    SpatialCoordinate,
    FacetNormal,
    Argument { number: usize },
    Coefficient { number: usize },

    // Label wrapper.
    Variable { expr: ExprId, label: Label },

    // Indexing and component handling.
    Indexed { base: ExprId, indices: MultiIndex },
    ComponentTensor { scalar: ExprId, indices: Vec<Index> },
    ListTensor { components: Vec<ExprId> },
    IndexSum { summand: ExprId, index: Index },

    // Scalar algebra.
    Sum { operands: Vec<ExprId> },
    Product { operands: Vec<ExprId> },
    Division { numerator: ExprId, denominator: ExprId },
    Power { base: ExprId, exponent: ExprId },
    Abs { operand: ExprId },

    // Transcendental functions.
    MathFn { kind: MathKind, operand: ExprId },
    Bessel { family: BesselFamily, order: ExprId, operand: ExprId },

    // Interface restriction.
    Restricted { operand: ExprId, side: Side },

    // Conditions and conditional selection.
    Condition { op: CondOp, lhs: ExprId, rhs: ExprId },
    NotCondition { operand: ExprId },
    Conditional { condition: ExprId, on_true: ExprId, on_false: ExprId },

    // Compound tensor operators. The differentiation engine has no active
    // rule for any of these; the upstream expansion pass must eliminate
    // them first (see autodiff::rules for the pending catalogues).
    Transposed(ExprId),
    Trace(ExprId),
    Deviatoric(ExprId),
    Divergence(ExprId),
    Curl(ExprId),
    Gradient { operand: ExprId, dim: usize },
    Outer(ExprId, ExprId),
    Inner(ExprId, ExprId),
    Dot(ExprId, ExprId),
    Cross(ExprId, ExprId),
    Determinant(ExprId),
    Cofactor(ExprId),
    Inverse(ExprId),

    // Unresolved derivative markers consumed by the driver.
    SpatialDerivative { operand: ExprId, component: IndexTerm },
    VariableDerivative { operand: ExprId, var: ExprId },
    CoefficientDerivative {
        operand: ExprId,
        coefficients: Vec<ExprId>,
        directions: Vec<ExprId>,
        table: DerivativeTable,
    },
}

/// Short kind tag for diagnostics and rule-gap errors.
pub fn kind_name(kind: &Kind) -> &'static str {
    match kind {
        Kind::IntValue(_) => "integer value",
        Kind::RealValue(_) => "real value",
        Kind::Zero => "zero",
        Kind::Identity(_) => "identity",
        Kind::SpatialCoordinate => "spatial coordinate",
        Kind::FacetNormal => "facet normal",
        Kind::Argument { .. } => "argument",
        Kind::Coefficient { .. } => "coefficient",
        Kind::Variable { .. } => "variable",
        Kind::Indexed { .. } => "indexed",
        Kind::ComponentTensor { .. } => "component tensor",
        Kind::ListTensor { .. } => "list tensor",
        Kind::IndexSum { .. } => "index sum",
        Kind::Sum { .. } => "sum",
        Kind::Product { .. } => "product",
        Kind::Division { .. } => "division",
        Kind::Power { .. } => "power",
        Kind::Abs { .. } => "abs",
        Kind::MathFn { .. } => "math function",
        Kind::Bessel { .. } => "bessel function",
        Kind::Restricted { .. } => "restriction",
        Kind::Condition { .. } => "condition",
        Kind::NotCondition { .. } => "condition negation",
        Kind::Conditional { .. } => "conditional",
        Kind::Transposed(_) => "transposed",
        Kind::Trace(_) => "trace",
        Kind::Deviatoric(_) => "deviatoric",
        Kind::Divergence(_) => "divergence",
        Kind::Curl(_) => "curl",
        Kind::Gradient { .. } => "gradient",
        Kind::Outer(..) => "outer product",
        Kind::Inner(..) => "inner product",
        Kind::Dot(..) => "dot product",
        Kind::Cross(..) => "cross product",
        Kind::Determinant(_) => "determinant",
        Kind::Cofactor(_) => "cofactor",
        Kind::Inverse(_) => "inverse",
        Kind::SpatialDerivative { .. } => "spatial derivative",
        Kind::VariableDerivative { .. } => "variable derivative",
        Kind::CoefficientDerivative { .. } => "coefficient derivative",
    }
}

/// Error raised by expression constructors when a shape or index
/// precondition does not hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExprError {
    RankMismatch { expected: usize, found: usize },
    ComponentOutOfRange { component: usize, extent: usize },
    ShapeMismatch { lhs: Vec<usize>, rhs: Vec<usize> },
    FreeIndexMismatch,
    ExpectedScalar { shape: Vec<usize> },
    ExpectedTrueScalar,
    IndexDimensionConflict { expected: usize, found: usize },
    UnboundIndex,
    DuplicateIndex,
    EmptyOperands,
    DivisionByZero,
    ExpectedSquare { shape: Vec<usize> },
    ExpectedVariable,
    ExpectedCondition,
    ExpectedCoefficient,
    ArityMismatch { expected: usize, found: usize },
}

impl fmt::Display for ExprError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExprError::RankMismatch { expected, found } => {
                write!(f, "expected rank {expected} but found {found}")
            }
            ExprError::ComponentOutOfRange { component, extent } => {
                write!(f, "component {component} out of range for extent {extent}")
            }
            ExprError::ShapeMismatch { lhs, rhs } => {
                write!(f, "shape mismatch: {lhs:?} vs {rhs:?}")
            }
            ExprError::FreeIndexMismatch => {
                write!(f, "operands carry different free index sets")
            }
            ExprError::ExpectedScalar { shape } => {
                write!(f, "expected a scalar expression, found shape {shape:?}")
            }
            ExprError::ExpectedTrueScalar => {
                write!(f, "expected a scalar expression without free indices")
            }
            ExprError::IndexDimensionConflict { expected, found } => {
                write!(f, "index bound to dimension {expected} reused with {found}")
            }
            ExprError::UnboundIndex => {
                write!(f, "index is not free in the operand")
            }
            ExprError::DuplicateIndex => {
                write!(f, "duplicate index in binding construct")
            }
            ExprError::EmptyOperands => write!(f, "operand list must be non-empty"),
            ExprError::DivisionByZero => write!(f, "division by a zero denominator"),
            ExprError::ExpectedSquare { shape } => {
                write!(f, "expected a square matrix, found shape {shape:?}")
            }
            ExprError::ExpectedVariable => {
                write!(f, "expected a variable node")
            }
            ExprError::ExpectedCondition => {
                write!(f, "expected a condition node")
            }
            ExprError::ExpectedCoefficient => {
                write!(f, "expected a coefficient node")
            }
            ExprError::ArityMismatch { expected, found } => {
                write!(f, "expected {expected} operands but found {found}")
            }
        }
    }
}

impl std::error::Error for ExprError {}

#[derive(Debug, Clone)]
struct Node {
    kind: Kind,
    shape: Vec<usize>,
    free: Vec<Index>,
    dims: BTreeMap<Index, usize>,
}

/// Arena owning every expression node of one DAG, plus the counters that
/// mint fresh index and label identities. There is no global state; separate
/// arenas are fully independent.
#[derive(Debug, Default)]
pub struct ExprArena {
    nodes: Vec<Node>,
    next_index: u32,
    next_label: u32,
}

impl ExprArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn node(&self, id: ExprId) -> &Node {
        &self.nodes[id.0 as usize]
    }

    pub(crate) fn push(&mut self, kind: Kind, shape: Vec<usize>, free: Vec<Index>, dims: BTreeMap<Index, usize>) -> ExprId {
        debug_assert!(free.windows(2).all(|w| w[0] < w[1]), "free indices must be sorted and unique");
        debug_assert!(free.iter().all(|i| dims.contains_key(i)), "every free index needs a dimension");
        let id = ExprId(self.nodes.len() as u32);
        self.nodes.push(Node { kind, shape, free, dims });
        id
    }

    // --- Queries -------------------------------------------------------

    pub fn kind(&self, id: ExprId) -> &Kind {
        &self.node(id).kind
    }

    pub fn shape(&self, id: ExprId) -> &[usize] {
        &self.node(id).shape
    }

    pub fn rank(&self, id: ExprId) -> usize {
        self.node(id).shape.len()
    }

    /// Free (unbound) symbolic indices, sorted by identity.
    pub fn free_indices(&self, id: ExprId) -> &[Index] {
        &self.node(id).free
    }

    /// Dimension of every free index of the node.
    pub fn index_dimensions(&self, id: ExprId) -> &BTreeMap<Index, usize> {
        &self.node(id).dims
    }

    pub fn is_zero(&self, id: ExprId) -> bool {
        matches!(self.node(id).kind, Kind::Zero)
    }

    /// Scalar shape; free indices allowed.
    pub fn is_scalar(&self, id: ExprId) -> bool {
        self.node(id).shape.is_empty()
    }

    /// Scalar shape and no free indices.
    pub fn is_true_scalar(&self, id: ExprId) -> bool {
        let n = self.node(id);
        n.shape.is_empty() && n.free.is_empty()
    }

    /// Constant-valued terminal (zero, literal, identity).
    pub fn is_constant_value(&self, id: ExprId) -> bool {
        matches!(
            self.node(id).kind,
            Kind::Zero | Kind::IntValue(_) | Kind::RealValue(_) | Kind::Identity(_)
        )
    }

    /// Integer payload of a literal, if the node is one without free indices.
    pub fn int_value(&self, id: ExprId) -> Option<i64> {
        match self.node(id).kind {
            Kind::IntValue(v) if self.node(id).free.is_empty() => Some(v),
            _ => None,
        }
    }

    // --- Identity minting ---------------------------------------------

    pub fn fresh_index(&mut self) -> Index {
        let i = Index(self.next_index);
        self.next_index += 1;
        i
    }

    pub fn fresh_indices(&mut self, count: usize) -> Vec<Index> {
        (0..count).map(|_| self.fresh_index()).collect()
    }

    pub fn fresh_label(&mut self) -> Label {
        let l = Label(self.next_label);
        self.next_label += 1;
        l
    }

    // --- Traversal helpers --------------------------------------------

    /// Child expression handles of a node, in operand order.
    pub fn children(&self, id: ExprId) -> Vec<ExprId> {
        match &self.node(id).kind {
            Kind::IntValue(_)
            | Kind::RealValue(_)
            | Kind::Zero
            | Kind::Identity(_)
            | Kind::SpatialCoordinate
            | Kind::FacetNormal
            | Kind::Argument { .. }
            | Kind::Coefficient { .. } => Vec::new(),
            Kind::Variable { expr, .. } => vec![*expr],
            Kind::Indexed { base, .. } => vec![*base],
            Kind::ComponentTensor { scalar, .. } => vec![*scalar],
            Kind::ListTensor { components } => components.clone(),
            Kind::IndexSum { summand, .. } => vec![*summand],
            Kind::Sum { operands } | Kind::Product { operands } => operands.clone(),
            Kind::Division { numerator, denominator } => vec![*numerator, *denominator],
            Kind::Power { base, exponent } => vec![*base, *exponent],
            Kind::Abs { operand } => vec![*operand],
            Kind::MathFn { operand, .. } => vec![*operand],
            Kind::Bessel { order, operand, .. } => vec![*order, *operand],
            Kind::Restricted { operand, .. } => vec![*operand],
            Kind::Condition { lhs, rhs, .. } => vec![*lhs, *rhs],
            Kind::NotCondition { operand } => vec![*operand],
            Kind::Conditional { condition, on_true, on_false } => {
                vec![*condition, *on_true, *on_false]
            }
            Kind::Transposed(a)
            | Kind::Trace(a)
            | Kind::Deviatoric(a)
            | Kind::Divergence(a)
            | Kind::Curl(a)
            | Kind::Gradient { operand: a, .. }
            | Kind::Determinant(a)
            | Kind::Cofactor(a)
            | Kind::Inverse(a) => vec![*a],
            Kind::Outer(a, b) | Kind::Inner(a, b) | Kind::Dot(a, b) | Kind::Cross(a, b) => {
                vec![*a, *b]
            }
            Kind::SpatialDerivative { operand, .. } => vec![*operand],
            Kind::VariableDerivative { operand, var } => vec![*operand, *var],
            Kind::CoefficientDerivative { operand, coefficients, directions, .. } => {
                let mut c = vec![*operand];
                c.extend(coefficients.iter().copied());
                c.extend(directions.iter().copied());
                c
            }
        }
    }

    /// True when nothing beneath the node varies in space: no spatial
    /// coordinate, facet normal, argument, coefficient, or spatial
    /// derivative occurs in the sub-DAG.
    pub fn is_spatially_constant(&self, id: ExprId) -> bool {
        match self.node(id).kind {
            Kind::SpatialCoordinate
            | Kind::FacetNormal
            | Kind::Argument { .. }
            | Kind::Coefficient { .. }
            | Kind::SpatialDerivative { .. } => false,
            _ => self
                .children(id)
                .into_iter()
                .all(|c| self.is_spatially_constant(c)),
        }
    }

    /// Structural equality. Child handles are compared recursively; index
    /// and label identities are compared as identities. Handle equality is
    /// a fast path since nodes are immutable.
    pub fn expr_eq(&self, a: ExprId, b: ExprId) -> bool {
        if a == b {
            return true;
        }
        let (na, nb) = (self.node(a), self.node(b));
        if na.shape != nb.shape || na.free != nb.free {
            return false;
        }
        let heads_match = match (&na.kind, &nb.kind) {
            (Kind::IntValue(x), Kind::IntValue(y)) => x == y,
            (Kind::RealValue(x), Kind::RealValue(y)) => x == y,
            (Kind::Zero, Kind::Zero) => true,
            (Kind::Identity(x), Kind::Identity(y)) => x == y,
            (Kind::SpatialCoordinate, Kind::SpatialCoordinate) => true,
            (Kind::FacetNormal, Kind::FacetNormal) => true,
            (Kind::Argument { number: x }, Kind::Argument { number: y }) => x == y,
            (Kind::Coefficient { number: x }, Kind::Coefficient { number: y }) => x == y,
            (Kind::Variable { label: x, .. }, Kind::Variable { label: y, .. }) => x == y,
            (Kind::Indexed { indices: x, .. }, Kind::Indexed { indices: y, .. }) => x == y,
            (Kind::ComponentTensor { indices: x, .. }, Kind::ComponentTensor { indices: y, .. }) => {
                x == y
            }
            (Kind::ListTensor { .. }, Kind::ListTensor { .. }) => true,
            (Kind::IndexSum { index: x, .. }, Kind::IndexSum { index: y, .. }) => x == y,
            (Kind::Sum { .. }, Kind::Sum { .. }) => true,
            (Kind::Product { .. }, Kind::Product { .. }) => true,
            (Kind::Division { .. }, Kind::Division { .. }) => true,
            (Kind::Power { .. }, Kind::Power { .. }) => true,
            (Kind::Abs { .. }, Kind::Abs { .. }) => true,
            (Kind::MathFn { kind: x, .. }, Kind::MathFn { kind: y, .. }) => x == y,
            (Kind::Bessel { family: x, .. }, Kind::Bessel { family: y, .. }) => x == y,
            (Kind::Restricted { side: x, .. }, Kind::Restricted { side: y, .. }) => x == y,
            (Kind::Condition { op: x, .. }, Kind::Condition { op: y, .. }) => x == y,
            (Kind::NotCondition { .. }, Kind::NotCondition { .. }) => true,
            (Kind::Conditional { .. }, Kind::Conditional { .. }) => true,
            (Kind::Transposed(_), Kind::Transposed(_)) => true,
            (Kind::Trace(_), Kind::Trace(_)) => true,
            (Kind::Deviatoric(_), Kind::Deviatoric(_)) => true,
            (Kind::Divergence(_), Kind::Divergence(_)) => true,
            (Kind::Curl(_), Kind::Curl(_)) => true,
            (Kind::Gradient { dim: x, .. }, Kind::Gradient { dim: y, .. }) => x == y,
            (Kind::Outer(..), Kind::Outer(..)) => true,
            (Kind::Inner(..), Kind::Inner(..)) => true,
            (Kind::Dot(..), Kind::Dot(..)) => true,
            (Kind::Cross(..), Kind::Cross(..)) => true,
            (Kind::Determinant(_), Kind::Determinant(_)) => true,
            (Kind::Cofactor(_), Kind::Cofactor(_)) => true,
            (Kind::Inverse(_), Kind::Inverse(_)) => true,
            (
                Kind::SpatialDerivative { component: x, .. },
                Kind::SpatialDerivative { component: y, .. },
            ) => x == y,
            (Kind::VariableDerivative { .. }, Kind::VariableDerivative { .. }) => true,
            (
                Kind::CoefficientDerivative { table: x, .. },
                Kind::CoefficientDerivative { table: y, .. },
            ) => x == y,
            _ => false,
        };
        if !heads_match {
            return false;
        }
        let (ca, cb) = (self.children(a), self.children(b));
        ca.len() == cb.len() && ca.iter().zip(cb.iter()).all(|(&x, &y)| self.expr_eq(x, y))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_indices_are_distinct_identities() {
        let mut arena = ExprArena::new();
        let i = arena.fresh_index();
        let j = arena.fresh_index();
        assert_ne!(i, j);
    }

    #[test]
    fn arenas_mint_independent_identities() {
        let mut a = ExprArena::new();
        let mut b = ExprArena::new();
        // Identities from different arenas compare equal numerically but the
        // arenas never exchange nodes, so this is not observable in practice.
        assert_eq!(a.fresh_index(), b.fresh_index());
    }

    #[test]
    fn structural_equality_crosses_handles() {
        let mut arena = ExprArena::new();
        let x = arena.spatial_coordinate(2);
        let y = arena.spatial_coordinate(2);
        assert_ne!(x, y);
        assert!(arena.expr_eq(x, y));
    }

    #[test]
    fn spatially_constant_detects_coordinates() {
        let mut arena = ExprArena::new();
        let x = arena.spatial_coordinate(2);
        let c = arena.int(3);
        assert!(!arena.is_spatially_constant(x));
        assert!(arena.is_spatially_constant(c));
    }
}
