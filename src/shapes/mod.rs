// Copyright 2025 STARGA Inc.
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at:
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Shared free-index helpers for the differentiation engine.

use std::collections::BTreeMap;

use crate::expr::{ExprArena, ExprError, ExprId, Index, IndexTerm};

/// Merge two index sets without duplication, sorted by identity.
pub fn merge_unique(a: &[Index], b: &[Index]) -> Vec<Index> {
    let mut out = a.to_vec();
    out.extend_from_slice(b);
    out.sort_unstable();
    out.dedup();
    out
}

/// Restrict an index-dimension map to exactly the given free set.
pub fn dims_for(dims: &BTreeMap<Index, usize>, free: &[Index]) -> BTreeMap<Index, usize> {
    free.iter().filter_map(|i| dims.get(i).map(|&d| (*i, d))).collect()
}

/// Convert a tensor-valued expression into a scalar indexed by fresh
/// trailing indices. A scalar expression passes through with no indices.
pub fn as_scalar(arena: &mut ExprArena, e: ExprId) -> Result<(ExprId, Vec<Index>), ExprError> {
    let rank = arena.rank(e);
    if rank == 0 {
        return Ok((e, Vec::new()));
    }
    let indices = arena.fresh_indices(rank);
    let terms = indices.iter().copied().map(IndexTerm::Free).collect();
    let scalar = arena.indexed(e, terms)?;
    Ok((scalar, indices))
}

/// Bind explicit indices of a scalar expression back into tensor axes.
/// The inverse of [`as_scalar`]; an empty index list is the identity.
pub fn as_tensor(arena: &mut ExprArena, e: ExprId, indices: &[Index]) -> Result<ExprId, ExprError> {
    if indices.is_empty() {
        Ok(e)
    } else {
        arena.component_tensor(e, indices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_unique_drops_duplicates() {
        let mut arena = ExprArena::new();
        let i = arena.fresh_index();
        let j = arena.fresh_index();
        let merged = merge_unique(&[i, j], &[j, i]);
        assert_eq!(merged, vec![i, j]);
    }

    #[test]
    fn as_scalar_on_scalar_is_identity() {
        let mut arena = ExprArena::new();
        let x = arena.coefficient(0, vec![]);
        let (s, ii) = as_scalar(&mut arena, x).unwrap();
        assert_eq!(s, x);
        assert!(ii.is_empty());
    }

    #[test]
    fn as_scalar_then_as_tensor_restores_the_tensor() {
        let mut arena = ExprArena::new();
        let u = arena.coefficient(0, vec![2, 3]);
        let (s, ii) = as_scalar(&mut arena, u).unwrap();
        assert_eq!(ii.len(), 2);
        assert!(arena.is_scalar(s));
        let back = as_tensor(&mut arena, s, &ii).unwrap();
        assert_eq!(back, u);
        assert_eq!(arena.shape(back), &[2, 3]);
    }

    #[test]
    fn dims_for_subsets_to_free() {
        let mut arena = ExprArena::new();
        let i = arena.fresh_index();
        let j = arena.fresh_index();
        let dims: BTreeMap<Index, usize> = [(i, 2), (j, 3)].into_iter().collect();
        let restricted = dims_for(&dims, &[j]);
        assert_eq!(restricted.len(), 1);
        assert_eq!(restricted[&j], 3);
    }
}
