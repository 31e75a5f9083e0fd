// Parameter merging for a single step.

use std::collections::BTreeMap;

use worker_common::constants::BUILD_VARIABLE_PREFIX;

use crate::model::Parameter;

/// Merge the three parameter sources of a step into one flat map.
///
/// Later sources overwrite earlier ones on key collision:
/// 1. the action's declared parameters,
/// 2. invocation-time overrides,
/// 3. job build variables, re-keyed under [`BUILD_VARIABLE_PREFIX`].
///
/// Duplicate keys are expected and resolved by this order; nothing is dropped.
pub fn merge_parameters(
    declared: &[Parameter],
    overrides: &[Parameter],
    build_variables: &[Parameter],
) -> BTreeMap<String, String> {
    let mut merged = BTreeMap::new();
    for p in declared.iter().chain(overrides) {
        merged.insert(p.name.clone(), p.value.clone());
    }
    for v in build_variables {
        merged.insert(format!("{BUILD_VARIABLE_PREFIX}{}", v.name), v.value.clone());
    }
    merged
}
