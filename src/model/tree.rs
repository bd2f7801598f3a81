//! Hierarchical parameter namespace keyed by dotted tensor names.

use super::tensor::{DenseTensor, Parameter};
use crate::utils::{is_within, param_key, split_param_key};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterTree {
    params: BTreeMap<String, Parameter>,
}

impl ParameterTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, param: Parameter) -> Option<Parameter> {
        self.params.insert(key.into(), param)
    }

    pub fn insert_dense(
        &mut self,
        key: impl Into<String>,
        tensor: DenseTensor,
    ) -> Option<Parameter> {
        self.insert(key, Parameter::Dense(tensor))
    }

    pub fn get(&self, key: &str) -> Option<&Parameter> {
        self.params.get(key)
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Parameter)> {
        self.params.iter()
    }

    pub fn weight(&self, module: &str) -> Option<&Parameter> {
        self.params.get(&param_key(module, "weight"))
    }

    /// Every module that owns at least one tensor.
    pub fn modules(&self) -> BTreeSet<&str> {
        self.params.keys().map(|k| split_param_key(k).0).collect()
    }

    pub fn has_module(&self, module: &str) -> bool {
        self.params.keys().any(|k| split_param_key(k).0 == module)
    }

    /// True when `name` is a module or an ancestor of one.
    pub fn covers(&self, name: &str) -> bool {
        self.params
            .keys()
            .any(|k| is_within(split_param_key(k).0, name))
    }

    /// Groups tensors by owning module, consuming the tree.
    pub fn into_modules(self) -> BTreeMap<String, Vec<(String, Parameter)>> {
        let mut out: BTreeMap<String, Vec<(String, Parameter)>> = BTreeMap::new();
        for (key, param) in self.params {
            let (module, leaf) = split_param_key(&key);
            let (module, leaf) = (module.to_string(), leaf.to_string());
            out.entry(module).or_default().push((leaf, param));
        }
        out
    }

    pub fn size_in_bytes(&self) -> usize {
        self.params.values().map(Parameter::size_in_bytes).sum()
    }
}

impl FromIterator<(String, Parameter)> for ParameterTree {
    fn from_iter<I: IntoIterator<Item = (String, Parameter)>>(iter: I) -> Self {
        Self {
            params: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for ParameterTree {
    type Item = (String, Parameter);
    type IntoIter = std::collections::btree_map::IntoIter<String, Parameter>;

    fn into_iter(self) -> Self::IntoIter {
        self.params.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::FloatDtype;

    fn tiny_tree() -> ParameterTree {
        let mut tree = ParameterTree::new();
        for key in ["blocks.0.attn.weight", "blocks.0.attn.bias", "proj_out.weight", "scale"] {
            let t = DenseTensor::from_f32(&[0.0; 4], vec![2, 2], FloatDtype::F32).unwrap();
            tree.insert_dense(key, t);
        }
        tree
    }

    #[test]
    fn test_modules_are_key_parents() {
        let tree = tiny_tree();
        let modules: Vec<_> = tree.modules().into_iter().collect();
        assert_eq!(modules, vec!["", "blocks.0.attn", "proj_out"]);
        assert!(tree.has_module("proj_out"));
        assert!(!tree.has_module("blocks.0"));
    }

    #[test]
    fn test_covers_ancestors() {
        let tree = tiny_tree();
        assert!(tree.covers("blocks.0"));
        assert!(tree.covers("proj_out"));
        assert!(!tree.covers("proj_in"));
        assert!(!tree.covers("blocks.1"));
    }

    #[test]
    fn test_into_modules_groups_leaves() {
        let grouped = tiny_tree().into_modules();
        let attn: Vec<_> = grouped["blocks.0.attn"].iter().map(|(l, _)| l.as_str()).collect();
        assert_eq!(attn, vec!["bias", "weight"]);
        assert_eq!(grouped[""].len(), 1);
    }
}
