/*
Copyright 2025 Connor Nolan

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use std::collections::HashMap;

use crate::deferred::Deferred;

/// Which labels defined from here on are visible to sibling files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExternPolicy {
    All,
    None,
    List(Vec<String>),
}

// One flat table with fully-qualified string keys: global labels under
// their bare name, file-locals under "{file}:{name}". Integer sub-labels
// and .REPEAT iterations extend the name with ": "-separated suffixes.
#[derive(Debug, Default)]
pub struct SymbolTable {
    labels: HashMap<String, Deferred>,
}

impl SymbolTable {
    pub fn new() -> SymbolTable {
        SymbolTable::default()
    }

    pub fn local_key(file_id: &str, name: &str) -> String {
        format!("{file_id}:{name}")
    }

    pub fn get(&self, key: &str) -> Option<&Deferred> {
        self.labels.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.labels.contains_key(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Deferred) {
        self.labels.insert(key.into(), value);
    }

    /// Finds a file that already defines `name` as a local label and
    /// returns that file id. Used by the extern collision checks.
    pub fn local_owner(&self, name: &str) -> Option<&str> {
        let suffix = format!(":{name}");
        self.labels
            .keys()
            .find(|key| key.ends_with(&suffix))
            .and_then(|key| key.rsplit_once(':'))
            .map(|(file, _)| file)
    }

    /// All keys in sorted order, for deterministic resolution and listing.
    pub fn sorted_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.labels.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_key_format() {
        assert_eq!(SymbolTable::local_key("a.mac", "X"), "a.mac:X");
    }

    #[test]
    fn test_local_owner() {
        let mut table = SymbolTable::new();
        table.insert("lib.mac:K", Deferred::int(1));
        assert_eq!(table.local_owner("K"), Some("lib.mac"));
        assert_eq!(table.local_owner("M"), None);
    }
}
