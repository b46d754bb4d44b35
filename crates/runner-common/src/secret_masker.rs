// SecretMasker: replaces registered secret values with `***` in any text
// that leaves the worker (step logs, issues, traces).

use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Replacement text used when a secret is found.
pub const MASK: &str = "***";

/// Shared, thread-safe set of secrets. Clones share the same set.
#[derive(Debug, Clone, Default)]
pub struct SecretMasker {
    secrets: Arc<RwLock<BTreeSet<String>>>,
}

impl SecretMasker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a secret. Blank values are ignored.
    pub fn add_value(&self, secret: &str) {
        if secret.trim().is_empty() {
            return;
        }
        self.secrets.write().insert(secret.to_string());
    }

    pub fn secret_count(&self) -> usize {
        self.secrets.read().len()
    }

    /// Replace every occurrence of every secret with `***`.
    ///
    /// Overlapping or adjacent occurrences collapse into a single mask.
    pub fn mask_secrets(&self, input: &str) -> String {
        let secrets = self.secrets.read();
        if secrets.is_empty() || input.is_empty() {
            return input.to_string();
        }

        let mut ranges: Vec<(usize, usize)> = Vec::new();
        for secret in secrets.iter() {
            let mut offset = 0;
            while let Some(pos) = input[offset..].find(secret.as_str()) {
                let start = offset + pos;
                ranges.push((start, start + secret.len()));
                // Advance by one char so overlapping occurrences are found too.
                let step = input[start..].chars().next().map_or(1, char::len_utf8);
                offset = start + step;
            }
        }
        if ranges.is_empty() {
            return input.to_string();
        }

        ranges.sort_unstable();
        let mut merged: Vec<(usize, usize)> = Vec::with_capacity(ranges.len());
        for (start, end) in ranges {
            match merged.last_mut() {
                Some(last) if start <= last.1 => last.1 = last.1.max(end),
                _ => merged.push((start, end)),
            }
        }

        let mut out = String::with_capacity(input.len());
        let mut cursor = 0;
        for (start, end) in merged {
            out.push_str(&input[cursor..start]);
            out.push_str(MASK);
            cursor = end;
        }
        out.push_str(&input[cursor..]);
        out
    }
}
