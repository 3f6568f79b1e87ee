//! Command line argument assembly for control plane components.
//!
//! Components are launched with a base set of arguments owned by the OS;
//! user-supplied extra arguments merge in under per-key policies so that
//! security-sensitive flags cannot be overridden.

use std::collections::BTreeMap;

use thiserror::Error;

/// Merge behavior for a user-supplied argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergePolicy {
    /// User value replaces the base value.
    #[default]
    Replace,

    /// User value is appended to the base value, comma-separated.
    Additive,

    /// The argument cannot be supplied by the user.
    Denied,
}

/// Argument merge errors.
#[derive(Debug, Error)]
pub enum ArgsError {
    /// A denied argument was supplied.
    #[error("extra arg {0:?} is not allowed to be overridden")]
    Denied(String),
}

/// Ordered argument builder with merge policies.
#[derive(Debug, Clone, Default)]
pub struct ArgsBuilder {
    args: BTreeMap<String, String>,
    policies: BTreeMap<String, MergePolicy>,
}

impl ArgsBuilder {
    /// Start from a base argument set.
    pub fn new<K: Into<String>, V: Into<String>>(base: impl IntoIterator<Item = (K, V)>) -> Self {
        Self {
            args: base
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            policies: BTreeMap::new(),
        }
    }

    /// Set a single argument.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.args.insert(key.into(), value.into());
        self
    }

    /// Declare a merge policy for a key.
    pub fn policy(&mut self, key: impl Into<String>, policy: MergePolicy) -> &mut Self {
        self.policies.insert(key.into(), policy);
        self
    }

    /// Merge user-supplied extra arguments under the declared policies.
    pub fn merge<K: Into<String>, V: Into<String>>(
        &mut self,
        extra: impl IntoIterator<Item = (K, V)>,
    ) -> Result<&mut Self, ArgsError> {
        for (key, value) in extra {
            let key = key.into();
            let value = value.into();

            match self.policies.get(&key).copied().unwrap_or_default() {
                MergePolicy::Denied => return Err(ArgsError::Denied(key)),
                MergePolicy::Additive => {
                    self.args
                        .entry(key)
                        .and_modify(|existing| {
                            existing.push(',');
                            existing.push_str(&value);
                        })
                        .or_insert(value);
                }
                MergePolicy::Replace => {
                    self.args.insert(key, value);
                }
            }
        }

        Ok(self)
    }

    /// Render as `--key=value` arguments, sorted by key.
    pub fn build(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|(k, v)| format!("--{k}={v}"))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_replace_default() {
        let mut builder = ArgsBuilder::new([("bind-address", "0.0.0.0")]);
        builder.merge([("bind-address", "127.0.0.1")]).unwrap();

        assert_eq!(builder.build(), vec!["--bind-address=127.0.0.1"]);
    }

    #[test]
    fn test_merge_additive() {
        let mut builder = ArgsBuilder::new([("enable-admission-plugins", "NodeRestriction")]);
        builder.policy("enable-admission-plugins", MergePolicy::Additive);
        builder
            .merge([("enable-admission-plugins", "PodSecurity")])
            .unwrap();

        assert_eq!(
            builder.build(),
            vec!["--enable-admission-plugins=NodeRestriction,PodSecurity"]
        );
    }

    #[test]
    fn test_merge_denied() {
        let mut builder = ArgsBuilder::new([("etcd-servers", "https://localhost:2379")]);
        builder.policy("etcd-servers", MergePolicy::Denied);

        assert!(builder.merge([("etcd-servers", "https://evil:2379")]).is_err());
    }

    #[test]
    fn test_build_sorted() {
        let builder = ArgsBuilder::new([("b", "2"), ("a", "1"), ("c", "3")]);

        assert_eq!(builder.build(), vec!["--a=1", "--b=2", "--c=3"]);
    }
}
