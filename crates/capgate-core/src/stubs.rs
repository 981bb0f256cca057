//! Grant-specific typed wrappers
//!
//! `capgate stubs --grant fs.read,net.fetch` prints a `Granted<'a>` wrapper
//! with one async method per granted operation, so code written against it
//! fails to compile when it reaches for something outside the grant. This is
//! a convenience only; enforcement stays in the authority and the broker.

use crate::permission::PermissionSet;
use std::collections::HashSet;
use std::fmt::Write as _;

/// Rust source for a wrapper exposing exactly `granted`
pub fn render_typed_wrapper(granted: &PermissionSet) -> String {
    let mut out = String::new();
    out.push_str("// Generated by `capgate stubs`. Do not edit.\n");
    let _ = writeln!(out, "// Grant: {}", granted);
    out.push_str("\nuse capgate_core::{CapabilityError, CapabilityObject};\n");
    out.push_str("use serde_json::Value;\n\n");
    out.push_str("pub struct Granted<'a> {\n    caps: &'a CapabilityObject,\n}\n\n");
    out.push_str("impl<'a> Granted<'a> {\n");
    out.push_str("    pub fn new(caps: &'a CapabilityObject) -> Self {\n        Self { caps }\n    }\n");

    let mut used = HashSet::new();
    used.insert("new".to_string());
    for id in granted {
        let Some((namespace, action)) = id.parts() else {
            continue;
        };
        let base = method_name(id.as_str());
        let mut name = base.clone();
        let mut n = 2;
        while !used.insert(name.clone()) {
            name = format!("{}_{}", base, n);
            n += 1;
        }
        let _ = write!(
            out,
            "\n    /// `{id}`\n    pub async fn {name}(&self, arguments: Value) -> Result<Value, CapabilityError> {{\n        self.caps.call({namespace:?}, {action:?}, arguments).await\n    }}\n",
        );
    }
    out.push_str("}\n");
    out
}

fn method_name(id: &str) -> String {
    let mut name: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    if name.starts_with(|c: char| c.is_ascii_digit()) {
        name.insert(0, '_');
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_method_per_granted_id() {
        let granted = PermissionSet::parse_list("fs.read,github.repos.get").unwrap();
        let source = render_typed_wrapper(&granted);
        assert!(source.contains("pub async fn fs_read("));
        assert!(source.contains("self.caps.call(\"fs\", \"read\", arguments)"));
        assert!(source.contains("pub async fn github_repos_get("));
        assert!(source.contains("self.caps.call(\"github\", \"repos.get\", arguments)"));
        assert!(!source.contains("fs_write"));
        syn::parse_file(&source).unwrap();
    }

    #[test]
    fn test_colliding_names_get_suffixes() {
        let granted = PermissionSet::parse_list("a.b_c,a_b.c,x.1").unwrap();
        let source = render_typed_wrapper(&granted);
        assert!(source.contains("fn a_b_c("));
        assert!(source.contains("fn a_b_c_2("));
        assert!(source.contains("fn x_1("));
        syn::parse_file(&source).unwrap();
    }

    #[test]
    fn test_empty_grant_still_parses() {
        let source = render_typed_wrapper(&PermissionSet::new());
        syn::parse_file(&source).unwrap();
    }
}
