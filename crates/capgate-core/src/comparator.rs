//! Declared-vs-granted permission check
//!
//! `allowed` is exactly `declared ⊆ granted`. Permissions granted but never
//! declared are reported as `extra` for the operator's benefit; they are not a
//! failure.

use crate::permission::{PermissionId, PermissionSet};
use serde::Serialize;
use std::fmt::Write as _;

/// Outcome of comparing a declared set with a grant
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PermissionCheck {
    pub allowed: bool,
    /// declared ∖ granted
    pub missing: Vec<PermissionId>,
    /// granted ∖ declared
    pub extra: Vec<PermissionId>,
    pub summary: String,
    pub detail: String,
    /// declared ∪ granted, only when the check failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_grant: Option<Vec<PermissionId>>,
}

impl PermissionCheck {
    /// The suggested grant as a ready-to-paste `--grant` value
    pub fn suggested_grant_arg(&self) -> Option<String> {
        self.suggested_grant.as_ref().map(|ids| {
            ids.iter()
                .map(PermissionId::as_str)
                .collect::<Vec<_>>()
                .join(",")
        })
    }
}

/// Compare what a source unit declares against what the operator granted
pub fn check(declared: &PermissionSet, granted: &PermissionSet) -> PermissionCheck {
    let missing = declared.difference(granted);
    let extra = granted.difference(declared);
    let allowed = missing.is_empty();

    let suggested_grant = (!allowed).then(|| declared.union(granted).to_vec());

    let summary = if allowed {
        let mut s = format!(
            "All {} declared permission(s) granted",
            declared.len()
        );
        if !extra.is_empty() {
            let _ = write!(s, "; {} granted permission(s) not required", extra.len());
        }
        s
    } else {
        format!(
            "Missing {} of {} declared permission(s): {}",
            missing.len(),
            declared.len(),
            join(&missing)
        )
    };

    let detail = render_detail(declared, granted, suggested_grant.as_deref());

    PermissionCheck {
        allowed,
        missing,
        extra,
        summary,
        detail,
        suggested_grant,
    }
}

fn render_detail(
    declared: &PermissionSet,
    granted: &PermissionSet,
    suggested: Option<&[PermissionId]>,
) -> String {
    let mut out = String::from("Declared permissions:\n");
    if declared.is_empty() {
        out.push_str("  (none)\n");
    }
    for id in declared {
        if granted.contains(id) {
            let _ = writeln!(out, "  ✓ {} (granted)", id);
        } else {
            let _ = writeln!(out, "  ✗ {} (not granted)", id);
        }
    }

    out.push_str("Granted permissions:\n");
    if granted.is_empty() {
        out.push_str("  (none)\n");
    }
    for id in granted {
        if declared.contains(id) {
            let _ = writeln!(out, "  ✓ {} (required)", id);
        } else {
            let _ = writeln!(out, "  · {} (not required)", id);
        }
    }

    if let Some(ids) = suggested {
        out.push_str("Suggested grant:\n");
        let _ = writeln!(out, "  --grant {}", join(ids));
    }
    out
}

fn join(ids: &[PermissionId]) -> String {
    ids.iter()
        .map(PermissionId::as_str)
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(ids: &[&str]) -> PermissionSet {
        ids.iter().copied().collect()
    }

    fn ids(raw: &[&str]) -> Vec<PermissionId> {
        raw.iter().map(|s| PermissionId::new(*s)).collect()
    }

    #[test]
    fn test_over_provisioned_grant_is_allowed() {
        let result = check(&set(&["fs.read"]), &set(&["fs.read", "fs.write"]));
        assert!(result.allowed);
        assert!(result.missing.is_empty());
        assert_eq!(result.extra, ids(&["fs.write"]));
        assert!(result.suggested_grant.is_none());
        assert!(result.summary.contains("not required"));
    }

    #[test]
    fn test_under_provisioned_grant_is_denied() {
        let result = check(&set(&["fs.read", "fs.write"]), &set(&["fs.read"]));
        assert!(!result.allowed);
        assert_eq!(result.missing, ids(&["fs.write"]));
        assert!(result.extra.is_empty());
        assert_eq!(result.suggested_grant_arg().as_deref(), Some("fs.read,fs.write"));
        assert!(result.summary.contains("fs.write"));
    }

    #[test]
    fn test_detail_marks_every_id() {
        let result = check(&set(&["fs.read", "fs.write"]), &set(&["fs.read", "net.fetch"]));
        assert!(result.detail.contains("✓ fs.read (granted)"));
        assert!(result.detail.contains("✗ fs.write (not granted)"));
        assert!(result.detail.contains("✓ fs.read (required)"));
        assert!(result.detail.contains("· net.fetch (not required)"));
        assert!(result.detail.contains("--grant fs.read,fs.write,net.fetch"));
    }

    #[test]
    fn test_empty_declaration_always_allowed() {
        let result = check(&PermissionSet::new(), &PermissionSet::new());
        assert!(result.allowed);
        assert!(result.detail.contains("(none)"));
    }

    #[test]
    fn test_allowed_iff_subset_over_small_universe() {
        let universe = ["a.x", "a.y", "b.x", "b.y"];
        let pick = |mask: u32| -> PermissionSet {
            universe
                .iter()
                .enumerate()
                .filter(|(i, _)| mask & (1 << i) != 0)
                .map(|(_, id)| *id)
                .collect()
        };
        for d in 0..16u32 {
            for g in 0..16u32 {
                let declared = pick(d);
                let granted = pick(g);
                let result = check(&declared, &granted);
                assert_eq!(result.allowed, declared.is_subset(&granted));
                assert_eq!(result.missing, declared.difference(&granted));
                assert_eq!(result.extra, granted.difference(&declared));
            }
        }
    }

    #[test]
    fn test_serializes_for_json_output() {
        let result = check(&set(&["fs.read"]), &PermissionSet::new());
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["allowed"], false);
        assert_eq!(json["missing"][0], "fs.read");
        assert_eq!(json["suggested_grant"][0], "fs.read");
    }
}
