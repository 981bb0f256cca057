//! File-wide symbol table: imports, globs, type aliases and local items
//!
//! Resolution is per file, not per module. Good enough against a
//! cooperative front-end; the broker re-check is what actually holds.

use std::collections::{HashMap, HashSet};
use syn::visit::Visit;
use syn::{Item, ItemType, ItemUse, Type, UseTree};

/// A name brought into scope by `use`
#[derive(Debug, Clone)]
pub(crate) struct Import {
    /// Module path the item was imported from, `a::b`
    pub module: String,
    /// Name of the item in that module, before any rename
    pub original: String,
}

/// Where a referenced type name comes from
pub(crate) enum Origin<'a> {
    /// Imported from an allow-listed module and named like a marker
    Trusted { module: String, original: String },
    /// Imported from an allow-listed module, but not a capability marker
    TrustedNonMarker { module: String, original: String },
    /// Imported from any other module
    Foreign { module: String },
    /// A local `type` alias
    Alias { name: String, ty: &'a Type },
    /// A local struct, enum, trait, union or macro
    LocalItem,
    /// Both trusted and untrusted glob imports could supply the name
    AmbiguousGlob,
    /// Not imported, not defined
    Unknown,
}

#[derive(Default)]
pub(crate) struct SymbolTable {
    imports: HashMap<String, Import>,
    globs: Vec<String>,
    aliases: HashMap<String, Type>,
    definitions: HashSet<String>,
}

impl SymbolTable {
    pub fn collect(file: &syn::File) -> Self {
        let mut table = Self::default();
        table.visit_file(file);
        table
    }

    pub fn import(&self, local: &str) -> Option<&Import> {
        self.imports.get(local)
    }

    /// Resolve the provenance of a (possibly qualified) type name
    pub fn origin<'s>(
        &'s self,
        segments: &[String],
        trusted: &[String],
        is_marker: impl Fn(&str) -> bool,
    ) -> Origin<'s> {
        let Some((last, prefix)) = segments.split_last() else {
            return Origin::Unknown;
        };

        if prefix.is_empty() {
            return self.origin_of_local(last, trusted, is_marker);
        }

        if matches!(prefix[0].as_str(), "crate" | "self" | "super") {
            // Same crate: only what this file defines can be resolved
            return match self.aliases.get_key_value(last.as_str()) {
                Some((name, ty)) => Origin::Alias {
                    name: name.clone(),
                    ty,
                },
                None if self.definitions.contains(last.as_str()) => Origin::LocalItem,
                None => Origin::Unknown,
            };
        }

        // `use capgate_core as cg;` then `cg::Capabilities`
        let mut module: Vec<String> = prefix.to_vec();
        if let Some(import) = self.imports.get(&module[0]) {
            let mut expanded: Vec<String> = split_path(&import.module);
            expanded.push(import.original.clone());
            expanded.extend(module.drain(1..));
            module = expanded;
        }
        let module = module.join("::");
        classify(module, last.clone(), trusted, &is_marker)
    }

    fn origin_of_local<'s>(
        &'s self,
        name: &str,
        trusted: &[String],
        is_marker: impl Fn(&str) -> bool,
    ) -> Origin<'s> {
        if let Some(import) = self.imports.get(name) {
            return classify(
                import.module.clone(),
                import.original.clone(),
                trusted,
                &is_marker,
            );
        }
        if let Some((alias, ty)) = self.aliases.get_key_value(name) {
            return Origin::Alias {
                name: alias.clone(),
                ty,
            };
        }
        if self.definitions.contains(name) {
            return Origin::LocalItem;
        }

        let (trusted_globs, foreign_globs): (Vec<&String>, Vec<&String>) = self
            .globs
            .iter()
            .partition(|module| trusted.iter().any(|t| t == *module));
        match (trusted_globs.first(), foreign_globs.first()) {
            (Some(_), Some(_)) => Origin::AmbiguousGlob,
            (Some(module), None) => {
                classify((*module).clone(), name.to_string(), trusted, &is_marker)
            }
            (None, Some(module)) => Origin::Foreign {
                module: (*module).clone(),
            },
            (None, None) => Origin::Unknown,
        }
    }

    fn collect_use(&mut self, tree: &UseTree, prefix: &mut Vec<String>) {
        match tree {
            UseTree::Path(p) => {
                prefix.push(p.ident.to_string());
                self.collect_use(&p.tree, prefix);
                prefix.pop();
            }
            UseTree::Name(n) => {
                if let Some(import) = import_for(&n.ident.to_string(), prefix) {
                    self.imports.insert(import.original.clone(), import);
                }
            }
            UseTree::Rename(r) => {
                if let Some(import) = import_for(&r.ident.to_string(), prefix) {
                    let local = r.rename.to_string();
                    if local != "_" {
                        self.imports.insert(local, import);
                    }
                }
            }
            UseTree::Glob(_) => self.globs.push(prefix.join("::")),
            UseTree::Group(g) => {
                for item in &g.items {
                    self.collect_use(item, prefix);
                }
            }
        }
    }
}

fn classify<'s>(
    module: String,
    original: String,
    trusted: &[String],
    is_marker: &impl Fn(&str) -> bool,
) -> Origin<'s> {
    if trusted.iter().any(|t| *t == module) {
        if is_marker(&original) {
            Origin::Trusted { module, original }
        } else {
            Origin::TrustedNonMarker { module, original }
        }
    } else {
        Origin::Foreign { module }
    }
}

/// `a::b::{self}` imports `b` from `a`
fn import_for(ident: &str, prefix: &[String]) -> Option<Import> {
    if ident == "self" {
        let (original, module) = prefix.split_last()?;
        return Some(Import {
            module: module.join("::"),
            original: original.clone(),
        });
    }
    Some(Import {
        module: prefix.join("::"),
        original: ident.to_string(),
    })
}

fn split_path(path: &str) -> Vec<String> {
    path.split("::")
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl<'ast> Visit<'ast> for SymbolTable {
    fn visit_item_use(&mut self, node: &'ast ItemUse) {
        self.collect_use(&node.tree, &mut Vec::new());
    }

    fn visit_item_type(&mut self, node: &'ast ItemType) {
        self.aliases
            .insert(node.ident.to_string(), (*node.ty).clone());
        syn::visit::visit_item_type(self, node);
    }

    fn visit_item(&mut self, node: &'ast Item) {
        let defined = match node {
            Item::Struct(i) => Some(&i.ident),
            Item::Enum(i) => Some(&i.ident),
            Item::Union(i) => Some(&i.ident),
            Item::Trait(i) => Some(&i.ident),
            Item::TraitAlias(i) => Some(&i.ident),
            Item::Macro(i) => i.ident.as_ref(),
            _ => None,
        };
        if let Some(ident) = defined {
            self.definitions.insert(ident.to_string());
        }
        syn::visit::visit_item(self, node);
    }
}
