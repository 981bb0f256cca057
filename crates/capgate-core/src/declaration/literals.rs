//! Type references and their literal permission lists

use proc_macro2::Span;
use syn::punctuated::Punctuated;
use syn::{Expr, GenericArgument, Lit, PathArguments, Stmt, Token, Type};

/// How the marker was written at the annotation site
pub(crate) enum Form<'a> {
    /// `Name<...>` or a bare `Name`
    Path(&'a PathArguments),
    /// `Name![...]`
    Macro(&'a syn::Macro),
}

/// A named type reference with its arguments, after looking through
/// references, parentheses and invisible groups.
pub(crate) struct TypeRef<'a> {
    pub segments: Vec<String>,
    pub span: Span,
    pub form: Form<'a>,
}

impl<'a> TypeRef<'a> {
    pub fn from_type(ty: &'a Type) -> Option<Self> {
        match ty {
            Type::Reference(r) => Self::from_type(&r.elem),
            Type::Paren(p) => Self::from_type(&p.elem),
            Type::Group(g) => Self::from_type(&g.elem),
            Type::Path(tp) if tp.qself.is_none() => {
                let last = tp.path.segments.last()?;
                Some(Self {
                    segments: tp
                        .path
                        .segments
                        .iter()
                        .map(|s| s.ident.to_string())
                        .collect(),
                    span: last.ident.span(),
                    form: Form::Path(&last.arguments),
                })
            }
            Type::Macro(tm) => {
                let last = tm.mac.path.segments.last()?;
                Some(Self {
                    segments: tm
                        .mac
                        .path
                        .segments
                        .iter()
                        .map(|s| s.ident.to_string())
                        .collect(),
                    span: last.ident.span(),
                    form: Form::Macro(&tm.mac),
                })
            }
            _ => None,
        }
    }

    /// Final identifier, the name the marker convention applies to
    pub fn name(&self) -> &str {
        self.segments.last().map(String::as_str).unwrap_or_default()
    }

    pub fn display(&self) -> String {
        let path = self.segments.join("::");
        match self.form {
            Form::Macro(_) => format!("{}!", path),
            Form::Path(_) => path,
        }
    }

    /// String literals of the first argument.
    ///
    /// `None` when the reference carries no argument at all; `Some(vec![])`
    /// when an argument is present but holds no string literals.
    pub fn literals(&self) -> Option<Vec<String>> {
        match self.form {
            Form::Path(PathArguments::AngleBracketed(args)) => {
                Some(match args.args.first()? {
                    GenericArgument::Const(expr) => literals_in_expr(expr),
                    _ => Vec::new(),
                })
            }
            Form::Path(_) => None,
            Form::Macro(mac) => {
                let elems = mac
                    .parse_body_with(Punctuated::<Expr, Token![,]>::parse_terminated)
                    .unwrap_or_default();
                let mut iter = elems.iter();
                match (iter.next(), iter.next()) {
                    (Some(only), None) if is_list(only) => Some(literals_in_expr(only)),
                    _ => Some(elems.iter().filter_map(string_literal).collect()),
                }
            }
        }
    }
}

fn is_list(expr: &Expr) -> bool {
    matches!(
        expr,
        Expr::Array(_) | Expr::Tuple(_) | Expr::Reference(_) | Expr::Block(_) | Expr::Paren(_)
    )
}

/// Literal strings of a tuple or array expression. Elements that are not
/// string literals are skipped.
fn literals_in_expr(expr: &Expr) -> Vec<String> {
    match expr {
        Expr::Lit(_) => string_literal(expr).into_iter().collect(),
        Expr::Array(a) => a.elems.iter().filter_map(string_literal).collect(),
        Expr::Tuple(t) => t.elems.iter().filter_map(string_literal).collect(),
        Expr::Reference(r) => literals_in_expr(&r.expr),
        Expr::Paren(p) => literals_in_expr(&p.expr),
        Expr::Group(g) => literals_in_expr(&g.expr),
        Expr::Block(b) => match b.block.stmts.as_slice() {
            [Stmt::Expr(inner, None)] => literals_in_expr(inner),
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

fn string_literal(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Lit(lit) => match &lit.lit {
            Lit::Str(s) => Some(s.value()),
            _ => None,
        },
        Expr::Group(g) => string_literal(&g.expr),
        Expr::Paren(p) => string_literal(&p.expr),
        _ => None,
    }
}
