//! Presentation of Delve variables as DAP values and variable trees.

use std::collections::HashMap;

use godap_delve::types::{variable_flags, ReflectKind, Variable};
use serde::Serialize;

use crate::handles::HandleTable;

/// Children are not expanded below this many levels of nesting.
pub const MAX_RENDER_DEPTH: usize = 32;

/// `(address, type)` of a value on the path from a root to the value being
/// rendered.
pub type VisitKey = (u64, String);

/// A Delve variable decoded by kind.
#[derive(Debug, Clone, PartialEq)]
pub enum GoValue<'a> {
    UnsafePointer {
        target: u64,
    },
    Pointer {
        type_name: &'a str,
        pointee: Option<&'a Variable>,
    },
    Slice {
        type_name: &'a str,
        base: u64,
        len: i64,
        cap: i64,
    },
    Map {
        type_name: &'a str,
        base: u64,
        len: i64,
    },
    Array {
        type_name: &'a str,
    },
    String {
        value: &'a str,
        len: i64,
        unreadable: &'a str,
    },
    Interface {
        type_name: &'a str,
        addr: u64,
        inner: Option<&'a Variable>,
        value: &'a str,
    },
    /// Structs, scalars, channels and functions.
    Other {
        type_name: &'a str,
        value: &'a str,
        has_children: bool,
    },
}

impl<'a> GoValue<'a> {
    pub fn from_variable(v: &'a Variable) -> Self {
        let type_name = v.type_.as_str();
        match v.reflect_kind() {
            ReflectKind::UnsafePointer => Self::UnsafePointer {
                target: v.children.first().map(|c| c.addr).unwrap_or_default(),
            },
            ReflectKind::Ptr => Self::Pointer {
                type_name,
                pointee: v.children.first(),
            },
            ReflectKind::Slice => Self::Slice {
                type_name,
                base: v.base,
                len: v.len,
                cap: v.cap,
            },
            ReflectKind::Map => Self::Map {
                type_name,
                base: v.base,
                len: v.len,
            },
            ReflectKind::Array => Self::Array { type_name },
            ReflectKind::String => Self::String {
                value: &v.value,
                len: v.len,
                unreadable: &v.unreadable,
            },
            ReflectKind::Interface => Self::Interface {
                type_name,
                addr: v.addr,
                inner: v.children.first(),
                value: &v.value,
            },
            _ => Self::Other {
                type_name,
                value: &v.value,
                has_children: !v.children.is_empty(),
            },
        }
    }

    /// The text shown for the value.
    pub fn display(&self) -> String {
        match self {
            Self::UnsafePointer { target } => format!("unsafe.Pointer(0x{target:x})"),
            Self::Pointer { type_name, pointee } => match pointee {
                None => format!("unknown <{type_name}>"),
                Some(p) if p.addr == 0 => format!("nil <{type_name}>"),
                Some(p) if p.type_ == "void" => "void".to_string(),
                Some(p) => format!("<{type_name}>(0x{:x})", p.addr),
            },
            Self::Slice {
                type_name,
                base,
                len,
                cap,
            } => {
                if *base == 0 {
                    format!("nil <{type_name}>")
                } else {
                    format!("<{type_name}> (length: {len}, cap: {cap})")
                }
            }
            Self::Map {
                type_name,
                base,
                len,
            } => {
                if *base == 0 {
                    format!("nil <{type_name}>")
                } else {
                    format!("<{type_name}> (length: {len})")
                }
            }
            Self::Array { type_name } => format!("<{type_name}>"),
            Self::String {
                value,
                len,
                unreadable,
            } => {
                if !unreadable.is_empty() {
                    return format!("<{unreadable}>");
                }
                let loaded = value.len() as i64;
                if !value.is_empty() && loaded < *len {
                    format!("\"{value}...+{} more\"", len - loaded)
                } else {
                    format!("\"{value}\"")
                }
            }
            Self::Interface {
                type_name,
                addr,
                inner,
                value,
            } => match inner {
                _ if *addr == 0 => "nil".to_string(),
                None => "nil".to_string(),
                Some(inner) if inner.reflect_kind() == ReflectKind::Invalid && inner.addr == 0 => {
                    format!("nil <{type_name}>")
                }
                Some(_) if !value.is_empty() => value.to_string(),
                Some(inner) => format!("<{type_name}({})>", inner.type_),
            },
            Self::Other {
                type_name, value, ..
            } => {
                if value.is_empty() {
                    format!("<{type_name}>")
                } else {
                    value.to_string()
                }
            }
        }
    }

    /// Whether the value can be expanded in the editor.
    pub fn has_children(&self) -> bool {
        match self {
            Self::UnsafePointer { .. } | Self::String { .. } => false,
            Self::Pointer { pointee, .. } => {
                matches!(pointee, Some(p) if p.addr != 0 && p.type_ != "void")
            }
            Self::Slice { base, .. } | Self::Map { base, .. } => *base != 0,
            Self::Array { .. } => true,
            Self::Interface { addr, inner, .. } => match inner {
                _ if *addr == 0 => false,
                None => false,
                Some(inner) => !(inner.reflect_kind() == ReflectKind::Invalid && inner.addr == 0),
            },
            Self::Other { has_children, .. } => *has_children,
        }
    }
}

/// A value reachable through a `variablesReference`.
#[derive(Debug, Clone, Default)]
pub struct VarNode {
    pub variable: Variable,
    /// Expression that evaluates to this value. Empty for scopes and other
    /// synthesized containers.
    pub evaluate_name: String,
    /// Values from the root down to and including this one.
    pub path: Vec<VisitKey>,
}

impl VarNode {
    /// A synthesized container such as the `Local` scope.
    pub fn container(name: &str, children: Vec<Variable>) -> Self {
        Self {
            variable: Variable {
                name: name.to_string(),
                children,
                ..Variable::default()
            },
            evaluate_name: String::new(),
            path: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    pub value: String,
    pub variables_reference: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DapVariable {
    pub name: String,
    pub value: String,
    pub evaluate_name: String,
    pub variables_reference: i64,
}

fn visit_key(v: &Variable) -> VisitKey {
    (v.addr, v.type_.clone())
}

/// Renders `v` and, when it has children, registers a handle for it.
///
/// `ancestors` are the values enclosing `v`. A value that already appears
/// among them is shown as a cycle and gets no handle.
pub fn render(
    v: &Variable,
    evaluate_name: &str,
    ancestors: &[VisitKey],
    handles: &mut HandleTable<VarNode>,
) -> Rendered {
    let value = GoValue::from_variable(v);
    let mut rendered = Rendered {
        value: value.display(),
        variables_reference: 0,
    };
    if !value.has_children() {
        return rendered;
    }

    let key = visit_key(v);
    if key.0 != 0 && ancestors.contains(&key) {
        rendered.value = format!("<{}>(0x{:x}) <cycle>", v.type_, v.addr);
        return rendered;
    }
    if ancestors.len() >= MAX_RENDER_DEPTH {
        return rendered;
    }

    let mut path = ancestors.to_vec();
    path.push(key);
    rendered.variables_reference = handles.create(VarNode {
        variable: v.clone(),
        evaluate_name: evaluate_name.to_string(),
        path,
    });
    rendered
}

/// Children whose content Delve did not load and must be re-read before
/// they are rendered, as `(child index, expression)`.
pub fn reload_requests(node: &VarNode) -> Vec<(usize, String)> {
    let children = &node.variable.children;
    let candidates: Box<dyn Iterator<Item = usize>> = match node.variable.reflect_kind() {
        // Map values sit at odd indices.
        ReflectKind::Map => Box::new((1..children.len()).step_by(2)),
        _ => Box::new(0..children.len()),
    };
    candidates
        .filter(|&i| needs_reload(&children[i]))
        .map(|i| (i, reload_expression(&children[i])))
        .collect()
}

/// A struct with fewer loaded fields than it has, or an interface whose
/// dynamic value was only loaded by address.
pub fn needs_reload(v: &Variable) -> bool {
    match v.reflect_kind() {
        ReflectKind::Struct => v.len > v.children.len() as i64,
        ReflectKind::Interface => v.children.first().is_some_and(|c| c.only_addr),
        _ => false,
    }
}

pub fn reload_expression(v: &Variable) -> String {
    format!("*(*\"{}\")(0x{:x})", v.type_, v.addr)
}

/// Identifier behind a possibly shadow-annotated name.
fn plain_name(name: &str) -> &str {
    name.trim_start_matches('(').trim_end_matches(')')
}

fn child_evaluate_name(parent: &VarNode, child: &Variable) -> String {
    let name = plain_name(&child.name);
    match parent.variable.reflect_kind() {
        ReflectKind::Ptr | ReflectKind::Interface => parent.evaluate_name.clone(),
        _ if parent.evaluate_name.is_empty() => name.to_string(),
        _ => format!("{}.{}", parent.evaluate_name, name),
    }
}

/// DAP variables for the children of `node`.
pub fn child_variables(node: &VarNode, handles: &mut HandleTable<VarNode>) -> Vec<DapVariable> {
    let parent = &node.variable;
    let fqn = &node.evaluate_name;
    match parent.reflect_kind() {
        ReflectKind::Array | ReflectKind::Slice => parent
            .children
            .iter()
            .enumerate()
            .map(|(i, child)| {
                let evaluate_name = format!("{fqn}[{i}]");
                let rendered = render(child, &evaluate_name, &node.path, handles);
                DapVariable {
                    name: format!("[{i}]"),
                    value: rendered.value,
                    evaluate_name,
                    variables_reference: rendered.variables_reference,
                }
            })
            .collect(),
        ReflectKind::Map => parent
            .children
            .chunks_exact(2)
            .map(|pair| {
                let key = render(&pair[0], "", &node.path, handles);
                let evaluate_name = format!("{fqn}[{}]", key.value);
                let value = render(&pair[1], &evaluate_name, &node.path, handles);
                DapVariable {
                    name: key.value,
                    value: value.value,
                    evaluate_name,
                    variables_reference: value.variables_reference,
                }
            })
            .collect(),
        _ => parent
            .children
            .iter()
            .map(|child| {
                let evaluate_name = child_evaluate_name(node, child);
                let rendered = render(child, &evaluate_name, &node.path, handles);
                DapVariable {
                    name: child.name.clone(),
                    value: rendered.value,
                    evaluate_name,
                    variables_reference: rendered.variables_reference,
                }
            })
            .collect(),
    }
}

/// Wraps shadowed variables in parentheses, one pair per enclosing scope.
///
/// Delve flags every declaration hidden by an inner one. Within a name the
/// most recently declared shadowed variable gets one pair, the next two, and
/// so on; the visible declaration keeps its plain name.
pub fn annotate_shadowed(vars: &mut [Variable]) {
    let mut groups: HashMap<String, Vec<usize>> = HashMap::new();
    for (i, var) in vars.iter().enumerate() {
        if var.has_flag(variable_flags::SHADOWED) {
            groups.entry(var.name.clone()).or_default().push(i);
        }
    }
    for mut indices in groups.into_values() {
        indices.sort_by(|&a, &b| vars[b].decl_line.cmp(&vars[a].decl_line));
        for (depth, index) in indices.into_iter().enumerate() {
            let name = &vars[index].name;
            vars[index].name = format!("{}{}{}", "(".repeat(depth + 1), name, ")".repeat(depth + 1));
        }
    }
}

/// Combines several function return values into one expandable value whose
/// text lists them all (`1, "x"`).
pub fn wrap_return_values(values: Vec<Variable>) -> Variable {
    let text: Vec<String> = values
        .iter()
        .map(|v| GoValue::from_variable(v).display())
        .collect();
    Variable {
        value: text.join(", "),
        kind: ReflectKind::Invalid.as_raw(),
        flags: variable_flags::FAKE_ADDRESS | variable_flags::RETURN_ARGUMENT,
        children: values,
        ..Variable::default()
    }
}
