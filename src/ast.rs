//! Abstract syntax tree for Ent
//!
//! One tagged variant per construct, split into top-level items, statements
//! and expressions the way the source language groups them. The tree is
//! strictly owned: each child has exactly one parent.

/// Binary operators. Levels mirror the expression grammar; `Or`/`And` are
/// the single-token `|`/`&` forms, `BitOr`/`BitAnd` the doubled ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Or,     // |
    And,    // &
    Eq,     // ==
    Ne,     // !=
    Lt,     // <
    Le,     // <=
    Gt,     // >
    Ge,     // >=
    BitAnd, // &&
    BitOr,  // ||
    Add,    // +
    Sub,    // -
    Mul,    // *
    Div,    // /
    Mod,    // %
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg, // -
    Not, // !
}

/// An expression. Every node evaluates to a single 64-bit value.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Numeric literal, stored as written
    Literal(String),
    /// String literal, inner text without quotes
    Str(String),
    /// Variable reference
    Ident(String),
    /// Unary operation
    Unary(UnOp, Box<Expr>),
    /// Binary operation
    Binary(BinOp, Box<Expr>, Box<Expr>),
    /// Function call
    Call(String, Vec<Expr>),
    /// Byte-addressed indexing: name[expr]
    Index(String, Box<Expr>),
    /// Dereference of the address held in a variable: [name]
    MemoryAddress(String),
    /// Struct member access: base->member (chains nest in `base`)
    Member(Box<Expr>, String),
}

/// A function parameter or struct member
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub ty: String,
    pub name: String,
}

/// A brace-delimited statement sequence; introduces a scope frame
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub statements: Vec<Stmt>,
}

/// A `case (value) { ... };` arm; `value` is `None` for `default`
#[derive(Debug, Clone, PartialEq)]
pub struct SwitchCase {
    pub value: Option<Expr>,
    pub body: Block,
}

/// A statement
#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    /// Local declaration; `init` present for the `= expr` form,
    /// `by_addr` for the `type [] name` form
    VarDecl {
        ty: String,
        name: String,
        by_addr: bool,
        init: Option<Expr>,
    },
    /// name = expr
    Assign { name: String, value: Expr },
    /// name[index] = expr
    IndexAssign {
        name: String,
        index: Expr,
        value: Expr,
    },
    /// [name] = expr
    MemoryAssign { name: String, value: Expr },
    /// base->m1->..->mN = expr; `target` is a `Expr::Member` chain
    MemberAssign { target: Expr, value: Expr },
    Return(Option<Expr>),
    If {
        cond: Expr,
        then_branch: Block,
        /// `Stmt::Block` for a plain else, `Stmt::If` for else-if chains
        else_branch: Option<Box<Stmt>>,
    },
    While { cond: Expr, body: Block },
    Switch { scrutinee: Expr, cases: Vec<SwitchCase> },
    Continue,
    Break,
    /// name++
    Increment(String),
    /// name--
    Decrement(String),
    /// Captured assembly lines, emitted verbatim
    InlineAsm(Vec<String>),
    /// Call in statement position
    Call { name: String, args: Vec<Expr> },
    Block(Block),
    /// Expression in statement position
    Expr(Expr),
}

/// What a typedef binds its new name to
#[derive(Debug, Clone, PartialEq)]
pub enum TypedefKind {
    /// typedef <existing-type> Name;
    Alias(String),
    /// typedef struct { ... } Name;
    Struct(Vec<Param>),
}

/// A top-level item
#[derive(Debug, Clone, PartialEq)]
pub enum Item {
    /// header { ... }; - prototypes, typedefs, uninitialized globals
    Header(Vec<Item>),
    /// function name(params) -> type;
    Prototype {
        name: String,
        return_type: String,
        params: Vec<Param>,
    },
    /// function name(params) -> type { ... };
    Function {
        name: String,
        return_type: String,
        params: Vec<Param>,
        body: Block,
    },
    Typedef { name: String, kind: TypedefKind },
    /// Global variable; `init` must be a literal when present
    Global {
        ty: String,
        name: String,
        by_addr: bool,
        init: Option<Expr>,
    },
    InlineAsm(Vec<String>),
}

/// A complete translation unit
#[derive(Debug, PartialEq)]
pub struct Program {
    pub items: Vec<Item>,
}

impl Program {
    /// Canonical source rendering. Parsing the result yields a structurally
    /// identical tree; nested expressions are fully parenthesized so the
    /// shape survives independent of precedence.
    pub fn pretty(&self) -> String {
        let mut out = String::new();
        for item in &self.items {
            write_item(&mut out, item, 0);
        }
        out
    }
}

fn indent(out: &mut String, depth: usize) {
    for _ in 0..depth {
        out.push_str("    ");
    }
}

fn write_params(out: &mut String, params: &[Param]) {
    out.push('(');
    for (i, param) in params.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        out.push_str(&param.ty);
        out.push(' ');
        out.push_str(&param.name);
    }
    out.push(')');
}

fn write_item(out: &mut String, item: &Item, depth: usize) {
    match item {
        Item::Header(items) => {
            indent(out, depth);
            out.push_str("header {\n");
            for inner in items {
                write_item(out, inner, depth + 1);
            }
            indent(out, depth);
            out.push_str("};\n");
        }
        Item::Prototype {
            name,
            return_type,
            params,
        } => {
            indent(out, depth);
            out.push_str("function ");
            out.push_str(name);
            write_params(out, params);
            out.push_str(" -> ");
            out.push_str(return_type);
            out.push_str(";\n");
        }
        Item::Function {
            name,
            return_type,
            params,
            body,
        } => {
            indent(out, depth);
            out.push_str("function ");
            out.push_str(name);
            write_params(out, params);
            out.push_str(" -> ");
            out.push_str(return_type);
            out.push_str(" {\n");
            for stmt in &body.statements {
                write_stmt(out, stmt, depth + 1);
            }
            indent(out, depth);
            out.push_str("};\n");
        }
        Item::Typedef { name, kind } => {
            indent(out, depth);
            match kind {
                TypedefKind::Alias(old) => {
                    out.push_str("typedef ");
                    out.push_str(old);
                }
                TypedefKind::Struct(members) => {
                    out.push_str("typedef struct {");
                    for member in members {
                        out.push(' ');
                        out.push_str(&member.ty);
                        out.push(' ');
                        out.push_str(&member.name);
                        out.push(';');
                    }
                    out.push_str(" }");
                }
            }
            out.push(' ');
            out.push_str(name);
            out.push_str(";\n");
        }
        Item::Global {
            ty,
            name,
            by_addr,
            init,
        } => {
            indent(out, depth);
            out.push_str(ty);
            if *by_addr {
                out.push_str(" []");
            }
            out.push(' ');
            out.push_str(name);
            if let Some(init) = init {
                out.push_str(" = ");
                write_expr(out, init);
            }
            out.push_str(";\n");
        }
        Item::InlineAsm(lines) => write_asm(out, lines, depth),
    }
}

fn write_block(out: &mut String, block: &Block, depth: usize) {
    out.push_str("{\n");
    for stmt in &block.statements {
        write_stmt(out, stmt, depth + 1);
    }
    indent(out, depth);
    out.push('}');
}

fn write_asm(out: &mut String, lines: &[String], depth: usize) {
    indent(out, depth);
    out.push_str("asm {\n");
    for line in lines {
        indent(out, depth + 1);
        out.push_str(line);
        out.push('\n');
    }
    indent(out, depth);
    out.push_str("};\n");
}

fn write_stmt(out: &mut String, stmt: &Stmt, depth: usize) {
    match stmt {
        Stmt::VarDecl {
            ty,
            name,
            by_addr,
            init,
        } => {
            indent(out, depth);
            out.push_str(ty);
            if *by_addr {
                out.push_str(" []");
            }
            out.push(' ');
            out.push_str(name);
            if let Some(init) = init {
                out.push_str(" = ");
                write_expr(out, init);
            }
            out.push_str(";\n");
        }
        Stmt::Assign { name, value } => {
            indent(out, depth);
            out.push_str(name);
            out.push_str(" = ");
            write_expr(out, value);
            out.push_str(";\n");
        }
        Stmt::IndexAssign { name, index, value } => {
            indent(out, depth);
            out.push_str(name);
            out.push('[');
            write_expr(out, index);
            out.push_str("] = ");
            write_expr(out, value);
            out.push_str(";\n");
        }
        Stmt::MemoryAssign { name, value } => {
            indent(out, depth);
            out.push('[');
            out.push_str(name);
            out.push_str("] = ");
            write_expr(out, value);
            out.push_str(";\n");
        }
        Stmt::MemberAssign { target, value } => {
            indent(out, depth);
            write_expr(out, target);
            out.push_str(" = ");
            write_expr(out, value);
            out.push_str(";\n");
        }
        Stmt::Return(value) => {
            indent(out, depth);
            out.push_str("return");
            if let Some(value) = value {
                out.push(' ');
                write_expr(out, value);
            }
            out.push_str(";\n");
        }
        Stmt::If { .. } => {
            indent(out, depth);
            write_if_chain(out, stmt, depth);
            out.push_str(";\n");
        }
        Stmt::While { cond, body } => {
            indent(out, depth);
            out.push_str("while (");
            write_expr(out, cond);
            out.push_str(") ");
            write_block(out, body, depth);
            out.push_str(";\n");
        }
        Stmt::Switch { scrutinee, cases } => {
            indent(out, depth);
            out.push_str("switch (");
            write_expr(out, scrutinee);
            out.push_str(") {\n");
            for case in cases {
                indent(out, depth + 1);
                match &case.value {
                    Some(value) => {
                        out.push_str("case (");
                        write_expr(out, value);
                        out.push_str(") ");
                    }
                    None => out.push_str("default "),
                }
                write_block(out, &case.body, depth + 1);
                out.push_str(";\n");
            }
            indent(out, depth);
            out.push_str("};\n");
        }
        Stmt::Continue => {
            indent(out, depth);
            out.push_str("continue;\n");
        }
        Stmt::Break => {
            indent(out, depth);
            out.push_str("break;\n");
        }
        Stmt::Increment(name) => {
            indent(out, depth);
            out.push_str(name);
            out.push_str("++;\n");
        }
        Stmt::Decrement(name) => {
            indent(out, depth);
            out.push_str(name);
            out.push_str("--;\n");
        }
        Stmt::InlineAsm(lines) => write_asm(out, lines, depth),
        Stmt::Call { name, args } => {
            indent(out, depth);
            write_call(out, name, args);
            out.push_str(";\n");
        }
        Stmt::Block(block) => {
            indent(out, depth);
            write_block(out, block, depth);
            out.push_str(";\n");
        }
        Stmt::Expr(expr) => {
            indent(out, depth);
            write_expr(out, expr);
            out.push_str(";\n");
        }
    }
}

fn write_if_chain(out: &mut String, stmt: &Stmt, depth: usize) {
    if let Stmt::If {
        cond,
        then_branch,
        else_branch,
    } = stmt
    {
        out.push_str("if (");
        write_expr(out, cond);
        out.push_str(") ");
        write_block(out, then_branch, depth);
        match else_branch.as_deref() {
            Some(Stmt::Block(block)) => {
                out.push_str(" else ");
                write_block(out, block, depth);
            }
            Some(nested @ Stmt::If { .. }) => {
                out.push_str(" else ");
                write_if_chain(out, nested, depth);
            }
            _ => {}
        }
    }
}

fn write_call(out: &mut String, name: &str, args: &[Expr]) {
    out.push_str(name);
    out.push('(');
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        write_expr(out, arg);
    }
    out.push(')');
}

fn write_expr(out: &mut String, expr: &Expr) {
    match expr {
        Expr::Literal(text) => out.push_str(text),
        Expr::Str(text) => {
            out.push('"');
            out.push_str(text);
            out.push('"');
        }
        Expr::Ident(name) => out.push_str(name),
        Expr::Unary(op, operand) => {
            out.push('(');
            out.push(match op {
                UnOp::Neg => '-',
                UnOp::Not => '!',
            });
            write_expr(out, operand);
            out.push(')');
        }
        Expr::Binary(op, lhs, rhs) => {
            out.push('(');
            write_expr(out, lhs);
            out.push(' ');
            out.push_str(match op {
                BinOp::Or => "|",
                BinOp::And => "&",
                BinOp::Eq => "==",
                BinOp::Ne => "!=",
                BinOp::Lt => "<",
                BinOp::Le => "<=",
                BinOp::Gt => ">",
                BinOp::Ge => ">=",
                BinOp::BitAnd => "&&",
                BinOp::BitOr => "||",
                BinOp::Add => "+",
                BinOp::Sub => "-",
                BinOp::Mul => "*",
                BinOp::Div => "/",
                BinOp::Mod => "%",
            });
            out.push(' ');
            write_expr(out, rhs);
            out.push(')');
        }
        Expr::Call(name, args) => write_call(out, name, args),
        Expr::Index(name, index) => {
            out.push_str(name);
            out.push('[');
            write_expr(out, index);
            out.push(']');
        }
        Expr::MemoryAddress(name) => {
            out.push('[');
            out.push_str(name);
            out.push(']');
        }
        Expr::Member(base, member) => {
            write_expr(out, base);
            out.push_str("->");
            out.push_str(member);
        }
    }
}
