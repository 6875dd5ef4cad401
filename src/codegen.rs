//! x86-64 code generator
//!
//! Walks the AST once and emits Intel-syntax (NASM) assembly, function by
//! function. No IR and no register allocation: expressions evaluate into
//! `rax` with `push rax` / `pop rbx` pairing, locals live at fixed
//! `rbp`-relative offsets, and the first six call arguments travel in the
//! System V registers.

use std::collections::HashMap;
use std::fmt;

use indexmap::IndexMap;

use crate::ast::*;

const ARGUMENT_REGISTERS: [&str; 6] = ["rdi", "rsi", "rdx", "rcx", "r8", "r9"];

#[derive(Debug)]
pub struct CodegenError {
    pub message: String,
}

impl CodegenError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for CodegenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for CodegenError {}

type Result<T> = std::result::Result<T, CodegenError>;

/// A local variable's stack slot and declared type
#[derive(Debug, Clone)]
struct LocalVar {
    offset: i64,
    ty: String,
}

/// Labels of an enclosing loop plus the block nesting depth at its entry,
/// so `break`/`continue` can release the stack space reserved by the
/// blocks they jump out of.
#[derive(Debug, Clone)]
struct LoopContext {
    start_label: String,
    end_label: String,
    block_depth: usize,
}

pub struct CodeGen {
    typedefs: HashMap<String, String>,
    struct_defs: IndexMap<String, Vec<Param>>,

    lines: Vec<String>,
    label_counter: u32,

    /// Scope frames of locals, innermost last
    scopes: Vec<HashMap<String, LocalVar>>,
    /// Globals by name: (label, type)
    globals: HashMap<String, (String, String)>,
    /// Interned string literals: (label, text)
    strings: Vec<(String, String)>,

    current_function: String,
    /// Next free offset below rbp; moves further down as locals are added
    local_offset: i64,
    loop_stack: Vec<LoopContext>,
    /// Bytes reserved by each enclosing block, innermost last
    block_sizes: Vec<i64>,
}

impl CodeGen {
    pub fn new(
        typedefs: HashMap<String, String>,
        struct_defs: IndexMap<String, Vec<Param>>,
    ) -> Self {
        Self {
            typedefs,
            struct_defs,
            lines: Vec::new(),
            label_counter: 0,
            scopes: Vec::new(),
            globals: HashMap::new(),
            strings: Vec::new(),
            current_function: String::new(),
            local_offset: 0,
            loop_stack: Vec::new(),
            block_sizes: Vec::new(),
        }
    }

    /// Generate the whole module. Items are emitted in source order;
    /// prototypes of functions never defined become `extern` lines.
    pub fn generate(&mut self, program: &Program) -> Result<String> {
        let defined: Vec<&str> = collect_defined_functions(&program.items);
        let mut externs: Vec<String> = Vec::new();
        collect_externs(&program.items, &defined, &mut externs);
        for name in externs {
            self.emit(format!("extern {}", name));
        }

        self.gen_items(&program.items)?;

        if !self.strings.is_empty() {
            self.emit("section .rodata");
            let strings = std::mem::take(&mut self.strings);
            for (label, text) in strings {
                self.emit(format!("{} db \"{}\", 0", label, text));
            }
        }

        let mut out = String::new();
        for line in &self.lines {
            out.push_str(line);
            out.push('\n');
        }
        Ok(out)
    }

    fn gen_items(&mut self, items: &[Item]) -> Result<()> {
        for item in items {
            match item {
                Item::Header(inner) => self.gen_items(inner)?,
                Item::Prototype { .. } => {}
                Item::Typedef { .. } => {}
                Item::Function {
                    name,
                    params,
                    body,
                    ..
                } => self.gen_function(name, params, body)?,
                Item::Global {
                    ty, name, init, ..
                } => self.gen_global(ty, name, init.as_ref())?,
                Item::InlineAsm(lines) => {
                    for line in lines {
                        self.emit(line.clone());
                    }
                }
            }
        }
        Ok(())
    }

    // -------- type sizes and layout --------

    /// Collapse a type name through the typedef table.
    fn resolve_type_name(&self, ty: &str) -> String {
        match self.typedefs.get(ty) {
            Some(resolved) => resolved.clone(),
            None => ty.to_string(),
        }
    }

    /// Byte size of a type. Struct layout is byte-packed: the size is the
    /// plain sum of member sizes in declaration order.
    fn type_size(&self, ty: &str) -> Result<i64> {
        let resolved = self.resolve_type_name(ty);
        let size = match resolved.as_str() {
            "char" | "int8" | "uint8" | "bool" => 1,
            "int16" | "uint16" => 2,
            "int32" | "uint32" | "float" => 4,
            "int64" | "uint64" => 8,
            _ => {
                let members = self
                    .struct_defs
                    .get(ty)
                    .ok_or_else(|| CodegenError::new(format!("unknown type size: {}", ty)))?;
                let mut total = 0;
                for member in members {
                    total += self.type_size(&member.ty)?;
                }
                total
            }
        };
        Ok(size)
    }

    /// Byte offset of `member` within struct type `ty`: the prefix sum of
    /// the sizes of the members declared before it.
    fn member_offset(&self, ty: &str, member: &str) -> Result<(i64, String)> {
        let members = self
            .struct_defs
            .get(ty)
            .ok_or_else(|| CodegenError::new(format!("struct type not found: {}", ty)))?;
        let mut offset = 0;
        for m in members {
            if m.name == member {
                return Ok((offset, m.ty.clone()));
            }
            offset += self.type_size(&m.ty)?;
        }
        Err(CodegenError::new(format!(
            "struct member not found: {}->{}",
            ty, member
        )))
    }

    // -------- scope bookkeeping --------

    fn lookup(&self, name: &str) -> Option<&LocalVar> {
        self.scopes.iter().rev().find_map(|frame| frame.get(name))
    }

    fn add_local(&mut self, name: &str, ty: &str) -> Result<i64> {
        let size = self.type_size(ty)?;
        self.local_offset -= size;
        let offset = self.local_offset;
        self.scopes
            .last_mut()
            .expect("inside a function")
            .insert(
                name.to_string(),
                LocalVar {
                    offset,
                    ty: ty.to_string(),
                },
            );
        Ok(offset)
    }

    /// `[rbp-8]` for negative offsets, `[rbp+16]` for positive ones.
    fn frame_operand(offset: i64) -> String {
        if offset < 0 {
            format!("[rbp{}]", offset)
        } else {
            format!("[rbp+{}]", offset)
        }
    }

    fn new_label(&mut self) -> String {
        let label = format!("L{}", self.label_counter);
        self.label_counter += 1;
        label
    }

    fn emit(&mut self, line: impl Into<String>) {
        self.lines.push(line.into());
    }

    // -------- globals --------

    fn gen_global(&mut self, ty: &str, name: &str, init: Option<&Expr>) -> Result<()> {
        let size = self.type_size(ty)?;
        self.globals
            .insert(name.to_string(), (name.to_string(), ty.to_string()));

        match init {
            None => {
                self.emit("section .bss");
                let directive = match size {
                    1 => format!("{} resb 1", name),
                    2 => format!("{} resw 1", name),
                    4 => format!("{} resd 1", name),
                    8 => format!("{} resq 1", name),
                    n => format!("{} resb {}", name, n),
                };
                self.emit(directive);
            }
            Some(Expr::Literal(value)) => {
                self.emit("section .data");
                let directive = match size {
                    1 => "db",
                    2 => "dw",
                    4 => "dd",
                    _ => "dq",
                };
                self.emit(format!("{} {} {}", name, directive, value));
            }
            Some(_) => {
                return Err(CodegenError::new(format!(
                    "global '{}' requires a constant initializer",
                    name
                )));
            }
        }
        Ok(())
    }

    // -------- functions --------

    fn gen_function(&mut self, name: &str, params: &[Param], body: &Block) -> Result<()> {
        self.current_function = name.to_string();
        self.local_offset = 0;
        self.scopes.push(HashMap::new());

        self.emit("section .text");
        self.emit(format!("global {}", name));
        self.emit(format!("{}:", name));
        self.emit("push rbp");
        self.emit("mov rbp, rsp");

        // spill register arguments; stack arguments keep positive offsets
        let mut stack_arg_offset = 16;
        for (i, param) in params.iter().enumerate() {
            let offset = if i < ARGUMENT_REGISTERS.len() {
                let offset = -8 * (i as i64 + 1);
                self.emit(format!(
                    "mov {}, {}",
                    Self::frame_operand(offset),
                    ARGUMENT_REGISTERS[i]
                ));
                offset
            } else {
                let offset = stack_arg_offset;
                stack_arg_offset += 8;
                offset
            };
            self.scopes
                .last_mut()
                .expect("inside a function")
                .insert(
                    param.name.clone(),
                    LocalVar {
                        offset,
                        ty: param.ty.clone(),
                    },
                );
        }
        // locals pack below the spill area
        self.local_offset = -8 * (params.len().min(ARGUMENT_REGISTERS.len()) as i64);

        self.gen_block(body)?;

        self.emit(format!(".L_return_{}:", name));
        self.emit("leave");
        self.emit("ret");

        self.scopes.pop();
        self.current_function.clear();
        Ok(())
    }

    /// Reserve stack space for the block's immediate declarations (rounded
    /// up to 16), emit its statements, release the space on the way out.
    fn gen_block(&mut self, block: &Block) -> Result<()> {
        let mut frame_size = 0;
        for stmt in &block.statements {
            if let Stmt::VarDecl { ty, .. } = stmt {
                frame_size += self.type_size(ty)?;
            }
        }
        if frame_size % 16 != 0 {
            frame_size += 16 - frame_size % 16;
        }

        self.scopes.push(HashMap::new());
        self.block_sizes.push(frame_size);
        if frame_size > 0 {
            self.emit(format!("sub rsp, {}", frame_size));
        }

        for stmt in &block.statements {
            self.gen_statement(stmt)?;
        }

        if frame_size > 0 {
            self.emit(format!("add rsp, {}", frame_size));
        }
        self.block_sizes.pop();
        self.scopes.pop();
        Ok(())
    }

    fn gen_statement(&mut self, stmt: &Stmt) -> Result<()> {
        match stmt {
            Stmt::VarDecl {
                ty, name, init, ..
            } => {
                // the initializer may name a shadowed outer variable, so it
                // evaluates before the new slot is registered
                match init {
                    Some(init) => {
                        self.gen_expression(init)?;
                        let offset = self.add_local(name, ty)?;
                        self.emit(format!("mov {}, rax", Self::frame_operand(offset)));
                    }
                    None => {
                        self.add_local(name, ty)?;
                    }
                }
                Ok(())
            }
            Stmt::Assign { name, value } => {
                self.gen_expression(value)?;
                self.gen_store_variable(name)
            }
            Stmt::IndexAssign { name, index, value } => {
                self.gen_expression(value)?;
                self.emit("push rax");
                self.gen_expression(index)?;
                self.emit("mov rbx, rax");
                self.gen_load_variable(name)?;
                self.emit("add rbx, rax");
                self.emit("pop rax");
                self.emit("mov [rbx], rax");
                Ok(())
            }
            Stmt::MemoryAssign { name, value } => {
                self.gen_expression(value)?;
                self.emit("push rax");
                self.gen_load_variable(name)?;
                self.emit("mov rbx, rax");
                self.emit("pop rax");
                self.emit("mov [rbx], rax");
                Ok(())
            }
            Stmt::MemberAssign { target, value } => {
                self.gen_member_address(target)?;
                self.emit("push rax");
                self.gen_expression(value)?;
                self.emit("pop rbx");
                self.emit("mov [rbx], rax");
                Ok(())
            }
            Stmt::Return(value) => {
                if let Some(value) = value {
                    self.gen_expression(value)?;
                }
                self.emit(format!("jmp .L_return_{}", self.current_function));
                Ok(())
            }
            Stmt::If {
                cond,
                then_branch,
                else_branch,
            } => self.gen_if(cond, then_branch, else_branch.as_deref()),
            Stmt::While { cond, body } => self.gen_while(cond, body),
            Stmt::Switch { scrutinee, cases } => self.gen_switch(scrutinee, cases),
            Stmt::Break => match self.loop_stack.last() {
                Some(ctx) => {
                    let target = ctx.end_label.clone();
                    let depth = ctx.block_depth;
                    self.emit_loop_exit(depth, &target);
                    Ok(())
                }
                None => Err(CodegenError::new("break statement not within a loop")),
            },
            Stmt::Continue => match self.loop_stack.last() {
                Some(ctx) => {
                    let target = ctx.start_label.clone();
                    let depth = ctx.block_depth;
                    self.emit_loop_exit(depth, &target);
                    Ok(())
                }
                None => Err(CodegenError::new("continue statement not within a loop")),
            },
            Stmt::Increment(name) => {
                self.gen_load_variable(name)?;
                self.emit("add rax, 1");
                self.gen_store_variable(name)
            }
            Stmt::Decrement(name) => {
                self.gen_load_variable(name)?;
                self.emit("sub rax, 1");
                self.gen_store_variable(name)
            }
            Stmt::InlineAsm(lines) => {
                for line in lines {
                    self.emit(line.clone());
                }
                Ok(())
            }
            Stmt::Call { name, args } => self.gen_call(name, args),
            Stmt::Block(block) => self.gen_block(block),
            Stmt::Expr(expr) => self.gen_expression(expr),
        }
    }

    fn gen_if(
        &mut self,
        cond: &Expr,
        then_branch: &Block,
        else_branch: Option<&Stmt>,
    ) -> Result<()> {
        let else_label = self.new_label();
        let end_label = self.new_label();

        self.gen_expression(cond)?;
        self.emit("cmp rax, 0");
        self.emit(format!("je {}", else_label));

        self.gen_block(then_branch)?;
        self.emit(format!("jmp {}", end_label));

        self.emit(format!("{}:", else_label));
        match else_branch {
            Some(Stmt::Block(block)) => self.gen_block(block)?,
            Some(Stmt::If {
                cond,
                then_branch,
                else_branch,
            }) => self.gen_if(cond, then_branch, else_branch.as_deref())?,
            Some(other) => self.gen_statement(other)?,
            None => {}
        }
        self.emit(format!("{}:", end_label));
        Ok(())
    }

    /// Release the stack space reserved by every block entered since the
    /// innermost loop, then jump. Both loop labels sit outside the body
    /// block's `sub rsp` / `add rsp` pair, so a `break` or `continue` that
    /// left the space reserved would unbalance `rsp` on every iteration.
    fn emit_loop_exit(&mut self, block_depth: usize, target: &str) {
        let reserved: i64 = self.block_sizes[block_depth..].iter().sum();
        if reserved > 0 {
            self.emit(format!("add rsp, {}", reserved));
        }
        self.emit(format!("jmp {}", target));
    }

    fn gen_while(&mut self, cond: &Expr, body: &Block) -> Result<()> {
        let start_label = self.new_label();
        let end_label = self.new_label();
        self.loop_stack.push(LoopContext {
            start_label: start_label.clone(),
            end_label: end_label.clone(),
            block_depth: self.block_sizes.len(),
        });

        self.emit(format!("{}:", start_label));
        self.gen_expression(cond)?;
        self.emit("cmp rax, 0");
        self.emit(format!("je {}", end_label));

        self.gen_block(body)?;
        self.emit(format!("jmp {}", start_label));
        self.emit(format!("{}:", end_label));

        self.loop_stack.pop();
        Ok(())
    }

    /// Scrutinee lands in `rbx`; one `cmp`/`je` per case, a terminal jump
    /// to the default (or end) label, then the case bodies in order,
    /// falling through toward the end label.
    fn gen_switch(&mut self, scrutinee: &Expr, cases: &[SwitchCase]) -> Result<()> {
        let end_label = self.new_label();
        let default_label = self.new_label();
        let has_default = cases.iter().any(|c| c.value.is_none());

        self.gen_expression(scrutinee)?;
        self.emit("mov rbx, rax");

        let mut case_labels = Vec::with_capacity(cases.len());
        for case in cases {
            let label = self.new_label();
            if let Some(value) = &case.value {
                let constant = match value {
                    Expr::Literal(text) => text.clone(),
                    _ => {
                        return Err(CodegenError::new(
                            "switch case value must be a constant",
                        ));
                    }
                };
                self.emit(format!("cmp rbx, {}", constant));
                self.emit(format!("je {}", label));
            }
            case_labels.push(label);
        }
        if has_default {
            self.emit(format!("jmp {}", default_label));
        } else {
            self.emit(format!("jmp {}", end_label));
        }

        for (case, label) in cases.iter().zip(&case_labels) {
            if case.value.is_none() {
                self.emit(format!("{}:", default_label));
            }
            self.emit(format!("{}:", label));
            self.gen_block(&case.body)?;
        }

        self.emit(format!("{}:", end_label));
        Ok(())
    }

    /// Arguments are evaluated right to left; the first six land in the
    /// System V registers, the rest are pushed and popped off after the
    /// call.
    fn gen_call(&mut self, name: &str, args: &[Expr]) -> Result<()> {
        for (i, arg) in args.iter().enumerate().rev() {
            self.gen_expression(arg)?;
            if i < ARGUMENT_REGISTERS.len() {
                self.emit(format!("mov {}, rax", ARGUMENT_REGISTERS[i]));
            } else {
                self.emit("push rax");
            }
        }
        self.emit(format!("call {}", name));
        let spilled = args.len().saturating_sub(ARGUMENT_REGISTERS.len());
        if spilled > 0 {
            self.emit(format!("add rsp, {}", 8 * spilled));
        }
        Ok(())
    }

    // -------- expressions --------

    fn gen_load_variable(&mut self, name: &str) -> Result<()> {
        if let Some(var) = self.lookup(name) {
            let operand = Self::frame_operand(var.offset);
            self.emit(format!("mov rax, {}", operand));
            Ok(())
        } else if let Some((label, _)) = self.globals.get(name) {
            let label = label.clone();
            self.emit(format!("mov rax, [{}]", label));
            Ok(())
        } else {
            Err(CodegenError::new(format!("variable not in scope: {}", name)))
        }
    }

    fn gen_store_variable(&mut self, name: &str) -> Result<()> {
        if let Some(var) = self.lookup(name) {
            let operand = Self::frame_operand(var.offset);
            self.emit(format!("mov {}, rax", operand));
            Ok(())
        } else if let Some((label, _)) = self.globals.get(name) {
            let label = label.clone();
            self.emit(format!("mov [{}], rax", label));
            Ok(())
        } else {
            Err(CodegenError::new(format!("variable not in scope: {}", name)))
        }
    }

    fn variable_type(&self, name: &str) -> Result<String> {
        if let Some(var) = self.lookup(name) {
            Ok(var.ty.clone())
        } else if let Some((_, ty)) = self.globals.get(name) {
            Ok(ty.clone())
        } else {
            Err(CodegenError::new(format!("variable not in scope: {}", name)))
        }
    }

    /// Leave the address of a `base->member` chain in `rax`. The base's
    /// value is treated as the struct address; each link adds the member's
    /// byte offset, loading through the chain between links.
    fn gen_member_address(&mut self, expr: &Expr) -> Result<String> {
        match expr {
            Expr::Member(base, member) => {
                let base_ty = match base.as_ref() {
                    Expr::Ident(name) => {
                        self.gen_load_variable(name)?;
                        self.variable_type(name)?
                    }
                    Expr::Member(..) => {
                        let inner_ty = self.gen_member_address(base)?;
                        self.emit("mov rax, [rax]");
                        inner_ty
                    }
                    _ => {
                        return Err(CodegenError::new(
                            "struct member access requires a variable base",
                        ));
                    }
                };
                let (offset, member_ty) = self.member_offset(&base_ty, member)?;
                self.emit(format!("add rax, {}", offset));
                Ok(member_ty)
            }
            _ => Err(CodegenError::new("not a struct member access")),
        }
    }

    fn intern_string(&mut self, text: &str) -> String {
        let label = format!("Lstr{}", self.strings.len());
        self.strings.push((label.clone(), text.to_string()));
        label
    }

    /// Evaluate an expression into `rax`.
    fn gen_expression(&mut self, expr: &Expr) -> Result<()> {
        match expr {
            Expr::Literal(text) => {
                if text.contains('.') {
                    return Err(CodegenError::new(
                        "floating-point literals are not supported in code generation",
                    ));
                }
                self.emit(format!("mov rax, {}", text));
                Ok(())
            }
            Expr::Str(text) => {
                let label = self.intern_string(text);
                self.emit(format!("mov rax, {}", label));
                Ok(())
            }
            Expr::Ident(name) => self.gen_load_variable(name),
            Expr::Unary(op, operand) => {
                self.gen_expression(operand)?;
                match op {
                    UnOp::Neg => self.emit("neg rax"),
                    UnOp::Not => {
                        self.emit("cmp rax, 0");
                        self.emit("sete al");
                        self.emit("movzx rax, al");
                    }
                }
                Ok(())
            }
            Expr::Binary(op, lhs, rhs) => {
                // operands evaluate right to left so the left operand ends
                // up in rax and the op sequences below read naturally
                self.gen_expression(rhs)?;
                self.emit("push rax");
                self.gen_expression(lhs)?;
                self.emit("pop rbx");
                self.gen_binary_op(*op);
                Ok(())
            }
            Expr::Call(name, args) => self.gen_call(name, args),
            Expr::Index(name, index) => {
                self.gen_expression(index)?;
                self.emit("mov rbx, rax");
                self.gen_load_variable(name)?;
                self.emit("add rbx, rax");
                self.emit("mov rax, [rbx]");
                Ok(())
            }
            Expr::MemoryAddress(name) => {
                self.gen_load_variable(name)?;
                self.emit("mov rax, [rax]");
                Ok(())
            }
            Expr::Member(..) => {
                self.gen_member_address(expr)?;
                self.emit("mov rax, [rax]");
                Ok(())
            }
        }
    }

    /// Left operand in `rax`, right in `rbx`; result in `rax`.
    fn gen_binary_op(&mut self, op: BinOp) {
        match op {
            BinOp::Add => self.emit("add rax, rbx"),
            BinOp::Sub => self.emit("sub rax, rbx"),
            BinOp::Mul => self.emit("imul rax, rbx"),
            BinOp::Div => {
                self.emit("xor rdx, rdx");
                self.emit("idiv rbx");
            }
            BinOp::Mod => {
                self.emit("xor rdx, rdx");
                self.emit("idiv rbx");
                self.emit("mov rax, rdx");
            }
            BinOp::Eq => self.emit_comparison("sete"),
            BinOp::Ne => self.emit_comparison("setne"),
            BinOp::Lt => self.emit_comparison("setl"),
            BinOp::Le => self.emit_comparison("setle"),
            BinOp::Gt => self.emit_comparison("setg"),
            BinOp::Ge => self.emit_comparison("setge"),
            BinOp::And | BinOp::BitAnd => self.emit("and rax, rbx"),
            BinOp::Or | BinOp::BitOr => self.emit("or rax, rbx"),
        }
    }

    fn emit_comparison(&mut self, set_instruction: &str) {
        self.emit("cmp rax, rbx");
        self.emit(format!("{} al", set_instruction));
        self.emit("movzx rax, al");
    }
}

fn collect_defined_functions(items: &[Item]) -> Vec<&str> {
    let mut defined = Vec::new();
    for item in items {
        match item {
            Item::Function { name, .. } => defined.push(name.as_str()),
            Item::Header(inner) => defined.extend(collect_defined_functions(inner)),
            _ => {}
        }
    }
    defined
}

fn collect_externs(items: &[Item], defined: &[&str], externs: &mut Vec<String>) {
    for item in items {
        match item {
            Item::Prototype { name, .. } => {
                if !defined.contains(&name.as_str()) && !externs.contains(name) {
                    externs.push(name.clone());
                }
            }
            Item::Header(inner) => collect_externs(inner, defined, externs),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::Lexer;
    use crate::parser::Parser;
    use crate::preprocess::Preprocessor;

    fn compile(code: &str) -> String {
        let mut pp = Preprocessor::new();
        let processed = pp.process(code, "test.ent").expect("preprocess");
        let mut lexer = Lexer::new(&processed);
        let tokens = lexer.tokenize().expect("lex");
        let mut parser = Parser::new(tokens, pp.take_asm_blocks());
        let program = parser.parse().expect("parse");
        let (typedefs, structs) = parser.into_tables();
        let mut codegen = CodeGen::new(typedefs, structs);
        codegen.generate(&program).expect("codegen")
    }

    fn compile_err(code: &str) -> CodegenError {
        let mut lexer = Lexer::new(code);
        let tokens = lexer.tokenize().expect("lex");
        let mut parser = Parser::new(tokens, Vec::new());
        let program = parser.parse().expect("parse");
        let (typedefs, structs) = parser.into_tables();
        let mut codegen = CodeGen::new(typedefs, structs);
        codegen.generate(&program).expect_err("expected codegen error")
    }

    fn has_line(asm: &str, line: &str) -> bool {
        asm.lines().any(|l| l == line)
    }

    #[test]
    fn test_minimal_function() {
        let asm = compile("function main() -> int32 { return 0; };");
        assert!(has_line(&asm, "main:"));
        assert!(has_line(&asm, ".L_return_main:"));
        assert!(has_line(&asm, "push rbp"));
        assert!(has_line(&asm, "mov rbp, rsp"));
        assert!(has_line(&asm, "mov rax, 0"));
        assert!(has_line(&asm, "leave"));
        assert!(has_line(&asm, "ret"));
    }

    #[test]
    fn test_local_variable_layout() {
        let asm = compile(
            "function main() -> int32 {\n\
               int32 x = 5;\n\
               x = x + 3;\n\
               return x;\n\
             };",
        );
        assert!(has_line(&asm, "sub rsp, 16"));
        assert!(has_line(&asm, "add rsp, 16"));
        assert!(has_line(&asm, "mov [rbp-4], rax"));
        assert!(has_line(&asm, "push rax"));
        assert!(has_line(&asm, "pop rbx"));
        assert!(has_line(&asm, "add rax, rbx"));
    }

    #[test]
    fn test_struct_member_offsets() {
        let asm = compile(
            "typedef struct { int32 a; int32 b; } Pair;\n\
             typedef Pair P;\n\
             function sum(P p) -> int32 { return p->a + p->b; };",
        );
        // p spilled from rdi, then member offsets 0 and 4
        assert!(has_line(&asm, "mov [rbp-8], rdi"));
        assert!(has_line(&asm, "add rax, 0"));
        assert!(has_line(&asm, "add rax, 4"));
    }

    #[test]
    fn test_while_with_break() {
        let asm = compile(
            "function loop() -> int32 {\n\
               int32 i = 0;\n\
               while (i < 10) { if (i == 5) { break; }; i = i + 1; };\n\
               return i;\n\
             };",
        );
        // loop start/end labels exist and break jumps to the end label
        assert!(has_line(&asm, "L0:"));
        assert!(has_line(&asm, "jmp L0"));
        assert!(has_line(&asm, "je L1"));
        assert!(has_line(&asm, "jmp L1"));
        assert!(has_line(&asm, "L1:"));
    }

    #[test]
    fn test_break_outside_loop_is_fatal() {
        let err = compile_err("function f() -> int32 { break; return 0; };");
        assert!(err.message.contains("break"));
    }

    #[test]
    fn test_continue_targets_loop_start() {
        let asm = compile(
            "function f() -> int32 {\n\
               int32 i = 0;\n\
               while (i < 3) { i = i + 1; continue; };\n\
               return i;\n\
             };",
        );
        // both the loop back-edge and continue jump to the start label
        let jumps = asm.lines().filter(|l| *l == "jmp L0").count();
        assert_eq!(jumps, 2);
    }

    #[test]
    fn test_continue_releases_loop_block_space() {
        let asm = compile(
            "function f() -> int32 {\n\
               int32 i = 0;\n\
               while (i < 5) {\n\
                 int32 x = i;\n\
                 i = x + 1;\n\
                 continue;\n\
               };\n\
               return i;\n\
             };",
        );
        // every jump back to the loop head, the continue included, first
        // releases the body block's 16 reserved bytes
        let lines: Vec<&str> = asm.lines().collect();
        let head_jumps: Vec<usize> = lines
            .iter()
            .enumerate()
            .filter(|(_, l)| **l == "jmp L0")
            .map(|(i, _)| i)
            .collect();
        assert_eq!(head_jumps.len(), 2);
        for i in head_jumps {
            assert_eq!(lines[i - 1], "add rsp, 16");
        }
    }

    #[test]
    fn test_break_releases_nested_block_space() {
        let asm = compile(
            "function f() -> int32 {\n\
               int32 i = 0;\n\
               while (i < 5) {\n\
                 int64 x = 7;\n\
                 if (x == 7) { break; };\n\
                 i = i + 1;\n\
               };\n\
               return i;\n\
             };",
        );
        // the break sits in a nested if block; it still releases the body
        // block's reservation on its way to the loop end label
        let lines: Vec<&str> = asm.lines().collect();
        let break_jump = lines
            .iter()
            .position(|l| *l == "jmp L1")
            .expect("break jump");
        assert_eq!(lines[break_jump - 1], "add rsp, 16");
    }

    #[test]
    fn test_calling_convention() {
        let asm = compile(
            "function add(int32 a, int32 b) -> int32 { return a + b; };\n\
             function main() -> int32 { return add(1, 2); };",
        );
        assert!(has_line(&asm, "mov [rbp-8], rdi"));
        assert!(has_line(&asm, "mov [rbp-16], rsi"));
        assert!(has_line(&asm, "mov rdi, rax"));
        assert!(has_line(&asm, "mov rsi, rax"));
        assert!(has_line(&asm, "call add"));
    }

    #[test]
    fn test_seven_arguments_spill() {
        let asm = compile(
            "function f(int32 a, int32 b, int32 c, int32 d, int32 e, int32 g, int32 h) -> int32 {\n\
               return h;\n\
             };\n\
             function main() -> int32 { return f(1, 2, 3, 4, 5, 6, 7); };",
        );
        // the seventh argument is pushed and cleaned up after the call
        assert!(has_line(&asm, "add rsp, 8"));
        // inside f the seventh argument reads from above rbp
        assert!(has_line(&asm, "mov rax, [rbp+16]"));
    }

    #[test]
    fn test_locals_do_not_collide_with_spilled_args() {
        let asm = compile(
            "function f(int64 a) -> int64 {\n\
               int64 x = 1;\n\
               return x + a;\n\
             };",
        );
        assert!(has_line(&asm, "mov [rbp-8], rdi"));
        // x lands below the spill slot
        assert!(has_line(&asm, "mov [rbp-16], rax"));
    }

    #[test]
    fn test_globals() {
        let asm = compile("int32 counter;\nint64 base = 4096;\nfunction main() -> int32 { counter = 1; return counter; };");
        assert!(has_line(&asm, "section .bss"));
        assert!(has_line(&asm, "counter resd 1"));
        assert!(has_line(&asm, "section .data"));
        assert!(has_line(&asm, "base dq 4096"));
        assert!(has_line(&asm, "mov [counter], rax"));
        assert!(has_line(&asm, "mov rax, [counter]"));
    }

    #[test]
    fn test_struct_global_reserves_full_size() {
        let asm = compile(
            "typedef struct { int32 a; int64 b; char c; } Rec;\n\
             Rec slot;",
        );
        assert!(has_line(&asm, "slot resb 13"));
    }

    #[test]
    fn test_switch_compare_chain() {
        let asm = compile(
            "function f(int32 x) -> int32 {\n\
               int32 r = 0;\n\
               switch (x) {\n\
                 case (1) { r = 10; };\n\
                 case (2) { r = 20; };\n\
                 default { r = 30; };\n\
               };\n\
               return r;\n\
             };",
        );
        assert!(has_line(&asm, "mov rbx, rax"));
        assert!(has_line(&asm, "cmp rbx, 1"));
        assert!(has_line(&asm, "cmp rbx, 2"));
    }

    #[test]
    fn test_non_constant_case_is_fatal() {
        let err = compile_err(
            "function f(int32 x) -> int32 {\n\
               switch (x) { case (x) { return 1; }; };\n\
               return 0;\n\
             };",
        );
        assert!(err.message.contains("constant"));
    }

    #[test]
    fn test_comparison_sequence() {
        let asm = compile("function f(int32 a, int32 b) -> int32 { return a < b; };");
        assert!(has_line(&asm, "cmp rax, rbx"));
        assert!(has_line(&asm, "setl al"));
        assert!(has_line(&asm, "movzx rax, al"));
    }

    #[test]
    fn test_division_and_modulo() {
        let asm = compile("function f(int32 a, int32 b) -> int32 { return a / b % 3; };");
        assert!(has_line(&asm, "xor rdx, rdx"));
        assert!(has_line(&asm, "idiv rbx"));
        assert!(has_line(&asm, "mov rax, rdx"));
    }

    #[test]
    fn test_unary_operators() {
        let asm = compile("function f(int32 a) -> int32 { return -a + !a; };");
        assert!(has_line(&asm, "neg rax"));
        assert!(has_line(&asm, "sete al"));
    }

    #[test]
    fn test_string_literal_goes_to_rodata() {
        let asm = compile(
            "function puts(int64 s) -> int32;\n\
             function main() -> int32 { puts(\"hi\"); return 0; };",
        );
        assert!(has_line(&asm, "section .rodata"));
        assert!(has_line(&asm, "Lstr0 db \"hi\", 0"));
        assert!(has_line(&asm, "mov rax, Lstr0"));
    }

    #[test]
    fn test_undefined_prototype_becomes_extern() {
        let asm = compile(
            "header { function write_byte(int32 b) -> void; };\n\
             function main() -> int32 { write_byte(7); return 0; };",
        );
        assert!(has_line(&asm, "extern write_byte"));
    }

    #[test]
    fn test_defined_prototype_is_not_extern() {
        let asm = compile(
            "function f() -> int32;\n\
             function f() -> int32 { return 1; };\n\
             function main() -> int32 { return f(); };",
        );
        assert!(!asm.contains("extern f"));
    }

    #[test]
    fn test_inline_asm_verbatim() {
        let asm = compile(
            "function f() -> int32 {\n\
               asm {\n\
                 mov rax, 60\n\
                 syscall\n\
               };\n\
               return 0;\n\
             };",
        );
        assert!(has_line(&asm, "mov rax, 60"));
        assert!(has_line(&asm, "syscall"));
    }

    #[test]
    fn test_memory_assign_and_deref() {
        let asm = compile(
            "function f(int64 p) -> int64 {\n\
               [p] = 5;\n\
               return [p];\n\
             };",
        );
        assert!(has_line(&asm, "mov [rbx], rax"));
        assert!(has_line(&asm, "mov rax, [rax]"));
    }

    #[test]
    fn test_float_literal_is_fatal() {
        let err = compile_err("function f() -> float { return 3.14; };");
        assert!(err.message.contains("floating-point"));
    }

    #[test]
    fn test_rsp_adjustments_are_balanced() {
        let asm = compile(
            "function f(int32 n) -> int32 {\n\
               int32 total = 0;\n\
               int32 i = 0;\n\
               while (i < n) {\n\
                 int32 step = 2;\n\
                 total = total + step;\n\
                 i = i + 1;\n\
               };\n\
               return total;\n\
             };",
        );
        let subs: i64 = asm
            .lines()
            .filter_map(|l| l.strip_prefix("sub rsp, "))
            .map(|n| n.parse::<i64>().unwrap())
            .sum();
        let adds: i64 = asm
            .lines()
            .filter_map(|l| l.strip_prefix("add rsp, "))
            .map(|n| n.parse::<i64>().unwrap())
            .sum();
        assert_eq!(subs, adds);
    }

    #[test]
    fn test_unknown_type_size_is_fatal() {
        let err = compile_err("void x;");
        assert!(err.message.contains("unknown type size"));
    }
}
