//! Ent parser - recursive descent over the token stream
//!
//! Parsing is context-sensitive: the parser grows a type table, a
//! function/prototype table, struct member tables and a stack of scope
//! frames while it walks, and consults them to decide whether a statement
//! is a declaration, an assignment, a member store or a call. Lookahead is
//! at most three tokens; there is no backtracking.

use std::collections::{HashMap, HashSet};
use std::fmt;

use indexmap::IndexMap;

use crate::ast::*;
use crate::preprocess::AsmBlock;
use crate::token::{Token, TokenKind};

#[derive(Debug)]
pub struct ParseError {
    pub message: String,
    pub line: usize,
    pub column: usize,
    pub token_kind: String,
    pub token_lexeme: String,
}

impl ParseError {
    fn at(token: &Token, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            line: token.line,
            column: token.column,
            token_kind: token.kind.to_string(),
            token_lexeme: token.lexeme.clone(),
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}: {} (got {} '{}')",
            self.line, self.column, self.message, self.token_kind, self.token_lexeme
        )
    }
}

impl std::error::Error for ParseError {}

type Result<T> = std::result::Result<T, ParseError>;

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    asm_blocks: Vec<AsmBlock>,
    asm_index: usize,

    existing_types: HashSet<String>,
    typedefs: HashMap<String, String>,
    struct_defs: IndexMap<String, Vec<Param>>,
    existing_functions: HashSet<String>,
    prototypes: HashSet<String>,
    /// Stack of scope frames mapping variable name to its declared type.
    scopes: Vec<HashMap<String, String>>,
}

pub const BUILTIN_TYPES: [&str; 12] = [
    "void", "char", "bool", "float", "int8", "int16", "int32", "int64", "uint8", "uint16",
    "uint32", "uint64",
];

impl Parser {
    pub fn new(tokens: Vec<Token>, asm_blocks: Vec<AsmBlock>) -> Self {
        Self {
            tokens,
            pos: 0,
            asm_blocks,
            asm_index: 0,
            existing_types: BUILTIN_TYPES.iter().map(|s| s.to_string()).collect(),
            typedefs: HashMap::new(),
            struct_defs: IndexMap::new(),
            existing_functions: HashSet::new(),
            prototypes: HashSet::new(),
            scopes: Vec::new(),
        }
    }

    /// Hand the accumulated tables to the code generator.
    pub fn into_tables(self) -> (HashMap<String, String>, IndexMap<String, Vec<Param>>) {
        (self.typedefs, self.struct_defs)
    }

    // -------- token plumbing --------

    fn peek(&self, offset: usize) -> &Token {
        self.tokens
            .get(self.pos + offset)
            .unwrap_or_else(|| self.tokens.last().expect("token stream ends with EOF"))
    }

    fn current(&self) -> &Token {
        self.peek(0)
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current().kind == kind
    }

    fn advance(&mut self) -> Token {
        let tok = self.current().clone();
        if tok.kind != TokenKind::Eof {
            self.pos += 1;
        }
        tok
    }

    fn expect(&mut self, kind: TokenKind, message: &str) -> Result<Token> {
        if self.check(kind) {
            Ok(self.advance())
        } else {
            Err(ParseError::at(self.current(), message))
        }
    }

    fn error<T>(&self, message: impl Into<String>) -> Result<T> {
        Err(ParseError::at(self.current(), message))
    }

    // -------- symbol table plumbing --------

    fn is_type_token(&self, tok: &Token) -> bool {
        tok.kind.is_builtin_type()
            || (tok.kind == TokenKind::Identifier && self.existing_types.contains(&tok.lexeme))
    }

    fn is_declared(&self, name: &str) -> bool {
        self.scopes.iter().any(|frame| frame.contains_key(name))
    }

    fn declared_type(&self, name: &str) -> Option<&String> {
        self.scopes.iter().rev().find_map(|frame| frame.get(name))
    }

    fn declare_variable(&mut self, tok: &Token, name: &str, ty: &str) -> Result<()> {
        if self.existing_types.contains(name) {
            return Err(ParseError::at(tok, "variable name collides with a type"));
        }
        let frame = self.scopes.last_mut().expect("scope stack is never empty");
        if frame.contains_key(name) {
            return Err(ParseError::at(tok, "duplicated variable name"));
        }
        frame.insert(name.to_string(), ty.to_string());
        Ok(())
    }

    /// Collapse a type name through the typedef chain to a built-in name or
    /// the marker `"struct"`. Values stored in `typedefs` are already
    /// collapsed, so one hop suffices.
    fn resolve_chain(&self, ty: &str) -> String {
        match self.typedefs.get(ty) {
            Some(resolved) => resolved.clone(),
            None => ty.to_string(),
        }
    }

    fn struct_members(&self, declared_ty: &str) -> Option<&Vec<Param>> {
        self.struct_defs.get(declared_ty)
    }

    // -------- top level --------

    pub fn parse(&mut self) -> Result<Program> {
        self.scopes.push(HashMap::new());
        let mut items = Vec::new();
        while !self.check(TokenKind::Eof) {
            items.push(self.parse_item()?);
        }
        self.scopes.pop();
        debug_assert!(self.scopes.is_empty());
        Ok(Program { items })
    }

    fn parse_item(&mut self) -> Result<Item> {
        match self.current().kind {
            TokenKind::Header => self.parse_header(),
            TokenKind::Function => self.parse_function(),
            TokenKind::Typedef => self.parse_typedef(),
            TokenKind::Asm => {
                let lines = self.parse_inline_asm()?;
                Ok(Item::InlineAsm(lines))
            }
            _ if self.is_type_token(self.current()) => self.parse_global(false),
            _ => self.error("expected declaration"),
        }
    }

    fn parse_header(&mut self) -> Result<Item> {
        self.expect(TokenKind::Header, "expected 'header' keyword")?;
        self.expect(TokenKind::LBrace, "expected '{' after 'header'")?;

        let mut items = Vec::new();
        while !self.check(TokenKind::RBrace) && !self.check(TokenKind::Eof) {
            match self.current().kind {
                TokenKind::Function => {
                    items.push(self.parse_prototype_item()?);
                }
                TokenKind::Typedef => {
                    items.push(self.parse_typedef()?);
                }
                _ if self.is_type_token(self.current()) => {
                    items.push(self.parse_global(true)?);
                }
                _ => return self.error("expected prototype, typedef or global in header"),
            }
        }
        self.expect(TokenKind::RBrace, "expected '}' after header block")?;
        self.expect(TokenKind::Semicolon, "expected ';' after header block")?;
        Ok(Item::Header(items))
    }

    /// `function name(params) -> type` followed by `;` (prototype) or a
    /// brace-delimited body (definition).
    fn parse_function(&mut self) -> Result<Item> {
        self.expect(TokenKind::Function, "expected 'function' keyword")?;
        let name_tok = self.expect(TokenKind::Identifier, "expected function name")?;
        let name = name_tok.lexeme.clone();

        let params = self.parse_parameter_list()?;
        self.expect(TokenKind::Minus, "expected '->' after parameters")?;
        self.expect(TokenKind::Greater, "expected '->' after parameters")?;
        let return_type = self.parse_type_name("expected function return type")?;

        if self.check(TokenKind::Semicolon) {
            self.advance();
            self.existing_functions.insert(name.clone());
            self.prototypes.insert(name.clone());
            return Ok(Item::Prototype {
                name,
                return_type,
                params,
            });
        }

        if self.existing_functions.contains(&name) && !self.prototypes.contains(&name) {
            return Err(ParseError::at(&name_tok, "duplicated function name"));
        }
        self.existing_functions.insert(name.clone());

        self.scopes.push(HashMap::new());
        for param in &params {
            let param_tok = name_tok.clone();
            self.declare_variable(&param_tok, &param.name, &param.ty)?;
        }
        self.expect(TokenKind::LBrace, "expected '{' before function body")?;
        let body = self.parse_block_body()?;
        self.scopes.pop();
        self.expect(TokenKind::Semicolon, "expected ';' after function definition")?;

        Ok(Item::Function {
            name,
            return_type,
            params,
            body,
        })
    }

    /// Prototype inside a header block; the body form is rejected.
    fn parse_prototype_item(&mut self) -> Result<Item> {
        self.expect(TokenKind::Function, "expected 'function' keyword")?;
        let name = self
            .expect(TokenKind::Identifier, "expected function name")?
            .lexeme;
        let params = self.parse_parameter_list()?;
        self.expect(TokenKind::Minus, "expected '->' after parameters")?;
        self.expect(TokenKind::Greater, "expected '->' after parameters")?;
        let return_type = self.parse_type_name("expected function return type")?;
        self.expect(TokenKind::Semicolon, "expected ';' after function prototype")?;

        self.existing_functions.insert(name.clone());
        self.prototypes.insert(name.clone());
        Ok(Item::Prototype {
            name,
            return_type,
            params,
        })
    }

    fn parse_parameter_list(&mut self) -> Result<Vec<Param>> {
        self.expect(TokenKind::LParen, "expected '(' after function name")?;
        let mut params = Vec::new();
        if !self.check(TokenKind::RParen) {
            loop {
                let ty = self.parse_type_name("expected parameter type")?;
                let name = self
                    .expect(TokenKind::Identifier, "expected parameter name")?
                    .lexeme;
                params.push(Param { ty, name });
                if !self.check(TokenKind::Comma) {
                    break;
                }
                self.advance();
            }
        }
        self.expect(TokenKind::RParen, "expected ')' after parameters")?;
        Ok(params)
    }

    fn parse_type_name(&mut self, message: &str) -> Result<String> {
        if self.is_type_token(self.current()) {
            let tok = self.advance();
            Ok(tok.symbol().to_string())
        } else {
            self.error(message)
        }
    }

    fn parse_typedef(&mut self) -> Result<Item> {
        self.expect(TokenKind::Typedef, "expected 'typedef' keyword")?;

        let kind = if self.check(TokenKind::Struct) {
            TypedefKind::Struct(self.parse_struct_body()?)
        } else {
            TypedefKind::Alias(self.parse_type_name("expected type after 'typedef'")?)
        };

        let name_tok = self.expect(TokenKind::Identifier, "expected typedef name")?;
        let name = name_tok.lexeme.clone();
        if self.existing_types.contains(&name) {
            return Err(ParseError::at(&name_tok, "cannot redefine type"));
        }
        if self.is_declared(&name) {
            return Err(ParseError::at(&name_tok, "type name collides with a variable"));
        }
        self.expect(TokenKind::Semicolon, "expected ';' after typedef")?;

        self.existing_types.insert(name.clone());
        match &kind {
            TypedefKind::Struct(members) => {
                self.typedefs.insert(name.clone(), "struct".to_string());
                self.struct_defs.insert(name.clone(), members.clone());
            }
            TypedefKind::Alias(old) => {
                let resolved = self.resolve_chain(old);
                if resolved == "struct" {
                    // carry the layout so the alias resolves to it too
                    if let Some(members) = self.struct_defs.get(old).cloned() {
                        self.struct_defs.insert(name.clone(), members);
                    }
                }
                self.typedefs.insert(name.clone(), resolved);
            }
        }

        Ok(Item::Typedef { name, kind })
    }

    fn parse_struct_body(&mut self) -> Result<Vec<Param>> {
        self.expect(TokenKind::Struct, "expected 'struct' keyword")?;
        self.expect(TokenKind::LBrace, "expected '{' after 'struct'")?;

        let mut members: Vec<Param> = Vec::new();
        while !self.check(TokenKind::RBrace) && !self.check(TokenKind::Eof) {
            let ty = self.parse_type_name("expected struct member type")?;
            let name_tok = self.expect(TokenKind::Identifier, "expected struct member name")?;
            if members.iter().any(|m| m.name == name_tok.lexeme) {
                return Err(ParseError::at(&name_tok, "duplicated struct member name"));
            }
            self.expect(TokenKind::Semicolon, "expected ';' after struct member")?;
            members.push(Param {
                ty,
                name: name_tok.lexeme,
            });
        }
        self.expect(TokenKind::RBrace, "expected '}' after struct members")?;
        Ok(members)
    }

    /// `type ('[' ']')? name (= expr)? ;` at top level or inside a header.
    /// Header globals may not carry an initializer.
    fn parse_global(&mut self, in_header: bool) -> Result<Item> {
        let ty = self.parse_type_name("expected global variable type")?;
        let by_addr = self.eat_by_addr_marker()?;
        let name_tok = self.expect(TokenKind::Identifier, "expected global variable name")?;
        let name = name_tok.lexeme.clone();

        let init = if self.check(TokenKind::Assign) {
            if in_header {
                return Err(ParseError::at(
                    self.current(),
                    "header does not allow global variable initialization",
                ));
            }
            self.advance();
            Some(self.parse_expression()?)
        } else {
            None
        };
        self.expect(TokenKind::Semicolon, "expected ';' after global variable")?;

        self.declare_variable(&name_tok, &name, &ty)?;
        Ok(Item::Global {
            ty,
            name,
            by_addr,
            init,
        })
    }

    fn eat_by_addr_marker(&mut self) -> Result<bool> {
        if self.check(TokenKind::LBracket) {
            self.advance();
            self.expect(TokenKind::RBracket, "expected ']' in by-address declaration")?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn parse_inline_asm(&mut self) -> Result<Vec<String>> {
        self.expect(TokenKind::Asm, "expected 'asm' keyword")?;
        self.expect(TokenKind::Semicolon, "expected ';' after asm block")?;
        let block = self.asm_blocks.get(self.asm_index).ok_or_else(|| {
            ParseError::at(self.current(), "asm marker without a captured block")
        })?;
        self.asm_index += 1;
        Ok(block.lines.clone())
    }

    // -------- statements --------

    /// Body of a block whose `{` has already been consumed. Pushes and pops
    /// a scope frame; consumes the closing `}`.
    fn parse_block_body(&mut self) -> Result<Block> {
        self.scopes.push(HashMap::new());
        let mut statements = Vec::new();
        while !self.check(TokenKind::RBrace) && !self.check(TokenKind::Eof) {
            statements.push(self.parse_statement()?);
        }
        self.expect(TokenKind::RBrace, "expected '}' after block")?;
        self.scopes.pop();
        Ok(Block { statements })
    }

    fn parse_block(&mut self) -> Result<Block> {
        self.expect(TokenKind::LBrace, "expected '{'")?;
        self.parse_block_body()
    }

    fn parse_statement(&mut self) -> Result<Stmt> {
        // declarations first: known type followed by a name (or the
        // by-address marker)
        if self.is_type_token(self.current())
            && matches!(
                self.peek(1).kind,
                TokenKind::Identifier | TokenKind::LBracket
            )
        {
            return self.parse_var_decl();
        }

        match self.current().kind {
            TokenKind::While => self.parse_while(),
            TokenKind::If => {
                let stmt = self.parse_if_chain()?;
                self.expect(TokenKind::Semicolon, "expected ';' after if statement")?;
                Ok(stmt)
            }
            TokenKind::Return => self.parse_return(),
            TokenKind::Switch => self.parse_switch(),
            TokenKind::Continue => {
                self.advance();
                self.expect(TokenKind::Semicolon, "expected ';' after 'continue'")?;
                Ok(Stmt::Continue)
            }
            TokenKind::Break => {
                self.advance();
                self.expect(TokenKind::Semicolon, "expected ';' after 'break'")?;
                Ok(Stmt::Break)
            }
            TokenKind::Asm => {
                let lines = self.parse_inline_asm()?;
                Ok(Stmt::InlineAsm(lines))
            }
            TokenKind::LBrace => {
                let block = self.parse_block()?;
                self.expect(TokenKind::Semicolon, "expected ';' after block")?;
                Ok(Stmt::Block(block))
            }
            TokenKind::Identifier => self.parse_identifier_statement(),
            TokenKind::LBracket => self.parse_memory_assign(),
            _ => {
                let expr = self.parse_expression()?;
                self.expect(TokenKind::Semicolon, "expected ';' after expression")?;
                Ok(Stmt::Expr(expr))
            }
        }
    }

    fn parse_var_decl(&mut self) -> Result<Stmt> {
        let ty = self.parse_type_name("expected variable type")?;
        let by_addr = self.eat_by_addr_marker()?;
        let name_tok = self.expect(TokenKind::Identifier, "expected variable name")?;
        let name = name_tok.lexeme.clone();

        let init = match self.current().kind {
            TokenKind::Semicolon => None,
            TokenKind::Assign => {
                self.advance();
                Some(self.parse_expression()?)
            }
            _ => {
                return self.error("expected ';' or '=' after variable declaration");
            }
        };
        self.expect(TokenKind::Semicolon, "expected ';' after variable declaration")?;

        self.declare_variable(&name_tok, &name, &ty)?;
        Ok(Stmt::VarDecl {
            ty,
            name,
            by_addr,
            init,
        })
    }

    /// Statement starting with an identifier: increment, decrement,
    /// assignment, index assignment, member assignment, or a call.
    fn parse_identifier_statement(&mut self) -> Result<Stmt> {
        let name = self.current().lexeme.clone();

        if self.is_declared(&name) {
            match (self.peek(1).kind, self.peek(2).kind) {
                (TokenKind::Plus, TokenKind::Plus) => {
                    self.advance();
                    self.advance();
                    self.advance();
                    self.expect(TokenKind::Semicolon, "expected ';' after increment")?;
                    Ok(Stmt::Increment(name))
                }
                (TokenKind::Minus, TokenKind::Minus) => {
                    self.advance();
                    self.advance();
                    self.advance();
                    self.expect(TokenKind::Semicolon, "expected ';' after decrement")?;
                    Ok(Stmt::Decrement(name))
                }
                (TokenKind::Minus, TokenKind::Greater) => {
                    self.advance();
                    let target = self.parse_member_chain(name)?;
                    self.expect(TokenKind::Assign, "expected '=' after member access")?;
                    let value = self.parse_expression()?;
                    self.expect(TokenKind::Semicolon, "expected ';' after assignment")?;
                    Ok(Stmt::MemberAssign { target, value })
                }
                (TokenKind::Assign, _) => {
                    self.advance();
                    self.advance();
                    let value = self.parse_expression()?;
                    self.expect(TokenKind::Semicolon, "expected ';' after assignment")?;
                    Ok(Stmt::Assign { name, value })
                }
                (TokenKind::LBracket, _) => {
                    self.advance();
                    self.advance();
                    let index = self.parse_expression()?;
                    self.expect(TokenKind::RBracket, "expected ']' after index")?;
                    self.expect(TokenKind::Assign, "expected '=' after index")?;
                    let value = self.parse_expression()?;
                    self.expect(TokenKind::Semicolon, "expected ';' after assignment")?;
                    Ok(Stmt::IndexAssign { name, index, value })
                }
                _ => self.error("unexpected token after identifier"),
            }
        } else if self.existing_functions.contains(&name) {
            self.advance();
            let args = self.parse_call_arguments()?;
            self.expect(TokenKind::Semicolon, "expected ';' after function call")?;
            Ok(Stmt::Call { name, args })
        } else {
            self.error("undefined variable or function name")
        }
    }

    /// `[ name ] = expr ;`
    fn parse_memory_assign(&mut self) -> Result<Stmt> {
        self.expect(TokenKind::LBracket, "expected '['")?;
        let name_tok = self.expect(TokenKind::Identifier, "expected variable name")?;
        if !self.is_declared(&name_tok.lexeme) {
            return Err(ParseError::at(&name_tok, "undefined variable name"));
        }
        self.expect(TokenKind::RBracket, "expected ']' after variable name")?;
        self.expect(TokenKind::Assign, "expected '=' after memory address")?;
        let value = self.parse_expression()?;
        self.expect(TokenKind::Semicolon, "expected ';' after memory assignment")?;
        Ok(Stmt::MemoryAssign {
            name: name_tok.lexeme,
            value,
        })
    }

    fn parse_while(&mut self) -> Result<Stmt> {
        self.expect(TokenKind::While, "expected 'while' keyword")?;
        self.expect(TokenKind::LParen, "expected '(' after 'while'")?;
        let cond = self.parse_expression()?;
        self.expect(TokenKind::RParen, "expected ')' after while condition")?;
        let body = self.parse_block()?;
        self.expect(TokenKind::Semicolon, "expected ';' after while block")?;
        Ok(Stmt::While { cond, body })
    }

    /// An `if` with optional `else`/`else if` chain. The single trailing
    /// `;` that terminates the whole chain is left to the caller.
    fn parse_if_chain(&mut self) -> Result<Stmt> {
        self.expect(TokenKind::If, "expected 'if' keyword")?;
        self.expect(TokenKind::LParen, "expected '(' after 'if'")?;
        let cond = self.parse_expression()?;
        self.expect(TokenKind::RParen, "expected ')' after if condition")?;
        let then_branch = self.parse_block()?;

        let else_branch = if self.check(TokenKind::Else) {
            self.advance();
            if self.check(TokenKind::If) {
                Some(Box::new(self.parse_if_chain()?))
            } else {
                Some(Box::new(Stmt::Block(self.parse_block()?)))
            }
        } else {
            None
        };

        Ok(Stmt::If {
            cond,
            then_branch,
            else_branch,
        })
    }

    fn parse_return(&mut self) -> Result<Stmt> {
        self.expect(TokenKind::Return, "expected 'return' keyword")?;
        let value = if self.check(TokenKind::Semicolon) {
            None
        } else {
            Some(self.parse_expression()?)
        };
        self.expect(TokenKind::Semicolon, "expected ';' after return statement")?;
        Ok(Stmt::Return(value))
    }

    fn parse_switch(&mut self) -> Result<Stmt> {
        self.expect(TokenKind::Switch, "expected 'switch' keyword")?;
        self.expect(TokenKind::LParen, "expected '(' after 'switch'")?;
        let scrutinee = self.parse_expression()?;
        self.expect(TokenKind::RParen, "expected ')' after switch condition")?;
        self.expect(TokenKind::LBrace, "expected '{' after switch condition")?;

        let mut cases = Vec::new();
        while !self.check(TokenKind::RBrace) && !self.check(TokenKind::Eof) {
            if self.check(TokenKind::Default) {
                self.advance();
                let body = self.parse_block()?;
                self.expect(TokenKind::Semicolon, "expected ';' after default block")?;
                cases.push(SwitchCase { value: None, body });
                break;
            }
            self.expect(TokenKind::Case, "expected 'case' or 'default'")?;
            self.expect(TokenKind::LParen, "expected '(' after 'case'")?;
            let value = self.parse_expression()?;
            self.expect(TokenKind::RParen, "expected ')' after case value")?;
            let body = self.parse_block()?;
            self.expect(TokenKind::Semicolon, "expected ';' after case block")?;
            cases.push(SwitchCase {
                value: Some(value),
                body,
            });
        }
        self.expect(TokenKind::RBrace, "expected '}' after switch body")?;
        self.expect(TokenKind::Semicolon, "expected ';' after switch body")?;
        Ok(Stmt::Switch { scrutinee, cases })
    }

    // -------- member chains --------

    /// Parse and validate `-> m1 -> m2 ...` after `base_name`. The caller
    /// has consumed the base identifier; the current token is the `-`.
    fn parse_member_chain(&mut self, base_name: String) -> Result<Expr> {
        let base_ty = match self.declared_type(&base_name) {
            Some(ty) => ty.clone(),
            None => return self.error("undefined variable name"),
        };

        let mut expr = Expr::Ident(base_name);
        let mut current_ty = base_ty;

        while self.check(TokenKind::Minus) && self.peek(1).kind == TokenKind::Greater {
            self.advance();
            self.advance();
            let member_tok = self.expect(TokenKind::Identifier, "expected member name after '->'")?;

            let members = match self.struct_members(&current_ty) {
                Some(members) => members,
                None => {
                    return Err(ParseError::at(
                        &member_tok,
                        format!("type '{}' is not a struct", current_ty),
                    ));
                }
            };
            let member = match members.iter().find(|m| m.name == member_tok.lexeme) {
                Some(member) => member,
                None => {
                    return Err(ParseError::at(
                        &member_tok,
                        format!("unknown struct member in type '{}'", current_ty),
                    ));
                }
            };
            current_ty = member.ty.clone();
            expr = Expr::Member(Box::new(expr), member_tok.lexeme);
        }

        Ok(expr)
    }

    // -------- expressions --------

    pub fn parse_expression(&mut self) -> Result<Expr> {
        self.parse_logical_or()
    }

    fn parse_logical_or(&mut self) -> Result<Expr> {
        let mut left = self.parse_logical_and()?;
        while self.check(TokenKind::Pipe) && self.peek(1).kind != TokenKind::Pipe {
            self.advance();
            let right = self.parse_logical_and()?;
            left = Expr::Binary(BinOp::Or, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_logical_and(&mut self) -> Result<Expr> {
        let mut left = self.parse_equality()?;
        while self.check(TokenKind::Ampersand) && self.peek(1).kind != TokenKind::Ampersand {
            self.advance();
            let right = self.parse_equality()?;
            left = Expr::Binary(BinOp::And, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<Expr> {
        let mut left = self.parse_relational()?;
        loop {
            let op = match self.current().kind {
                TokenKind::Equal => BinOp::Eq,
                TokenKind::NotEqual => BinOp::Ne,
                _ => break,
            };
            self.advance();
            let right = self.parse_relational()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_relational(&mut self) -> Result<Expr> {
        let mut left = self.parse_bitwise()?;
        loop {
            let op = match self.current().kind {
                TokenKind::Less => BinOp::Lt,
                TokenKind::LessEqual => BinOp::Le,
                TokenKind::Greater => BinOp::Gt,
                TokenKind::GreaterEqual => BinOp::Ge,
                _ => break,
            };
            self.advance();
            let right = self.parse_bitwise()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    /// `&&` and `||` are two adjacent tokens; both are consumed here and
    /// the operator recorded is the one actually seen.
    fn parse_bitwise(&mut self) -> Result<Expr> {
        let mut left = self.parse_additive()?;
        loop {
            let op = match (self.current().kind, self.peek(1).kind) {
                (TokenKind::Ampersand, TokenKind::Ampersand) => BinOp::BitAnd,
                (TokenKind::Pipe, TokenKind::Pipe) => BinOp::BitOr,
                _ => break,
            };
            self.advance();
            self.advance();
            let right = self.parse_additive()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<Expr> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.current().kind {
                TokenKind::Plus => BinOp::Add,
                TokenKind::Minus => BinOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.parse_multiplicative()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.current().kind {
                TokenKind::Star => BinOp::Mul,
                TokenKind::Slash => BinOp::Div,
                TokenKind::Percent => BinOp::Mod,
                _ => break,
            };
            self.advance();
            let right = self.parse_unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        let op = match self.current().kind {
            TokenKind::Bang => UnOp::Not,
            TokenKind::Minus => UnOp::Neg,
            _ => return self.parse_primary(),
        };
        self.advance();
        let operand = self.parse_unary()?;
        Ok(Expr::Unary(op, Box::new(operand)))
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.current().kind {
            TokenKind::Number => {
                let tok = self.advance();
                Ok(Expr::Literal(tok.lexeme))
            }
            TokenKind::Str => {
                let tok = self.advance();
                Ok(Expr::Str(tok.lexeme))
            }
            TokenKind::LParen => {
                self.advance();
                let expr = self.parse_expression()?;
                self.expect(TokenKind::RParen, "expected ')' after expression")?;
                Ok(expr)
            }
            TokenKind::LBracket => {
                self.advance();
                let name_tok = self.expect(TokenKind::Identifier, "expected variable name")?;
                if !self.is_declared(&name_tok.lexeme) {
                    return Err(ParseError::at(&name_tok, "undefined variable name"));
                }
                self.expect(TokenKind::RBracket, "expected ']' after variable name")?;
                Ok(Expr::MemoryAddress(name_tok.lexeme))
            }
            TokenKind::Identifier => self.parse_identifier_expr(),
            _ => self.error("expected expression"),
        }
    }

    fn parse_identifier_expr(&mut self) -> Result<Expr> {
        let name_tok = self.advance();
        let name = name_tok.lexeme.clone();

        if self.check(TokenKind::LBracket) {
            if !self.is_declared(&name) {
                return Err(ParseError::at(&name_tok, "undefined variable name"));
            }
            self.advance();
            let index = self.parse_expression()?;
            self.expect(TokenKind::RBracket, "expected ']' after array index")?;
            return Ok(Expr::Index(name, Box::new(index)));
        }

        if self.check(TokenKind::Minus) && self.peek(1).kind == TokenKind::Greater {
            return self.parse_member_chain(name);
        }

        if self.is_declared(&name) {
            Ok(Expr::Ident(name))
        } else if self.existing_functions.contains(&name) {
            let args = self.parse_call_arguments()?;
            Ok(Expr::Call(name, args))
        } else {
            Err(ParseError::at(&name_tok, "undefined variable or function name"))
        }
    }

    fn parse_call_arguments(&mut self) -> Result<Vec<Expr>> {
        self.expect(TokenKind::LParen, "expected '(' after function name")?;
        let mut args = Vec::new();
        if !self.check(TokenKind::RParen) {
            loop {
                args.push(self.parse_expression()?);
                if !self.check(TokenKind::Comma) {
                    break;
                }
                self.advance();
            }
        }
        self.expect(TokenKind::RParen, "expected ')' after arguments")?;
        Ok(args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::Lexer;
    use crate::preprocess::Preprocessor;

    fn parse(code: &str) -> Result<Program> {
        let mut pp = Preprocessor::new();
        let processed = pp.process(code, "test.ent").expect("preprocess");
        let mut lexer = Lexer::new(&processed);
        let tokens = lexer.tokenize().expect("lex");
        let mut parser = Parser::new(tokens, pp.take_asm_blocks());
        parser.parse()
    }

    fn parse_with_tables(
        code: &str,
    ) -> (Program, HashMap<String, String>, IndexMap<String, Vec<Param>>) {
        let mut lexer = Lexer::new(code);
        let tokens = lexer.tokenize().expect("lex");
        let mut parser = Parser::new(tokens, Vec::new());
        let program = parser.parse().expect("parse");
        let (typedefs, structs) = parser.into_tables();
        (program, typedefs, structs)
    }

    #[test]
    fn test_minimal_function() {
        let program = parse("function main() -> int32 { return 0; };").unwrap();
        assert_eq!(program.items.len(), 1);
        match &program.items[0] {
            Item::Function {
                name, return_type, ..
            } => {
                assert_eq!(name, "main");
                assert_eq!(return_type, "int32");
            }
            other => panic!("expected function, got {:?}", other),
        }
    }

    #[test]
    fn test_local_decl_and_assign() {
        let program = parse(
            "function main() -> int32 {\n  int32 x = 5;\n  x = x + 3;\n  return x;\n};",
        )
        .unwrap();
        let body = match &program.items[0] {
            Item::Function { body, .. } => body,
            _ => unreachable!(),
        };
        assert_eq!(body.statements.len(), 3);
        assert!(matches!(
            body.statements[0],
            Stmt::VarDecl { init: Some(_), .. }
        ));
        assert!(matches!(body.statements[1], Stmt::Assign { .. }));
        assert!(matches!(body.statements[2], Stmt::Return(Some(_))));
    }

    #[test]
    fn test_typedef_chain_and_struct_tables() {
        let (_, typedefs, structs) = parse_with_tables(
            "typedef struct { int32 a; int32 b; } Pair;\n\
             typedef Pair P;\n\
             function sum(P p) -> int32 { return p->a + p->b; };",
        );
        assert_eq!(typedefs.get("Pair").map(String::as_str), Some("struct"));
        assert_eq!(typedefs.get("P").map(String::as_str), Some("struct"));
        let members: Vec<&str> = structs["Pair"].iter().map(|m| m.name.as_str()).collect();
        assert_eq!(members, vec!["a", "b"]);
        assert!(structs.contains_key("P"));
    }

    #[test]
    fn test_typedef_alias_collapses_to_builtin() {
        let (_, typedefs, _) =
            parse_with_tables("typedef int32 word;\ntypedef word cell;");
        assert_eq!(typedefs.get("word").map(String::as_str), Some("int32"));
        assert_eq!(typedefs.get("cell").map(String::as_str), Some("int32"));
    }

    #[test]
    fn test_redefine_type_is_error() {
        assert!(parse("typedef int32 int8;").is_err());
        assert!(parse("typedef int32 word;\ntypedef int64 word;").is_err());
    }

    #[test]
    fn test_duplicate_function_is_error() {
        let code = "function f() -> int32 { return 0; };\n\
                    function f() -> int32 { return 1; };";
        assert!(parse(code).is_err());
    }

    #[test]
    fn test_prototype_then_definition_is_allowed() {
        let code = "function f() -> int32;\n\
                    function f() -> int32 { return 1; };";
        assert!(parse(code).is_ok());
    }

    #[test]
    fn test_header_block() {
        let program = parse(
            "header {\n\
               function visible() -> int32;\n\
               typedef int32 word;\n\
               uint64 heap_base;\n\
             };\n\
             function main() -> int32 { return visible(); };",
        )
        .unwrap();
        match &program.items[0] {
            Item::Header(items) => assert_eq!(items.len(), 3),
            other => panic!("expected header, got {:?}", other),
        }
    }

    #[test]
    fn test_header_global_init_is_error() {
        assert!(parse("header { int32 x = 1; };").is_err());
    }

    #[test]
    fn test_undeclared_variable_is_error() {
        assert!(parse("function f() -> int32 { return y; };").is_err());
    }

    #[test]
    fn test_unknown_call_is_error() {
        assert!(parse("function f() -> int32 { g(); return 0; };").is_err());
    }

    #[test]
    fn test_duplicate_var_in_same_scope_is_error() {
        assert!(parse("function f() -> int32 { int32 x; int32 x; return 0; };").is_err());
    }

    #[test]
    fn test_shadowing_in_inner_block_is_allowed() {
        let code = "function f() -> int32 {\n\
                      int32 x = 1;\n\
                      { int32 x = 2; x = 3; };\n\
                      return x;\n\
                    };";
        assert!(parse(code).is_ok());
    }

    #[test]
    fn test_inner_declaration_not_visible_outside() {
        let code = "function f() -> int32 {\n\
                      { int32 x = 2; };\n\
                      return x;\n\
                    };";
        assert!(parse(code).is_err());
    }

    #[test]
    fn test_increment_decrement_and_index_assign() {
        let program = parse(
            "function f() -> int32 {\n\
               int64 p = 0;\n\
               p++;\n\
               p--;\n\
               p[2] = 7;\n\
               [p] = 9;\n\
               return 0;\n\
             };",
        )
        .unwrap();
        let body = match &program.items[0] {
            Item::Function { body, .. } => body,
            _ => unreachable!(),
        };
        assert!(matches!(body.statements[1], Stmt::Increment(_)));
        assert!(matches!(body.statements[2], Stmt::Decrement(_)));
        assert!(matches!(body.statements[3], Stmt::IndexAssign { .. }));
        assert!(matches!(body.statements[4], Stmt::MemoryAssign { .. }));
    }

    #[test]
    fn test_member_assign_chain() {
        let code = "typedef struct { int32 x; int32 y; } Point;\n\
                    typedef struct { Point origin; int32 id; } Shape;\n\
                    function f(Shape s) -> int32 {\n\
                      s->origin->x = 3;\n\
                      return s->id;\n\
                    };";
        let program = parse(code).unwrap();
        let body = match &program.items[2] {
            Item::Function { body, .. } => body,
            _ => unreachable!(),
        };
        match &body.statements[0] {
            Stmt::MemberAssign { target, .. } => {
                assert!(matches!(target, Expr::Member(_, member) if member == "x"));
            }
            other => panic!("expected member assign, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_struct_member_is_error() {
        let code = "typedef struct { int32 a; } S;\n\
                    function f(S s) -> int32 { return s->b; };";
        assert!(parse(code).is_err());
    }

    #[test]
    fn test_member_access_on_non_struct_is_error() {
        let code = "function f(int32 x) -> int32 { return x->a; };";
        assert!(parse(code).is_err());
    }

    #[test]
    fn test_duplicate_struct_member_is_error() {
        assert!(parse("typedef struct { int32 a; int32 a; } S;").is_err());
    }

    #[test]
    fn test_precedence_shape() {
        let program = parse(
            "function f(int32 a, int32 b) -> int32 { return a + b * 2; };",
        )
        .unwrap();
        let body = match &program.items[0] {
            Item::Function { body, .. } => body,
            _ => unreachable!(),
        };
        match &body.statements[0] {
            Stmt::Return(Some(Expr::Binary(BinOp::Add, _, rhs))) => {
                assert!(matches!(**rhs, Expr::Binary(BinOp::Mul, _, _)));
            }
            other => panic!("unexpected return shape: {:?}", other),
        }
    }

    #[test]
    fn test_double_tokens_are_bitwise_ops() {
        let program = parse(
            "function f(int32 a, int32 b) -> int32 { return a && b || a; };",
        )
        .unwrap();
        let body = match &program.items[0] {
            Item::Function { body, .. } => body,
            _ => unreachable!(),
        };
        match &body.statements[0] {
            Stmt::Return(Some(Expr::Binary(op, _, _))) => {
                assert_eq!(*op, BinOp::BitOr);
            }
            other => panic!("unexpected return shape: {:?}", other),
        }
    }

    #[test]
    fn test_single_tokens_are_logical_ops() {
        let program = parse(
            "function f(int32 a, int32 b) -> int32 { return a & b | a; };",
        )
        .unwrap();
        let body = match &program.items[0] {
            Item::Function { body, .. } => body,
            _ => unreachable!(),
        };
        match &body.statements[0] {
            Stmt::Return(Some(Expr::Binary(BinOp::Or, lhs, _))) => {
                assert!(matches!(**lhs, Expr::Binary(BinOp::And, _, _)));
            }
            other => panic!("unexpected return shape: {:?}", other),
        }
    }

    #[test]
    fn test_while_with_if_and_break() {
        let code = "function loop() -> int32 {\n\
                      int32 i = 0;\n\
                      while (i < 10) { if (i == 5) { break; }; i = i + 1; };\n\
                      return i;\n\
                    };";
        assert!(parse(code).is_ok());
    }

    #[test]
    fn test_else_if_chain() {
        let code = "function f(int32 x) -> int32 {\n\
                      if (x == 1) { return 1; } else if (x == 2) { return 2; } else { return 3; };\n\
                    };";
        let program = parse(code).unwrap();
        let body = match &program.items[0] {
            Item::Function { body, .. } => body,
            _ => unreachable!(),
        };
        match &body.statements[0] {
            Stmt::If {
                else_branch: Some(else_stmt),
                ..
            } => assert!(matches!(**else_stmt, Stmt::If { .. })),
            other => panic!("expected if with else, got {:?}", other),
        }
    }

    #[test]
    fn test_switch_cases_and_default() {
        let code = "function f(int32 x) -> int32 {\n\
                      int32 r = 0;\n\
                      switch (x) {\n\
                        case (1) { r = 10; };\n\
                        case (2) { r = 20; };\n\
                        default { r = 30; };\n\
                      };\n\
                      return r;\n\
                    };";
        let program = parse(code).unwrap();
        let body = match &program.items[0] {
            Item::Function { body, .. } => body,
            _ => unreachable!(),
        };
        match &body.statements[1] {
            Stmt::Switch { cases, .. } => {
                assert_eq!(cases.len(), 3);
                assert!(cases[0].value.is_some());
                assert!(cases[2].value.is_none());
            }
            other => panic!("expected switch, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_trailing_semicolon_is_error() {
        assert!(parse("function main() -> int32 { return 0; }").is_err());
    }

    #[test]
    fn test_inline_asm_pairing() {
        let code = "function f() -> int32 {\n\
                      asm {\n\
                        mov rax, 60\n\
                        syscall\n\
                      };\n\
                      return 0;\n\
                    };";
        let program = parse(code).unwrap();
        let body = match &program.items[0] {
            Item::Function { body, .. } => body,
            _ => unreachable!(),
        };
        match &body.statements[0] {
            Stmt::InlineAsm(lines) => {
                assert_eq!(lines, &vec!["mov rax, 60".to_string(), "syscall".to_string()]);
            }
            other => panic!("expected inline asm, got {:?}", other),
        }
    }

    #[test]
    fn test_single_line_asm_statement() {
        let code = "function f() -> int32 {\n\
                      asm { syscall };\n\
                      return 0;\n\
                    };";
        let program = parse(code).unwrap();
        let body = match &program.items[0] {
            Item::Function { body, .. } => body,
            _ => unreachable!(),
        };
        match &body.statements[0] {
            Stmt::InlineAsm(lines) => assert_eq!(lines, &vec!["syscall".to_string()]),
            other => panic!("expected inline asm, got {:?}", other),
        }
        assert!(matches!(body.statements[1], Stmt::Return(Some(_))));
    }

    #[test]
    fn test_variable_name_colliding_with_type_is_error() {
        assert!(parse("typedef int32 word;\nfunction f() -> int32 { int32 word; return 0; };").is_err());
    }

    #[test]
    fn test_global_declarations() {
        let program = parse("int32 counter;\nint64 base = 4096;\nuint8 [] flag;").unwrap();
        assert_eq!(program.items.len(), 3);
        assert!(matches!(
            program.items[1],
            Item::Global { init: Some(_), .. }
        ));
        assert!(matches!(
            program.items[2],
            Item::Global { by_addr: true, .. }
        ));
    }

    #[test]
    fn test_call_with_arguments() {
        let code = "function add(int32 a, int32 b) -> int32 { return a + b; };\n\
                    function main() -> int32 { return add(1, 2); };";
        assert!(parse(code).is_ok());
    }

    #[test]
    fn test_pretty_print_round_trip() {
        let code = "header { function write_byte(int32 b) -> void; };\n\
                    typedef struct { int32 x; int32 y; } Point;\n\
                    typedef Point Pt;\n\
                    int64 base = 4096;\n\
                    uint8 [] flag;\n\
                    function f(Pt p, int32 n) -> int32 {\n\
                      int32 i = 0;\n\
                      int64 q = base;\n\
                      while (i < n) {\n\
                        if (i == 5) { break; } else { i = i + 1; };\n\
                        continue;\n\
                      };\n\
                      i++;\n\
                      q[2] = 7;\n\
                      [q] = p->x;\n\
                      p->y = -i;\n\
                      switch (i) {\n\
                        case (1) { write_byte(1); };\n\
                        default { write_byte(i * 2 + p->x); };\n\
                      };\n\
                      asm {\n\
                        mov rax, 60\n\
                        syscall\n\
                      };\n\
                      return !i & (q == base);\n\
                    };";
        let first = parse(code).unwrap();
        let second = parse(&first.pretty()).unwrap();
        assert_eq!(first, second);
    }
}
