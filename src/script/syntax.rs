//! Lexer and parser for the statement subset diagram scripts are written in.

use super::ScriptError;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Name(String),
    Str(String),
    Int(i64),
    Float(f64),
    Op(&'static str),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Name(String),
    Attr(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Call {
        func: Box<Expr>,
        args: Vec<Expr>,
        kwargs: Vec<(String, Expr)>,
    },
    List(Vec<Expr>),
    Tuple(Vec<Expr>),
    Dict(Vec<(Expr, Expr)>),
    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    Neg(Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    Name(String),
    Attr(Expr, String),
    Index(Expr, Expr),
    Tuple(Vec<Target>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Import {
    pub module: String,
    pub name: Option<String>,
    pub alias: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    Expr(Expr),
    Assign(Vec<Target>, Expr),
    Import(Vec<Import>),
    For {
        target: Target,
        iter: Expr,
        body: Vec<Stmt>,
    },
    With {
        context: Expr,
        alias: Option<String>,
        body: Vec<Stmt>,
    },
    Pass,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    pub line: usize,
    pub kind: StmtKind,
}

#[derive(Debug)]
struct Line {
    number: usize,
    indent: usize,
    tokens: Vec<Token>,
}

const UNSUPPORTED_KEYWORDS: [&str; 18] = [
    "if", "elif", "else", "while", "def", "class", "return", "try", "except", "finally", "lambda",
    "global", "nonlocal", "del", "assert", "raise", "yield", "async",
];

const OPERATORS: [&str; 22] = [
    "**", "//", "==", "!=", "<=", ">=", "+=", "-=", "*=", "/=", "->", "(", ")", "[", "]", "{",
    "}", ",", ":", ".", ";", "=",
];

const SINGLE_OPS: [&str; 8] = ["+", "-", "*", "/", "%", "<", ">", "@"];

/// Deepest expression tree or block nesting a script may use. Evaluation
/// recurses along the same shape, so this also bounds the interpreter's stack.
pub const MAX_NESTING: usize = 100;

fn syntax(line: usize, message: impl Into<String>) -> ScriptError {
    ScriptError::Syntax {
        line,
        message: message.into(),
    }
}

pub fn parse_program(source: &str) -> Result<Vec<Stmt>, ScriptError> {
    let lines = Lexer::new(source).lines()?;
    let mut idx = 0;
    let body = parse_block(&lines, &mut idx, 0, 0)?;
    if let Some(line) = lines.get(idx) {
        return Err(syntax(line.number, "unindent does not match any outer indentation level"));
    }
    Ok(body)
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
}

impl Lexer {
    fn new(source: &str) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn lines(mut self) -> Result<Vec<Line>, ScriptError> {
        let mut lines = Vec::new();
        while self.pos < self.chars.len() {
            let number = self.line;
            let mut indent = 0;
            while let Some(c) = self.peek() {
                match c {
                    ' ' => indent += 1,
                    '\t' => indent += 8 - indent % 8,
                    '\r' | '\x0c' => {}
                    _ => break,
                }
                self.pos += 1;
            }
            match self.peek() {
                None => break,
                Some('\n') => {
                    self.pos += 1;
                    self.line += 1;
                    continue;
                }
                Some('#') => {
                    self.skip_comment();
                    continue;
                }
                _ => {}
            }
            let tokens = self.line_tokens()?;
            if !tokens.is_empty() {
                lines.push(Line {
                    number,
                    indent,
                    tokens,
                });
            }
        }
        Ok(lines)
    }

    fn skip_comment(&mut self) {
        while let Some(c) = self.peek() {
            if c == '\n' {
                break;
            }
            self.pos += 1;
        }
    }

    fn line_tokens(&mut self) -> Result<Vec<Token>, ScriptError> {
        let mut tokens = Vec::new();
        let mut depth: usize = 0;
        while let Some(c) = self.peek() {
            match c {
                '\n' => {
                    self.pos += 1;
                    self.line += 1;
                    if depth == 0 {
                        break;
                    }
                }
                ' ' | '\t' | '\r' | '\x0c' => self.pos += 1,
                '#' => self.skip_comment(),
                '\\' if self.peek_at(1) == Some('\n') => {
                    self.pos += 2;
                    self.line += 1;
                }
                '\\' if self.peek_at(1) == Some('\r') && self.peek_at(2) == Some('\n') => {
                    self.pos += 3;
                    self.line += 1;
                }
                '"' | '\'' => tokens.push(Token::Str(self.string("")?)),
                c if c.is_ascii_digit()
                    || (c == '.' && self.peek_at(1).is_some_and(|n| n.is_ascii_digit())) =>
                {
                    tokens.push(self.number()?)
                }
                c if c.is_alphabetic() || c == '_' => {
                    let word = self.word();
                    if matches!(self.peek(), Some('"' | '\'')) {
                        if word.len() <= 2 && word.chars().all(|p| "rRbBuUfF".contains(p)) {
                            if word.contains(['f', 'F']) {
                                return Err(ScriptError::Unsupported {
                                    line: self.line,
                                    what: "f-strings".to_string(),
                                });
                            }
                            tokens.push(Token::Str(self.string(&word)?));
                            continue;
                        }
                    }
                    tokens.push(Token::Name(word));
                }
                _ => {
                    let op = self.operator()?;
                    match op {
                        "(" | "[" | "{" => depth += 1,
                        ")" | "]" | "}" => {
                            depth = depth
                                .checked_sub(1)
                                .ok_or_else(|| syntax(self.line, format!("unmatched '{op}'")))?;
                        }
                        _ => {}
                    }
                    tokens.push(Token::Op(op));
                }
            }
        }
        if depth > 0 {
            return Err(syntax(self.line, "unexpected end of input inside brackets"));
        }
        Ok(tokens)
    }

    fn word(&mut self) -> String {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' {
                self.pos += 1;
            } else {
                break;
            }
        }
        self.chars[start..self.pos].iter().collect()
    }

    fn number(&mut self) -> Result<Token, ScriptError> {
        let start = self.pos;
        let mut is_float = false;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() || c == '_' {
                self.pos += 1;
            } else if c == '.' && !is_float {
                is_float = true;
                self.pos += 1;
            } else if (c == 'e' || c == 'E')
                && self
                    .peek_at(1)
                    .is_some_and(|n| n.is_ascii_digit() || n == '-' || n == '+')
            {
                is_float = true;
                self.pos += 2;
            } else {
                break;
            }
        }
        let text: String = self.chars[start..self.pos].iter().filter(|c| **c != '_').collect();
        if is_float {
            text.parse::<f64>()
                .map(Token::Float)
                .map_err(|_| syntax(self.line, format!("invalid number '{text}'")))
        } else {
            text.parse::<i64>()
                .map(Token::Int)
                .map_err(|_| syntax(self.line, format!("invalid number '{text}'")))
        }
    }

    fn string(&mut self, prefix: &str) -> Result<String, ScriptError> {
        let raw = prefix.contains(['r', 'R']);
        let quote = self.peek().ok_or_else(|| syntax(self.line, "expected string"))?;
        let triple = self.peek_at(1) == Some(quote) && self.peek_at(2) == Some(quote);
        self.pos += if triple { 3 } else { 1 };
        let start_line = self.line;
        let mut out = String::new();
        loop {
            let Some(c) = self.peek() else {
                return Err(syntax(start_line, "unterminated string literal"));
            };
            if c == quote {
                if !triple {
                    self.pos += 1;
                    return Ok(out);
                }
                if self.peek_at(1) == Some(quote) && self.peek_at(2) == Some(quote) {
                    self.pos += 3;
                    return Ok(out);
                }
            }
            if c == '\n' {
                if !triple {
                    return Err(syntax(start_line, "unterminated string literal"));
                }
                self.line += 1;
            }
            if c == '\\' {
                let next = self.peek_at(1);
                if raw {
                    out.push('\\');
                    if let Some(next) = next {
                        out.push(next);
                        if next == '\n' {
                            self.line += 1;
                        }
                    }
                    self.pos += 2;
                    continue;
                }
                self.pos += 2;
                match next {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some('r') => out.push('\r'),
                    Some('\\') => out.push('\\'),
                    Some('\'') => out.push('\''),
                    Some('"') => out.push('"'),
                    Some('0') => out.push('\0'),
                    Some('\n') => self.line += 1,
                    Some(other) => {
                        // Unknown escapes are kept verbatim, as Python does.
                        out.push('\\');
                        out.push(other);
                    }
                    None => return Err(syntax(start_line, "unterminated string literal")),
                }
                continue;
            }
            out.push(c);
            self.pos += 1;
        }
    }

    fn operator(&mut self) -> Result<&'static str, ScriptError> {
        for op in OPERATORS {
            let len = op.len();
            let matches = op
                .chars()
                .enumerate()
                .all(|(i, ch)| self.peek_at(i) == Some(ch));
            if matches {
                self.pos += len;
                return Ok(op);
            }
        }
        let c = self.peek().unwrap_or('\0');
        for op in SINGLE_OPS {
            if op.starts_with(c) {
                self.pos += 1;
                return Ok(op);
            }
        }
        Err(syntax(self.line, format!("unexpected character '{c}'")))
    }
}

fn parse_block(lines: &[Line], idx: &mut usize, indent: usize, level: usize) -> Result<Vec<Stmt>, ScriptError> {
    if let Some(line) = lines.get(*idx).filter(|_| level > MAX_NESTING) {
        return Err(syntax(line.number, format!("blocks nested more than {MAX_NESTING} levels deep")));
    }
    let mut body = Vec::new();
    while let Some(line) = lines.get(*idx) {
        if line.indent < indent {
            break;
        }
        if line.indent > indent {
            return Err(syntax(line.number, "unexpected indent"));
        }
        *idx += 1;
        let mut parser = Parser {
            tokens: &line.tokens,
            pos: 0,
            line: line.number,
            depth: 0,
        };
        match parser.compound_header()? {
            Some(header) => {
                let inline = parser.rest_statements()?;
                let block = if !inline.is_empty() {
                    inline
                } else {
                    match lines.get(*idx) {
                        Some(next) if next.indent > indent => parse_block(lines, idx, next.indent, level + 1)?,
                        _ => return Err(syntax(line.number, "expected an indented block")),
                    }
                };
                body.push(header.into_stmt(line.number, block));
            }
            None => body.extend(parser.rest_statements()?),
        }
    }
    Ok(body)
}

enum Header {
    For(Target, Expr),
    With(Expr, Option<String>),
}

impl Header {
    fn into_stmt(self, line: usize, body: Vec<Stmt>) -> Stmt {
        let kind = match self {
            Header::For(target, iter) => StmtKind::For { target, iter, body },
            Header::With(context, alias) => StmtKind::With {
                context,
                alias,
                body,
            },
        };
        Stmt { line, kind }
    }
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    line: usize,
    /// Expression nesting so far, counting brackets, unary operators and
    /// every link of an operator or postfix chain.
    depth: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    fn peek_op(&self, op: &str) -> bool {
        matches!(self.peek(), Some(Token::Op(o)) if *o == op)
    }

    fn peek_name(&self, name: &str) -> bool {
        matches!(self.peek(), Some(Token::Name(n)) if n == name)
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if self.peek_op(op) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_op(&mut self, op: &str) -> Result<(), ScriptError> {
        if self.eat_op(op) {
            Ok(())
        } else {
            Err(self.unexpected(&format!("expected '{op}'")))
        }
    }

    fn expect_name(&mut self) -> Result<String, ScriptError> {
        match self.peek() {
            Some(Token::Name(name)) => {
                self.pos += 1;
                Ok(name.clone())
            }
            _ => Err(self.unexpected("expected a name")),
        }
    }

    fn unexpected(&self, context: &str) -> ScriptError {
        let found = match self.peek() {
            Some(Token::Name(n)) => format!("'{n}'"),
            Some(Token::Str(_)) => "string".to_string(),
            Some(Token::Int(i)) => i.to_string(),
            Some(Token::Float(f)) => f.to_string(),
            Some(Token::Op(op)) => format!("'{op}'"),
            None => "end of line".to_string(),
        };
        syntax(self.line, format!("{context}, found {found}"))
    }

    fn nest(&mut self) -> Result<(), ScriptError> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(syntax(
                self.line,
                format!("expression nested more than {MAX_NESTING} levels deep"),
            ));
        }
        Ok(())
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn compound_header(&mut self) -> Result<Option<Header>, ScriptError> {
        if self.peek_name("for") {
            self.pos += 1;
            let target = self.target_list()?;
            if !self.peek_name("in") {
                return Err(self.unexpected("expected 'in'"));
            }
            self.pos += 1;
            let iter = self.expr_list()?;
            self.expect_op(":")?;
            return Ok(Some(Header::For(target, iter)));
        }
        if self.peek_name("with") {
            self.pos += 1;
            let context = self.expr()?;
            let alias = if self.peek_name("as") {
                self.pos += 1;
                Some(self.expect_name()?)
            } else {
                None
            };
            if self.peek_op(",") {
                return Err(ScriptError::Unsupported {
                    line: self.line,
                    what: "multiple context managers in one 'with'".to_string(),
                });
            }
            self.expect_op(":")?;
            return Ok(Some(Header::With(context, alias)));
        }
        Ok(None)
    }

    fn rest_statements(&mut self) -> Result<Vec<Stmt>, ScriptError> {
        let mut out = Vec::new();
        while !self.at_end() {
            if self.eat_op(";") {
                continue;
            }
            out.push(Stmt {
                line: self.line,
                kind: self.simple_statement()?,
            });
            if !self.at_end() && !self.eat_op(";") {
                return Err(self.unexpected("expected end of statement"));
            }
        }
        Ok(out)
    }

    fn simple_statement(&mut self) -> Result<StmtKind, ScriptError> {
        if let Some(Token::Name(word)) = self.peek() {
            match word.as_str() {
                "pass" => {
                    self.pos += 1;
                    return Ok(StmtKind::Pass);
                }
                "import" => {
                    self.pos += 1;
                    return self.import();
                }
                "from" => {
                    self.pos += 1;
                    return self.from_import();
                }
                "for" | "with" => {
                    return Err(syntax(self.line, "compound statement must start a line"));
                }
                w if UNSUPPORTED_KEYWORDS.contains(&w) => {
                    return Err(ScriptError::Unsupported {
                        line: self.line,
                        what: format!("'{w}' statements"),
                    });
                }
                _ => {}
            }
        }

        let first = self.expr_list()?;
        if !self.peek_op("=") {
            if let Some(Token::Op(op)) = self.peek() {
                if op.ends_with('=') && *op != "==" {
                    return Err(ScriptError::Unsupported {
                        line: self.line,
                        what: format!("augmented assignment '{op}'"),
                    });
                }
            }
            return Ok(StmtKind::Expr(first));
        }

        let mut targets = vec![self.to_target(first)?];
        let mut value;
        loop {
            self.expect_op("=")?;
            value = self.expr_list()?;
            if self.peek_op("=") {
                targets.push(self.to_target(value)?);
                continue;
            }
            break;
        }
        Ok(StmtKind::Assign(targets, value))
    }

    fn dotted_name(&mut self) -> Result<String, ScriptError> {
        let mut name = self.expect_name()?;
        while self.eat_op(".") {
            name.push('.');
            name.push_str(&self.expect_name()?);
        }
        Ok(name)
    }

    fn import(&mut self) -> Result<StmtKind, ScriptError> {
        let mut imports = Vec::new();
        loop {
            let module = self.dotted_name()?;
            let alias = if self.peek_name("as") {
                self.pos += 1;
                Some(self.expect_name()?)
            } else {
                None
            };
            imports.push(Import {
                module,
                name: None,
                alias,
            });
            if !self.eat_op(",") {
                break;
            }
        }
        Ok(StmtKind::Import(imports))
    }

    fn from_import(&mut self) -> Result<StmtKind, ScriptError> {
        let module = self.dotted_name()?;
        if !self.peek_name("import") {
            return Err(self.unexpected("expected 'import'"));
        }
        self.pos += 1;
        let parens = self.eat_op("(");
        let mut imports = Vec::new();
        loop {
            let name = if self.eat_op("*") {
                "*".to_string()
            } else {
                self.expect_name()?
            };
            let alias = if self.peek_name("as") {
                self.pos += 1;
                Some(self.expect_name()?)
            } else {
                None
            };
            imports.push(Import {
                module: module.clone(),
                name: Some(name),
                alias,
            });
            if !self.eat_op(",") || (parens && self.peek_op(")")) {
                break;
            }
        }
        if parens {
            self.expect_op(")")?;
        }
        Ok(StmtKind::Import(imports))
    }

    fn to_target(&self, expr: Expr) -> Result<Target, ScriptError> {
        match expr {
            Expr::Name(name) => Ok(Target::Name(name)),
            Expr::Attr(obj, name) => Ok(Target::Attr(*obj, name)),
            Expr::Index(obj, key) => Ok(Target::Index(*obj, *key)),
            Expr::Tuple(items) | Expr::List(items) => Ok(Target::Tuple(
                items
                    .into_iter()
                    .map(|item| self.to_target(item))
                    .collect::<Result<_, _>>()?,
            )),
            _ => Err(syntax(self.line, "cannot assign to expression")),
        }
    }

    fn target_list(&mut self) -> Result<Target, ScriptError> {
        let mut items = Vec::new();
        loop {
            items.push(self.postfix()?);
            if !self.eat_op(",") || self.peek_name("in") {
                break;
            }
        }
        let expr = if items.len() == 1 {
            items.remove(0)
        } else {
            Expr::Tuple(items)
        };
        self.to_target(expr)
    }

    /// One expression, or a bare comma-separated tuple.
    fn expr_list(&mut self) -> Result<Expr, ScriptError> {
        let first = self.expr()?;
        if !self.peek_op(",") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.at_end() || self.peek_op("=") || self.peek_op(":") || self.peek_op(";") {
                break;
            }
            items.push(self.expr()?);
        }
        Ok(Expr::Tuple(items))
    }

    fn expr(&mut self) -> Result<Expr, ScriptError> {
        let outer = self.depth;
        let mut left = self.unary()?;
        loop {
            if self.eat_op("+") {
                self.nest()?;
                let right = self.unary()?;
                left = Expr::Add(Box::new(left), Box::new(right));
            } else if self.eat_op("-") {
                self.nest()?;
                let right = self.unary()?;
                left = Expr::Sub(Box::new(left), Box::new(right));
            } else {
                break;
            }
        }
        self.depth = outer;
        if let Some(Token::Op(op)) = self.peek() {
            if matches!(*op, "*" | "/" | "//" | "%" | "**" | "==" | "!=" | "<" | ">" | "<=" | ">=" | "@") {
                return Err(ScriptError::Unsupported {
                    line: self.line,
                    what: format!("operator '{op}'"),
                });
            }
        }
        if let Some(Token::Name(word)) = self.peek() {
            if matches!(word.as_str(), "if" | "and" | "or" | "not" | "is") {
                return Err(ScriptError::Unsupported {
                    line: self.line,
                    what: format!("'{word}' expressions"),
                });
            }
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, ScriptError> {
        let negate = if self.eat_op("-") {
            true
        } else if self.eat_op("+") {
            false
        } else {
            return self.postfix();
        };
        self.nest()?;
        let operand = self.unary()?;
        self.depth -= 1;
        Ok(if negate {
            Expr::Neg(Box::new(operand))
        } else {
            operand
        })
    }

    fn postfix(&mut self) -> Result<Expr, ScriptError> {
        let outer = self.depth;
        let mut expr = self.atom()?;
        loop {
            if matches!(self.peek(), Some(Token::Op("." | "(" | "["))) {
                self.nest()?;
            }
            if self.eat_op(".") {
                let name = self.expect_name()?;
                expr = Expr::Attr(Box::new(expr), name);
            } else if self.eat_op("(") {
                let (args, kwargs) = self.call_args()?;
                expr = Expr::Call {
                    func: Box::new(expr),
                    args,
                    kwargs,
                };
            } else if self.eat_op("[") {
                let key = self.expr_list()?;
                self.expect_op("]")?;
                expr = Expr::Index(Box::new(expr), Box::new(key));
            } else {
                break;
            }
        }
        self.depth = outer;
        Ok(expr)
    }

    fn call_args(&mut self) -> Result<(Vec<Expr>, Vec<(String, Expr)>), ScriptError> {
        let mut args = Vec::new();
        let mut kwargs = Vec::new();
        while !self.eat_op(")") {
            if self.peek_op("*") || self.peek_op("**") {
                return Err(ScriptError::Unsupported {
                    line: self.line,
                    what: "argument unpacking".to_string(),
                });
            }
            let is_kwarg = matches!(self.peek(), Some(Token::Name(_)))
                && matches!(self.tokens.get(self.pos + 1), Some(Token::Op("=")));
            if is_kwarg {
                let name = self.expect_name()?;
                self.expect_op("=")?;
                kwargs.push((name, self.expr()?));
            } else {
                if !kwargs.is_empty() {
                    return Err(syntax(self.line, "positional argument follows keyword argument"));
                }
                args.push(self.expr()?);
            }
            if !self.eat_op(",") {
                self.expect_op(")")?;
                break;
            }
        }
        Ok((args, kwargs))
    }

    fn atom(&mut self) -> Result<Expr, ScriptError> {
        let Some(token) = self.peek() else {
            return Err(self.unexpected("expected an expression"));
        };
        match token {
            Token::Str(_) => {
                let mut text = String::new();
                while let Some(Token::Str(part)) = self.peek() {
                    text.push_str(part);
                    self.pos += 1;
                }
                Ok(Expr::Str(text))
            }
            Token::Int(i) => {
                self.pos += 1;
                Ok(Expr::Int(*i))
            }
            Token::Float(f) => {
                self.pos += 1;
                Ok(Expr::Float(*f))
            }
            Token::Name(name) => {
                self.pos += 1;
                match name.as_str() {
                    "True" => Ok(Expr::Bool(true)),
                    "False" => Ok(Expr::Bool(false)),
                    "None" => Ok(Expr::None),
                    "lambda" | "not" | "await" | "yield" => Err(ScriptError::Unsupported {
                        line: self.line,
                        what: format!("'{name}' expressions"),
                    }),
                    _ => Ok(Expr::Name(name.clone())),
                }
            }
            Token::Op(open @ ("(" | "[" | "{")) => {
                self.pos += 1;
                self.nest()?;
                let group = self.group(open)?;
                self.depth -= 1;
                Ok(group)
            }
            _ => Err(self.unexpected("expected an expression")),
        }
    }

    fn group(&mut self, open: &str) -> Result<Expr, ScriptError> {
        match open {
            "(" => {
                if self.eat_op(")") {
                    return Ok(Expr::Tuple(Vec::new()));
                }
                let first = self.expr()?;
                if self.eat_op(")") {
                    return Ok(first);
                }
                let mut items = vec![first];
                while self.eat_op(",") {
                    if self.peek_op(")") {
                        break;
                    }
                    items.push(self.expr()?);
                }
                self.expect_op(")")?;
                Ok(Expr::Tuple(items))
            }
            "[" => {
                let items = self.sequence("]")?;
                Ok(Expr::List(items))
            }
            _ => {
                let mut entries = Vec::new();
                while !self.eat_op("}") {
                    let key = self.expr()?;
                    self.expect_op(":")?;
                    let value = self.expr()?;
                    entries.push((key, value));
                    if !self.eat_op(",") {
                        self.expect_op("}")?;
                        break;
                    }
                }
                Ok(Expr::Dict(entries))
            }
        }
    }

    fn sequence(&mut self, close: &str) -> Result<Vec<Expr>, ScriptError> {
        let mut items = Vec::new();
        while !self.eat_op(close) {
            items.push(self.expr()?);
            if self.peek_name("for") {
                return Err(ScriptError::Unsupported {
                    line: self.line,
                    what: "comprehensions".to_string(),
                });
            }
            if !self.eat_op(",") {
                self.expect_op(close)?;
                break;
            }
        }
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_calls_with_keywords() {
        let program = parse_program("dot.node('A', 'Start', shape='box')").unwrap();
        assert_eq!(program.len(), 1);
        let StmtKind::Expr(Expr::Call { args, kwargs, .. }) = &program[0].kind else {
            panic!("expected call");
        };
        assert_eq!(args.len(), 2);
        assert_eq!(kwargs[0].0, "shape");
    }

    #[test]
    fn joins_bracketed_continuations() {
        let program = parse_program("dot.edges([\n    ('A', 'B'),\n    ('B', 'C'),\n])\nx = 1").unwrap();
        assert_eq!(program.len(), 2);
        assert_eq!(program[1].line, 5);
    }

    #[test]
    fn builds_indented_blocks() {
        let source = "with dot.subgraph(name='cluster_0') as c:\n    c.node('A')\n    for a, b in pairs:\n        c.edge(a, b)\ndot.node('B')";
        let program = parse_program(source).unwrap();
        assert_eq!(program.len(), 2);
        let StmtKind::With { alias, body, .. } = &program[0].kind else {
            panic!("expected with");
        };
        assert_eq!(alias.as_deref(), Some("c"));
        assert_eq!(body.len(), 2);
        assert!(matches!(&body[1].kind, StmtKind::For { target: Target::Tuple(t), .. } if t.len() == 2));
    }

    #[test]
    fn comments_and_blank_lines_are_skipped() {
        let program = parse_program("# heading\n\nx = 'a#b'  # trailing\n").unwrap();
        assert_eq!(
            program[0].kind,
            StmtKind::Assign(vec![Target::Name("x".to_string())], Expr::Str("a#b".to_string()))
        );
    }

    #[test]
    fn string_escapes_and_implicit_concatenation() {
        let program = parse_program("x = 'a\\nb' \"c\"\ny = r'\\n'\nz = '''multi\nline'''").unwrap();
        assert!(matches!(&program[0].kind, StmtKind::Assign(_, Expr::Str(s)) if s == "a\nbc"));
        assert!(matches!(&program[1].kind, StmtKind::Assign(_, Expr::Str(s)) if s == "\\n"));
        assert!(matches!(&program[2].kind, StmtKind::Assign(_, Expr::Str(s)) if s == "multi\nline"));
    }

    #[test]
    fn imports_are_recorded() {
        let program = parse_program("import graphviz as gv\nfrom graphviz import Digraph, Graph").unwrap();
        let StmtKind::Import(imports) = &program[1].kind else {
            panic!("expected import");
        };
        assert_eq!(imports.len(), 2);
        assert_eq!(imports[0].name.as_deref(), Some("Digraph"));
    }

    #[test]
    fn rejects_unsupported_constructs() {
        assert!(matches!(
            parse_program("if x:\n    pass"),
            Err(ScriptError::Unsupported { line: 1, .. })
        ));
        assert!(matches!(
            parse_program("x += 1"),
            Err(ScriptError::Unsupported { .. })
        ));
        assert!(matches!(
            parse_program("x = f'{y}'"),
            Err(ScriptError::Unsupported { .. })
        ));
        assert!(matches!(
            parse_program("x = [a for a in b]"),
            Err(ScriptError::Unsupported { .. })
        ));
    }

    #[test]
    fn nesting_depth_is_bounded() {
        let nested = |levels: usize| format!("x = {}1{}", "(".repeat(levels), ")".repeat(levels));
        assert!(parse_program(&nested(40)).is_ok());
        assert!(matches!(
            parse_program(&nested(300)),
            Err(ScriptError::Syntax { line: 1, .. })
        ));
        assert!(matches!(
            parse_program(&format!("x = {}[1]", "[".repeat(5000) + &"]".repeat(5000))),
            Err(ScriptError::Syntax { .. })
        ));
        assert!(matches!(
            parse_program(&format!("x = {}1", "-".repeat(500))),
            Err(ScriptError::Syntax { .. })
        ));
        let chain = vec!["'a'"; 500].join(" + ");
        assert!(matches!(
            parse_program(&format!("x = {chain}")),
            Err(ScriptError::Syntax { .. })
        ));
        assert!(parse_program("st.session_state.dot.render(filename='f', view=False)").is_ok());
    }

    #[test]
    fn block_depth_is_bounded() {
        let mut source = String::new();
        for level in 0..150 {
            source.push_str(&" ".repeat(level));
            source.push_str("for a in b:\n");
        }
        source.push_str(&" ".repeat(150));
        source.push_str("pass\n");
        assert!(matches!(parse_program(&source), Err(ScriptError::Syntax { .. })));
    }

    #[test]
    fn reports_indentation_errors() {
        assert!(matches!(
            parse_program("x = 1\n    y = 2"),
            Err(ScriptError::Syntax { line: 2, .. })
        ));
        assert!(matches!(
            parse_program("for a in b:\nx = 1"),
            Err(ScriptError::Syntax { line: 1, .. })
        ));
        assert!(matches!(
            parse_program("x = (1,"),
            Err(ScriptError::Syntax { .. })
        ));
    }
}
