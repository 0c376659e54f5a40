//! Parsing source code into an AST.
//!
//! The grammar is a small imperative language: assignments, `var`
//! declarations, `if`/`while`/`for` blocks closed by `end`, `print`, and
//! `input`, with expressions climbing from `or` (lowest precedence) to
//! unary operators (highest).
//!
//! The entry point is [`parse`]. The parser never gives up on the whole
//! file: a statement that fails to parse produces one diagnostic, the
//! parser skips to the next line, and parsing continues. An unclosed
//! block produces a diagnostic but still yields a well-formed AST with
//! whatever body was collected.

pub mod lex;

use crate::ast::{BinOp, Expr, PrintArg, SourceProgram, Stmt, UnOp};
use crate::err::Diagnostic;

use self::lex::{lex, Op, Spanned, Token, TokenStream, Word};

/// Parses source text into an AST, reporting syntax diagnostics.
///
/// Lexical diagnostics are *not* included here; run [`lex`] separately
/// (or use [`crate::pipeline::build`]) if the source has not been
/// validated yet.
///
/// # Example
/// ```
/// use micro86::parse::parse;
///
/// let (ast, diagnostics) = parse("
/// x = 1
/// while x < 5
///   x = x + 1
/// end
/// print x
/// ");
/// assert!(diagnostics.is_empty());
/// assert_eq!(ast.body.len(), 3);
/// ```
pub fn parse(src: &str) -> (SourceProgram, Vec<Diagnostic>) {
    let (stream, _) = lex(src);
    parse_tokens(stream)
}

/// Parses an already-lexed token stream.
pub fn parse_tokens(stream: TokenStream) -> (SourceProgram, Vec<Diagnostic>) {
    let mut parser = Parser {
        tokens: stream.tokens,
        pos: 0,
        eof_line: stream.eof_line,
        diagnostics: Vec::new(),
    };

    let program = parser.parse_program();
    (program, parser.diagnostics)
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    eof_line: usize,
    diagnostics: Vec<Diagnostic>,
}

/// Which keyword closed a block body (or EOF did).
#[derive(PartialEq, Eq, Clone, Copy)]
enum BlockEnd {
    End,
    Else,
    Eof,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|s| &s.token)
    }

    fn bump(&mut self) -> Option<&Spanned> {
        let spanned = self.tokens.get(self.pos)?;
        self.pos += 1;
        Some(spanned)
    }

    /// The line of the current token (or of EOF).
    fn line(&self) -> usize {
        self.tokens.get(self.pos).map_or(self.eof_line, |s| s.line)
    }

    fn eat_op(&mut self, op: Op) -> bool {
        match self.peek() {
            Some(Token::Op(o)) if *o == op => {
                self.pos += 1;
                true
            }
            _ => false,
        }
    }

    fn eat_word(&mut self, word: Word) -> bool {
        match self.peek() {
            Some(Token::Word(w)) if *w == word => {
                self.pos += 1;
                true
            }
            _ => false,
        }
    }

    /// Consumes newline tokens; returns whether any were present (or EOF).
    fn eat_newlines(&mut self) -> bool {
        let mut any = self.peek().is_none();
        while matches!(self.peek(), Some(Token::NewLine)) {
            self.pos += 1;
            any = true;
        }
        any
    }

    fn error(&mut self, message: impl Into<String>) {
        let line = self.line();
        self.diagnostics.push(Diagnostic::error(line, message.into()));
    }

    /// Skips to just past the next NEWLINE (or to EOF).
    fn recover_to_newline(&mut self) {
        while let Some(token) = self.peek() {
            let was_newline = matches!(token, Token::NewLine);
            self.pos += 1;
            if was_newline {
                break;
            }
        }
    }

    fn parse_program(&mut self) -> SourceProgram {
        self.eat_newlines();

        // Optional header: `program NAME`.
        let mut name = None;
        if self.eat_word(Word::Program) {
            match self.peek().cloned() {
                Some(Token::Word(Word::Ident(id))) => {
                    self.pos += 1;
                    name = Some(id);
                }
                _ => self.error("expected program name after 'program'"),
            }
            self.eat_newlines();
        }

        let (mut body, mut terminator) = self.parse_block();
        while terminator != BlockEnd::Eof {
            // A stray `end`/`else` at top level; parse_block already
            // consumed it.
            self.error("unexpected 'end' outside a block");
            let (mut rest, t) = self.parse_block();
            body.append(&mut rest);
            terminator = t;
        }

        SourceProgram { name, body }
    }

    /// Parses statements until `end`, `else`, or EOF.
    fn parse_block(&mut self) -> (Vec<Stmt>, BlockEnd) {
        let mut body = Vec::new();

        loop {
            self.eat_newlines();
            match self.peek() {
                None => return (body, BlockEnd::Eof),
                Some(Token::Word(Word::End)) => {
                    self.pos += 1;
                    return (body, BlockEnd::End);
                }
                Some(Token::Word(Word::Else)) => {
                    self.pos += 1;
                    return (body, BlockEnd::Else);
                }
                _ => {}
            }

            match self.parse_statement() {
                Some(stmt) => {
                    body.push(stmt);
                    if !self.eat_newlines() {
                        // Trailing garbage after a well-formed statement.
                        self.error("expected end of line");
                        self.recover_to_newline();
                    }
                }
                None => self.recover_to_newline(),
            }
        }
    }

    /// Parses one statement. On failure, reports a diagnostic and returns
    /// None (the caller recovers to the next line).
    fn parse_statement(&mut self) -> Option<Stmt> {
        let line = self.line();

        match self.peek().cloned() {
            Some(Token::Word(Word::Var)) => {
                self.pos += 1;
                let name = self.expect_ident("variable name after 'var'")?;
                let init = match self.eat_op(Op::Assign) {
                    true => Some(self.parse_expr()?),
                    false => None,
                };
                Some(Stmt::VarDecl { name, init, line })
            }
            Some(Token::Word(Word::If)) => {
                self.pos += 1;
                let cond = self.parse_expr()?;
                self.eat_word(Word::Then);
                let (then_body, end) = self.parse_block();
                let else_body = match end {
                    BlockEnd::Else => {
                        let (else_body, end) = self.parse_block();
                        if end == BlockEnd::Eof {
                            self.error("expected 'end' to close 'if'");
                        }
                        else_body
                    }
                    BlockEnd::End => Vec::new(),
                    BlockEnd::Eof => {
                        self.error("expected 'end' to close 'if'");
                        Vec::new()
                    }
                };
                Some(Stmt::If { cond, then_body, else_body, line })
            }
            Some(Token::Word(Word::While)) => {
                self.pos += 1;
                let cond = self.parse_expr()?;
                self.eat_word(Word::Do);
                let (body, end) = self.parse_block();
                if end != BlockEnd::End {
                    self.error("expected 'end' to close 'while'");
                }
                Some(Stmt::While { cond, body, line })
            }
            Some(Token::Word(Word::For)) => {
                self.pos += 1;
                let var = self.expect_ident("loop variable after 'for'")?;
                if !self.eat_op(Op::Assign) {
                    self.error("expected '=' after the loop variable");
                    return None;
                }
                let from = self.parse_expr()?;
                if !self.eat_word(Word::To) {
                    self.error("expected 'to' in 'for'");
                    return None;
                }
                let to = self.parse_expr()?;
                let step = match self.eat_word(Word::Step) {
                    true => Some(self.parse_expr()?),
                    false => None,
                };
                let (body, end) = self.parse_block();
                if end != BlockEnd::End {
                    self.error("expected 'end' to close 'for'");
                }
                Some(Stmt::For { var, from, to, step, body, line })
            }
            Some(Token::Word(Word::Print)) => {
                self.pos += 1;
                let arg = match self.peek().cloned() {
                    Some(Token::Str(s)) => {
                        self.pos += 1;
                        PrintArg::Str(s)
                    }
                    _ => PrintArg::Expr(self.parse_expr()?),
                };
                Some(Stmt::Print { arg, line })
            }
            Some(Token::Word(Word::Input)) => {
                self.pos += 1;
                let name = self.expect_ident("variable name after 'input'")?;
                Some(Stmt::Input { name, line })
            }
            Some(Token::Word(Word::Ident(name))) => {
                self.pos += 1;
                if !self.eat_op(Op::Assign) {
                    self.error(format!("expected '=' after '{name}'"));
                    return None;
                }
                let value = self.parse_expr()?;
                Some(Stmt::Assign { name: name.to_lowercase(), value, line })
            }
            Some(token) => {
                self.error(format!("unexpected {}", describe(&token)));
                None
            }
            None => None,
        }
    }

    fn expect_ident(&mut self, what: &str) -> Option<String> {
        match self.peek().cloned() {
            Some(Token::Word(Word::Ident(id))) => {
                self.pos += 1;
                Some(id.to_lowercase())
            }
            _ => {
                self.error(format!("expected {what}"));
                None
            }
        }
    }

    // ---- expressions, precedence climbing ----

    fn parse_expr(&mut self) -> Option<Expr> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Option<Expr> {
        let mut lhs = self.parse_and()?;
        while self.eat_word(Word::Or) {
            let rhs = self.parse_and()?;
            lhs = Expr::Binary { op: BinOp::Or, lhs: Box::new(lhs), rhs: Box::new(rhs) };
        }
        Some(lhs)
    }

    fn parse_and(&mut self) -> Option<Expr> {
        let mut lhs = self.parse_cmp()?;
        while self.eat_word(Word::And) {
            let rhs = self.parse_cmp()?;
            lhs = Expr::Binary { op: BinOp::And, lhs: Box::new(lhs), rhs: Box::new(rhs) };
        }
        Some(lhs)
    }

    fn parse_cmp(&mut self) -> Option<Expr> {
        let mut lhs = self.parse_add()?;
        loop {
            let op = match self.peek() {
                Some(Token::Op(Op::Lt)) => BinOp::Lt,
                Some(Token::Op(Op::Gt)) => BinOp::Gt,
                Some(Token::Op(Op::Le)) => BinOp::Le,
                Some(Token::Op(Op::Ge)) => BinOp::Ge,
                Some(Token::Op(Op::Eq)) => BinOp::Eq,
                Some(Token::Op(Op::Ne)) => BinOp::Ne,
                _ => return Some(lhs),
            };
            self.pos += 1;
            let rhs = self.parse_add()?;
            lhs = Expr::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs) };
        }
    }

    fn parse_add(&mut self) -> Option<Expr> {
        let mut lhs = self.parse_mul()?;
        loop {
            let op = match self.peek() {
                Some(Token::Op(Op::Plus)) => BinOp::Add,
                Some(Token::Op(Op::Minus)) => BinOp::Sub,
                _ => return Some(lhs),
            };
            self.pos += 1;
            let rhs = self.parse_mul()?;
            lhs = Expr::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs) };
        }
    }

    fn parse_mul(&mut self) -> Option<Expr> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Op(Op::Star)) => BinOp::Mul,
                Some(Token::Op(Op::Slash)) => BinOp::Div,
                Some(Token::Op(Op::Percent)) => BinOp::Mod,
                _ => return Some(lhs),
            };
            self.pos += 1;
            let rhs = self.parse_unary()?;
            lhs = Expr::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs) };
        }
    }

    fn parse_unary(&mut self) -> Option<Expr> {
        if self.eat_op(Op::Minus) {
            let expr = self.parse_unary()?;
            return Some(Expr::Unary { op: UnOp::Neg, expr: Box::new(expr) });
        }
        if self.eat_word(Word::Not) {
            let expr = self.parse_unary()?;
            return Some(Expr::Unary { op: UnOp::Not, expr: Box::new(expr) });
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Option<Expr> {
        match self.peek().cloned() {
            Some(Token::Number(n)) => {
                self.pos += 1;
                Some(Expr::Num(n))
            }
            Some(Token::Str(s)) => {
                self.pos += 1;
                Some(Expr::Str(s))
            }
            Some(Token::Word(Word::True)) => {
                self.pos += 1;
                Some(Expr::Num(1))
            }
            Some(Token::Word(Word::False)) => {
                self.pos += 1;
                Some(Expr::Num(0))
            }
            Some(Token::Word(Word::Ident(id))) => {
                self.pos += 1;
                Some(Expr::Var(id.to_lowercase()))
            }
            Some(Token::Op(Op::LParen)) => {
                self.pos += 1;
                let inner = self.parse_expr()?;
                if !self.eat_op(Op::RParen) {
                    self.error("expected ')'");
                    return None;
                }
                Some(inner)
            }
            Some(token) => {
                self.error(format!("expected expression, found {}", describe(&token)));
                None
            }
            None => {
                self.error("expected expression");
                None
            }
        }
    }
}

fn describe(token: &Token) -> String {
    match token {
        Token::Number(n)  => format!("number {n}"),
        Token::Word(w)    => format!("'{w}'"),
        Token::Str(_)     => "string literal".to_string(),
        Token::Op(op)     => format!("'{op}'"),
        Token::NewLine    => "end of line".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(src: &str) -> SourceProgram {
        let (ast, diagnostics) = parse(src);
        assert!(diagnostics.is_empty(), "unexpected diagnostics: {diagnostics:?}");
        ast
    }

    #[test]
    fn assignment_and_precedence() {
        let ast = ok("x = 1 + 2 * 3");
        let Stmt::Assign { name, value, line } = &ast.body[0] else {
            panic!("expected assignment, got {:?}", ast.body[0]);
        };
        assert_eq!(name, "x");
        assert_eq!(*line, 1);
        // 1 + (2 * 3), not (1 + 2) * 3.
        let Expr::Binary { op: BinOp::Add, rhs, .. } = value else {
            panic!("expected top-level +, got {value:?}");
        };
        assert!(matches!(**rhs, Expr::Binary { op: BinOp::Mul, .. }));
    }

    #[test]
    fn left_associativity() {
        let ast = ok("x = 10 - 3 - 2");
        let Stmt::Assign { value, .. } = &ast.body[0] else { unreachable!() };
        // (10 - 3) - 2.
        let Expr::Binary { op: BinOp::Sub, lhs, .. } = value else {
            panic!("expected top-level -");
        };
        assert!(matches!(**lhs, Expr::Binary { op: BinOp::Sub, .. }));
    }

    #[test]
    fn program_header() {
        let ast = ok("program demo\nx = 1");
        assert_eq!(ast.name.as_deref(), Some("demo"));
        assert_eq!(ast.body.len(), 1);
    }

    #[test]
    fn if_else_blocks() {
        let ast = ok("
if x > 0 then
  y = 1
else
  y = 2
end
        ");
        let Stmt::If { then_body, else_body, .. } = &ast.body[0] else {
            panic!("expected if");
        };
        assert_eq!(then_body.len(), 1);
        assert_eq!(else_body.len(), 1);
    }

    #[test]
    fn while_and_for() {
        let ast = ok("
while x < 10 do
  x = x + 1
end
for i = 1 to 5 step 2
  print i
end
        ");
        assert!(matches!(ast.body[0], Stmt::While { .. }));
        let Stmt::For { var, step, body, .. } = &ast.body[1] else {
            panic!("expected for");
        };
        assert_eq!(var, "i");
        assert!(step.is_some());
        assert_eq!(body.len(), 1);
    }

    #[test]
    fn true_false_fold_to_numbers() {
        let ast = ok("x = true\ny = false");
        let Stmt::Assign { value, .. } = &ast.body[0] else { unreachable!() };
        assert_eq!(*value, Expr::Num(1));
        let Stmt::Assign { value, .. } = &ast.body[1] else { unreachable!() };
        assert_eq!(*value, Expr::Num(0));
    }

    #[test]
    fn print_forms() {
        let ast = ok("print \"hi\"\nprint x + 1\ninput n");
        assert!(matches!(&ast.body[0], Stmt::Print { arg: PrintArg::Str(s), .. } if s == "hi"));
        assert!(matches!(&ast.body[1], Stmt::Print { arg: PrintArg::Expr(_), .. }));
        assert!(matches!(&ast.body[2], Stmt::Input { name, .. } if name == "n"));
    }

    #[test]
    fn unary_chain() {
        let ast = ok("x = --5\ny = not not true");
        let Stmt::Assign { value, .. } = &ast.body[0] else { unreachable!() };
        let Expr::Unary { op: UnOp::Neg, expr } = value else { panic!("expected neg") };
        assert!(matches!(**expr, Expr::Unary { op: UnOp::Neg, .. }));
    }

    #[test]
    fn bad_statement_recovers_to_next_line() {
        let (ast, diagnostics) = parse("x = \ny = 2");
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].line, 1);
        // The second statement still parsed.
        assert_eq!(ast.body.len(), 1);
        assert!(matches!(&ast.body[0], Stmt::Assign { name, .. } if name == "y"));
    }

    #[test]
    fn unclosed_block_keeps_partial_body() {
        let (ast, diagnostics) = parse("while x < 3\n  x = x + 1\n");
        assert_eq!(diagnostics.len(), 1);
        assert!(diagnostics[0].message.contains("'end'"));
        let Stmt::While { body, .. } = &ast.body[0] else { panic!("expected while") };
        assert_eq!(body.len(), 1);
    }

    #[test]
    fn stray_end_is_reported() {
        let (ast, diagnostics) = parse("x = 1\nend\ny = 2");
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(ast.body.len(), 2);
    }

    #[test]
    fn trailing_tokens_are_reported() {
        let (ast, diagnostics) = parse("x = 1 2\ny = 3");
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].line, 1);
        assert_eq!(ast.body.len(), 2);
    }

    #[test]
    fn variable_names_normalize_to_lowercase() {
        let ast = ok("Total = 3\nx = TOTAL");
        assert!(matches!(&ast.body[0], Stmt::Assign { name, .. } if name == "total"));
        let Stmt::Assign { value, .. } = &ast.body[1] else { unreachable!() };
        assert_eq!(*value, Expr::Var("total".to_string()));
    }
}
