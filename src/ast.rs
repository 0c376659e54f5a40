//! Components relating to the abstract syntax tree (AST) of the surface
//! language.
//!
//! These components are produced by [`crate::parse`] and consumed by
//! [`crate::codegen`]:
//! - [`SourceProgram`]: A whole parsed program.
//! - [`Stmt`]: One statement, carrying its source line.
//! - [`Expr`]: An expression tree.

/// A whole parsed program.
#[derive(Debug, PartialEq, Clone, Default)]
pub struct SourceProgram {
    /// The name from an optional leading `program NAME` line.
    pub name: Option<String>,
    /// Top-level statements, in source order.
    pub body: Vec<Stmt>,
}

/// One statement.
///
/// Every statement records the 1-based source line it starts on, which the
/// code generator turns into `_SRC_` labels for the source map.
#[derive(Debug, PartialEq, Clone)]
pub enum Stmt {
    /// `name = expr`
    Assign {
        /// Variable name (normalized to lower case).
        name: String,
        /// The assigned value.
        value: Expr,
        /// Source line.
        line: usize,
    },
    /// `var name [= expr]`
    VarDecl {
        /// Variable name (normalized to lower case).
        name: String,
        /// Optional initializer.
        init: Option<Expr>,
        /// Source line.
        line: usize,
    },
    /// `if cond [then] … [else …] end`
    If {
        /// The condition.
        cond: Expr,
        /// Statements of the then-arm.
        then_body: Vec<Stmt>,
        /// Statements of the else-arm (empty without `else`).
        else_body: Vec<Stmt>,
        /// Source line.
        line: usize,
    },
    /// `while cond [do] … end`
    While {
        /// The condition.
        cond: Expr,
        /// Loop body.
        body: Vec<Stmt>,
        /// Source line.
        line: usize,
    },
    /// `for var = from to to_expr [step step_expr] … end`
    For {
        /// Loop variable name (normalized to lower case).
        var: String,
        /// Initial value.
        from: Expr,
        /// Upper (or lower, with a negative step) bound.
        to: Expr,
        /// Optional step; defaults to 1.
        step: Option<Expr>,
        /// Loop body.
        body: Vec<Stmt>,
        /// Source line.
        line: usize,
    },
    /// `print STRING` or `print expr`
    Print {
        /// What to print.
        arg: PrintArg,
        /// Source line.
        line: usize,
    },
    /// `input name`
    Input {
        /// Target variable name (normalized to lower case).
        name: String,
        /// Source line.
        line: usize,
    },
}
impl Stmt {
    /// The 1-based source line this statement starts on.
    pub fn line(&self) -> usize {
        match *self {
            Stmt::Assign { line, .. }
            | Stmt::VarDecl { line, .. }
            | Stmt::If { line, .. }
            | Stmt::While { line, .. }
            | Stmt::For { line, .. }
            | Stmt::Print { line, .. }
            | Stmt::Input { line, .. } => line,
        }
    }
}

/// The argument of a `print` statement.
#[derive(Debug, PartialEq, Clone)]
pub enum PrintArg {
    /// A string literal, printed character by character.
    Str(String),
    /// An expression, printed as a decimal number.
    Expr(Expr),
}

/// An expression tree.
///
/// `true` and `false` are folded to `Num(1)` / `Num(0)` by the parser.
#[derive(Debug, PartialEq, Clone)]
pub enum Expr {
    /// A numeric literal.
    Num(u16),
    /// A string literal. Only meaningful directly under `print`; the
    /// code generator rejects it anywhere else.
    Str(String),
    /// A variable read.
    Var(String),
    /// A unary operation.
    Unary {
        /// The operator.
        op: UnOp,
        /// The operand.
        expr: Box<Expr>,
    },
    /// A binary operation.
    Binary {
        /// The operator.
        op: BinOp,
        /// Left operand (evaluated first).
        lhs: Box<Expr>,
        /// Right operand.
        rhs: Box<Expr>,
    },
}

/// A unary operator.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum UnOp {
    /// Arithmetic negation.
    Neg,
    /// Logical not (yields 0 or 1).
    Not,
}

/// A binary operator, lowest precedence first.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum BinOp {
    #[allow(missing_docs)] Or,
    #[allow(missing_docs)] And,
    #[allow(missing_docs)] Eq,
    #[allow(missing_docs)] Ne,
    #[allow(missing_docs)] Lt,
    #[allow(missing_docs)] Gt,
    #[allow(missing_docs)] Le,
    #[allow(missing_docs)] Ge,
    #[allow(missing_docs)] Add,
    #[allow(missing_docs)] Sub,
    #[allow(missing_docs)] Mul,
    #[allow(missing_docs)] Div,
    #[allow(missing_docs)] Mod,
}
impl BinOp {
    /// Whether this operator compares its operands (yielding 0 or 1).
    pub fn is_comparison(self) -> bool {
        matches!(self, BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Gt | BinOp::Le | BinOp::Ge)
    }
}
