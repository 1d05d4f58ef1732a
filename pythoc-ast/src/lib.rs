#![forbid(unsafe_code)]

//! AST surface for the PythoC front end.
//!
//! The host syntax parser is an external collaborator: it hands the compiler
//! an already-parsed tree in this shape (typically as JSON). Everything in
//! here is therefore plain data with serde derives; the semantic weight
//! lives in `pythoc-core`.

use serde::{Deserialize, Serialize};

/// A half-open byte range into the original host source.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub offset: usize,
    pub len: usize,
}

impl Span {
    pub fn new(offset: usize, len: usize) -> Self {
        Self { offset, len }
    }
}

impl From<Span> for miette::SourceSpan {
    fn from(s: Span) -> Self {
        miette::SourceSpan::new(s.offset.into(), s.len)
    }
}

pub fn span(start: usize, len: usize) -> Span {
    Span::new(start, len)
}

pub fn span_between(start: usize, end: usize) -> Span {
    debug_assert!(end >= start);
    span(start, end - start)
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Spanned<T> {
    pub span: Span,
    pub node: T,
}

impl<T> Spanned<T> {
    pub fn new(span: Span, node: T) -> Self {
        Self { span, node }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Spanned<U> {
        Spanned {
            span: self.span,
            node: f(self.node),
        }
    }
}

pub type Ident = Spanned<String>;

pub fn ident(name: &str) -> Ident {
    Spanned::new(Span::default(), name.to_string())
}

/// One translation-unit worth of decorated definitions.
///
/// `top_stmts` carries module-level effect statements (`effect.default(...)`,
/// `effect.name = impl`) in source order.
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct Unit {
    pub name: String,
    pub funcs: Vec<FuncDef>,
    pub classes: Vec<ClassDef>,
    pub top_stmts: Vec<Stmt>,
}

impl Unit {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }
}

/// Semantic markers attached to a definition by the host decorators.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Decorator {
    /// `@compile` / `@compile(suffix="fast")`: marks a translation unit.
    Compile { suffix: Option<String> },
    /// `@extern(lib="m")`: external symbol declaration; body is a stub.
    Extern { lib: Option<String> },
    /// `@inline`: unconditional AST inlining at every call site.
    Inline,
    /// `@enum(tag_type=i32)`: tagged-sum declaration on a class.
    Enum { tag_type: Option<TypeExpr> },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FuncDef {
    pub span: Span,
    pub name: Ident,
    pub decorators: Vec<Decorator>,
    pub params: Vec<Param>,
    pub ret: Option<TypeExpr>,
    pub body: Vec<Stmt>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub span: Span,
    pub name: Ident,
    pub annotation: Option<TypeExpr>,
}

/// A class-based type declaration: a struct, or an enum when decorated.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClassDef {
    pub span: Span,
    pub name: Ident,
    pub decorators: Vec<Decorator>,
    pub fields: Vec<FieldDef>,
}

/// A struct field or enum variant. Enum variants annotated `: None` carry no
/// payload; `tag_value` is the explicit discriminant when the host gave one.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    pub span: Span,
    pub name: Option<Ident>,
    pub annotation: Option<TypeExpr>,
    pub tag_value: Option<i64>,
}

/// Parsed form of a type annotation (`i32`, `ptr[T]`, `array[i32, 5]`,
/// `refined[i32, is_positive, "Tag"]`, ...).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TypeExpr {
    pub span: Span,
    pub kind: TypeExprKind,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum TypeExprKind {
    Name(String),
    Ptr(Box<TypeExpr>),
    Array {
        elem: Box<TypeExpr>,
        dims: Vec<u64>,
    },
    Func {
        params: Vec<TypeExpr>,
        ret: Box<TypeExpr>,
        variadic: bool,
    },
    /// `refined[T, pred..., "tag"...]`; `base` is absent for the
    /// predicate-only form `refined[pred]`.
    Refined {
        base: Option<Box<TypeExpr>>,
        preds: Vec<Ident>,
        tags: Vec<String>,
    },
    Linear,
    /// `(T, U)`: an anonymous struct.
    Tuple(Vec<TypeExpr>),
}

impl TypeExpr {
    pub fn name(n: &str) -> Self {
        Self {
            span: Span::default(),
            kind: TypeExprKind::Name(n.to_string()),
        }
    }

    pub fn ptr(inner: TypeExpr) -> Self {
        Self {
            span: Span::default(),
            kind: TypeExprKind::Ptr(Box::new(inner)),
        }
    }

    pub fn linear() -> Self {
        Self {
            span: Span::default(),
            kind: TypeExprKind::Linear,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Stmt {
    pub span: Span,
    pub kind: StmtKind,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum StmtKind {
    Expr(Expr),
    /// `a = e`, `a.b = e`, `a, b = e` (tuple target).
    Assign {
        target: Expr,
        value: Expr,
    },
    /// `a: T = e` / `a: T` (declaration).
    AnnAssign {
        target: Expr,
        annotation: TypeExpr,
        value: Option<Expr>,
    },
    Return(Option<Expr>),
    Yield(Option<Expr>),
    If {
        cond: Expr,
        then_body: Vec<Stmt>,
        else_body: Vec<Stmt>,
    },
    While {
        cond: Expr,
        body: Vec<Stmt>,
        else_body: Vec<Stmt>,
    },
    For {
        target: Expr,
        iter: Expr,
        body: Vec<Stmt>,
        else_body: Vec<Stmt>,
    },
    Match {
        subject: Expr,
        arms: Vec<MatchArm>,
    },
    /// `with item: body`: label scopes and effect overrides.
    With {
        item: Expr,
        binding: Option<Ident>,
        body: Vec<Stmt>,
    },
    Break,
    Continue,
    Pass,
}

impl Stmt {
    pub fn expr(e: Expr) -> Self {
        Self {
            span: e.span,
            kind: StmtKind::Expr(e),
        }
    }

    pub fn assign(target: Expr, value: Expr) -> Self {
        Self {
            span: target.span,
            kind: StmtKind::Assign { target, value },
        }
    }

    pub fn assign_name(name: &str, value: Expr) -> Self {
        Self::assign(Expr::name(name), value)
    }

    pub fn decl(name: &str, annotation: TypeExpr) -> Self {
        Self {
            span: Span::default(),
            kind: StmtKind::AnnAssign {
                target: Expr::name(name),
                annotation,
                value: None,
            },
        }
    }

    pub fn ann_assign(name: &str, annotation: TypeExpr, value: Expr) -> Self {
        Self {
            span: Span::default(),
            kind: StmtKind::AnnAssign {
                target: Expr::name(name),
                annotation,
                value: Some(value),
            },
        }
    }

    pub fn ret(value: Option<Expr>) -> Self {
        Self {
            span: Span::default(),
            kind: StmtKind::Return(value),
        }
    }

    pub fn yield_(value: Expr) -> Self {
        Self {
            span: Span::default(),
            kind: StmtKind::Yield(Some(value)),
        }
    }

    pub fn if_(cond: Expr, then_body: Vec<Stmt>, else_body: Vec<Stmt>) -> Self {
        Self {
            span: Span::default(),
            kind: StmtKind::If {
                cond,
                then_body,
                else_body,
            },
        }
    }

    pub fn while_(cond: Expr, body: Vec<Stmt>) -> Self {
        Self {
            span: Span::default(),
            kind: StmtKind::While {
                cond,
                body,
                else_body: Vec::new(),
            },
        }
    }

    pub fn for_(target: Expr, iter: Expr, body: Vec<Stmt>) -> Self {
        Self {
            span: Span::default(),
            kind: StmtKind::For {
                target,
                iter,
                body,
                else_body: Vec::new(),
            },
        }
    }

    pub fn with_(item: Expr, body: Vec<Stmt>) -> Self {
        Self {
            span: Span::default(),
            kind: StmtKind::With {
                item,
                binding: None,
                body,
            },
        }
    }

    pub fn break_() -> Self {
        Self {
            span: Span::default(),
            kind: StmtKind::Break,
        }
    }

    pub fn continue_() -> Self {
        Self {
            span: Span::default(),
            kind: StmtKind::Continue,
        }
    }

    pub fn pass() -> Self {
        Self {
            span: Span::default(),
            kind: StmtKind::Pass,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MatchArm {
    pub span: Span,
    pub pattern: Pattern,
    pub guard: Option<Expr>,
    pub body: Vec<Stmt>,
}

impl MatchArm {
    pub fn new(pattern: Pattern, body: Vec<Stmt>) -> Self {
        Self {
            span: Span::default(),
            pattern,
            guard: None,
            body,
        }
    }

    pub fn guarded(pattern: Pattern, guard: Expr, body: Vec<Stmt>) -> Self {
        Self {
            span: Span::default(),
            pattern,
            guard: Some(guard),
            body,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Pattern {
    /// `case _:`
    Wildcard { span: Span },
    /// `case x:`: binds, matches anything.
    Binding { span: Span, name: Ident },
    /// `case 42:` / `case Status.Ok:`: literal or variant reference.
    Value { span: Span, expr: Expr },
    Or { span: Span, alts: Vec<Pattern> },
    /// `case (p, q):`: tuples, arrays, and enum `(tag, payload)` forms.
    Sequence { span: Span, elems: Vec<Pattern> },
    /// `case Point(x=a, y=b):` / `case Point(a, b):`
    Struct {
        span: Span,
        name: Option<Ident>,
        fields: Vec<(Option<Ident>, Pattern)>,
    },
}

impl Pattern {
    pub fn wildcard() -> Self {
        Pattern::Wildcard {
            span: Span::default(),
        }
    }

    pub fn binding(name: &str) -> Self {
        Pattern::Binding {
            span: Span::default(),
            name: ident(name),
        }
    }

    pub fn value(expr: Expr) -> Self {
        Pattern::Value {
            span: Span::default(),
            expr,
        }
    }

    pub fn int(v: i128) -> Self {
        Self::value(Expr::int(v))
    }

    pub fn bool_(v: bool) -> Self {
        Self::value(Expr::bool_(v))
    }

    pub fn or(alts: Vec<Pattern>) -> Self {
        Pattern::Or {
            span: Span::default(),
            alts,
        }
    }

    pub fn sequence(elems: Vec<Pattern>) -> Self {
        Pattern::Sequence {
            span: Span::default(),
            elems,
        }
    }

    pub fn span(&self) -> Span {
        match self {
            Pattern::Wildcard { span }
            | Pattern::Binding { span, .. }
            | Pattern::Value { span, .. }
            | Pattern::Or { span, .. }
            | Pattern::Sequence { span, .. }
            | Pattern::Struct { span, .. } => *span,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Expr {
    pub span: Span,
    pub kind: ExprKind,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ExprKind {
    Name(String),
    Int(i128),
    Float(f64),
    Bool(bool),
    Str(String),
    NoneLit,
    Tuple(Vec<Expr>),
    Attribute {
        base: Box<Expr>,
        attr: Ident,
    },
    Subscript {
        base: Box<Expr>,
        indices: Vec<Expr>,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
        kwargs: Vec<(Ident, Expr)>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        left: Box<Expr>,
        op: BinOp,
        right: Box<Expr>,
    },
    Compare {
        left: Box<Expr>,
        op: CmpOp,
        right: Box<Expr>,
    },
    /// Single-expression function with an implicit `return`.
    Lambda {
        params: Vec<Ident>,
        body: Box<Expr>,
    },
}

impl Expr {
    fn mk(kind: ExprKind) -> Self {
        Self {
            span: Span::default(),
            kind,
        }
    }

    pub fn name(n: &str) -> Self {
        Self::mk(ExprKind::Name(n.to_string()))
    }

    pub fn int(v: i128) -> Self {
        Self::mk(ExprKind::Int(v))
    }

    pub fn float(v: f64) -> Self {
        Self::mk(ExprKind::Float(v))
    }

    pub fn bool_(v: bool) -> Self {
        Self::mk(ExprKind::Bool(v))
    }

    pub fn str_(v: &str) -> Self {
        Self::mk(ExprKind::Str(v.to_string()))
    }

    pub fn tuple(elems: Vec<Expr>) -> Self {
        Self::mk(ExprKind::Tuple(elems))
    }

    pub fn attr(base: Expr, attr: &str) -> Self {
        Self::mk(ExprKind::Attribute {
            base: Box::new(base),
            attr: ident(attr),
        })
    }

    pub fn call(callee: Expr, args: Vec<Expr>) -> Self {
        Self::mk(ExprKind::Call {
            callee: Box::new(callee),
            args,
            kwargs: Vec::new(),
        })
    }

    pub fn call_named(name: &str, args: Vec<Expr>) -> Self {
        Self::call(Self::name(name), args)
    }

    pub fn call_kw(callee: Expr, args: Vec<Expr>, kwargs: Vec<(Ident, Expr)>) -> Self {
        Self::mk(ExprKind::Call {
            callee: Box::new(callee),
            args,
            kwargs,
        })
    }

    pub fn binary(left: Expr, op: BinOp, right: Expr) -> Self {
        Self::mk(ExprKind::Binary {
            left: Box::new(left),
            op,
            right: Box::new(right),
        })
    }

    pub fn compare(left: Expr, op: CmpOp, right: Expr) -> Self {
        Self::mk(ExprKind::Compare {
            left: Box::new(left),
            op,
            right: Box::new(right),
        })
    }

    pub fn unary(op: UnaryOp, operand: Expr) -> Self {
        Self::mk(ExprKind::Unary {
            op,
            operand: Box::new(operand),
        })
    }

    pub fn lambda(params: Vec<&str>, body: Expr) -> Self {
        Self::mk(ExprKind::Lambda {
            params: params.into_iter().map(ident).collect(),
            body: Box::new(body),
        })
    }

    /// The identifier this expression names, if it is a bare name.
    pub fn as_name(&self) -> Option<&str> {
        match &self.kind {
            ExprKind::Name(n) => Some(n),
            _ => None,
        }
    }

    /// The callee name of a direct `name(...)` call, if any.
    pub fn as_direct_call(&self) -> Option<(&str, &[Expr])> {
        match &self.kind {
            ExprKind::Call { callee, args, .. } => callee.as_name().map(|n| (n, args.as_slice())),
            _ => None,
        }
    }

    /// The string literal of this expression, if it is one.
    pub fn as_str_lit(&self) -> Option<&str> {
        match &self.kind {
            ExprKind::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int_lit(&self) -> Option<i128> {
        match &self.kind {
            ExprKind::Int(v) => Some(*v),
            ExprKind::Unary {
                op: UnaryOp::Neg,
                operand,
            } => operand.as_int_lit().map(|v| -v),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    Neg,
    Not,
    BitNot,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    And,
    Or,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builders_produce_expected_shapes() {
        let e = Expr::call_named("consume", vec![Expr::name("t")]);
        let (callee, args) = e.as_direct_call().expect("direct call");
        assert_eq!(callee, "consume");
        assert_eq!(args.len(), 1);
        assert_eq!(args[0].as_name(), Some("t"));
    }

    #[test]
    fn negative_int_literals_fold() {
        let e = Expr::unary(UnaryOp::Neg, Expr::int(7));
        assert_eq!(e.as_int_lit(), Some(-7));
    }

    #[test]
    fn unit_round_trips_through_json() {
        let mut unit = Unit::new("demo");
        unit.funcs.push(FuncDef {
            span: Span::default(),
            name: ident("f"),
            decorators: vec![Decorator::Compile { suffix: None }],
            params: vec![],
            ret: Some(TypeExpr::name("i32")),
            body: vec![Stmt::ret(Some(Expr::int(0)))],
        });
        let json = serde_json::to_string(&unit).expect("serialize");
        let back: Unit = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, unit);
    }
}
