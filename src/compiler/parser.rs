//! Recursive-descent template parser.
//!
//! Statement nesting is resolved by recursion over the segment stream, so
//! nested blocks and quoted strings inside markers are handled structurally.

use super::ast::*;
use super::lexer::{segment, tokenize, LexError, Segment, SegmentKind, Tok, TokKind};
use crate::error::ParseError;
use crate::types::Span;
use std::collections::BTreeSet;

/// Parse template source into an AST.
pub fn parse(path: &str, source: &str) -> Result<Ast, ParseError> {
    let segments = segment(source).map_err(|e| lex_error(path, e))?;
    let mut parser = Parser {
        path,
        segments,
        pos: 0,
        ast: Ast::new(),
        blocks: BTreeSet::new(),
        seen_output: false,
    };
    let (root, _) = parser.parse_sequence(&[])?;
    parser.ast.root = root;
    Ok(parser.ast)
}

fn lex_error(path: &str, err: LexError) -> ParseError {
    ParseError::new(path, err.span, err.message)
}

/// A closing or continuation statement that ended a sequence.
struct EndTag {
    keyword: String,
    toks: Vec<Tok>,
    span: Span,
}

struct Parser<'a> {
    path: &'a str,
    segments: Vec<Segment<'a>>,
    pos: usize,
    ast: Ast,
    blocks: BTreeSet<String>,
    /// Whether anything other than whitespace has been produced yet.
    seen_output: bool,
}

impl<'a> Parser<'a> {
    fn error(&self, span: Span, message: impl Into<String>) -> ParseError {
        ParseError::new(self.path, span, message)
    }

    /// Parse nodes until one of `terminators` or end of input.
    fn parse_sequence(
        &mut self,
        terminators: &[&str],
    ) -> Result<(Vec<NodeId>, Option<EndTag>), ParseError> {
        let mut nodes = Vec::new();

        while self.pos < self.segments.len() {
            let seg = self.segments[self.pos].clone();
            self.pos += 1;

            match seg.kind {
                SegmentKind::Text => {
                    if !seg.body.trim().is_empty() {
                        self.seen_output = true;
                    }
                    nodes.push(self.ast.push(Node::new(
                        NodeKind::Literal {
                            text: seg.body.to_string(),
                        },
                        seg.span,
                    )));
                }
                SegmentKind::Output => {
                    self.seen_output = true;
                    let toks = tokenize(seg.body, seg.body_offset).map_err(|e| lex_error(self.path, e))?;
                    nodes.push(self.parse_output(&toks, seg.span)?);
                }
                SegmentKind::Statement => {
                    let toks = tokenize(seg.body, seg.body_offset).map_err(|e| lex_error(self.path, e))?;
                    let keyword = match toks.first() {
                        Some(Tok {
                            kind: TokKind::Ident(k),
                            ..
                        }) => k.clone(),
                        _ => return Err(self.error(seg.span, "expected a statement keyword")),
                    };

                    if terminators.contains(&keyword.as_str()) {
                        return Ok((
                            nodes,
                            Some(EndTag {
                                keyword,
                                toks,
                                span: seg.span,
                            }),
                        ));
                    }
                    if let Some(node) = self.parse_statement(&keyword, &toks, seg.span)? {
                        nodes.push(node);
                    }
                }
            }
        }

        Ok((nodes, None))
    }

    /// Parse the body of a block statement, turning end-of-input into an
    /// "unterminated" error pointing at the opening tag.
    fn parse_body(
        &mut self,
        opener: &str,
        open_span: Span,
        terminators: &[&str],
    ) -> Result<(Vec<NodeId>, EndTag), ParseError> {
        match self.parse_sequence(terminators)? {
            (nodes, Some(end)) => Ok((nodes, end)),
            (_, None) => Err(self.error(open_span, format!("unterminated '{opener}' block"))),
        }
    }

    fn parse_statement(
        &mut self,
        keyword: &str,
        toks: &[Tok],
        span: Span,
    ) -> Result<Option<NodeId>, ParseError> {
        let mut cur = Cursor::new(self.path, toks, span);
        cur.bump(); // keyword

        let kind = match keyword {
            "if" => {
                self.seen_output = true;
                return self.parse_if(cur, span).map(Some);
            }
            "for" => {
                self.seen_output = true;
                let binding = cur.binding()?;
                cur.expect_keyword("in")?;
                let iterable = parse_iterable(&mut cur)?;
                cur.finish()?;
                let (body, end) = self.parse_body("for", span, &["endfor"])?;
                Cursor::new(self.path, &end.toks, end.span).bump_finish()?;
                NodeKind::Loop {
                    binding,
                    iterable,
                    body,
                }
            }
            "include" => {
                self.seen_output = true;
                let target = cur.string()?;
                cur.finish()?;
                NodeKind::Include { target }
            }
            "import" => {
                let target = cur.string()?;
                cur.expect_keyword("as")?;
                let alias = cur.ident()?;
                cur.finish()?;
                NodeKind::Import { target, alias }
            }
            "extends" => {
                let target = cur.string()?;
                cur.finish()?;
                if self.ast.extends.is_some() {
                    return Err(self.error(span, "template extends more than one parent"));
                }
                if self.seen_output {
                    return Err(self.error(span, "'extends' must come before any content"));
                }
                self.ast.extends = Some(Reference { target, span });
                return Ok(None);
            }
            "block" => {
                let name = cur.ident()?;
                cur.finish()?;
                if !self.blocks.insert(name.clone()) {
                    return Err(self.error(span, format!("block '{name}' defined twice")));
                }
                let (body, end) = self.parse_body("block", span, &["endblock"])?;
                let mut end_cur = Cursor::new(self.path, &end.toks, end.span);
                end_cur.bump();
                if !end_cur.at_end() {
                    let closing = end_cur.ident()?;
                    if closing != name {
                        return Err(self.error(
                            end.span,
                            format!("'endblock {closing}' does not close block '{name}'"),
                        ));
                    }
                }
                end_cur.finish()?;
                NodeKind::Block { name, body }
            }
            "macro" => {
                let name = cur.ident()?;
                let params = cur.param_list()?;
                cur.finish()?;
                let (body, end) = self.parse_body("macro", span, &["endmacro"])?;
                Cursor::new(self.path, &end.toks, end.span).bump_finish()?;
                NodeKind::Macro { name, params, body }
            }
            "call" => {
                self.seen_output = true;
                let first = cur.ident()?;
                let (namespace, name) = if cur.eat(&TokKind::Dot) {
                    (Some(first), cur.ident()?)
                } else {
                    (None, first)
                };
                let args = cur.arg_list()?;
                cur.finish()?;
                NodeKind::Call {
                    namespace,
                    name,
                    args,
                }
            }
            "stop" => {
                cur.finish()?;
                NodeKind::Stop
            }
            "elif" | "else" | "endif" | "endfor" | "endblock" | "endmacro" | "endraw" => {
                return Err(self.error(span, format!("unexpected '{keyword}'")));
            }
            other => return Err(self.error(span, format!("unknown statement '{other}'"))),
        };

        Ok(Some(self.ast.push(Node::new(kind, span))))
    }

    fn parse_if(&mut self, mut cur: Cursor<'_>, span: Span) -> Result<NodeId, ParseError> {
        let mut branches = Vec::new();
        let mut condition = parse_condition(&mut cur)?;
        cur.finish()?;
        let otherwise;

        loop {
            let (body, end) = self.parse_body("if", span, &["elif", "else", "endif"])?;
            branches.push(Branch { condition, body });
            let mut end_cur = Cursor::new(self.path, &end.toks, end.span);
            end_cur.bump();
            match end.keyword.as_str() {
                "elif" => {
                    condition = parse_condition(&mut end_cur)?;
                    end_cur.finish()?;
                }
                "else" => {
                    end_cur.finish()?;
                    let (body, end) = self.parse_body("if", span, &["endif"])?;
                    Cursor::new(self.path, &end.toks, end.span).bump_finish()?;
                    otherwise = body;
                    break;
                }
                _ => {
                    end_cur.finish()?;
                    otherwise = Vec::new();
                    break;
                }
            }
        }

        Ok(self.ast.push(Node::new(
            NodeKind::Conditional {
                branches,
                otherwise,
            },
            span,
        )))
    }

    fn parse_output(&mut self, toks: &[Tok], span: Span) -> Result<NodeId, ParseError> {
        let mut cur = Cursor::new(self.path, toks, span);
        let expr = parse_expr(&mut cur)?;
        let mut filters = Vec::new();
        while cur.eat(&TokKind::Pipe) {
            let start = cur.peek_span();
            let name = cur.ident()?;
            let args = if cur.peek_is(&TokKind::LParen) {
                cur.literal_args()?
            } else {
                Vec::new()
            };
            filters.push(FilterCall {
                name,
                args,
                span: start.join(cur.prev_span()),
            });
        }
        cur.finish()?;

        let kind = match (expr.atoms.as_slice(), filters.is_empty()) {
            ([Atom::Var(path)], true) => NodeKind::VariableRef { path: path.clone() },
            _ => NodeKind::FilterApplication { expr, filters },
        };
        Ok(self.ast.push(Node::new(kind, span)))
    }
}

// ─── Expression grammar ───────────────────────────────────────

struct Cursor<'t> {
    path: &'t str,
    toks: &'t [Tok],
    pos: usize,
    span: Span,
}

impl<'t> Cursor<'t> {
    fn new(path: &'t str, toks: &'t [Tok], span: Span) -> Self {
        Self {
            path,
            toks,
            pos: 0,
            span,
        }
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError::new(self.path, self.peek_span(), message)
    }

    fn peek(&self) -> Option<&TokKind> {
        self.toks.get(self.pos).map(|t| &t.kind)
    }

    fn peek_is(&self, kind: &TokKind) -> bool {
        self.peek() == Some(kind)
    }

    fn peek_span(&self) -> Span {
        self.toks
            .get(self.pos)
            .map(|t| t.span)
            .unwrap_or(Span::new(self.span.end, self.span.end))
    }

    fn prev_span(&self) -> Span {
        self.pos
            .checked_sub(1)
            .and_then(|p| self.toks.get(p))
            .map(|t| t.span)
            .unwrap_or(self.span)
    }

    fn at_end(&self) -> bool {
        self.pos >= self.toks.len()
    }

    fn bump(&mut self) -> Option<&TokKind> {
        let tok = self.toks.get(self.pos).map(|t| &t.kind);
        self.pos += 1;
        tok
    }

    fn eat(&mut self, kind: &TokKind) -> bool {
        if self.peek_is(kind) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokKind) -> Result<(), ParseError> {
        if self.eat(kind) {
            Ok(())
        } else {
            Err(self.unexpected(&format!("expected {}", kind.describe())))
        }
    }

    fn unexpected(&self, message: &str) -> ParseError {
        match self.peek() {
            Some(found) => self.error(format!("{message}, found {}", found.describe())),
            None => self.error(format!("{message}, found end of marker")),
        }
    }

    fn ident(&mut self) -> Result<String, ParseError> {
        match self.peek() {
            Some(TokKind::Ident(name)) => {
                let name = name.clone();
                self.pos += 1;
                Ok(name)
            }
            _ => Err(self.unexpected("expected an identifier")),
        }
    }

    /// A name bound at render time. `_` names are reserved for globals.
    fn binding(&mut self) -> Result<String, ParseError> {
        let span = self.peek_span();
        let name = self.ident()?;
        if name.starts_with('_') {
            return Err(ParseError::new(
                self.path,
                span,
                format!("'{name}' cannot be bound: '_' names are compile-time globals"),
            ));
        }
        Ok(name)
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<(), ParseError> {
        match self.peek() {
            Some(TokKind::Ident(name)) if name == keyword => {
                self.pos += 1;
                Ok(())
            }
            _ => Err(self.unexpected(&format!("expected '{keyword}'"))),
        }
    }

    fn string(&mut self) -> Result<String, ParseError> {
        match self.peek() {
            Some(TokKind::Str(s)) => {
                let s = s.clone();
                self.pos += 1;
                Ok(s)
            }
            _ => Err(self.unexpected("expected a quoted template path")),
        }
    }

    fn int(&mut self) -> Result<i64, ParseError> {
        match self.peek() {
            Some(TokKind::Int(i)) => {
                let i = *i;
                self.pos += 1;
                Ok(i)
            }
            _ => Err(self.unexpected("expected an integer")),
        }
    }

    fn finish(&self) -> Result<(), ParseError> {
        if self.at_end() {
            Ok(())
        } else {
            Err(self.unexpected("unexpected trailing input"))
        }
    }

    /// Skip the keyword of an end tag and require nothing after it.
    fn bump_finish(mut self) -> Result<(), ParseError> {
        self.bump();
        self.finish()
    }

    fn param_list(&mut self) -> Result<Vec<String>, ParseError> {
        self.expect(&TokKind::LParen)?;
        let mut params = Vec::new();
        if self.eat(&TokKind::RParen) {
            return Ok(params);
        }
        loop {
            params.push(self.binding()?);
            if self.eat(&TokKind::RParen) {
                return Ok(params);
            }
            self.expect(&TokKind::Comma)?;
        }
    }

    fn arg_list(&mut self) -> Result<Vec<Expr>, ParseError> {
        self.expect(&TokKind::LParen)?;
        let mut args = Vec::new();
        if self.eat(&TokKind::RParen) {
            return Ok(args);
        }
        loop {
            args.push(parse_expr(self)?);
            if self.eat(&TokKind::RParen) {
                return Ok(args);
            }
            self.expect(&TokKind::Comma)?;
        }
    }

    fn literal_args(&mut self) -> Result<Vec<Literal>, ParseError> {
        self.expect(&TokKind::LParen)?;
        let mut args = Vec::new();
        if self.eat(&TokKind::RParen) {
            return Ok(args);
        }
        loop {
            match parse_atom(self)? {
                Atom::Lit(lit) => args.push(lit),
                Atom::Var(path) => {
                    return Err(ParseError::new(
                        self.path,
                        self.prev_span(),
                        format!("filter arguments must be literals, found variable '{path}'"),
                    ))
                }
            }
            if self.eat(&TokKind::RParen) {
                return Ok(args);
            }
            self.expect(&TokKind::Comma)?;
        }
    }
}

fn parse_atom(cur: &mut Cursor<'_>) -> Result<Atom, ParseError> {
    match cur.peek().cloned() {
        Some(TokKind::Str(s)) => {
            cur.pos += 1;
            Ok(Atom::Lit(Literal::Str(s)))
        }
        Some(TokKind::Int(i)) => {
            cur.pos += 1;
            Ok(Atom::Lit(Literal::Int(i)))
        }
        Some(TokKind::Ident(name)) => {
            cur.pos += 1;
            match name.as_str() {
                "true" => return Ok(Atom::Lit(Literal::Bool(true))),
                "false" => return Ok(Atom::Lit(Literal::Bool(false))),
                "none" => return Ok(Atom::Lit(Literal::Null)),
                _ => {}
            }
            let mut path = VarPath::simple(name);
            while cur.peek_is(&TokKind::Dot) {
                cur.pos += 1;
                match cur.peek().cloned() {
                    Some(TokKind::Ident(attr)) => path.attrs.push(attr),
                    Some(TokKind::Int(i)) if i >= 0 => path.attrs.push(i.to_string()),
                    _ => return Err(cur.unexpected("expected an attribute name")),
                }
                cur.pos += 1;
            }
            Ok(Atom::Var(path))
        }
        _ => Err(cur.unexpected("expected an expression")),
    }
}

fn parse_expr(cur: &mut Cursor<'_>) -> Result<Expr, ParseError> {
    let mut atoms = vec![parse_atom(cur)?];
    while cur.eat(&TokKind::Tilde) {
        atoms.push(parse_atom(cur)?);
    }
    Ok(Expr { atoms })
}

fn parse_condition(cur: &mut Cursor<'_>) -> Result<Condition, ParseError> {
    let negate = matches!(cur.peek(), Some(TokKind::Ident(k)) if k == "not");
    if negate {
        cur.pos += 1;
    }
    let lhs = parse_expr(cur)?;
    let cmp = if cur.eat(&TokKind::EqEq) {
        Some((CmpOp::Eq, parse_expr(cur)?))
    } else if cur.eat(&TokKind::NotEq) {
        Some((CmpOp::Ne, parse_expr(cur)?))
    } else {
        None
    };
    Ok(Condition { negate, lhs, cmp })
}

fn parse_iterable(cur: &mut Cursor<'_>) -> Result<Iterable, ParseError> {
    if matches!(cur.peek(), Some(TokKind::Ident(k)) if k == "range")
        && cur.toks.get(cur.pos + 1).map(|t| &t.kind) == Some(&TokKind::LParen)
    {
        cur.pos += 2;
        let first = cur.int()?;
        let (start, end) = if cur.eat(&TokKind::Comma) {
            (first, cur.int()?)
        } else {
            (0, first)
        };
        cur.expect(&TokKind::RParen)?;
        return Ok(Iterable::Range { start, end });
    }
    match parse_atom(cur)? {
        Atom::Var(path) => Ok(Iterable::Var(path)),
        Atom::Lit(_) => Err(ParseError::new(
            cur.path,
            cur.prev_span(),
            "loops iterate over a variable or range(...)",
        )),
    }
}
