//! Tokenizer for template markers.
//!
//! Lexing happens in two layers. [`segment`] splits source into text,
//! `{{ output }}` and `{% statement %}` segments (dropping `{# comments #}`
//! and expanding `{% raw %}` sections to text), honouring quoted strings so a
//! `%}` inside a string literal does not close a marker. [`tokenize`] then
//! turns the body of a marker into expression tokens with `nom`
//! combinators.

use crate::types::Span;
use nom::branch::alt;
use nom::bytes::complete::{escaped_transform, tag, take_while};
use nom::character::complete::{anychar, char, digit1, none_of, satisfy};
use nom::combinator::{map, opt, recognize, value};
use nom::sequence::{delimited, pair};
use nom::IResult;

/// Lexing failure; the parser attaches the template path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LexError {
    pub span: Span,
    pub message: String,
}

impl LexError {
    fn new(span: Span, message: impl Into<String>) -> Self {
        Self {
            span,
            message: message.into(),
        }
    }
}

// ─── Segments ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SegmentKind {
    Text,
    Output,
    Statement,
}

/// A top-level piece of template source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Segment<'a> {
    pub kind: SegmentKind,
    /// Text content, or the marker body without delimiters.
    pub body: &'a str,
    /// Span of the whole segment including delimiters.
    pub span: Span,
    /// Offset of `body` within the source.
    pub body_offset: usize,
}

pub(crate) fn segment(source: &str) -> Result<Vec<Segment<'_>>, LexError> {
    let bytes = source.as_bytes();
    let mut segments = Vec::new();
    let mut pos = 0;
    let mut text_start = 0;

    while pos + 1 < bytes.len() {
        if bytes[pos] != b'{' {
            pos += 1;
            continue;
        }
        let (kind, close) = match bytes[pos + 1] {
            b'{' => (SegmentKind::Output, "}}"),
            b'%' => (SegmentKind::Statement, "%}"),
            b'#' => {
                let end = source[pos + 2..]
                    .find("#}")
                    .ok_or_else(|| LexError::new(Span::new(pos, pos + 2), "unterminated comment"))?;
                push_text(&mut segments, source, text_start, pos);
                pos = pos + 2 + end + 2;
                text_start = pos;
                continue;
            }
            _ => {
                pos += 1;
                continue;
            }
        };

        push_text(&mut segments, source, text_start, pos);
        let body_start = pos + 2;
        let body_end = find_close(source, body_start, close).ok_or_else(|| {
            let what = if kind == SegmentKind::Output {
                "output"
            } else {
                "statement"
            };
            LexError::new(Span::new(pos, pos + 2), format!("unterminated {what} marker"))
        })?;
        let end = body_end + 2;
        let body = &source[body_start..body_end];

        if kind == SegmentKind::Statement && body.trim() == "raw" {
            let (raw_end, after) = find_endraw(source, end)
                .ok_or_else(|| LexError::new(Span::new(pos, end), "unterminated 'raw' block"))?;
            if raw_end > end {
                segments.push(Segment {
                    kind: SegmentKind::Text,
                    body: &source[end..raw_end],
                    span: Span::new(end, raw_end),
                    body_offset: end,
                });
            }
            pos = after;
            text_start = pos;
            continue;
        }

        segments.push(Segment {
            kind,
            body,
            span: Span::new(pos, end),
            body_offset: body_start,
        });
        pos = end;
        text_start = pos;
    }

    push_text(&mut segments, source, text_start, source.len());
    Ok(segments)
}

fn push_text<'a>(segments: &mut Vec<Segment<'a>>, source: &'a str, start: usize, end: usize) {
    if end > start {
        segments.push(Segment {
            kind: SegmentKind::Text,
            body: &source[start..end],
            span: Span::new(start, end),
            body_offset: start,
        });
    }
}

/// Position of `close` at or after `from`, skipping quoted strings.
fn find_close(source: &str, from: usize, close: &str) -> Option<usize> {
    let bytes = source.as_bytes();
    let close = close.as_bytes();
    let mut i = from;
    let mut quote: Option<u8> = None;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) => {
                if b == b'\\' {
                    i += 2;
                    continue;
                }
                if b == q {
                    quote = None;
                }
            }
            None => {
                if b == b'"' || b == b'\'' {
                    quote = Some(b);
                } else if bytes[i..].starts_with(close) {
                    return Some(i);
                }
            }
        }
        i += 1;
    }
    None
}

/// Finds `{% endraw %}` after `from`; returns (start of tag, end of tag).
fn find_endraw(source: &str, from: usize) -> Option<(usize, usize)> {
    let mut search = from;
    while let Some(rel) = source[search..].find("{%") {
        let start = search + rel;
        let close = source[start + 2..].find("%}")?;
        let body = &source[start + 2..start + 2 + close];
        let end = start + 2 + close + 2;
        if body.trim() == "endraw" {
            return Some((start, end));
        }
        search = end;
    }
    None
}

// ─── Expression tokens ────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TokKind {
    Ident(String),
    Str(String),
    Int(i64),
    Pipe,
    Tilde,
    Dot,
    Comma,
    LParen,
    RParen,
    EqEq,
    NotEq,
}

impl TokKind {
    pub fn describe(&self) -> String {
        match self {
            TokKind::Ident(s) => format!("identifier '{s}'"),
            TokKind::Str(_) => "string literal".to_string(),
            TokKind::Int(i) => format!("number {i}"),
            TokKind::Pipe => "'|'".to_string(),
            TokKind::Tilde => "'~'".to_string(),
            TokKind::Dot => "'.'".to_string(),
            TokKind::Comma => "','".to_string(),
            TokKind::LParen => "'('".to_string(),
            TokKind::RParen => "')'".to_string(),
            TokKind::EqEq => "'=='".to_string(),
            TokKind::NotEq => "'!='".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Tok {
    pub kind: TokKind,
    pub span: Span,
}

/// Tokenize a marker body. `offset` is the body's position in the source.
pub(crate) fn tokenize(body: &str, offset: usize) -> Result<Vec<Tok>, LexError> {
    let mut toks = Vec::new();
    let mut rest = body.trim_start();

    while let Some(first) = rest.chars().next() {
        let start = offset + body.len() - rest.len();

        let (after, kind) = if first == '"' || first == '\'' {
            let (after, text) = quoted(first, rest).map_err(|_| {
                LexError::new(
                    Span::new(start, offset + body.len()),
                    "unterminated string literal",
                )
            })?;
            (after, TokKind::Str(text))
        } else if let Ok((after, digits)) = integer(rest) {
            let value = digits.parse::<i64>().map_err(|_| {
                LexError::new(
                    Span::new(start, start + digits.len()),
                    format!("integer out of range: {digits}"),
                )
            })?;
            (after, TokKind::Int(value))
        } else {
            alt((punct, map(identifier, |s: &str| TokKind::Ident(s.to_string()))))(rest)
                .map_err(|_| {
                    LexError::new(
                        Span::new(start, start + first.len_utf8()),
                        format!("unexpected character '{first}'"),
                    )
                })?
        };

        toks.push(Tok {
            kind,
            span: Span::new(start, offset + body.len() - after.len()),
        });
        rest = after.trim_start();
    }

    Ok(toks)
}

type LexResult<'a, T> = IResult<&'a str, T, nom::error::Error<&'a str>>;

fn punct(input: &str) -> LexResult<'_, TokKind> {
    alt((
        value(TokKind::EqEq, tag("==")),
        value(TokKind::NotEq, tag("!=")),
        value(TokKind::Pipe, char('|')),
        value(TokKind::Tilde, char('~')),
        value(TokKind::Dot, char('.')),
        value(TokKind::Comma, char(',')),
        value(TokKind::LParen, char('(')),
        value(TokKind::RParen, char(')')),
    ))(input)
}

fn identifier(input: &str) -> LexResult<'_, &str> {
    recognize(pair(
        satisfy(|c| c.is_alphabetic() || c == '_'),
        take_while(|c: char| c.is_alphanumeric() || c == '_'),
    ))(input)
}

fn integer(input: &str) -> LexResult<'_, &str> {
    recognize(pair(opt(char('-')), digit1))(input)
}

/// String literal in `quote`; `\n` and `\t` are translated, any other
/// escaped character stands for itself.
fn quoted(quote: char, input: &str) -> LexResult<'_, String> {
    let stop = if quote == '"' { "\"\\" } else { "'\\" };
    delimited(
        char(quote),
        map(
            opt(escaped_transform(
                none_of(stop),
                '\\',
                alt((value('\n', char('n')), value('\t', char('t')), anychar)),
            )),
            Option::unwrap_or_default,
        ),
        char(quote),
    )(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<SegmentKind> {
        segment(source).unwrap().into_iter().map(|s| s.kind).collect()
    }

    #[test]
    fn splits_text_and_markers() {
        let segs = segment("Hi {{ name }}!{% if x %}y{% endif %}").unwrap();
        assert_eq!(segs.len(), 6);
        assert_eq!(segs[0].body, "Hi ");
        assert_eq!(segs[1].kind, SegmentKind::Output);
        assert_eq!(segs[1].body.trim(), "name");
        assert_eq!(segs[1].span, Span::new(3, 13));
        assert_eq!(segs[3].body.trim(), "if x");
    }

    #[test]
    fn comments_are_dropped() {
        assert_eq!(
            kinds("a{# note {{ x }} #}b"),
            vec![SegmentKind::Text, SegmentKind::Text]
        );
    }

    #[test]
    fn quoted_close_marker_does_not_terminate() {
        let segs = segment(r#"{{ "50%} off" | upper }}"#).unwrap();
        assert_eq!(segs.len(), 1);
        assert!(segs[0].body.contains("50%} off"));
    }

    #[test]
    fn raw_sections_become_text() {
        let segs = segment("{% raw %}{{ not parsed }}{% endraw %}").unwrap();
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].kind, SegmentKind::Text);
        assert_eq!(segs[0].body, "{{ not parsed }}");
    }

    #[test]
    fn unterminated_markers_fail_with_span() {
        let err = segment("ok {{ name ").unwrap_err();
        assert_eq!(err.span, Span::new(3, 5));
        assert!(segment("{# forever").is_err());
        assert!(segment("{% raw %} no end").is_err());
    }

    #[test]
    fn tokenizes_expressions() {
        let toks = tokenize(r#" user.name | default("anon") ~ -3 != 'x' "#, 0).unwrap();
        let kinds: Vec<TokKind> = toks.into_iter().map(|t| t.kind).collect();
        assert_eq!(
            kinds,
            vec![
                TokKind::Ident("user".into()),
                TokKind::Dot,
                TokKind::Ident("name".into()),
                TokKind::Pipe,
                TokKind::Ident("default".into()),
                TokKind::LParen,
                TokKind::Str("anon".into()),
                TokKind::RParen,
                TokKind::Tilde,
                TokKind::Int(-3),
                TokKind::NotEq,
                TokKind::Str("x".into()),
            ]
        );
    }

    #[test]
    fn token_spans_are_absolute() {
        let toks = tokenize("abc", 10).unwrap();
        assert_eq!(toks[0].span, Span::new(10, 13));
    }

    #[test]
    fn string_escapes() {
        let toks = tokenize(r#""a\"b\n""#, 0).unwrap();
        assert_eq!(toks[0].kind, TokKind::Str("a\"b\n".into()));
        assert!(tokenize("\"open", 0).is_err());
        assert!(tokenize("a = b", 0).is_err());
    }
}
