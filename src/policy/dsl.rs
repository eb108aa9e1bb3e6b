//! Policy DSL text form
//!
//! ```text
//! [AGGREGATE] (SOURCE <ident>)* (SINK <ident>)? CONSTRAINT <expr_sql>
//!             ON FAIL <action> [DESCRIPTION <text>]
//! ```
//!
//! Keywords are case-insensitive and may appear in any order; each value
//! runs from its keyword to the next keyword. Whitespace is normalized to
//! single spaces, so constraints keep their token structure but not their
//! exact spacing. `NONE` as a SOURCE/SINK value means absent.

use super::{Action, PolicyError};

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedPolicyText {
    pub aggregate: bool,
    pub sources: Vec<String>,
    pub sink: Option<String>,
    pub constraint: String,
    pub action: Action,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Keyword {
    Source,
    Sink,
    Constraint,
    OnFail,
    Description,
}

pub fn parse_policy_text(text: &str) -> Result<ParsedPolicyText, PolicyError> {
    if text.trim().is_empty() {
        return Err(PolicyError::ParseError("policy text is empty".to_string()));
    }

    let tokens: Vec<&str> = text.split_whitespace().collect();
    let mut start = 0;
    let aggregate = tokens
        .first()
        .is_some_and(|t| t.eq_ignore_ascii_case("AGGREGATE"));
    if aggregate {
        start = 1;
    }

    // Keyword positions in token space. "ON FAIL" spans two tokens.
    let mut keywords: Vec<(usize, Keyword, usize)> = Vec::new();
    let mut i = start;
    while i < tokens.len() {
        let tok = tokens[i];
        let found = if tok.eq_ignore_ascii_case("SOURCE") {
            Some((Keyword::Source, 1))
        } else if tok.eq_ignore_ascii_case("SINK") {
            Some((Keyword::Sink, 1))
        } else if tok.eq_ignore_ascii_case("CONSTRAINT") {
            Some((Keyword::Constraint, 1))
        } else if tok.eq_ignore_ascii_case("DESCRIPTION") {
            Some((Keyword::Description, 1))
        } else if tok.eq_ignore_ascii_case("ON")
            && tokens.get(i + 1).is_some_and(|t| t.eq_ignore_ascii_case("FAIL"))
        {
            Some((Keyword::OnFail, 2))
        } else {
            None
        };
        if let Some((kw, width)) = found {
            keywords.push((i, kw, width));
            i += width;
        } else {
            i += 1;
        }
    }

    if keywords.first().is_none_or(|(pos, _, _)| *pos != start) {
        return Err(PolicyError::ParseError(
            "policy text must start with a keyword (SOURCE, SINK, CONSTRAINT, ON FAIL, DESCRIPTION)"
                .to_string(),
        ));
    }

    let mut sources = Vec::new();
    let mut sink = None;
    let mut constraint: Option<String> = None;
    let mut action: Option<Action> = None;
    let mut description: Option<String> = None;

    for (idx, (pos, keyword, width)) in keywords.iter().enumerate() {
        let value_start = pos + width;
        let value_end = keywords
            .get(idx + 1)
            .map(|(next, _, _)| *next)
            .unwrap_or(tokens.len());
        let value = tokens[value_start..value_end].join(" ");

        match keyword {
            Keyword::Source => {
                if !value.is_empty() && !value.eq_ignore_ascii_case("NONE") {
                    sources.push(value);
                }
            }
            Keyword::Sink => {
                sink = if value.is_empty() || value.eq_ignore_ascii_case("NONE") {
                    None
                } else {
                    Some(value)
                };
            }
            Keyword::Constraint => constraint = Some(value),
            Keyword::OnFail => {
                action = Some(value.parse::<Action>().map_err(|_| {
                    PolicyError::ParseError(format!(
                        "invalid ON FAIL value '{value}'; must be one of \
                         REMOVE, KILL, INVALIDATE, INVALIDATE_MESSAGE, HUMAN, LLM"
                    ))
                })?);
            }
            Keyword::Description => {
                description = if value.is_empty() { None } else { Some(value) };
            }
        }
    }

    let constraint = constraint.filter(|c| !c.is_empty()).ok_or_else(|| {
        PolicyError::ParseError("CONSTRAINT is required but not found in policy text".to_string())
    })?;
    let action = action.ok_or_else(|| {
        PolicyError::ParseError("ON FAIL is required but not found in policy text".to_string())
    })?;
    if sources.is_empty() && sink.is_none() {
        return Err(PolicyError::MissingSourceOrSink);
    }

    Ok(ParsedPolicyText {
        aggregate,
        sources,
        sink,
        constraint,
        action,
        description,
    })
}
