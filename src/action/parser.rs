//! Thought/Action response parser.
//!
//! A response looks like
//!
//! ```text
//! Thought: the search box is at the top
//! Action: click(start_box='(235,512)')
//! ```
//!
//! Every candidate after the action marker must be a single call with
//! keyword arguments bound to literals. Anything else is a [`GrammarError`];
//! the parser never guesses beyond the click/drag repairs in
//! [`super::repair`].

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;

use crate::action::repair;
use crate::action::types::{ActionArg, ActionType, ParsedAction};
use crate::errors::GrammarError;
use crate::grammar::{tokenize, Cursor, Token};
use crate::perception::resize::{box_to_fraction, CoordinateConvention};

/// Per-dialect parsing rules.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParseProfile {
    /// Text that introduces the action section.
    pub action_marker: &'static str,
    /// Separator between successive actions in the action section.
    pub separator: &'static str,
    /// Append a missing closing parenthesis to each candidate.
    pub close_calls: bool,
    /// A `type(content` candidate without a well-formed content literal is
    /// an error rather than left for the call grammar to reject.
    pub strict_type_content: bool,
    pub convention: CoordinateConvention,
}

impl ParseProfile {
    /// Legacy UI-TARS: boxes are thousandths of the screen.
    pub fn uitars() -> Self {
        Self {
            action_marker: "Action:",
            separator: "\n\n",
            close_calls: false,
            strict_type_content: false,
            convention: CoordinateConvention::Factor(1000.0),
        }
    }

    /// UI-TARS 1.5: boxes are pixels of the smart-resized screenshot.
    pub fn uitars15(resized_height: u32, resized_width: u32) -> Self {
        Self {
            action_marker: "Action: ",
            separator: ")\n\n",
            close_calls: true,
            strict_type_content: true,
            convention: CoordinateConvention::AxisAware {
                height: resized_height as f64,
                width: resized_width as f64,
            },
        }
    }
}

macro_rules! static_regex {
    ($name:ident, $pattern:expr) => {
        fn $name() -> &'static Regex {
            static RE: OnceLock<Regex> = OnceLock::new();
            RE.get_or_init(|| Regex::new($pattern).expect("static regex"))
        }
    };
}

static_regex!(point_tag, r"<point>(\d+)\s+(\d+)</point>");
static_regex!(type_content, r"(?s)type\(content='(.*?)'\)");

/// Rewrites the light textual variants models emit into the canonical form.
pub fn normalize_response(text: &str) -> String {
    let text = text.trim().replace("[EOS]", "");
    let text = point_tag().replace_all(&text, |caps: &regex::Captures<'_>| {
        format!("({},{})", &caps[1], &caps[2])
    });
    text.replace("<|box_start|>", "")
        .replace("<|box_end|>", "")
        .replace("start_point=", "start_box=")
        .replace("end_point=", "end_box=")
        .replace("point=", "start_box=")
        .trim()
        .to_string()
}

/// Escapes every `'` not already preceded by a backslash.
pub fn escape_single_quotes(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut prev = None;
    for c in text.chars() {
        if c == '\'' && prev != Some('\\') {
            out.push('\\');
        }
        out.push(c);
        prev = Some(c);
    }
    out
}

/// Returns `(reflection, thought)`.
fn extract_rationale(text: &str, marker: &str) -> (Option<String>, Option<String>) {
    fn until_marker(rest: &str, marker: &str) -> Option<String> {
        // the rationale owns at least one character before the marker
        let end = rest
            .char_indices()
            .skip(1)
            .find(|(i, _)| rest[*i..].starts_with(marker))
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        let s = rest[..end].trim();
        (!s.is_empty()).then(|| s.to_string())
    }

    if text.starts_with("Reflection:") {
        let Some(start) = text.find("Reflection: ") else {
            return (None, None);
        };
        let body = &text[start + "Reflection: ".len()..];
        let Some(split) = body.find("Action_Summary: ") else {
            return (None, None);
        };
        let reflection = body[..split].trim().to_string();
        let thought = until_marker(&body[split + "Action_Summary: ".len()..], marker);
        if thought.is_none() {
            return (None, None);
        }
        return (Some(reflection), thought);
    }

    let hint = if text.starts_with("Action_Summary:") {
        "Action_Summary: "
    } else {
        "Thought: "
    };
    let thought = text
        .find(hint)
        .and_then(|start| until_marker(&text[start + hint.len()..], marker));
    (None, thought)
}

/// Rebuilds a `type(content='...')` candidate with its quotes re-escaped.
fn rewrap_type_content(candidate: &str, profile: &ParseProfile) -> Result<String, GrammarError> {
    let mut candidate = candidate.to_string();
    if profile.close_calls && !candidate.trim().ends_with(')') {
        candidate = format!("{})", candidate.trim());
    }

    let pattern = type_content();
    if profile.strict_type_content && !pattern.is_match(&candidate) {
        return Err(GrammarError::MissingTypeContent(candidate));
    }
    let content = pattern.replace_all(&candidate, |caps: &regex::Captures<'_>| caps[1].to_string());
    Ok(format!("type(content='{}')", escape_single_quotes(&content)))
}

/// Splits the action section into call candidates, blank ones dropped.
fn split_candidates(section: &str, profile: &ParseProfile) -> Result<Vec<String>, GrammarError> {
    let mut candidates = Vec::new();
    for piece in section.split(profile.separator) {
        if piece.trim().is_empty() {
            continue;
        }
        let mut candidate = if piece.contains("type(content") {
            rewrap_type_content(piece, profile)?
        } else {
            piece.to_string()
        };
        if profile.close_calls && !candidate.trim().ends_with(')') {
            candidate = format!("{})", candidate.trim());
        }
        candidates.push(candidate.trim().to_string());
    }
    Ok(candidates)
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    None,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub name: String,
    pub kwargs: Vec<(String, Literal)>,
}

/// `name(k=literal, ...)` or `obj.name(...)`; the last attribute names the call.
pub fn parse_call(src: &str) -> Result<Call, String> {
    let tokens = tokenize(src).map_err(|e| e.to_string())?;
    let mut cur = Cursor::new(tokens);

    let mut name = match cur.next() {
        Some(Token::Ident(n)) => n,
        Some(t) => return Err(format!("expected a function name, found '{t}'")),
        None => return Err("empty action".into()),
    };
    while cur.eat(&Token::Dot) {
        match cur.next() {
            Some(Token::Ident(n)) => name = n,
            _ => return Err("expected an attribute name after '.'".into()),
        }
    }

    cur.expect(&Token::LParen)?;
    let mut kwargs: Vec<(String, Literal)> = Vec::new();
    loop {
        if cur.eat(&Token::RParen) {
            break;
        }
        let key = match (cur.peek(), cur.peek_at(1)) {
            (Some(Token::Ident(k)), Some(Token::Assign)) => k.clone(),
            (Some(t), _) => return Err(format!("positional argument '{t}' is not allowed")),
            (None, _) => return Err("unclosed call".into()),
        };
        cur.next();
        cur.next();
        if kwargs.iter().any(|(k, _)| *k == key) {
            return Err(format!("keyword argument repeated: {key}"));
        }
        let value = parse_literal(&mut cur)?;
        kwargs.push((key, value));

        if !cur.eat(&Token::Comma) {
            cur.expect(&Token::RParen)?;
            break;
        }
    }

    if !cur.is_done() {
        return Err("trailing input after call".into());
    }
    Ok(Call { name, kwargs })
}

fn parse_literal(cur: &mut Cursor) -> Result<Literal, String> {
    match cur.next() {
        Some(Token::Str(s)) => {
            // adjacent literals concatenate
            let mut s = s;
            while let Some(Token::Str(more)) = cur.peek() {
                s.push_str(more);
                cur.next();
            }
            Ok(Literal::Str(s))
        }
        Some(Token::Int(n)) => Ok(Literal::Int(n)),
        Some(Token::Float(n)) => Ok(Literal::Float(n)),
        Some(Token::Minus) => match cur.next() {
            Some(Token::Int(n)) => Ok(Literal::Int(-n)),
            Some(Token::Float(n)) => Ok(Literal::Float(-n)),
            _ => Err("expected a number after '-'".into()),
        },
        Some(Token::Plus) => match cur.next() {
            Some(Token::Int(n)) => Ok(Literal::Int(n)),
            Some(Token::Float(n)) => Ok(Literal::Float(n)),
            _ => Err("expected a number after '+'".into()),
        },
        Some(Token::Ident(id)) => match id.as_str() {
            "True" => Ok(Literal::Bool(true)),
            "False" => Ok(Literal::Bool(false)),
            "None" => Ok(Literal::None),
            _ => Err(format!("'{id}' is not a literal")),
        },
        Some(t) => Err(format!("'{t}' is not a literal")),
        None => Err("missing argument value".into()),
    }
}

enum CandidateError {
    Syntax(String),
    Coordinate { param: String, value: String },
}

fn parse_box(value: &str, convention: &CoordinateConvention) -> Option<[f64; 4]> {
    let cleaned: String = value
        .chars()
        .filter(|c| !matches!(c, '(' | ')' | '[' | ']'))
        .collect();
    let numbers = cleaned
        .split(',')
        .map(|n| n.trim().parse::<f64>())
        .collect::<Result<Vec<_>, _>>()
        .ok()?;
    box_to_fraction(&numbers, convention)
}

fn candidate_to_action(
    candidate: &str,
    text: &str,
    reflection: &Option<String>,
    thought: &Option<String>,
    profile: &ParseProfile,
) -> Result<ParsedAction, CandidateError> {
    let src = candidate.replace('\n', "\\n");
    let call = parse_call(src.trim_start()).map_err(CandidateError::Syntax)?;

    let mut inputs = BTreeMap::new();
    for (name, value) in call.kwargs {
        let value = match value {
            Literal::None => continue,
            Literal::Str(s) if s.is_empty() => continue,
            Literal::Str(s) => s.trim_start().to_string(),
            Literal::Int(n) => n.to_string(),
            Literal::Float(n) => n.to_string(),
            Literal::Bool(true) => "True".to_string(),
            Literal::Bool(false) => "False".to_string(),
        };
        let name = name.trim().to_string();

        let arg = if name.contains("start_box") || name.contains("end_box") {
            match parse_box(&value, &profile.convention) {
                Some(b) => ActionArg::Box(b),
                None => return Err(CandidateError::Coordinate { param: name, value }),
            }
        } else {
            ActionArg::Text(value)
        };
        inputs.insert(name, arg);
    }

    Ok(ParsedAction {
        action_type: ActionType::from_name(&call.name),
        inputs,
        reflection: reflection.clone(),
        thought: thought.clone(),
        raw_text: text.to_string(),
    })
}

/// Parses one model response into its ordered actions. Either every
/// candidate parses or the whole response fails.
pub fn parse(raw_text: &str, profile: &ParseProfile) -> Result<Vec<ParsedAction>, GrammarError> {
    let text = normalize_response(raw_text);
    let (reflection, thought) = extract_rationale(&text, profile.action_marker);

    if !text.contains("Action:") {
        return Err(GrammarError::MissingActionSection);
    }
    let section = text.split(profile.action_marker).last().unwrap_or_default();

    let mut actions = Vec::new();
    for candidate in split_candidates(section, profile)? {
        let strict = candidate_to_action(&candidate, &text, &reflection, &thought, profile);
        let parsed = match strict {
            Ok(action) => action,
            Err(first) => {
                let repaired = repair::repair(&candidate).and_then(|fixed| {
                    candidate_to_action(&fixed, &text, &reflection, &thought, profile).ok()
                });
                match (repaired, first) {
                    (Some(action), _) => action,
                    (None, CandidateError::Syntax(reason)) => {
                        tracing::error!(candidate = %candidate, reason = %reason, "action can't parse");
                        return Err(GrammarError::ActionParse { candidate, reason });
                    }
                    (None, CandidateError::Coordinate { param, value }) => {
                        tracing::error!(candidate = %candidate, param = %param, "bad coordinate");
                        return Err(GrammarError::BadCoordinate { candidate, param, value });
                    }
                }
            }
        };
        actions.push(parsed);
    }

    if actions.is_empty() {
        return Err(GrammarError::ActionParse {
            candidate: section.to_string(),
            reason: "no action in Action section".into(),
        });
    }
    Ok(actions)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn legacy(text: &str) -> Result<Vec<ParsedAction>, GrammarError> {
        parse(text, &ParseProfile::uitars())
    }

    #[test]
    fn single_point_becomes_degenerate_box() {
        let profile = ParseProfile {
            convention: CoordinateConvention::Factor(1.0),
            ..ParseProfile::uitars()
        };
        let actions = parse("Thought: go\nAction: click(start_box='(100,100)')", &profile).unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].action_type, ActionType::Click);
        assert_eq!(actions[0].bbox("start_box"), Some(&[100.0, 100.0, 100.0, 100.0]));
        assert_eq!(actions[0].thought.as_deref(), Some("go"));
    }

    #[test]
    fn missing_action_marker_is_an_error() {
        assert_eq!(
            legacy("Thought: I will click the button"),
            Err(GrammarError::MissingActionSection)
        );
    }

    #[test]
    fn actions_keep_their_order() {
        let text = "Thought: two steps\nAction: click(start_box='(10,20)')\n\nhotkey(key='ctrl s')";
        let actions = legacy(text).unwrap();
        let kinds: Vec<_> = actions.iter().map(|a| a.action_type.clone()).collect();
        assert_eq!(kinds, vec![ActionType::Click, ActionType::Hotkey]);
        assert_eq!(actions[1].text("key"), Some("ctrl s"));
    }

    #[test]
    fn finished_parses_with_no_arguments() {
        let actions = legacy("Thought: done\nAction: finished()").unwrap();
        assert_eq!(actions[0].action_type, ActionType::Finished);
        assert!(actions[0].inputs.is_empty());
    }

    #[test]
    fn type_content_quotes_are_reescaped() {
        let actions = legacy("Thought: t\nAction: type(content='it's fine\\n')").unwrap();
        assert_eq!(actions[0].text("content"), Some("it's fine\n"));
    }

    #[test]
    fn type_without_content_literal_fails_in_strict_profile() {
        let err = parse(
            "Thought: t\nAction: type(content=\"abc\")",
            &ParseProfile::uitars15(812, 1288),
        )
        .unwrap_err();
        assert!(matches!(err, GrammarError::MissingTypeContent(_)));
    }

    #[test]
    fn malformed_click_is_repaired() {
        let actions = legacy("Thought: t\nAction: click(start_box='=x(50,60)')").unwrap();
        assert_eq!(actions[0].bbox("start_box"), Some(&[0.05, 0.06, 0.05, 0.06]));
    }

    #[test]
    fn unrepairable_click_is_a_grammar_error() {
        let err = legacy("Thought: t\nAction: click(start_box='=x(50)')").unwrap_err();
        assert!(matches!(
            err,
            GrammarError::BadCoordinate { ref candidate, ref param, .. }
                if candidate == "click(start_box='=x(50)')" && param == "start_box"
        ));

        let err = legacy("Thought: t\nAction: click(start_box=x)").unwrap_err();
        assert!(matches!(err, GrammarError::ActionParse { ref candidate, .. } if candidate == "click(start_box=x)"));
    }

    #[test]
    fn positional_arguments_are_rejected() {
        let err = parse_call("click('(1,2)')").unwrap_err();
        assert!(err.contains("positional"));
    }

    #[test]
    fn dotted_call_uses_last_attribute() {
        let call = parse_call("pyautogui.press(key='enter', presses=-2, dry=True,)").unwrap();
        assert_eq!(call.name, "press");
        assert_eq!(call.kwargs[1], ("presses".into(), Literal::Int(-2)));
        assert_eq!(call.kwargs[2], ("dry".into(), Literal::Bool(true)));
    }

    #[test]
    fn uitars15_uses_axis_aware_boxes() {
        let profile = ParseProfile::uitars15(812, 1288);
        let text = "Thought: open menu\nAction: click(start_point='<point>644 406</point>')";
        let actions = parse(text, &profile).unwrap();
        assert_eq!(actions[0].bbox("start_box"), Some(&[0.5, 0.5, 0.5, 0.5]));
    }

    #[test]
    fn uitars15_splits_on_closing_paren() {
        let profile = ParseProfile::uitars15(812, 1288);
        let text = "Thought: t\nAction: drag(start_box='(0,0)', end_box='(644,406)')\n\nwait()";
        let actions = parse(text, &profile).unwrap();
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0].action_type, ActionType::Drag);
        assert_eq!(actions[1].action_type, ActionType::Wait);
    }

    #[test]
    fn reflection_and_summary_are_split() {
        let text = "Reflection: missed it Action_Summary: retry the click\nAction: click(start_box='(1,1)')";
        let actions = legacy(text).unwrap();
        assert_eq!(actions[0].reflection.as_deref(), Some("missed it"));
        assert_eq!(actions[0].thought.as_deref(), Some("retry the click"));
    }

    #[test]
    fn blank_trailing_candidate_is_skipped() {
        let actions = legacy("Thought: t\nAction: scroll(direction='down')\n\n\n\n").unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].text("direction"), Some("down"));
    }

    #[test]
    fn quote_escaping_skips_escaped_quotes() {
        assert_eq!(escape_single_quotes(r"a'b\'c"), r"a\'b\'c");
    }
}
