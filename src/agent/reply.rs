//! Reply selection without AI: keyword rules and coarse fallbacks

use crate::session::ReplyRule;

/// Where a reply came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplySource {
    Rule,
    Ai,
    Heuristic,
}

impl ReplySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplySource::Rule => "rule",
            ReplySource::Ai => "ai",
            ReplySource::Heuristic => "heuristic",
        }
    }
}

const GREETINGS: &[&str] = &["hi", "hello", "hey", "yo", "hola", "sup"];

/// First rule, in list order, whose pattern occurs in `text`
pub fn match_rule<'a>(rules: &'a [ReplyRule], text: &str) -> Option<&'a ReplyRule> {
    let lowered = text.to_lowercase();
    rules.iter().find(|rule| {
        if rule.pattern.is_empty() {
            return false;
        }
        if rule.case_sensitive {
            text.contains(&rule.pattern)
        } else {
            lowered.contains(&rule.pattern.to_lowercase())
        }
    })
}

/// Canned reply keyed on coarse message features, checked in order:
/// a question mark, a greeting word, "thank"
pub fn heuristic_reply(text: &str) -> Option<&'static str> {
    let lowered = text.to_lowercase();
    if lowered.contains('?') {
        return Some("Good question, let me get back to you on that!");
    }
    let greets = lowered
        .split(|c: char| !c.is_alphanumeric())
        .any(|word| GREETINGS.contains(&word));
    if greets {
        return Some("Hey! How's it going?");
    }
    if lowered.contains("thank") {
        return Some("You're welcome!");
    }
    None
}
