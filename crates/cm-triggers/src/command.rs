//! Chat-style command patterns such as `!so {user} {count:number} {rest...}`

use crate::{TriggerError, TriggerResult};
use cm_core::ContextData;
use cm_schema::Schema;
use regex::Regex;
use serde_json::{json, Value};
use std::sync::OnceLock;

static PLACEHOLDER: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();

fn placeholder() -> TriggerResult<&'static Regex> {
    PLACEHOLDER
        .get_or_init(|| Regex::new(r"^\{([A-Za-z_][A-Za-z0-9_]*)(:number|\.\.\.)?\}$"))
        .as_ref()
        .map_err(|e| TriggerError::InvalidPattern(e.to_string()))
}

/// One named argument of a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandArg {
    /// A single word
    Word(String),
    /// A single word parsed as a number
    Number(String),
    /// Everything after the preceding arguments; only valid last
    Rest(String),
}

impl CommandArg {
    pub fn name(&self) -> &str {
        match self {
            CommandArg::Word(name) | CommandArg::Number(name) | CommandArg::Rest(name) => name,
        }
    }
}

/// A parsed command pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPattern {
    command: String,
    args: Vec<CommandArg>,
}

impl CommandPattern {
    /// Parse a pattern: a command word followed by `{name}`, `{name:number}`
    /// or a final `{name...}` placeholder
    pub fn parse(pattern: &str) -> TriggerResult<Self> {
        let mut tokens = pattern.split_whitespace();
        let command = match tokens.next() {
            Some(command) if !command.starts_with('{') => command.to_string(),
            _ => {
                return Err(TriggerError::InvalidPattern(format!(
                    "{:?} must start with a command word",
                    pattern
                )))
            }
        };

        let re = placeholder()?;
        let mut args: Vec<CommandArg> = Vec::new();
        for token in tokens {
            if matches!(args.last(), Some(CommandArg::Rest(_))) {
                return Err(TriggerError::InvalidPattern(format!(
                    "{:?}: nothing may follow a rest argument",
                    pattern
                )));
            }
            let captures = re.captures(token).ok_or_else(|| {
                TriggerError::InvalidPattern(format!("{:?}: bad placeholder {}", pattern, token))
            })?;
            let name = captures[1].to_string();
            if args.iter().any(|arg| arg.name() == name) {
                return Err(TriggerError::InvalidPattern(format!(
                    "{:?}: duplicate argument {}",
                    pattern, name
                )));
            }
            args.push(match captures.get(2).map(|m| m.as_str()) {
                Some(":number") => CommandArg::Number(name),
                Some(_) => CommandArg::Rest(name),
                None => CommandArg::Word(name),
            });
        }

        Ok(Self { command, args })
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn args(&self) -> &[CommandArg] {
        &self.args
    }

    /// Parse `message` into named fields
    ///
    /// The command word matches case-insensitively. Returns `None` if the
    /// command differs, an argument is missing or a number fails to parse.
    /// Extra words after the last argument are ignored.
    pub fn matches(&self, message: &str) -> Option<ContextData> {
        let mut words = message.split_whitespace();
        if !words.next()?.eq_ignore_ascii_case(&self.command) {
            return None;
        }

        let mut fields = ContextData::new();
        for arg in &self.args {
            let value = match arg {
                CommandArg::Word(_) => Value::String(words.next()?.to_string()),
                CommandArg::Number(_) => number(words.next()?)?,
                CommandArg::Rest(_) => {
                    let rest: Vec<&str> = words.by_ref().collect();
                    if rest.is_empty() {
                        return None;
                    }
                    Value::String(rest.join(" "))
                }
            };
            fields.insert(arg.name().to_string(), value);
        }
        Some(fields)
    }

    /// Schema of the fields produced by [`matches`](Self::matches)
    pub fn context_schema(&self) -> Schema {
        self.extend_schema(Schema::object())
    }

    /// Add this pattern's fields to an object schema
    pub fn extend_schema(&self, schema: Schema) -> Schema {
        self.args.iter().fold(schema, |schema, arg| {
            let property = match arg {
                CommandArg::Number(_) => Schema::number(),
                CommandArg::Word(_) | CommandArg::Rest(_) => Schema::string(),
            };
            schema.property(arg.name(), property)
        })
    }
}

fn number(word: &str) -> Option<Value> {
    if let Ok(int) = word.parse::<i64>() {
        return Some(json!(int));
    }
    word.parse::<f64>()
        .ok()
        .filter(|n| n.is_finite())
        .map(|n| json!(n))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let pattern = CommandPattern::parse("!so {user} {count:number} {rest...}").unwrap();
        assert_eq!(pattern.command(), "!so");
        assert_eq!(
            pattern.args(),
            &[
                CommandArg::Word("user".into()),
                CommandArg::Number("count".into()),
                CommandArg::Rest("rest".into()),
            ]
        );
    }

    #[test]
    fn test_parse_errors() {
        for bad in [
            "",
            "{user}",
            "!so user",
            "!so {1user}",
            "!so {rest...} {user}",
            "!so {user} {user}",
        ] {
            assert!(
                matches!(CommandPattern::parse(bad), Err(TriggerError::InvalidPattern(_))),
                "{:?} should not parse",
                bad
            );
        }
    }

    #[test]
    fn test_matches() {
        let pattern = CommandPattern::parse("!so {user} {count:number} {rest...}").unwrap();

        let fields = pattern.matches("!SO ada 3 great   stream today").unwrap();
        assert_eq!(fields["user"], json!("ada"));
        assert_eq!(fields["count"], json!(3));
        assert_eq!(fields["rest"], json!("great stream today"));
    }

    #[test]
    fn test_no_match() {
        let pattern = CommandPattern::parse("!so {user} {count:number}").unwrap();

        assert!(pattern.matches("!shoutout ada 3").is_none());
        assert!(pattern.matches("!so ada").is_none());
        assert!(pattern.matches("!so ada lots").is_none());
        assert!(pattern.matches("").is_none());
    }

    #[test]
    fn test_extra_words_ignored() {
        let pattern = CommandPattern::parse("!hello").unwrap();
        assert_eq!(pattern.matches("!hello there friend"), Some(ContextData::new()));
    }

    #[test]
    fn test_context_schema() {
        let pattern = CommandPattern::parse("!roll {sides:number} {label}").unwrap();
        let schema = pattern.context_schema();

        assert!(schema.get_property("sides").is_some());
        assert!(schema.get_property("label").is_some());
        assert!(schema.get_property("other").is_none());
    }
}
