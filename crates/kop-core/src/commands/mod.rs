//! Keyword command registry.
//!
//! A closed set of canonical commands, each with synonyms, bound to pure handler
//! functions. Unknown input yields suggestions instead of an error.

mod handlers;
mod suggest;

use std::{collections::HashMap, sync::OnceLock};

use regex::Regex;

use crate::{config::CoopProfile, directory::Member, errors::Error, replies, Result};

pub use suggest::MAX_SUGGESTIONS;

/// Read-only inputs a handler may use.
pub struct CommandContext<'a> {
    pub member: &'a Member,
    /// Trimmed, lowercased message text (including the keyword).
    pub text: &'a str,
    pub coop: &'a CoopProfile,
    pub catalog: &'a [CommandInfo],
}

pub type Handler = fn(&CommandContext<'_>) -> Result<String>;

#[derive(Clone, Copy)]
pub struct CommandSpec {
    pub name: &'static str,
    pub aliases: &'static [&'static str],
    pub description: &'static str,
    pub handler: Handler,
}

/// Catalog entry shown by `menu`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandInfo {
    pub name: &'static str,
    pub description: &'static str,
}

/// Outcome of a dispatch: the canonical command (if any matched) and the reply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Dispatch {
    pub command: Option<&'static str>,
    pub reply: String,
}

pub struct CommandRegistry {
    commands: Vec<CommandSpec>,
    catalog: Vec<CommandInfo>,
    /// keyword or synonym -> index into `commands`
    index: HashMap<String, usize>,
    coop: CoopProfile,
}

impl CommandRegistry {
    pub fn empty(coop: CoopProfile) -> Self {
        Self {
            commands: Vec::new(),
            catalog: Vec::new(),
            index: HashMap::new(),
            coop,
        }
    }

    /// Registry with the built-in commands (`saldo`, `pinjaman`, `profil`, `info`,
    /// `kontak`, `menu`).
    pub fn with_defaults(coop: CoopProfile) -> Result<Self> {
        let mut reg = Self::empty(coop);
        for spec in handlers::builtin() {
            reg.register(spec)?;
        }
        Ok(reg)
    }

    /// Add a command. Rejects keywords or synonyms that are already taken.
    pub fn register(&mut self, spec: CommandSpec) -> Result<()> {
        let keywords: Vec<String> = std::iter::once(spec.name)
            .chain(spec.aliases.iter().copied())
            .map(|k| k.trim().to_lowercase())
            .collect();

        for (i, kw) in keywords.iter().enumerate() {
            if kw.is_empty() || kw.contains(char::is_whitespace) {
                return Err(Error::Config(format!(
                    "command keyword must be a single word: {kw:?}"
                )));
            }
            if self.index.contains_key(kw) || keywords[..i].contains(kw) {
                return Err(Error::Config(format!(
                    "command keyword already registered: {kw}"
                )));
            }
        }

        let idx = self.commands.len();
        for kw in keywords {
            self.index.insert(kw, idx);
        }
        self.catalog.push(CommandInfo {
            name: spec.name,
            description: spec.description,
        });
        self.commands.push(spec);
        Ok(())
    }

    /// Canonical command for a keyword or synonym.
    pub fn resolve(&self, keyword: &str) -> Option<&CommandSpec> {
        self.index
            .get(&keyword.to_lowercase())
            .map(|&i| &self.commands[i])
    }

    pub fn canonical_names(&self) -> Vec<&'static str> {
        self.commands.iter().map(|c| c.name).collect()
    }

    pub fn catalog(&self) -> &[CommandInfo] {
        &self.catalog
    }

    /// Up to [`MAX_SUGGESTIONS`] canonical commands close to `token`.
    pub fn suggest(&self, token: &str) -> Vec<String> {
        let keywords = self
            .index
            .iter()
            .map(|(kw, &i)| (kw.as_str(), self.commands[i].name));
        suggest::suggest(token, keywords)
    }

    /// Route `text` for `member`: first word selects the command, otherwise a
    /// "not understood" reply with suggestions. Handler errors are returned to the
    /// caller, which owns the apology.
    pub fn dispatch(&self, member: &Member, text: &str) -> Result<Dispatch> {
        let text = text.trim().to_lowercase();
        let token = first_token(&text);

        let Some(spec) = self.resolve(&token) else {
            let shown = if token.is_empty() { text.as_str() } else { token.as_str() };
            let suggestions = self.suggest(&token);
            return Ok(Dispatch {
                command: None,
                reply: replies::not_understood(shown, &suggestions, &self.canonical_names()),
            });
        };

        let ctx = CommandContext {
            member,
            text: &text,
            coop: &self.coop,
            catalog: &self.catalog,
        };
        let reply = (spec.handler)(&ctx)?;
        Ok(Dispatch {
            command: Some(spec.name),
            reply,
        })
    }
}

/// First whitespace-delimited word, lowercased, without surrounding punctuation.
pub fn first_token(text: &str) -> String {
    static EDGE_PUNCT: OnceLock<Regex> = OnceLock::new();
    let re = EDGE_PUNCT
        .get_or_init(|| Regex::new(r"^[^\p{L}\p{N}]+|[^\p{L}\p{N}]+$").expect("valid regex"));

    let word = text.split_whitespace().next().unwrap_or_default();
    re.replace_all(&word.to_lowercase(), "").into_owned()
}
