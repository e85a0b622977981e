use std::collections::BTreeMap;
use std::io::{self, BufRead, StdinLock, Stdout, Write};

use anyhow::{Context, Result};

use crate::error::SyncError;

/// Two titles claimed for the same language slot of one cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub language: String,
    pub existing: String,
    pub candidate: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Choice {
    KeepExisting,
    TakeNew,
}

impl Conflict {
    pub fn winner(&self, choice: Choice) -> &str {
        match choice {
            Choice::KeepExisting => &self.existing,
            Choice::TakeNew => &self.candidate,
        }
    }

    pub fn loser(&self, choice: Choice) -> &str {
        match choice {
            Choice::KeepExisting => &self.candidate,
            Choice::TakeNew => &self.existing,
        }
    }

    /// Choice that keeps `title`, if it is one of the two contenders.
    pub fn choice_for(&self, title: &str) -> Option<Choice> {
        if title == self.existing {
            Some(Choice::KeepExisting)
        } else if title == self.candidate {
            Some(Choice::TakeNew)
        } else {
            None
        }
    }
}

/// Decision provider consulted when a cluster has two titles for one language.
pub trait ConflictResolver {
    fn choose(&mut self, conflict: &Conflict) -> Result<Choice>;
}

impl<R: ConflictResolver + ?Sized> ConflictResolver for &mut R {
    fn choose(&mut self, conflict: &Conflict) -> Result<Choice> {
        (**self).choose(conflict)
    }
}

impl<R: ConflictResolver + ?Sized> ConflictResolver for Box<R> {
    fn choose(&mut self, conflict: &Conflict) -> Result<Choice> {
        (**self).choose(conflict)
    }
}

/// Non-interactive policy: the title found first wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeepExistingResolver;

impl ConflictResolver for KeepExistingResolver {
    fn choose(&mut self, conflict: &Conflict) -> Result<Choice> {
        tracing::warn!(
            language = %conflict.language,
            kept = %conflict.existing,
            dropped = %conflict.candidate,
            "conflict resolved by keeping the existing title"
        );
        Ok(Choice::KeepExisting)
    }
}

/// Deterministic resolver with per-language preferred titles; records every conflict it sees.
#[derive(Debug, Clone, Default)]
pub struct ScriptedResolver {
    preferred: BTreeMap<String, String>,
    presented: Vec<Conflict>,
}

impl ScriptedResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn prefer(mut self, language: &str, title: &str) -> Self {
        self.preferred
            .insert(language.to_string(), title.to_string());
        self
    }

    pub fn presented(&self) -> &[Conflict] {
        &self.presented
    }
}

impl ConflictResolver for ScriptedResolver {
    fn choose(&mut self, conflict: &Conflict) -> Result<Choice> {
        self.presented.push(conflict.clone());
        Ok(self
            .preferred
            .get(&conflict.language)
            .and_then(|title| conflict.choice_for(title))
            .unwrap_or(Choice::KeepExisting))
    }
}

/// Wraps another resolver and keeps every conflict handed to it.
#[derive(Debug, Clone, Default)]
pub struct RecordingResolver<R> {
    inner: R,
    seen: Vec<Conflict>,
}

impl<R: ConflictResolver> RecordingResolver<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            seen: Vec::new(),
        }
    }

    pub fn seen(&self) -> &[Conflict] {
        &self.seen
    }
}

impl<R: ConflictResolver> ConflictResolver for RecordingResolver<R> {
    fn choose(&mut self, conflict: &Conflict) -> Result<Choice> {
        self.seen.push(conflict.clone());
        self.inner.choose(conflict)
    }
}

/// Operator prompt: `Conflict (fr)` with numbered options, `q` aborts the run.
pub struct ConsoleResolver<R, W> {
    input: R,
    output: W,
}

impl ConsoleResolver<StdinLock<'static>, Stdout> {
    pub fn stdio() -> Self {
        Self::new(io::stdin().lock(), io::stdout())
    }
}

impl<R: BufRead, W: Write> ConsoleResolver<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }

    fn prompt(&mut self, conflict: &Conflict) -> Result<()> {
        writeln!(self.output, "Conflict ({})", conflict.language)?;
        writeln!(self.output, "  [0] {}", conflict.existing)?;
        writeln!(self.output, "  [1] {}", conflict.candidate)?;
        write!(self.output, "> ")?;
        self.output.flush().context("failed to flush conflict prompt")
    }
}

impl<R: BufRead, W: Write> ConflictResolver for ConsoleResolver<R, W> {
    fn choose(&mut self, conflict: &Conflict) -> Result<Choice> {
        loop {
            self.prompt(conflict)?;
            let mut line = String::new();
            let read = self
                .input
                .read_line(&mut line)
                .context("failed to read conflict answer")?;
            let answer = line.trim();
            if read == 0 || answer.eq_ignore_ascii_case("q") {
                return Err(SyncError::ConflictAborted {
                    language: conflict.language.clone(),
                }
                .into());
            }
            let choice = match answer {
                "0" => Some(Choice::KeepExisting),
                "1" => Some(Choice::TakeNew),
                other => conflict.choice_for(other),
            };
            match choice {
                Some(choice) => return Ok(choice),
                None => writeln!(self.output, "Value \"{answer}\" is invalid")?,
            }
        }
    }
}
