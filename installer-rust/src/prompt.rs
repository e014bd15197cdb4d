use anyhow::{Context, Result};
use std::io::{BufRead, Write};

use crate::locale::Catalog;

/// Questions asked during an interactive run.
pub trait Prompter {
    /// Switches retry hints to the session language.
    fn use_catalog(&mut self, _catalog: &Catalog) {}
    /// False when nobody is there to answer.
    fn is_interactive(&self) -> bool {
        true
    }
    /// Index into `options`.
    fn choose(&mut self, question: &str, options: &[String], default: usize) -> Result<usize>;
    fn input(&mut self, question: &str, default: &str) -> Result<String>;
    fn confirm(&mut self, question: &str, default: bool) -> Result<bool>;
}

/// Accepts every default. Used with `--yes` and when stdin is not a
/// terminal.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unattended;

impl Prompter for Unattended {
    fn is_interactive(&self) -> bool {
        false
    }

    fn choose(&mut self, _question: &str, _options: &[String], default: usize) -> Result<usize> {
        Ok(default)
    }

    fn input(&mut self, _question: &str, default: &str) -> Result<String> {
        Ok(default.to_string())
    }

    fn confirm(&mut self, _question: &str, default: bool) -> Result<bool> {
        Ok(default)
    }
}

pub struct TerminalPrompter<R, W> {
    input: R,
    output: W,
    choice_invalid: String,
    yes_no_invalid: String,
}

impl<R: BufRead, W: Write> TerminalPrompter<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self {
            input,
            output,
            choice_invalid: "Please enter a number between 1 and {max}.".to_string(),
            yes_no_invalid: "Please answer y or n.".to_string(),
        }
    }

    /// `None` at end of input.
    fn read_answer(&mut self) -> Result<Option<String>> {
        self.output.flush().context("flush prompt")?;
        let mut line = String::new();
        let read = self.input.read_line(&mut line).context("read answer")?;
        if read == 0 {
            return Ok(None);
        }
        Ok(Some(line.trim().to_string()))
    }
}

impl<R: BufRead, W: Write> Prompter for TerminalPrompter<R, W> {
    fn use_catalog(&mut self, catalog: &Catalog) {
        self.choice_invalid = catalog.get("ChoiceInvalid");
        self.yes_no_invalid = catalog.get("YesNoInvalid");
    }

    fn choose(&mut self, question: &str, options: &[String], default: usize) -> Result<usize> {
        if options.is_empty() {
            return Ok(default);
        }
        writeln!(self.output, "{question}")?;
        for (index, option) in options.iter().enumerate() {
            let marker = if index == default { '*' } else { ' ' };
            writeln!(self.output, " {marker} {}) {option}", index + 1)?;
        }
        loop {
            write!(self.output, "[{}]: ", default + 1)?;
            let Some(answer) = self.read_answer()? else {
                return Ok(default);
            };
            if answer.is_empty() {
                return Ok(default);
            }
            match answer.parse::<usize>() {
                Ok(n) if (1..=options.len()).contains(&n) => return Ok(n - 1),
                _ => {
                    let hint = self.choice_invalid.replace("{max}", &options.len().to_string());
                    writeln!(self.output, "{hint}")?;
                }
            }
        }
    }

    fn input(&mut self, question: &str, default: &str) -> Result<String> {
        writeln!(self.output, "{question}")?;
        write!(self.output, "[{default}]: ")?;
        match self.read_answer()? {
            Some(answer) if !answer.is_empty() => Ok(answer),
            _ => Ok(default.to_string()),
        }
    }

    fn confirm(&mut self, question: &str, default: bool) -> Result<bool> {
        let choices = if default { "[Y/n]" } else { "[y/N]" };
        loop {
            write!(self.output, "{question} {choices} ")?;
            let Some(answer) = self.read_answer()? else {
                return Ok(default);
            };
            match answer.to_lowercase().as_str() {
                "" => return Ok(default),
                "y" | "yes" | "j" | "ja" => return Ok(true),
                "n" | "no" | "nein" => return Ok(false),
                _ => writeln!(self.output, "{}", self.yes_no_invalid)?,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn prompter(input: &str) -> TerminalPrompter<Cursor<Vec<u8>>, Vec<u8>> {
        TerminalPrompter::new(Cursor::new(input.as_bytes().to_vec()), Vec::new())
    }

    #[test]
    fn choose_retries_until_valid() {
        let options = vec!["English".to_string(), "Deutsch".to_string()];
        let mut p = prompter("7\nabc\n2\n");
        assert_eq!(p.choose("Language?", &options, 0).unwrap(), 1);
        let shown = String::from_utf8(p.output.clone()).unwrap();
        assert!(shown.contains("between 1 and 2"));
        assert!(shown.contains(" * 1) English"));
    }

    #[test]
    fn empty_answer_and_eof_take_defaults() {
        let options = vec!["a".to_string(), "b".to_string()];
        let mut p = prompter("\n");
        assert_eq!(p.choose("?", &options, 1).unwrap(), 1);
        assert_eq!(p.input("Dir?", "/opt/app").unwrap(), "/opt/app");
        assert!(p.confirm("Go?", true).unwrap());
    }

    #[test]
    fn confirm_accepts_german_answers() {
        let table = crate::locale::LocalizationTable::engine_languages();
        let mut p = prompter("vielleicht\nj\nnein\n");
        p.use_catalog(&table.select(Some("de")));
        assert!(p.confirm("Weiter?", false).unwrap());
        assert!(!p.confirm("Weiter?", true).unwrap());
        let shown = String::from_utf8(p.output.clone()).unwrap();
        assert!(shown.contains("j oder n"));
    }

    #[test]
    fn unattended_returns_defaults() {
        let mut p = Unattended;
        assert!(!p.is_interactive());
        assert_eq!(p.choose("?", &[], 0).unwrap(), 0);
        assert_eq!(p.input("?", "x").unwrap(), "x");
        assert!(!p.confirm("?", false).unwrap());
    }
}
