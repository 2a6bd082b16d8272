//! Operator input.
//!
//! Two points in a run block on the human at the terminal: the intervention
//! prompt (after pressing `i`) and structured questions asked by the agent
//! during spec discovery. Both are cooperative suspension points. While
//! suspended, the keyboard listener stops sampling and no other control
//! signal is read. There is no timeout: the run waits until the operator
//! answers.

use std::collections::BTreeMap;
use std::io::{BufRead, Write};

use async_trait::async_trait;
use colored::Colorize;
use tracing::warn;

use crate::keyboard;
use crate::sandbox::{Question, QuestionHandler};
use crate::signals::ControlSignals;

/// Source of operator intervention messages.
#[async_trait]
pub trait Operator: Send + Sync {
    /// Ask the operator what to tell the agent.
    ///
    /// `None` means the operator gave no text; the agent is told to carry on.
    async fn intervention(&self) -> Option<String>;
}

/// Operator reading from the controlling terminal.
#[derive(Debug, Clone)]
pub struct TerminalOperator {
    signals: ControlSignals,
}

impl TerminalOperator {
    #[must_use]
    pub fn new(signals: ControlSignals) -> Self {
        Self { signals }
    }
}

fn read_line(prompt: &str) -> Option<String> {
    keyboard::leave_raw_mode();
    let mut stdout = std::io::stdout().lock();
    let _ = write!(stdout, "{prompt}");
    let _ = stdout.flush();
    drop(stdout);

    let mut line = String::new();
    match std::io::stdin().lock().read_line(&mut line) {
        Ok(0) => None,
        Ok(_) => Some(line.trim().to_string()),
        Err(e) => {
            warn!("Failed to read operator input: {e}");
            None
        }
    }
}

#[async_trait]
impl Operator for TerminalOperator {
    async fn intervention(&self) -> Option<String> {
        let _suspended = self.signals.suspend();
        keyboard::leave_raw_mode();
        println!();
        println!(
            "{}",
            "Agent paused. Type a message for the agent (empty to continue):"
                .magenta()
                .bold()
        );
        let text = tokio::task::spawn_blocking(|| read_line("> "))
            .await
            .ok()
            .flatten();
        text.filter(|t| !t.is_empty())
    }
}

/// Turn the operator's reply into an answer string.
///
/// Option numbers (`2`, or `1,3` for multi-select questions) pick option
/// labels; anything else is taken as free text.
#[must_use]
pub fn parse_answer(question: &Question, reply: &str) -> String {
    let reply = reply.trim();
    if question.options.is_empty() || reply.is_empty() {
        return reply.to_string();
    }

    let picks: Option<Vec<usize>> = reply
        .split(',')
        .map(|part| part.trim().parse::<usize>().ok())
        .collect();

    match picks {
        Some(picks) if !picks.is_empty() && (question.multi_select || picks.len() == 1) => {
            let labels: Option<Vec<&str>> = picks
                .iter()
                .map(|n| {
                    n.checked_sub(1)
                        .and_then(|i| question.options.get(i))
                        .map(|o| o.label.as_str())
                })
                .collect();
            labels.map_or_else(|| reply.to_string(), |l| l.join(", "))
        }
        _ => reply.to_string(),
    }
}

impl QuestionHandler for TerminalOperator {
    fn answer(&self, questions: &[Question]) -> BTreeMap<String, String> {
        let _suspended = self.signals.suspend();
        keyboard::leave_raw_mode();
        let mut answers = BTreeMap::new();

        for question in questions {
            println!();
            if question.header.is_empty() {
                println!("{}", question.question.cyan().bold());
            } else {
                println!(
                    "{} {}",
                    format!("[{}]", question.header).yellow().bold(),
                    question.question.cyan().bold()
                );
            }
            for (i, option) in question.options.iter().enumerate() {
                if option.description.is_empty() {
                    println!("  {}. {}", i + 1, option.label);
                } else {
                    println!("  {}. {} - {}", i + 1, option.label, option.description.dimmed());
                }
            }
            let hint = if question.multi_select {
                "numbers separated by commas, or your own answer"
            } else {
                "a number, or your own answer"
            };
            let reply = read_line(&format!("{} ", format!("({hint}) >").dimmed()))
                .unwrap_or_default();
            answers.insert(question.question.clone(), parse_answer(question, &reply));
        }

        answers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::QuestionOption;

    fn question(multi_select: bool) -> Question {
        Question {
            question: "Which database?".into(),
            header: "DB".into(),
            options: vec![
                QuestionOption {
                    label: "Postgres".into(),
                    description: String::new(),
                },
                QuestionOption {
                    label: "SQLite".into(),
                    description: "embedded".into(),
                },
            ],
            multi_select,
        }
    }

    #[test]
    fn test_parse_answer_picks_option() {
        assert_eq!(parse_answer(&question(false), "2"), "SQLite");
        assert_eq!(parse_answer(&question(false), " 1 "), "Postgres");
    }

    #[test]
    fn test_parse_answer_multi_select() {
        assert_eq!(parse_answer(&question(true), "1, 2"), "Postgres, SQLite");
        assert_eq!(parse_answer(&question(false), "1,2"), "1,2");
    }

    #[test]
    fn test_parse_answer_free_text_and_out_of_range() {
        assert_eq!(parse_answer(&question(false), "MySQL please"), "MySQL please");
        assert_eq!(parse_answer(&question(false), "7"), "7");
        assert_eq!(parse_answer(&question(false), "0"), "0");
        assert_eq!(parse_answer(&question(false), ""), "");
    }
}
