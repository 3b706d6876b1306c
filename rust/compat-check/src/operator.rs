//! Operator input from the controlling terminal.
//!
//! Stdin is read line by line on one task. Interactive prompts and the
//! coordinator's start confirmation consume the same stream, so input
//! typed ahead is never lost between them.

use std::fmt::Display;
use std::io::Write;
use std::str::FromStr;

use compat_core::SessionState;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};

pub struct Operator {
    lines: mpsc::Receiver<String>,
}

impl Operator {
    pub fn from_stdin() -> Self {
        let (tx, lines) = mpsc::channel(16);
        tokio::spawn(async move {
            let mut stdin = BufReader::new(tokio::io::stdin()).lines();
            loop {
                match stdin.next_line().await {
                    Ok(Some(line)) => {
                        if tx.send(line).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => return,
                    Err(e) => {
                        tracing::warn!(error = %e, "stdin closed");
                        return;
                    }
                }
            }
        });
        Self { lines }
    }

    /// Hand the remaining input over to the coordinator as confirmations.
    pub fn into_confirmations(self) -> mpsc::Receiver<String> {
        self.lines
    }

    async fn line(&mut self, prompt: &str) -> Option<String> {
        print!("{}", prompt);
        let _ = std::io::stdout().flush();
        self.lines.recv().await.map(|l| l.trim().to_string())
    }

    /// Ask a yes/no question. `None` when input is closed.
    pub async fn confirm(&mut self, question: &str, default: bool) -> Option<bool> {
        let hint = if default { "[Y/n]" } else { "[y/N]" };
        loop {
            let answer = self.line(&format!("{} {} ", question, hint)).await?;
            match answer.to_ascii_lowercase().as_str() {
                "" => return Some(default),
                "y" | "yes" => return Some(true),
                "n" | "no" => return Some(false),
                _ => println!("Please answer y or n."),
            }
        }
    }

    /// Ask for a value, re-asking until it parses. An empty answer takes
    /// the default when there is one.
    pub async fn ask<T>(&mut self, question: &str, default: Option<T>) -> Option<T>
    where
        T: FromStr + Display,
        T::Err: Display,
    {
        let prompt = match &default {
            Some(d) => format!("{} [{}]: ", question, d),
            None => format!("{}: ", question),
        };
        let mut default = default;
        loop {
            let answer = self.line(&prompt).await?;
            if answer.is_empty() {
                if let Some(d) = default.take() {
                    return Some(d);
                }
                println!("A value is required.");
                continue;
            }
            match answer.parse() {
                Ok(value) => return Some(value),
                Err(e) => println!("Invalid value '{}': {}", answer, e),
            }
        }
    }
}

/// Tell the operator when the cluster is ready to start.
pub fn spawn_confirm_prompt(mut states: watch::Receiver<SessionState>, cluster_size: u32) {
    tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = *states.borrow();
            match state {
                SessionState::ReadyPendingConfirm => {
                    println!(
                        "All {} node(s) registered. Type 'start' to run the tests, anything else aborts.",
                        cluster_size
                    );
                }
                SessionState::AwaitingWorkers => {
                    println!("Waiting for workers to register...");
                }
                s if s.is_terminal() => return,
                _ => {}
            }
        }
    });
}
