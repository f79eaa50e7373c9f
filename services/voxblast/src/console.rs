//! Console stand-in for a speech recognizer.
//!
//! Each typed line is heard as one final phrase while capture is running.
//! Lines starting with `:` are commands for the session instead.

use anyhow::Result;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use voxblast_core::SessionHandle;
use voxblast_core::collaborators::{RecognitionEvent, SpeechRecognizer};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleInput {
    Phrase(String),
    Submit,
    Skip,
    Quit,
    Unknown(String),
}

pub fn parse_line(line: &str) -> Option<ConsoleInput> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let input = match line {
        ":submit" | ":s" => ConsoleInput::Submit,
        ":skip" => ConsoleInput::Skip,
        ":quit" | ":q" => ConsoleInput::Quit,
        command if command.starts_with(':') => ConsoleInput::Unknown(command.to_string()),
        phrase => ConsoleInput::Phrase(phrase.to_string()),
    };
    Some(input)
}

#[derive(Default)]
pub struct ConsoleRecognizer {
    current: Mutex<Option<mpsc::Sender<RecognitionEvent>>>,
}

impl ConsoleRecognizer {
    fn current(&self) -> MutexGuard<'_, Option<mpsc::Sender<RecognitionEvent>>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hands a typed phrase to the running capture. Returns false if capture
    /// is not running, in which case the phrase is dropped.
    pub fn deliver(&self, text: &str) -> bool {
        let current = self.current();
        let Some(tx) = current.as_ref() else {
            return false;
        };
        tx.try_send(RecognitionEvent::Phrase {
            text: text.to_string(),
            is_final: true,
        })
        .is_ok()
    }
}

impl SpeechRecognizer for ConsoleRecognizer {
    fn start(&self) -> Result<mpsc::Receiver<RecognitionEvent>> {
        let (tx, rx) = mpsc::channel(32);
        *self.current() = Some(tx);
        Ok(rx)
    }

    fn stop(&self) {
        if let Some(tx) = self.current().take() {
            let _ = tx.try_send(RecognitionEvent::End);
        }
    }
}

/// Reads stdin until EOF or `:quit`, routing each line.
pub async fn run_console(recognizer: std::sync::Arc<ConsoleRecognizer>, handle: SessionHandle) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::error!("Failed to read console input: {}", e);
                break;
            }
        };
        match parse_line(&line) {
            Some(ConsoleInput::Phrase(phrase)) => {
                if !recognizer.deliver(&phrase) {
                    tracing::info!("Not listening right now, ignored {:?}", phrase);
                }
            }
            Some(ConsoleInput::Submit) => handle.submit(),
            Some(ConsoleInput::Skip) => handle.skip(),
            Some(ConsoleInput::Quit) => {
                handle.stop();
                return;
            }
            Some(ConsoleInput::Unknown(command)) => {
                println!("Unknown command {}. Try :submit, :skip or :quit", command);
            }
            None => {}
        }
    }
    tracing::info!("Console closed, stopping session");
    handle.stop();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_commands_and_phrases() {
        assert_eq!(parse_line(":submit"), Some(ConsoleInput::Submit));
        assert_eq!(parse_line("  :skip "), Some(ConsoleInput::Skip));
        assert_eq!(parse_line(":q"), Some(ConsoleInput::Quit));
        assert_eq!(
            parse_line("an apple"),
            Some(ConsoleInput::Phrase("an apple".into()))
        );
        assert_eq!(
            parse_line(":dance"),
            Some(ConsoleInput::Unknown(":dance".into()))
        );
        assert_eq!(parse_line("   "), None);
    }

    #[tokio::test]
    async fn phrases_flow_only_while_started() {
        let recognizer = ConsoleRecognizer::default();
        assert!(!recognizer.deliver("too early"));

        let mut events = recognizer.start().unwrap();
        assert!(recognizer.deliver("apple"));
        recognizer.stop();
        assert!(!recognizer.deliver("too late"));

        assert_eq!(
            events.recv().await,
            Some(RecognitionEvent::Phrase {
                text: "apple".into(),
                is_final: true
            })
        );
        assert_eq!(events.recv().await, Some(RecognitionEvent::End));
        assert_eq!(events.recv().await, None);
    }
}
