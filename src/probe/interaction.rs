//! The user on the other side of a probe run.

use std::io::{BufRead, Write};

use tracing::info;

/// Called by the prober only between commands, never while it is waiting for
/// a device to become ready.
pub trait UserInteraction {
    fn confirm(&mut self, prompt: &str) -> bool;
    fn read_line(&mut self, prompt: &str) -> String;
    fn notify(&mut self, message: &str);
}

/// Prompts on a terminal.
pub struct ConsoleInteraction<R, W> {
    input: R,
    output: W,
}

impl ConsoleInteraction<std::io::StdinLock<'static>, std::io::Stderr> {
    /// Reads from stdin and prompts on stderr, leaving stdout for the report.
    pub fn stdio() -> Self {
        Self::new(std::io::stdin().lock(), std::io::stderr())
    }
}

impl<R: BufRead, W: Write> ConsoleInteraction<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }

    fn line(&mut self) -> String {
        let mut line = String::new();
        // end of input reads as an empty answer
        if self.input.read_line(&mut line).is_err() {
            line.clear();
        }
        line.trim().to_string()
    }
}

impl<R: BufRead, W: Write> UserInteraction for ConsoleInteraction<R, W> {
    fn confirm(&mut self, prompt: &str) -> bool {
        let _ = write!(self.output, "{prompt} [y/N] ");
        let _ = self.output.flush();
        matches!(self.line().to_ascii_lowercase().as_str(), "y" | "yes")
    }

    fn read_line(&mut self, prompt: &str) -> String {
        let _ = write!(self.output, "{prompt}: ");
        let _ = self.output.flush();
        self.line()
    }

    fn notify(&mut self, message: &str) {
        let _ = writeln!(self.output, "{message}");
    }
}

/// Declines every prompt, for runs nobody is watching.
#[derive(Debug, Default)]
pub struct Unattended;

impl UserInteraction for Unattended {
    fn confirm(&mut self, prompt: &str) -> bool {
        info!("declining: {prompt}");
        false
    }

    fn read_line(&mut self, _prompt: &str) -> String {
        String::new()
    }

    fn notify(&mut self, message: &str) {
        info!("{message}");
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn console_reads_answers() {
        let mut output = Vec::new();
        let mut console = ConsoleInteraction::new(&b"yes\nDisc 1\n"[..], &mut output);
        assert!(console.confirm("Insert a disc"));
        assert_eq!(console.read_line("Label"), "Disc 1");
        // input exhausted
        assert!(!console.confirm("Another"));
        drop(console);
        assert_eq!(
            String::from_utf8(output).unwrap(),
            "Insert a disc [y/N] Label: Another [y/N] "
        );
    }

    #[test]
    fn unattended_declines() {
        assert!(!Unattended.confirm("anything"));
        assert_eq!(Unattended.read_line("label"), "");
    }
}
