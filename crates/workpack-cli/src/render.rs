use std::io::{self, IsTerminal};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anstyle::{AnsiColor, Effects, Style};
use indicatif::{ProgressBar, ProgressStyle};
use workpack_installer::{ReportLevel, ReportSink};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OutputStyle {
    Plain,
    Rich,
}

pub fn current_output_style() -> OutputStyle {
    if std::env::var_os("NO_COLOR").is_some() || !io::stdout().is_terminal() {
        OutputStyle::Plain
    } else {
        OutputStyle::Rich
    }
}

pub fn render_status_line(style: OutputStyle, status: &str, message: &str) -> String {
    match style {
        OutputStyle::Plain => message.to_string(),
        OutputStyle::Rich => format!("{} {message}", status_badge(status)),
    }
}

fn status_badge(status: &str) -> &'static str {
    match status {
        "ok" => "[OK]",
        "warn" => "[WARN]",
        "err" => "[ERR]",
        _ => "[..]",
    }
}

pub fn render_section_header(style: OutputStyle, title: &str) -> Option<String> {
    match style {
        OutputStyle::Plain => None,
        OutputStyle::Rich => Some(format!("== {title} ==")),
    }
}

pub fn print_section(style: OutputStyle, title: &str) {
    if let Some(line) = render_section_header(style, title) {
        println!("{}", colorize(section_style(), &line));
    }
}

pub fn print_status(style: OutputStyle, status: &str, message: &str) {
    println!("{}", render_status_line(style, status, message));
}

fn section_style() -> Style {
    Style::new()
        .fg_color(Some(AnsiColor::BrightBlue.into()))
        .effects(Effects::BOLD)
}

fn verbose_style() -> Style {
    Style::new().effects(Effects::DIMMED)
}

fn warning_style() -> Style {
    Style::new()
        .fg_color(Some(AnsiColor::Yellow.into()))
        .effects(Effects::BOLD)
}

fn colorize(style: Style, text: &str) -> String {
    format!("{}{}{}", style.render(), text, style.render_reset())
}

/// Prints reporter output to the terminal. Long package operations get a
/// spinner when the output is interactive.
pub struct TerminalSink {
    style: OutputStyle,
    verbose: bool,
    activity: Mutex<Option<ProgressBar>>,
}

impl TerminalSink {
    pub fn new(style: OutputStyle, verbose: bool) -> Self {
        Self {
            style,
            verbose,
            activity: Mutex::new(None),
        }
    }

    /// The line as printed, or `None` when the level is filtered out.
    pub fn format_line(&self, level: ReportLevel, message: &str) -> Option<String> {
        match (level, self.style) {
            (ReportLevel::Info, _) => Some(message.to_string()),
            (ReportLevel::Verbose, _) if !self.verbose => None,
            (ReportLevel::Verbose, OutputStyle::Plain) => Some(message.to_string()),
            (ReportLevel::Verbose, OutputStyle::Rich) => Some(colorize(verbose_style(), message)),
            (ReportLevel::Warning, OutputStyle::Plain) => {
                Some(render_status_line(self.style, "warn", message))
            }
            (ReportLevel::Warning, OutputStyle::Rich) => Some(colorize(
                warning_style(),
                &render_status_line(self.style, "warn", message),
            )),
        }
    }

    fn activity(&self) -> MutexGuard<'_, Option<ProgressBar>> {
        self.activity
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ReportSink for TerminalSink {
    fn write(&self, level: ReportLevel, message: &str) {
        let Some(line) = self.format_line(level, message) else {
            return;
        };
        match self.activity().as_ref() {
            Some(spinner) => spinner.println(line),
            None if level == ReportLevel::Warning => eprintln!("{line}"),
            None => println!("{line}"),
        }
    }

    fn begin_activity(&self, label: &str) {
        if self.style != OutputStyle::Rich {
            return;
        }
        let spinner = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan.bold} {msg} {elapsed}") {
            spinner.set_style(style.tick_chars("|/-\\ "));
        }
        spinner.set_message(label.to_string());
        spinner.enable_steady_tick(Duration::from_millis(80));
        if let Some(previous) = self.activity().replace(spinner) {
            previous.finish_and_clear();
        }
    }

    fn end_activity(&self) {
        if let Some(spinner) = self.activity().take() {
            spinner.finish_and_clear();
        }
    }
}
