use anyhow::Result;
use chrono::{DateTime, Local};
use log::{LevelFilter, Record};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::Mutex;

use xchat::models::{DeliveryStatus, MessageView};
use xchat::sync::ConversationSummary;

/// Line logger for the CLI: appends to a file when one is given, otherwise
/// prints to stdout.
pub struct SimpleLogger {
    log_file: Option<Mutex<File>>,
}

impl SimpleLogger {
    pub fn new(log_file_path: Option<&str>) -> Result<Self> {
        let log_file = match log_file_path {
            Some(path) => Some(Mutex::new(OpenOptions::new().create(true).append(true).open(path)?)),
            None => None,
        };

        Ok(SimpleLogger { log_file })
    }
}

impl log::Log for SimpleLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let now: DateTime<Local> = Local::now();
        let line = format!(
            "[{}] {} [{}:{}] {}\n",
            now.format("%Y-%m-%d %H:%M:%S"),
            record.level(),
            record.file().unwrap_or("unknown"),
            record.line().unwrap_or(0),
            record.args()
        );

        match &self.log_file {
            Some(file) => {
                let mut file = file.lock().unwrap_or_else(|e| e.into_inner());
                let _ = file.write_all(line.as_bytes());
            }
            None => print!("{}", line),
        }
    }

    fn flush(&self) {
        match &self.log_file {
            Some(file) => {
                let _ = file.lock().unwrap_or_else(|e| e.into_inner()).flush();
            }
            None => {
                let _ = std::io::stdout().flush();
            }
        }
    }
}

pub fn setup_logging(log_file: Option<&str>, level: LevelFilter) -> Result<()> {
    let logger = SimpleLogger::new(log_file)?;
    log::set_boxed_logger(Box::new(logger)).map(|()| log::set_max_level(level))?;

    log::info!("Logging initialized at level: {}", level);
    log::info!("{} version {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    Ok(())
}

fn status_mark(status: DeliveryStatus) -> &'static str {
    match status {
        DeliveryStatus::Sent => "✓",
        DeliveryStatus::Delivered => "✓✓",
        DeliveryStatus::Seen => "✓✓ seen",
    }
}

/// Render one message for the terminal, wrapping the body to `width`.
pub fn format_message(view: &MessageView, sender_name: &str, width: usize) -> String {
    let message = &view.message;
    let body = match (&message.media_url, message.content.is_empty()) {
        (Some(url), true) => format!("{} {}", message.kind.label(), url),
        (Some(url), false) => format!("{} {}\n{}", message.kind.label(), url, message.content),
        (None, _) => message.content.clone(),
    };

    let header = if view.outgoing {
        format!("[{}] you {}", view.time_label, status_mark(message.delivery_status))
    } else {
        format!("[{}] {}", view.time_label, sender_name)
    };

    let indent = "    ";
    let options = textwrap::Options::new(width.max(20))
        .initial_indent(indent)
        .subsequent_indent(indent);
    format!("{}\n{}", header, textwrap::fill(&body, options))
}

/// One line of the conversation list.
pub fn format_summary(summary: &ConversationSummary, names: &[String]) -> String {
    let unread = if summary.unread > 0 {
        format!(" ({} unread)", summary.unread)
    } else {
        String::new()
    };
    let last = if summary.conversation.last_message.is_empty() {
        "no messages yet".to_string()
    } else {
        textwrap::fill(&summary.conversation.last_message, 40)
            .lines()
            .next()
            .unwrap_or_default()
            .to_string()
    };
    format!("{}  {}{}: {}", summary.id(), names.join(", "), unread, last)
}
