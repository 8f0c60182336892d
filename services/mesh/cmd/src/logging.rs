//! Log line formatting for the bitmesh node.
//!
//! Lines look like `[timestamp] [component] [level] message key=value ...`.

use std::fmt::{self, Write as _};
use std::io::IsTerminal;

use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::{format::Writer, FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

const COLOR_RESET: &str = "\x1b[0m";
const COLOR_CYAN: &str = "\x1b[36m";
const COLOR_GREEN: &str = "\x1b[32m";
const COLOR_BRIGHT_YELLOW: &str = "\x1b[93m";
const COLOR_BRIGHT_RED: &str = "\x1b[91m";
const COLOR_BRIGHT_GRAY: &str = "\x1b[90m";

const COMPONENT_WIDTH: usize = 16;
const LEVEL_WIDTH: usize = 5;

/// Tag an info event with a component name
#[macro_export]
macro_rules! component_info {
    ($component:expr, $($arg:tt)*) => {
        tracing::info!(component = $component, $($arg)*)
    };
}

/// Tag a warn event with a component name
#[macro_export]
macro_rules! component_warn {
    ($component:expr, $($arg:tt)*) => {
        tracing::warn!(component = $component, $($arg)*)
    };
}

/// Tag a debug event with a component name
#[macro_export]
macro_rules! component_debug {
    ($component:expr, $($arg:tt)*) => {
        tracing::debug!(component = $component, $($arg)*)
    };
}

/// Tag an error event with a component name
#[macro_export]
macro_rules! component_error {
    ($component:expr, $($arg:tt)*) => {
        tracing::error!(component = $component, $($arg)*)
    };
}

/// Event formatter for the node's console output
pub struct MeshLogFormatter {
    default_component: String,
    color_enabled: bool,
}

impl MeshLogFormatter {
    /// Formatter labelling untagged events with `default_component`.
    ///
    /// Colours follow `color` when set, otherwise whether stdout is a terminal.
    pub fn new(default_component: impl Into<String>, color: Option<bool>) -> Self {
        let color_enabled = color.unwrap_or_else(is_terminal);
        Self {
            default_component: default_component.into(),
            color_enabled,
        }
    }

    fn format_component(&self, component: Option<&str>) -> String {
        let name = component.unwrap_or(&self.default_component);
        if name.chars().count() > COMPONENT_WIDTH {
            let truncated: String = name.chars().take(COMPONENT_WIDTH - 1).collect();
            format!("{}…", truncated)
        } else {
            format!("{:<width$}", name, width = COMPONENT_WIDTH)
        }
    }

    fn color_for_level(&self, level: &Level) -> &'static str {
        if !self.color_enabled {
            return "";
        }
        match *level {
            Level::ERROR => COLOR_BRIGHT_RED,
            Level::WARN => COLOR_BRIGHT_YELLOW,
            Level::INFO => COLOR_GREEN,
            Level::DEBUG | Level::TRACE => COLOR_BRIGHT_GRAY,
        }
    }

    fn render(&self, timestamp: &str, level: &Level, fields: &FieldVisitor) -> String {
        let (cyan, color, reset) = if self.color_enabled {
            (COLOR_CYAN, self.color_for_level(level), COLOR_RESET)
        } else {
            ("", "", "")
        };

        let mut line = format!(
            "{}[{}]{} [{}] [{}{:<width$}{}] {}",
            cyan,
            timestamp,
            reset,
            self.format_component(fields.component.as_deref()),
            color,
            level.as_str(),
            reset,
            fields.message,
            width = LEVEL_WIDTH
        );
        for (key, value) in &fields.extra {
            let _ = write!(line, " {}={}", key, value);
        }
        line
    }
}

impl<S, N> FormatEvent<S, N> for MeshLogFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let timestamp = chrono::Local::now()
            .format("%Y-%m-%d %H:%M:%S%.3f")
            .to_string();

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        writeln!(
            writer,
            "{}",
            self.render(&timestamp, event.metadata().level(), &visitor)
        )
    }
}

/// Collects the message, the component tag and any other fields
#[derive(Default)]
struct FieldVisitor {
    message: String,
    component: Option<String>,
    extra: Vec<(&'static str, String)>,
}

impl tracing::field::Visit for FieldVisitor {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        match field.name() {
            "message" => self.message = value.to_string(),
            "component" => self.component = Some(value.to_string()),
            name => self.extra.push((name, value.to_string())),
        }
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        let rendered = format!("{:?}", value);
        let unquoted = rendered
            .strip_prefix('"')
            .and_then(|s| s.strip_suffix('"'))
            .map(str::to_string)
            .unwrap_or(rendered);
        match field.name() {
            "message" => self.message = unquoted,
            "component" => self.component = Some(unquoted),
            name => self.extra.push((name, unquoted)),
        }
    }
}

fn is_terminal() -> bool {
    if std::env::var("TERM").map(|term| term == "dumb").unwrap_or(false) {
        return false;
    }
    std::io::stdout().is_terminal()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_plain_line() {
        let formatter = MeshLogFormatter::new("bitmesh", Some(false));
        let fields = FieldVisitor {
            message: "peer connected".to_string(),
            component: Some("pool".to_string()),
            extra: vec![("peer", "0102030405060708".to_string())],
        };
        let line = formatter.render("2024-01-01 00:00:00.000", &Level::INFO, &fields);
        assert_eq!(
            line,
            "[2024-01-01 00:00:00.000] [pool            ] [INFO ] peer connected peer=0102030405060708"
        );
    }

    #[test]
    fn test_default_component_and_truncation() {
        let formatter = MeshLogFormatter::new("bitmesh", Some(false));
        assert_eq!(formatter.format_component(None), "bitmesh         ");
        let long = formatter.format_component(Some("a-very-long-component-name"));
        assert_eq!(long.chars().count(), COMPONENT_WIDTH);
        assert!(long.ends_with('…'));
    }

    #[test]
    fn test_colors_only_when_enabled() {
        let colored = MeshLogFormatter::new("bitmesh", Some(true));
        let fields = FieldVisitor {
            message: "boom".to_string(),
            ..Default::default()
        };
        let line = colored.render("t", &Level::ERROR, &fields);
        assert!(line.contains(COLOR_BRIGHT_RED));
        assert!(line.ends_with("boom"));

        let plain = MeshLogFormatter::new("bitmesh", Some(false));
        assert!(!plain.render("t", &Level::ERROR, &fields).contains('\x1b'));
    }
}
