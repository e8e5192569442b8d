use crate::lexer::SourceMap;
use super::{Diagnostic, Severity};

pub struct AnsiRenderer {
    pub use_color: bool,
}

impl AnsiRenderer {
    fn bold(&self, s: &str) -> String {
        if self.use_color { format!("\x1b[1m{s}\x1b[0m") } else { s.to_string() }
    }

    fn bold_red(&self, s: &str) -> String {
        if self.use_color { format!("\x1b[1;31m{s}\x1b[0m") } else { s.to_string() }
    }

    fn cyan(&self, s: &str) -> String {
        if self.use_color { format!("\x1b[36m{s}\x1b[0m") } else { s.to_string() }
    }

    fn dim(&self, s: &str) -> String {
        if self.use_color { format!("\x1b[2m{s}\x1b[0m") } else { s.to_string() }
    }

    pub fn render(&self, d: &Diagnostic) -> String {
        let mut out = String::new();

        let severity_label = match d.severity {
            Severity::Error => self.bold_red("error"),
            Severity::Warning => self.bold(&self.cyan("warning")),
        };
        let head = match d.code {
            Some(code) => format!("{severity_label}[{code}]"),
            None => severity_label,
        };
        out.push_str(&format!("{}: {}\n", head, self.bold(&d.message)));

        let primary = d.labels.iter().find(|l| l.is_primary);
        if let Some(label) = primary {
            out.push_str(&format!("  {} {}:{}\n", self.cyan("-->"), label.line, label.col));
        }
        if let (Some(label), Some(source)) = (primary, &d.source) {
            let map = SourceMap::new(source);
            let line_text = map.line_text(source, label.line);
            let gutter = label.line.to_string().len();
            let pipe = self.cyan("|");
            let pad = " ".repeat(gutter);

            out.push_str(&format!("{pad} {pipe}\n"));
            let line_num = self.cyan(&format!("{:>gutter$}", label.line));
            out.push_str(&format!("{line_num} {pipe} {line_text}\n"));

            // Columns count bytes; indent by the characters they cover.
            let before = line_text.get(..(label.col as usize).saturating_sub(1)).unwrap_or(line_text);
            let indent = " ".repeat(before.chars().count());
            let caret = self.bold_red("^");
            if label.message.is_empty() {
                out.push_str(&format!("{pad} {pipe} {indent}{caret}\n"));
            } else {
                out.push_str(&format!("{pad} {pipe} {indent}{caret} {}\n", self.bold_red(&label.message)));
            }
            out.push_str(&format!("{pad} {pipe}\n"));
        }

        for label in d.labels.iter().filter(|l| !l.is_primary) {
            out.push_str(&format!("  {} {}:{} {}\n", self.dim("="), label.line, label.col, label.message));
        }

        for note in &d.notes {
            out.push_str(&format!("  {} note: {}\n", self.dim("="), note));
        }

        if let Some(suggestion) = &d.suggestion {
            out.push_str(&format!("  {} suggestion: {}\n", self.dim("="), suggestion));
        }

        out
    }
}
