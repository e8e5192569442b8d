use super::{Diagnostic, Severity};

pub fn to_value(d: &Diagnostic) -> serde_json::Value {
    let severity = match d.severity {
        Severity::Error => "error",
        Severity::Warning => "warning",
    };

    let labels: Vec<serde_json::Value> = d
        .labels
        .iter()
        .map(|l| {
            serde_json::json!({
                "line": l.line,
                "col": l.col,
                "message": l.message,
                "primary": l.is_primary,
            })
        })
        .collect();

    let mut obj = serde_json::json!({
        "severity": severity,
        "message": d.message,
        "labels": labels,
        "notes": d.notes,
    });

    if let Some(code) = d.code {
        obj["code"] = serde_json::Value::String(code.to_string());
    }

    if let Some(s) = &d.suggestion {
        obj["suggestion"] = serde_json::Value::String(s.clone());
    }

    obj
}

pub fn render(d: &Diagnostic) -> String {
    serde_json::to_string(&to_value(d))
        .unwrap_or_else(|_| r#"{"severity":"error","message":"internal error serializing diagnostic"}"#.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_json(s: &str) -> serde_json::Value {
        serde_json::from_str(s).expect("valid JSON")
    }

    #[test]
    fn render_basic_error() {
        let v = parse_json(&render(&Diagnostic::error("division by zero")));
        assert_eq!(v["severity"], "error");
        assert_eq!(v["message"], "division by zero");
        assert!(v["labels"].as_array().unwrap().is_empty());
        assert!(v.get("code").is_none());
        assert!(v.get("suggestion").is_none());
    }

    #[test]
    fn render_with_label_and_code() {
        let d = Diagnostic::error("bad token").with_code("lexical").with_label(3, 5, "here");
        let v = parse_json(&render(&d));
        let label = &v["labels"][0];
        assert_eq!(label["line"], 3);
        assert_eq!(label["col"], 5);
        assert_eq!(label["primary"], true);
        assert_eq!(v["code"], "lexical");
    }

    #[test]
    fn render_with_notes_and_secondary_labels() {
        let d = Diagnostic::error("bad")
            .with_secondary_label(1, 1, "declared here")
            .with_note("called from line 2, column 1")
            .with_note("called from line 3, column 8")
            .with_suggestion("fix it");
        let v = parse_json(&render(&d));
        assert_eq!(v["notes"].as_array().unwrap().len(), 2);
        assert_eq!(v["labels"][0]["primary"], false);
        assert_eq!(v["suggestion"], "fix it");
    }

    #[test]
    fn render_warning_severity() {
        let v = parse_json(&render(&Diagnostic::warning("unused")));
        assert_eq!(v["severity"], "warning");
    }
}
