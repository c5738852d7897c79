//! Rendering of record values into output lines
//!
//! Line templates are built from placeholder expressions:
//!
//! | expression        | renders                                             |
//! |-------------------|-----------------------------------------------------|
//! | `` (empty)        | an empty column                                     |
//! | `record_uuid`     | UUID of the record being built                      |
//! | `unique_id`       | listing id of the record                            |
//! | `index`           | position of the record in the fan-out               |
//! | `literal:TEXT`    | `TEXT` as-is                                        |
//! | `value:FIELD`     | first non-empty value of `FIELD`, `'` escaped       |
//! | `raw:FIELD`       | same, unescaped                                     |
//! | `chemistry:FIELD` | chemical formula markup as HTML, `'` escaped        |
//! | `base64:FIELD`    | standard base64 of the raw value                    |
//!
//! A bare `FIELD` (no format) is read as `value:FIELD`. Inside a template's
//! `prefix` and `suffix` expressions are written in braces, e.g.
//! `mineral_keys['{record_uuid}']='{value:15ecaaaa9bebc84862bc45523aab}';`.
//! Missing fields render as an empty string.

use crate::config::{LineMode, LineTemplate};
use crate::error::{PipelineError, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use odr_common::record::{find_value, RecordNode};
use regex::Regex;
use serde_json::Value;

/// Markup for the `[box]` placeholder in chemical formulas
const BOX_HTML: &str = r#"<span style="border: 1px solid #333; font-size:7px;">&nbsp;&nbsp;&nbsp;</span>"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldFormat {
    Value,
    Raw,
    Chemistry,
    Base64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expr<'a> {
    Empty,
    RecordUuid,
    UniqueId,
    Index,
    Literal(&'a str),
    Field { format: FieldFormat, field: &'a str },
}

impl<'a> Expr<'a> {
    pub fn parse(text: &'a str) -> Result<Self> {
        let text = text.trim();
        let expr = match text.split_once(':') {
            None => match text {
                "" => Expr::Empty,
                "record_uuid" => Expr::RecordUuid,
                "unique_id" => Expr::UniqueId,
                "index" => Expr::Index,
                field => Expr::Field {
                    format: FieldFormat::Value,
                    field,
                },
            },
            Some(("literal", rest)) => Expr::Literal(rest),
            Some((format, field)) => {
                let format = match format {
                    "value" => FieldFormat::Value,
                    "raw" => FieldFormat::Raw,
                    "chemistry" => FieldFormat::Chemistry,
                    "base64" => FieldFormat::Base64,
                    other => {
                        return Err(PipelineError::validation(format!(
                            "unknown column format '{}' in '{}'",
                            other, text
                        )))
                    },
                };
                Expr::Field { format, field }
            },
        };
        Ok(expr)
    }
}

/// The record being rendered and where it sits in the run
#[derive(Debug, Clone, Copy)]
pub struct RenderContext<'a> {
    pub record: &'a RecordNode,
    pub unique_id: &'a str,
    pub index: usize,
}

impl RenderContext<'_> {
    pub fn eval(&self, expr: Expr<'_>) -> String {
        match expr {
            Expr::Empty => String::new(),
            Expr::RecordUuid => self.record.record_uuid.clone(),
            Expr::UniqueId => self.unique_id.to_string(),
            Expr::Index => self.index.to_string(),
            Expr::Literal(text) => text.to_string(),
            Expr::Field { format, field } => {
                let raw = find_value(field, self.record).unwrap_or_default();
                match format {
                    FieldFormat::Value => escape_single_quotes(&raw),
                    FieldFormat::Raw => raw,
                    FieldFormat::Chemistry => format_chemistry(&raw),
                    FieldFormat::Base64 => STANDARD.encode(raw.as_bytes()),
                }
            },
        }
    }
}

pub fn escape_single_quotes(value: &str) -> String {
    value.replace('\'', "\\'")
}

/// `_x_` becomes a subscript, `^x^` a superscript and `[box]` an empty box;
/// single quotes are escaped.
pub fn format_chemistry(formula: &str) -> String {
    let mut out = String::with_capacity(formula.len() + 16);
    let mut rest = formula;

    while let Some((before, inner, after)) = split_marked(rest, '_') {
        out.push_str(before);
        out.push_str("<sub>");
        out.push_str(inner);
        out.push_str("</sub>");
        rest = after;
    }
    out.push_str(rest);

    let mut sup = String::with_capacity(out.len());
    let mut rest = out.as_str();
    while let Some((before, inner, after)) = split_marked(rest, '^') {
        sup.push_str(before);
        sup.push_str("<sup>");
        sup.push_str(inner);
        sup.push_str("</sup>");
        rest = after;
    }
    sup.push_str(rest);

    escape_single_quotes(&sup).replace("[box]", BOX_HTML)
}

/// Split at the first `marker...marker` pair with a non-empty inside
fn split_marked(text: &str, marker: char) -> Option<(&str, &str, &str)> {
    let mut search_from = 0;
    loop {
        let open = search_from + text[search_from..].find(marker)?;
        let body = &text[open + marker.len_utf8()..];
        let close = body.find(marker)?;
        if close == 0 {
            // `__` has nothing inside; retry from the second marker
            search_from = open + marker.len_utf8();
            continue;
        }
        let after = &body[close + marker.len_utf8()..];
        return Some((&text[..open], &body[..close], after));
    }
}

/// Renders [`LineTemplate`]s for one record
pub struct LineRenderer {
    placeholder: Regex,
}

impl LineRenderer {
    pub fn new() -> Result<Self> {
        let placeholder = Regex::new(r"\{([^{}]*)\}")
            .map_err(|e| PipelineError::validation(format!("bad placeholder pattern: {}", e)))?;
        Ok(Self { placeholder })
    }

    /// Replace every `{expr}` in `text`
    pub fn expand(&self, text: &str, ctx: &RenderContext<'_>) -> Result<String> {
        let mut out = String::with_capacity(text.len());
        let mut last = 0;
        for caps in self.placeholder.captures_iter(text) {
            let (Some(whole), Some(inner)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            out.push_str(&text[last..whole.start()]);
            out.push_str(&ctx.eval(Expr::parse(inner.as_str())?));
            last = whole.end();
        }
        out.push_str(&text[last..]);
        Ok(out)
    }

    pub fn render(&self, template: &LineTemplate, ctx: &RenderContext<'_>) -> Result<String> {
        let columns = template
            .columns
            .iter()
            .map(|column| Expr::parse(column).map(|expr| ctx.eval(expr)))
            .collect::<Result<Vec<_>>>()?;

        let body = match template.mode {
            LineMode::Delimited => columns.join(&template.delimiter),
            LineMode::Json => {
                // Members keep column order
                let members = columns
                    .into_iter()
                    .enumerate()
                    .map(|(i, value)| {
                        let key = template.keys.get(i).cloned().unwrap_or_else(|| format!("col{}", i));
                        format!("{}:{}", Value::String(key), Value::String(value))
                    })
                    .collect::<Vec<_>>();
                format!("{{{}}}", members.join(","))
            },
        };

        Ok(format!(
            "{}{}{}",
            self.expand(&template.prefix, ctx)?,
            body,
            self.expand(&template.suffix, ctx)?
        ))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record() -> RecordNode {
        RecordNode::from_value(&json!({
            "record_uuid": "r-1",
            "template_uuid": "ima",
            "fields_ima": [
                {"a": {"template_field_uuid": "name", "value": "Abellaite"}},
                {"b": {"template_field_uuid": "formula", "value": "NaPb_2_(CO_3_)_2_(OH)"}},
                {"c": {"template_field_uuid": "note", "value": "it's new"}}
            ]
        }))
        .unwrap()
    }

    fn template(prefix: &str, columns: &[&str], suffix: &str) -> LineTemplate {
        LineTemplate {
            output: "mineral_data".into(),
            prefix: prefix.into(),
            suffix: suffix.into(),
            delimiter: "||".into(),
            mode: LineMode::Delimited,
            columns: columns.iter().map(|c| c.to_string()).collect(),
            keys: Vec::new(),
        }
    }

    #[test]
    fn test_chemistry_markup() {
        assert_eq!(format_chemistry("H_2_O"), "H<sub>2</sub>O");
        assert_eq!(format_chemistry("Fe^3+^"), "Fe<sup>3+</sup>");
        assert_eq!(
            format_chemistry("Ca_2_(Fe^2+^)'"),
            "Ca<sub>2</sub>(Fe<sup>2+</sup>)\\'"
        );
        assert!(format_chemistry("[box]_2_").starts_with("<span"));
        assert_eq!(format_chemistry("no markup"), "no markup");
        assert_eq!(format_chemistry("a__b"), "a__b");
    }

    #[test]
    fn test_expression_parsing() {
        assert_eq!(Expr::parse("").unwrap(), Expr::Empty);
        assert_eq!(Expr::parse("index").unwrap(), Expr::Index);
        assert_eq!(Expr::parse("literal:a:b").unwrap(), Expr::Literal("a:b"));
        assert_eq!(
            Expr::parse("abc123").unwrap(),
            Expr::Field {
                format: FieldFormat::Value,
                field: "abc123"
            }
        );
        assert!(Expr::parse("upper:abc").is_err());
    }

    #[test]
    fn test_line_columns_and_placeholders() {
        let record = record();
        let ctx = RenderContext {
            record: &record,
            unique_id: "u-1",
            index: 4,
        };
        let renderer = LineRenderer::new().unwrap();

        let line = renderer
            .render(
                &template(
                    "mineral_data_array['{record_uuid}']='",
                    &["name", "", "chemistry:formula", "note", "base64:name", "missing", "index"],
                    "';\n",
                ),
                &ctx,
            )
            .unwrap();

        assert_eq!(
            line,
            "mineral_data_array['r-1']='Abellaite||||NaPb<sub>2</sub>(CO<sub>3</sub>)<sub>2</sub>(OH)||it\\'s new||QWJlbGxhaXRl||||4';\n"
        );
    }

    #[test]
    fn test_prefix_only_template() {
        let record = record();
        let ctx = RenderContext {
            record: &record,
            unique_id: "u-1",
            index: 0,
        };
        let renderer = LineRenderer::new().unwrap();
        let line = renderer
            .render(&template("mineral_keys['{record_uuid}']='{value:name}';", &[], ""), &ctx)
            .unwrap();
        assert_eq!(line, "mineral_keys['r-1']='Abellaite';");
    }

    #[test]
    fn test_json_line() {
        let record = record();
        let ctx = RenderContext {
            record: &record,
            unique_id: "u-1",
            index: 0,
        };
        let mut t = template("refs.push(", &["raw:note", "unique_id"], ");");
        t.mode = LineMode::Json;
        t.keys = vec!["note".into()];

        let line = LineRenderer::new().unwrap().render(&t, &ctx).unwrap();
        assert_eq!(line, r#"refs.push({"note":"it's new","col1":"u-1"});"#);
    }

    #[test]
    fn test_json_line_keeps_column_order() {
        let record = record();
        let ctx = RenderContext {
            record: &record,
            unique_id: "u-1",
            index: 3,
        };
        let mut t = template("", &["raw:name", "raw:formula", "index"], "");
        t.mode = LineMode::Json;
        t.keys = vec!["zname".into(), "formula".into(), "aindex".into()];

        let line = LineRenderer::new().unwrap().render(&t, &ctx).unwrap();
        assert_eq!(line, r#"{"zname":"Abellaite","formula":"NaPb_2_(CO_3_)_2_(OH)","aindex":"3"}"#);
        let parsed: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed["aindex"], "3");
    }
}
