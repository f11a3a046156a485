//! HTML to Markdown conversion

use crate::error::{Error, Result};
use scraper::{Html, Selector};

/// Trait for HTML-to-Markdown converters
pub trait HtmlConverter: Send + Sync {
    fn to_markdown(&self, html: &str) -> Result<String>;
}

/// Default converter: strip to the document body and render it as text
/// with markdown-style structure.
pub struct TextExtractor;

impl HtmlConverter for TextExtractor {
    fn to_markdown(&self, html: &str) -> Result<String> {
        let document = Html::parse_document(html);
        let body_selector =
            Selector::parse("body").map_err(|e| Error::Internal(format!("selector: {:?}", e)))?;
        let root = document
            .select(&body_selector)
            .next()
            .map(|e| e.html())
            .unwrap_or_else(|| html.to_string());

        let text = html2text::from_read(root.as_bytes(), 80)
            .map_err(|e| Error::Internal(format!("html render: {}", e)))?;
        Ok(normalize_whitespace(&text))
    }
}

fn normalize_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut blank_run = 0;
    for line in text.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(line);
        out.push('\n');
    }
    out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_body_text() {
        let html = "<html><head><title>t</title></head>\
                    <body><h1>Header</h1><p>Hello world.</p></body></html>";
        let md = TextExtractor.to_markdown(html).unwrap();
        assert!(md.contains("Header"));
        assert!(md.contains("Hello world."));
        assert!(!md.contains("<p>"));
    }

    #[test]
    fn collapses_blank_runs() {
        assert_eq!(normalize_whitespace("a\n\n\n\nb"), "a\n\nb");
    }

    #[test]
    fn handles_documents_without_body() {
        let md = TextExtractor.to_markdown("just text").unwrap();
        assert!(md.contains("just text"));
    }
}
