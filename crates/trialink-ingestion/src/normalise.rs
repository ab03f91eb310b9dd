//! Reduction of fetched filing documents to plain text.

use scraper::{Html, Node};

/// Visible text of an HTML (or inline XBRL) document, whitespace collapsed.
/// Script and style bodies are dropped.
pub fn html_to_text(html: &str) -> String {
    let doc = Html::parse_document(html);
    let mut out = String::with_capacity(html.len() / 2);

    for node in doc.tree.root().descendants() {
        let Node::Text(text) = node.value() else { continue };
        let hidden = node.ancestors().any(|a| {
            a.value()
                .as_element()
                .is_some_and(|e| matches!(e.name(), "script" | "style" | "head"))
        });
        if !hidden {
            out.push_str(text);
            out.push(' ');
        }
    }

    collapse_whitespace(&out)
}

/// Text of every page of a PDF, pages separated by newlines.
pub fn pdf_to_text(bytes: &[u8]) -> Result<String, lopdf::Error> {
    let doc = lopdf::Document::load_mem(bytes)?;
    let pages: Vec<u32> = doc.get_pages().keys().copied().collect();
    let mut text = String::new();
    for page in pages {
        // Pages with undecodable fonts are skipped rather than failing the filing
        if let Ok(page_text) = doc.extract_text(&[page]) {
            text.push_str(&collapse_whitespace(&page_text));
            text.push('\n');
        }
    }
    Ok(text)
}

pub fn looks_like_pdf(url: &str, content_type: Option<&str>, bytes: &[u8]) -> bool {
    content_type.is_some_and(|ct| ct.contains("application/pdf"))
        || url.to_ascii_lowercase().ends_with(".pdf")
        || bytes.starts_with(b"%PDF")
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_html_to_text_drops_scripts() {
        let html = r#"<html><head><title>10-K</title><style>p{}</style></head>
            <body><p>Our Phase 3 trial   NCT01234567</p><script>var x = 1;</script>
            <div>met its <b>primary</b> endpoint.</div></body></html>"#;
        let text = html_to_text(html);
        assert!(text.contains("Our Phase 3 trial NCT01234567"));
        assert!(text.contains("met its primary endpoint."));
        assert!(!text.contains("var x"));
        assert!(!text.contains("p{}"));
    }

    #[test]
    fn test_looks_like_pdf() {
        assert!(looks_like_pdf("https://x/doc.PDF", None, b""));
        assert!(looks_like_pdf("https://x/doc", Some("application/pdf"), b""));
        assert!(looks_like_pdf("https://x/doc", None, b"%PDF-1.7"));
        assert!(!looks_like_pdf("https://x/doc.htm", Some("text/html"), b"<html>"));
    }

    #[test]
    fn test_garbage_pdf_is_error() {
        assert!(pdf_to_text(b"not a pdf").is_err());
    }
}
