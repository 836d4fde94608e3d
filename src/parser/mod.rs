use pulldown_cmark::{Event, Options, Parser, Tag};

fn flush(out: &mut String, block: &mut String) {
    let text = block.trim();
    if !text.is_empty() {
        if !out.is_empty() {
            out.push_str("\n\n");
        }
        out.push_str(text);
    }
    block.clear();
}

/// Render markdown as plain text.
///
/// Headings, paragraphs, code blocks, lists and tables each become their
/// own blank-line separated paragraph, so the chunker sees the document's
/// block structure. Markup and raw HTML are dropped.
pub fn parse_markdown(content: &str) -> String {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_TABLES);
    options.insert(Options::ENABLE_FOOTNOTES);
    options.insert(Options::ENABLE_STRIKETHROUGH);
    options.insert(Options::ENABLE_TASKLISTS);

    let mut out = String::new();
    let mut block = String::new();

    for event in Parser::new_ext(content, options) {
        match event {
            Event::Start(Tag::Heading(..)) | Event::Start(Tag::CodeBlock(_)) => {
                flush(&mut out, &mut block);
            }
            Event::End(Tag::Heading(..))
            | Event::End(Tag::Paragraph)
            | Event::End(Tag::CodeBlock(_))
            | Event::End(Tag::List(_))
            | Event::End(Tag::Table(_)) => {
                flush(&mut out, &mut block);
            }
            Event::End(Tag::Item) | Event::End(Tag::TableHead) | Event::End(Tag::TableRow) => {
                block.push('\n');
            }
            Event::End(Tag::TableCell) => block.push(' '),
            Event::Text(text) | Event::Code(text) => block.push_str(&text),
            Event::SoftBreak => block.push(' '),
            Event::HardBreak => block.push('\n'),
            _ => {}
        }
    }
    flush(&mut out, &mut block);

    out
}
