//! Text helpers for Telegram HTML output.

use std::sync::OnceLock;

use regex::Regex;

const THUMBNAIL_URL: &str = "https://api.dicebear.com/9.x/notionists/png?seed={seed}&size=256&scale=110&backgroundColor=b6e3f4,c0aede,d1d4f9,cfbbef,e4f4f1&backgroundType=gradientLinear";

/// Escape HTML special characters for Telegram HTML parse mode.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

/// Code spans pulled out of the text before escaping, restored afterwards.
#[derive(Default)]
struct Stash {
    blocks: Vec<String>,
    inline: Vec<String>,
}

impl Stash {
    fn block(&mut self, code: &str) -> String {
        self.blocks.push(code.to_string());
        format!("\u{0}B{}\u{0}", self.blocks.len() - 1)
    }

    fn inline(&mut self, code: &str) -> String {
        self.inline.push(code.to_string());
        format!("\u{0}I{}\u{0}", self.inline.len() - 1)
    }

    fn restore(&self, mut text: String) -> String {
        for (i, code) in self.blocks.iter().enumerate() {
            text = text.replace(
                &format!("\u{0}B{i}\u{0}"),
                &format!("<pre>{}</pre>", escape_html(code)),
            );
        }
        for (i, code) in self.inline.iter().enumerate() {
            text = text.replace(
                &format!("\u{0}I{i}\u{0}"),
                &format!("<code>{}</code>", escape_html(code)),
            );
        }
        text
    }
}

fn fence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```[A-Za-z0-9_+-]*\n?(.*?)```").expect("valid regex"))
}

fn inline_code_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"`([^`\n]+)`").expect("valid regex"))
}

fn link_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[([^\]]+)\]\(([^)\s]+)\)").expect("valid regex"))
}

fn bold_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\*\*([^*\n]+)\*\*|__([^_\n]+)__").expect("valid regex"))
}

fn italic_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(^|[^\w*])[*_]([^*_\n]+)[*_]($|[^\w*])").expect("valid regex")
    })
}

/// Convert the Markdown that assistants usually produce into Telegram HTML.
///
/// Telegram accepts only `<b>`, `<i>`, `<code>`, `<pre>`, `<a>` and
/// `<blockquote>`; anything else stays as escaped text.
pub fn markdown_to_html(input: &str) -> String {
    let mut stash = Stash::default();

    let text = fence_re()
        .replace_all(input, |c: &regex::Captures| stash.block(&c[1]))
        .into_owned();
    let text = inline_code_re()
        .replace_all(&text, |c: &regex::Captures| stash.inline(&c[1]))
        .into_owned();

    let escaped = escape_html(&text);

    let mut lines: Vec<String> = Vec::new();
    let mut quote: Vec<String> = Vec::new();
    for line in escaped.split('\n') {
        if let Some(rest) = line.strip_prefix("&gt;") {
            quote.push(inline_styles(rest.strip_prefix(' ').unwrap_or(rest)));
            continue;
        }
        if !quote.is_empty() {
            lines.push(format!("<blockquote>{}</blockquote>", quote.join("\n")));
            quote.clear();
        }
        if is_rule(line) {
            continue;
        }
        lines.push(block_line(line));
    }
    if !quote.is_empty() {
        lines.push(format!("<blockquote>{}</blockquote>", quote.join("\n")));
    }

    let mut html = stash.restore(lines.join("\n"));
    while html.contains("\n\n\n") {
        html = html.replace("\n\n\n", "\n\n");
    }
    html
}

fn is_rule(line: &str) -> bool {
    let t = line.trim();
    t.len() >= 3 && t.chars().all(|c| c == '-' || c == '*' || c == '_')
}

fn block_line(line: &str) -> String {
    let hashes = line.chars().take_while(|c| *c == '#').count();
    if (1..=6).contains(&hashes) {
        if let Some(title) = line[hashes..].strip_prefix(' ') {
            return format!("<b>{}</b>", inline_styles(title));
        }
    }
    for bullet in ["- ", "* ", "+ "] {
        if let Some(rest) = line.strip_prefix(bullet) {
            return format!("• {}", inline_styles(rest));
        }
    }
    inline_styles(line)
}

fn inline_styles(line: &str) -> String {
    let line = bold_re().replace_all(line, |c: &regex::Captures| {
        let inner = c.get(1).or_else(|| c.get(2)).map_or("", |m| m.as_str());
        format!("<b>{inner}</b>")
    });
    let line = italic_re().replace_all(&line, "$1<i>$2</i>$3");
    link_re()
        .replace_all(&line, r#"<a href="$2">$1</a>"#)
        .into_owned()
}

/// Split `s` into pieces of at most `max_len` bytes, preferring newline
/// boundaries and never cutting a UTF-8 character.
pub fn split_text(s: &str, max_len: usize) -> Vec<String> {
    let max_len = max_len.max(1);
    let mut out = Vec::new();
    let mut rest = s;

    while rest.len() > max_len {
        let mut cut = max_len;
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        if cut == 0 {
            cut = rest.chars().next().map_or(rest.len(), char::len_utf8);
        }
        if let Some(nl) = rest[..cut].rfind('\n') {
            if nl > 0 {
                cut = nl + 1;
            }
        }
        out.push(rest[..cut].to_string());
        rest = &rest[cut..];
    }
    if !rest.is_empty() || out.is_empty() {
        out.push(rest.to_string());
    }
    out
}

/// Upper-case the first character.
pub fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Keep at most `max_chars` characters, appending `...` when cut.
pub fn truncate_with_ellipsis(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max_chars).collect();
    out.push_str("...");
    out
}

/// Avatar image used as the assistant card picture.
pub fn thumbnail_url(seed: &str) -> String {
    THUMBNAIL_URL.replace("{seed}", &encode_uri(seed))
}

// Same reserved set as JavaScript's encodeURI.
fn encode_uri(s: &str) -> String {
    const KEEP: &str = ";,/?:@&=+$-_.!~*'()#";
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        if b.is_ascii_alphanumeric() || KEEP.as_bytes().contains(&b) {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}
