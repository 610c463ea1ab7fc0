use rust_embed::RustEmbed;

use crate::storage::Entry;

#[derive(RustEmbed)]
#[folder = "static/"]
pub struct Assets;

fn template(name: &str) -> Option<String> {
    let file = Assets::get(name)?;
    String::from_utf8(file.data.into_owned()).ok()
}

pub fn login_page() -> Option<String> {
    template("login.html")
}

/// Render the directory table for the virtual directory `dir` (always
/// starting with `/`).
pub fn directory_page(dir: &str, entries: &[Entry]) -> Option<String> {
    let page = template("table.html")?;
    let rows: String = entries
        .iter()
        .map(|entry| render_row(dir, entry))
        .collect::<Vec<_>>()
        .join("\n");

    Some(
        page.replace("{{path_query}}", &urlencoding::encode(dir))
            .replace("{{path}}", &escape_html(dir))
            .replace("{{rows}}", &rows),
    )
}

fn render_row(dir: &str, entry: &Entry) -> String {
    let child = child_path(dir, &entry.name);
    let link = urlencoding::encode(&child);
    let name = escape_html(&entry.name);
    let size = format_bytes(entry.size);
    if entry.is_directory {
        format!(
            "        <tr><td><a href=\"/home?path={link}\">{name}/</a></td>\
             <td class=\"size\">{size}</td>\
             <td><a href=\"/download?path={link}\">zip</a></td></tr>"
        )
    } else {
        format!(
            "        <tr><td>{name}</td>\
             <td class=\"size\">{size}</td>\
             <td><a href=\"/download?path={link}\">download</a></td></tr>"
        )
    }
}

fn child_path(dir: &str, name: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), name)
}

pub fn escape_html(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            '{' => escaped.push_str("&#123;"),
            '}' => escaped.push_str("&#125;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["KB", "MB", "GB", "TB", "PB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.2} {}", UNITS[unit])
}
