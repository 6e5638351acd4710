use regex::Regex;
use std::sync::OnceLock;

fn think_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<think>.*?</think>").expect("static regex"))
}

fn fence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)```[ \t]*([A-Za-z0-9_+.-]*)[^\n]*\n(.*?)```").expect("static regex")
    })
}

fn open_fence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)```[ \t]*([A-Za-z0-9_+.-]*)[^\n]*\n(.*)$").expect("static regex")
    })
}

/// Removes `<think>...</think>` sections emitted by reasoning models.
pub fn strip_think_tags(text: &str) -> String {
    think_re().replace_all(text, "").to_string()
}

/// Pulls the program out of a natural-language reply.
///
/// Only fenced blocks count. Blocks tagged `python`/`py` win over untagged
/// or other-language blocks; among equals the longest is taken. Returns
/// `None` when there is no non-empty block.
pub fn extract_code_block(text: &str) -> Option<String> {
    pick_block(text, false)
}

/// Like [`extract_code_block`], but a reply cut off at the token limit may
/// end inside a fence; that trailing unclosed block is a candidate too.
pub fn extract_truncated_code_block(text: &str) -> Option<String> {
    pick_block(text, true)
}

fn pick_block(text: &str, allow_unclosed: bool) -> Option<String> {
    let text = strip_think_tags(text);
    let mut best: Option<(bool, usize, String)> = None;
    let mut consider = |lang: &str, body: &str| {
        let body = body.trim_end().trim_start_matches(['\n', '\r']);
        if body.trim().is_empty() {
            return;
        }
        let preferred = matches!(lang.to_ascii_lowercase().as_str(), "python" | "py" | "python3");
        let key = (preferred, body.len());
        let better = match &best {
            None => true,
            Some((p, len, _)) => key > (*p, *len),
        };
        if better {
            best = Some((preferred, body.len(), body.to_string()));
        }
    };

    let mut closed_end = 0;
    for cap in fence_re().captures_iter(&text) {
        let lang = cap.get(1).map(|m| m.as_str()).unwrap_or("");
        let body = cap.get(2).map(|m| m.as_str()).unwrap_or("");
        consider(lang, body);
        closed_end = cap.get(0).map(|m| m.end()).unwrap_or(closed_end);
    }
    if allow_unclosed {
        if let Some(cap) = open_fence_re().captures(&text[closed_end..]) {
            let lang = cap.get(1).map(|m| m.as_str()).unwrap_or("");
            let body = cap.get(2).map(|m| m.as_str()).unwrap_or("");
            consider(lang, body);
        }
    }

    best.map(|(_, _, code)| code)
}
