use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

static FENCE_OPEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[ \t]*(`{3,}|~{3,})[ \t]*([\w+#.-]*)").expect("fence pattern is valid")
});

static ASSIGNMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_]\w*[ \t]*(?::[^=]*)?=[^=]").expect("assignment pattern is valid")
});

const THINK_END: &str = "</think>";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractionFailure {
    #[error("model response is empty")]
    Empty,
    #[error("no code defining '{function}' found in the response")]
    NoCode { function: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Fenced,
    Heuristic,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extracted {
    pub code: String,
    pub origin: Origin,
}

/// Pulls the candidate program for `function_name` out of a model response.
///
/// Fenced blocks win when present: the last block declaring the function,
/// else the last block mentioning it, else the longest (later on ties).
/// Without fences the raw text is scanned for the declaration and its body.
pub fn extract(response: &str, function_name: &str) -> Result<Extracted, ExtractionFailure> {
    let text = strip_reasoning(response);
    if text.trim().is_empty() {
        return Err(ExtractionFailure::Empty);
    }

    let blocks = fenced_blocks(text);
    if let Some(code) = select_block(blocks, function_name) {
        return Ok(Extracted {
            code,
            origin: Origin::Fenced,
        });
    }

    scan_definition(text, function_name)
        .map(|code| Extracted {
            code,
            origin: Origin::Heuristic,
        })
        .ok_or_else(|| ExtractionFailure::NoCode {
            function: function_name.to_string(),
        })
}

fn strip_reasoning(text: &str) -> &str {
    match text.rfind(THINK_END) {
        Some(idx) => &text[idx + THINK_END.len()..],
        None => text,
    }
}

struct Fence {
    lang: String,
    body: String,
}

/// Untagged fences count as Python, as do tags like `py3` or `python3.11`.
fn is_python_hint(lang: &str) -> bool {
    let lang = lang.to_ascii_lowercase();
    matches!(lang.as_str(), "" | "py" | "py3") || lang.starts_with("python")
}

struct Block {
    code: String,
    python: bool,
}

/// Non-empty fenced regions, in order. An unclosed fence runs to the end.
fn fenced_blocks(text: &str) -> Vec<Block> {
    let mut fences = Vec::new();
    let mut open: Option<(String, Fence)> = None;

    for line in text.lines() {
        match open.take() {
            None => {
                if let Some(caps) = FENCE_OPEN.captures(line) {
                    let fence = Fence {
                        lang: caps[2].to_string(),
                        body: String::new(),
                    };
                    open = Some((caps[1].to_string(), fence));
                }
            }
            Some((marker, mut fence)) => {
                let trimmed = line.trim_end();
                if trimmed.trim_start().starts_with(marker.as_str())
                    && trimmed.trim().chars().all(|c| Some(c) == marker.chars().next())
                {
                    fences.push(fence);
                    continue;
                }
                // closing marker glued to the last code line
                if let Some(code) = trimmed.strip_suffix(marker.as_str()) {
                    fence.body.push_str(code);
                    fence.body.push('\n');
                    fences.push(fence);
                    continue;
                }
                fence.body.push_str(line);
                fence.body.push('\n');
                open = Some((marker, fence));
            }
        }
    }
    if let Some((_, fence)) = open {
        fences.push(fence);
    }

    fences
        .into_iter()
        .filter(|f| !f.body.trim().is_empty())
        .map(|f| {
            let lines: Vec<&str> = f.body.lines().collect();
            Block {
                code: dedent(&lines),
                python: is_python_hint(&f.lang),
            }
        })
        .collect()
}

/// Last block matching `pred`, Python-hinted blocks first.
fn last_matching(blocks: &[Block], pred: impl Fn(&Block) -> bool) -> Option<usize> {
    blocks
        .iter()
        .rposition(|b| b.python && pred(b))
        .or_else(|| blocks.iter().rposition(&pred))
}

/// Longest block (later on ties), Python-hinted blocks first.
fn longest(blocks: &[Block]) -> Option<usize> {
    let longest_where = |python_only: bool| {
        blocks
            .iter()
            .enumerate()
            .filter(|(_, b)| b.python || !python_only)
            .max_by_key(|(_, b)| b.code.len())
            .map(|(idx, _)| idx)
    };
    longest_where(true).or_else(|| longest_where(false))
}

fn select_block(mut blocks: Vec<Block>, name: &str) -> Option<String> {
    let idx = last_matching(&blocks, |b| b.code.lines().any(|l| declares(l, name)))
        .or_else(|| last_matching(&blocks, |b| b.code.contains(name)))
        .or_else(|| longest(&blocks))?;
    Some(blocks.swap_remove(idx).code)
}

fn strip_keyword<'a>(s: &'a str, keyword: &str) -> Option<&'a str> {
    let rest = s.strip_prefix(keyword)?;
    rest.starts_with([' ', '\t']).then(|| rest.trim_start())
}

/// `def name(`, `async def name(` or `class name(`/`class name:`.
fn declares(line: &str, name: &str) -> bool {
    let mut rest = line.trim_start();
    if let Some(after_async) = strip_keyword(rest, "async") {
        rest = after_async;
    }
    let Some(rest) = strip_keyword(rest, "def").or_else(|| strip_keyword(rest, "class")) else {
        return false;
    };
    rest.strip_prefix(name)
        .is_some_and(|after| after.trim_start().starts_with(['(', ':']))
}

fn indent_of(line: &str) -> usize {
    line.bytes().take_while(|b| *b == b' ' || *b == b'\t').count()
}

fn is_import(trimmed: &str) -> bool {
    trimmed.starts_with("import ") || (trimmed.starts_with("from ") && trimmed.contains(" import "))
}

fn is_definition_start(trimmed: &str) -> bool {
    trimmed.starts_with("def ")
        || trimmed.starts_with("async def ")
        || trimmed.starts_with("class ")
        || trimmed.starts_with('@')
        || is_import(trimmed)
}

fn scan_definition(text: &str, name: &str) -> Option<String> {
    let lines: Vec<&str> = text.lines().collect();
    let decl = lines.iter().rposition(|l| declares(l, name))?;
    let base = indent_of(lines[decl]);

    let in_body = |l: &str| l.trim().is_empty() || indent_of(l) > base;
    let at_base = |l: &str| indent_of(l) == base;
    let continues = |l: &str| in_body(l) || (at_base(l) && is_definition_start(l.trim_start()));

    // helpers, decorators and module constants directly above
    let mut start = decl;
    while start > 0 {
        let prev = lines[start - 1];
        let constant = at_base(prev) && ASSIGNMENT.is_match(prev.trim_start());
        if !(continues(prev) || constant) {
            break;
        }
        start -= 1;
    }
    while start < decl && lines[start].trim().is_empty() {
        start += 1;
    }

    // comment lines and string continuations stay in the body while it resumes below
    let resumes = |rest: &[&str]| {
        rest.iter()
            .find(|l| !l.trim().is_empty() && !l.trim_start().starts_with('#'))
            .is_some_and(|l| indent_of(l) > base)
    };
    let mut open_quote = track_triple_quotes(lines[decl], None);
    let mut end = decl + 1;
    while end < lines.len() {
        let line = lines[end];
        let comment = line.trim_start().starts_with('#') && resumes(&lines[end + 1..]);
        if open_quote.is_none() && !continues(line) && !comment {
            break;
        }
        open_quote = track_triple_quotes(line, open_quote);
        end += 1;
    }
    while end > decl + 1 && lines[end - 1].trim().is_empty() {
        end -= 1;
    }

    let imports: Vec<&str> = lines[..start]
        .iter()
        .map(|l| l.trim_start())
        .filter(|l| is_import(l))
        .collect();

    let body = dedent(&lines[start..end]);
    match imports.is_empty() {
        true => Some(body),
        false => Some(format!("{}\n\n{}", imports.join("\n"), body)),
    }
}

/// Which triple quote is still open after `line`, given the one open before it.
fn track_triple_quotes(line: &str, mut open: Option<&'static str>) -> Option<&'static str> {
    let mut rest = line;
    loop {
        let found = match open {
            Some(quote) => rest.find(quote).map(|idx| (idx, None)),
            None => ["\"\"\"", "'''"]
                .into_iter()
                .filter_map(|quote| rest.find(quote).map(|idx| (idx, Some(quote))))
                .min_by_key(|(idx, _)| *idx),
        };
        let Some((idx, next)) = found else {
            return open;
        };
        rest = &rest[idx + 3..];
        open = next;
    }
}

fn dedent(lines: &[&str]) -> String {
    let margin = lines
        .iter()
        .filter(|l| !l.trim().is_empty())
        .map(|l| indent_of(l))
        .min()
        .unwrap_or(0);

    let mut out: Vec<&str> = lines
        .iter()
        .map(|l| match l.trim().is_empty() {
            true => "",
            false => l[margin..].trim_end(),
        })
        .collect();
    while out.last().is_some_and(|l| l.is_empty()) {
        out.pop();
    }
    while out.first().is_some_and(|l| l.is_empty()) {
        out.remove(0);
    }
    out.join("\n")
}
