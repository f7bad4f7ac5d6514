/// One source line split into its assembly-style fields. Absent fields are
/// empty strings, never missing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record {
    pub label: String,
    pub directive: String,
    pub args: Vec<String>,
    pub comment: String,
}

/// Splits assembly-style text into records, one per matching line.
///
/// The line grammar is `[label[':']] [directive [arg(','arg)*]] [';' comment]`
/// with space/tab as the only whitespace. A label is only recognised in
/// column 0. Lines without a label or a directive are skipped.
pub fn scan(text: &str) -> impl Iterator<Item = Record> + '_ {
    text.lines().filter_map(scan_line)
}

#[must_use]
pub fn scan_line(line: &str) -> Option<Record> {
    let (body, comment) = match line.split_once(';') {
        Some((body, comment)) => (body, comment.trim().to_string()),
        None => (line, String::new()),
    };

    let mut rest = body;
    let mut label = String::new();
    if rest.starts_with(|c: char| c != ' ' && c != '\t') {
        let end = rest.find([' ', '\t']).unwrap_or(rest.len());
        label = rest[..end].strip_suffix(':').unwrap_or(&rest[..end]).to_string();
        rest = &rest[end..];
    }

    let rest = rest.trim_matches([' ', '\t']);
    let (directive, argtext) = match rest.find([' ', '\t']) {
        Some(end) => (rest[..end].to_string(), rest[end..].trim_matches([' ', '\t'])),
        None => (rest.to_string(), ""),
    };

    let mut args: Vec<String> = if argtext.is_empty() {
        Vec::new()
    } else {
        argtext.split(',').map(|a| a.trim_matches([' ', '\t']).to_string()).collect()
    };
    if args.last().is_some_and(String::is_empty) {
        args.pop();
    }

    if label.is_empty() && directive.is_empty() {
        return None;
    }
    Some(Record {
        label,
        directive,
        args,
        comment,
    })
}

/// Reads a source-tree file as ASCII text: non-ASCII bytes are dropped and CR
/// becomes LF before scanning.
#[must_use]
pub fn ascii_text(bytes: &[u8]) -> String {
    bytes
        .iter()
        .filter(|b| b.is_ascii())
        .map(|&b| if b == b'\r' { '\n' } else { char::from(b) })
        .collect()
}
