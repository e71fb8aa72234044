use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

fn collect_files(dir: &Path, ext: &str, out: &mut Vec<PathBuf>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_files(&path, ext, out);
        } else if path.extension().and_then(|s| s.to_str()) == Some(ext) {
            out.push(path);
        }
    }
}

fn line_number(content: &str, byte_idx: usize) -> usize {
    content[..byte_idx].bytes().filter(|b| *b == b'\n').count() + 1
}

fn literal_after_paren(content: &str, call_idx: usize) -> Option<(usize, String)> {
    let open_paren_rel = content[call_idx..].find('(')?;
    let mut i = call_idx + open_paren_rel + 1;
    let bytes = content.as_bytes();

    while i < bytes.len() && bytes[i].is_ascii_whitespace() {
        i += 1;
    }
    if i >= bytes.len() {
        return None;
    }

    if bytes[i] == b'r' {
        let mut j = i + 1;
        let mut hashes = 0usize;
        while j < bytes.len() && bytes[j] == b'#' {
            hashes += 1;
            j += 1;
        }
        if j >= bytes.len() || bytes[j] != b'"' {
            return None;
        }
        let start = j + 1;
        let end_marker = format!("\"{}", "#".repeat(hashes));
        let end = start + content[start..].find(&end_marker)?;
        return Some((i, content[start..end].to_string()));
    }

    if bytes[i] == b'"' {
        let start = i + 1;
        let mut escaped = false;
        for (j, b) in bytes.iter().enumerate().skip(start) {
            if escaped {
                escaped = false;
            } else if *b == b'\\' {
                escaped = true;
            } else if *b == b'"' {
                return Some((i, content[start..j].to_string()));
            }
        }
    }

    None
}

/// Every SQL string literal passed straight to a `sqlx::query*` call.
/// Queries assembled with `format!` are skipped.
fn sql_literals() -> Vec<(PathBuf, usize, String)> {
    let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("src");
    let mut files = Vec::new();
    collect_files(&root, "rs", &mut files);

    let mut result = Vec::new();
    for file in files {
        let Ok(content) = fs::read_to_string(&file) else {
            continue;
        };
        let mut pos = 0usize;
        while let Some(rel) = content[pos..].find("sqlx::query") {
            let idx = pos + rel;
            if let Some((byte_idx, sql)) = literal_after_paren(&content, idx) {
                result.push((file.clone(), line_number(&content, byte_idx), sql));
            }
            pos = idx + "sqlx::query".len();
        }
    }
    result
}

fn placeholders(sql: &str) -> BTreeSet<u32> {
    let bytes = sql.as_bytes();
    let mut found = BTreeSet::new();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            let start = i + 1;
            let mut end = start;
            while end < bytes.len() && bytes[end].is_ascii_digit() {
                end += 1;
            }
            if let Ok(n) = sql[start..end].parse::<u32>() {
                found.insert(n);
            }
            i = end.max(start);
        } else {
            i += 1;
        }
    }
    found
}

#[test]
fn queries_use_postgres_placeholders_only() {
    let violations: Vec<String> = sql_literals()
        .into_iter()
        .filter(|(_, _, sql)| sql.contains('?'))
        .map(|(file, line, _)| format!("{}:{} uses '?' placeholder", file.display(), line))
        .collect();

    assert!(
        violations.is_empty(),
        "Found non-PostgreSQL placeholders:\n{}",
        violations.join("\n")
    );
}

#[test]
fn queries_avoid_sqlite_only_syntax() {
    let violations: Vec<String> = sql_literals()
        .into_iter()
        .filter(|(_, _, sql)| {
            let lower = sql.to_lowercase();
            lower.contains("insert or ignore")
                || lower.contains("insert or replace")
                || lower.contains("strftime(")
                || lower.contains("datetime(")
        })
        .map(|(file, line, _)| format!("{}:{} uses SQLite-only syntax", file.display(), line))
        .collect();

    assert!(
        violations.is_empty(),
        "Found SQLite-specific SQL:\n{}",
        violations.join("\n")
    );
}

#[test]
fn placeholders_are_numbered_without_gaps() {
    let violations: Vec<String> = sql_literals()
        .into_iter()
        .filter_map(|(file, line, sql)| {
            let found = placeholders(&sql);
            let expected: BTreeSet<u32> = (1..=found.len() as u32).collect();
            (found != expected).then(|| format!("{}:{} has placeholders {:?}", file.display(), line, found))
        })
        .collect();

    assert!(
        violations.is_empty(),
        "Found gaps in $n placeholders:\n{}",
        violations.join("\n")
    );
}

#[test]
fn migrations_are_postgres_flavoured() {
    let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("migrations");
    let mut files = Vec::new();
    collect_files(&root, "sql", &mut files);
    assert!(!files.is_empty(), "no migrations found");

    for file in files {
        let content = fs::read_to_string(&file).unwrap_or_default().to_lowercase();
        assert!(
            !content.contains("autoincrement") && !content.contains("integer primary key"),
            "{} uses SQLite key syntax",
            file.display()
        );
    }
}
