// src/extract/utils.rs

/// Collapse runs of whitespace (including non-breaking spaces) and trim.
pub fn clean_text(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Header cell text → column key: trimmed, whitespace-collapsed, lowercase.
pub fn normalize_header(raw: &str) -> String {
    clean_text(raw).to_lowercase()
}

/// Build unique column keys for a header row. Blank headers get a positional
/// name; repeats get a numeric suffix.
pub fn header_keys<I, S>(cells: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut keys: Vec<String> = Vec::new();
    for (i, cell) in cells.into_iter().enumerate() {
        let mut key = normalize_header(cell.as_ref());
        if key.is_empty() {
            key = format!("column_{}", i + 1);
        }
        if keys.contains(&key) {
            let mut n = 2;
            while keys.contains(&format!("{}_{}", key, n)) {
                n += 1;
            }
            key = format!("{}_{}", key, n);
        }
        keys.push(key);
    }
    keys
}
