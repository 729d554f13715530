/// Fixed separator between note fragments. Merges split on it again, so it
/// must never be produced by the normal note columns.
pub const NOTE_SEPARATOR: &str = "\n\n---\n\n";

/// Lowercase, drop punctuation, collapse whitespace.
pub fn fold_text(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_alphanumeric() {
                c.to_lowercase().next().unwrap_or(c)
            } else if c.is_whitespace() || c == '-' || c == '_' {
                ' '
            } else {
                '\0'
            }
        })
        .filter(|c| *c != '\0')
        .collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// "first last" lookup key; `None` when both parts fold to nothing.
pub fn name_key(first: Option<&str>, last: Option<&str>) -> Option<String> {
    let parts: Vec<String> = [first, last]
        .into_iter()
        .flatten()
        .map(fold_text)
        .filter(|p| !p.is_empty())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" "))
    }
}

/// Canonical form of a legacy identifier.
///
/// Spreadsheet exports turn integer ids into floats (`"123.0"`), so a
/// trailing `.0` run is collapsed.
pub fn normalize_external_id(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let folded = trimmed.to_lowercase();
    let collapsed = match folded.split_once('.') {
        Some((int, frac))
            if !int.is_empty()
                && int.chars().all(|c| c.is_ascii_digit())
                && !frac.is_empty()
                && frac.chars().all(|c| c == '0') =>
        {
            int.to_string()
        }
        _ => folded,
    };
    Some(collapsed)
}

/// Lowercased email, or `None` when the value cannot be an address.
pub fn normalize_email(raw: &str) -> Option<String> {
    let email = raw.trim().to_lowercase();
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && domain.contains('.') => Some(email),
        _ => None,
    }
}

pub fn union_emails(existing: &mut Vec<String>, incoming: &[String]) {
    for email in incoming {
        let folded = email.trim().to_lowercase();
        if !existing.iter().any(|e| e.eq_ignore_ascii_case(&folded)) {
            existing.push(folded);
        }
    }
}

/// Join non-empty note fragments with [`NOTE_SEPARATOR`].
pub fn join_notes<'a, I>(parts: I) -> Option<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut out: Vec<&str> = Vec::new();
    for part in parts {
        let part = part.trim();
        if !part.is_empty() && !out.contains(&part) {
            out.push(part);
        }
    }
    if out.is_empty() {
        None
    } else {
        Some(out.join(NOTE_SEPARATOR))
    }
}

/// Union note fragments. Re-absorbing the same notes is a no-op.
pub fn union_notes(existing: Option<&str>, incoming: Option<&str>) -> Option<String> {
    let existing_parts = existing.into_iter().flat_map(|n| n.split(NOTE_SEPARATOR));
    let incoming_parts = incoming.into_iter().flat_map(|n| n.split(NOTE_SEPARATOR));
    join_notes(existing_parts.chain(incoming_parts))
}
