/// Default country calling code applied to national (leading `0`) numbers.
pub const DEFAULT_COUNTRY_CODE: &str = "61";

/// Numbers shorter than this (after canonicalization) are treated as noise,
/// e.g. extensions or a stray "0" typed into a phone column.
const MIN_KEY_DIGITS: usize = 6;

/// Canonical lookup key for a phone number.
///
/// Normalization steps:
/// - keep ASCII digits only (drops spaces, dashes, brackets and a leading `+`)
/// - `00` international prefix is dropped
/// - a single leading `0` (national trunk prefix) becomes the country code
///
/// `"0412 345 678"`, `"+61412345678"` and `"61412345678"` share one key.
pub fn phone_key(raw: &str, country_code: &str) -> Option<String> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    let key = if let Some(international) = digits.strip_prefix("00") {
        international.to_string()
    } else if let Some(national) = digits.strip_prefix('0') {
        format!("{country_code}{national}")
    } else {
        digits
    };
    if key.len() < MIN_KEY_DIGITS {
        return None;
    }
    Some(key)
}

/// Union `incoming` phone numbers into `existing`, de-duplicated by key.
/// Existing entries keep their position and formatting.
pub fn union_phones(existing: &mut Vec<String>, incoming: &[String], country_code: &str) {
    for phone in incoming {
        let Some(key) = phone_key(phone, country_code) else {
            continue;
        };
        let seen = existing
            .iter()
            .any(|p| phone_key(p, country_code).as_deref() == Some(key.as_str()));
        if !seen {
            existing.push(phone.trim().to_string());
        }
    }
}
