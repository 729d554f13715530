use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gender {
    Male,
    Female,
    Other,
    Unknown,
}

impl Gender {
    /// Map a legacy gender code. `Ok(None)` for blank cells.
    pub fn parse(raw: &str) -> Result<Option<Self>, String> {
        let code = raw.trim().to_ascii_lowercase();
        let gender = match code.as_str() {
            "" => return Ok(None),
            "m" | "male" | "1" => Self::Male,
            "f" | "female" | "2" => Self::Female,
            "x" | "o" | "other" | "non-binary" | "nonbinary" | "nb" | "3" => Self::Other,
            "u" | "unknown" | "not stated" | "9" => Self::Unknown,
            _ => return Err(format!("unknown gender code `{}`", raw.trim())),
        };
        Ok(Some(gender))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Phone,
    Email,
    Sms,
    Letter,
    Fax,
    InPerson,
    Other,
}

impl Channel {
    /// Free-text communication type; unrecognised values fall back to `Other`.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "phone" | "call" | "phone call" | "telephone" => Self::Phone,
            "email" | "e-mail" => Self::Email,
            "sms" | "text" | "text message" => Self::Sms,
            "letter" | "mail" | "post" => Self::Letter,
            "fax" => Self::Fax,
            "in person" | "visit" | "meeting" | "face to face" => Self::InPerson,
            _ => Self::Other,
        }
    }
}

/// Active/inactive flags appear as words, Y/N and 1/0.
pub fn parse_active_flag(raw: &str) -> Result<Option<bool>, String> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "" => Ok(None),
        "1" | "y" | "yes" | "true" | "active" | "current" => Ok(Some(true)),
        "0" | "n" | "no" | "false" | "inactive" | "former" | "ended" | "closed" => Ok(Some(false)),
        other => Err(format!("unknown status `{other}`")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gender_codes_map_to_the_enum() {
        assert_eq!(Gender::parse("M"), Ok(Some(Gender::Male)));
        assert_eq!(Gender::parse("female"), Ok(Some(Gender::Female)));
        assert_eq!(Gender::parse("Non-Binary"), Ok(Some(Gender::Other)));
        assert_eq!(Gender::parse("9"), Ok(Some(Gender::Unknown)));
        assert_eq!(Gender::parse(""), Ok(None));
        assert!(Gender::parse("Q").is_err());
    }

    #[test]
    fn channel_falls_back_to_other() {
        assert_eq!(Channel::parse("Phone Call"), Channel::Phone);
        assert_eq!(Channel::parse("E-mail"), Channel::Email);
        assert_eq!(Channel::parse("carrier pigeon"), Channel::Other);
    }

    #[test]
    fn active_flags() {
        assert_eq!(parse_active_flag("Yes"), Ok(Some(true)));
        assert_eq!(parse_active_flag("Inactive"), Ok(Some(false)));
        assert_eq!(parse_active_flag(" "), Ok(None));
        assert!(parse_active_flag("maybe").is_err());
    }
}
